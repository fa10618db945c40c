//! Physical and virtual memory primitives shared by the VM layer.

use address::VA;

pub mod address;
pub mod page;
pub mod page_alloc;
pub mod page_directory;
pub mod range;

pub const PAGE_SHIFT: usize = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
pub const PAGE_MASK: usize = PAGE_SIZE - 1;

/// Lowest address user space may map. The first pages stay unmapped so null
/// dereferences always fault.
pub const USER_RANGE_BASE: usize = 0x1_0000;

/// First address past the user half of the address space.
pub const USER_RANGE_END: usize = 0x0000_8000_0000_0000;

/// Start of the kernel half of the address space.
pub const KERNEL_BASE: usize = 0xffff_8000_0000_0000;

/// Returns `true` if `va` lies below the user/kernel split.
pub const fn is_user_address(va: VA) -> bool {
    va.value() < USER_RANGE_END
}

/// Returns `true` if a PTE for `va` may be marked user-accessible.
pub const fn is_user_accessible(va: VA) -> bool {
    va.value() >= USER_RANGE_BASE && is_user_address(va)
}
