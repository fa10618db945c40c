//! Type-safe virtual and physical addresses.
//!
//! [`VA`] and [`PA`] share one implementation but cannot be mixed up: a
//! physical frame base can never be passed where a virtual page address is
//! expected, and vice versa.

use super::{PAGE_MASK, PAGE_SHIFT, PAGE_SIZE};
use core::{
    fmt::{self, Debug, Display},
    marker::PhantomData,
};

mod sealed {
    /// Sealed trait to prevent external implementations of `MemKind`.
    pub trait Sealed {}
}

/// Marker trait for kinds of memory addresses (virtual or physical).
pub trait MemKind: sealed::Sealed + Ord + Clone + Copy + PartialEq + Eq {}

/// Marker for virtual memory address type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Virtual;

/// Marker for physical memory address type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Physical;

impl sealed::Sealed for Virtual {}
impl sealed::Sealed for Physical {}

impl MemKind for Virtual {}
impl MemKind for Physical {}

/// A memory address of kind `K`.
#[derive(PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Address<K: MemKind> {
    inner: usize,
    _phantom: PhantomData<K>,
}

impl<K: MemKind> Clone for Address<K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K: MemKind> Copy for Address<K> {}

impl<K: MemKind> Debug for Address<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}", self.inner)
    }
}

impl<K: MemKind> Address<K> {
    /// Construct an address from a raw usize value.
    pub const fn from_value(addr: usize) -> Self {
        Self {
            inner: addr,
            _phantom: PhantomData,
        }
    }

    /// Return the underlying raw address value.
    pub const fn value(self) -> usize {
        self.inner
    }

    pub const fn null() -> Self {
        Self::from_value(0)
    }

    /// Check if the address is aligned to the system's page size.
    pub const fn is_page_aligned(self) -> bool {
        self.inner & PAGE_MASK == 0
    }

    /// Add `count` pages to the address.
    #[must_use]
    pub const fn add_pages(self, count: usize) -> Self {
        Self::from_value(self.inner + (PAGE_SIZE * count))
    }

    #[must_use]
    pub const fn add_bytes(self, n: usize) -> Self {
        Self::from_value(self.inner + n)
    }

    /// Return an address aligned down to the next page boundary.
    #[must_use]
    pub const fn page_aligned(self) -> Self {
        Self::from_value(self.inner & !PAGE_MASK)
    }

    /// Return an address aligned up to `align` (must be a power of two).
    #[must_use]
    pub const fn align_up(self, align: usize) -> Self {
        assert!(align.is_power_of_two());
        Self::from_value((self.inner + (align - 1)) & !(align - 1))
    }

    /// Get the offset of the address within its page.
    pub const fn page_offset(self) -> usize {
        self.inner & PAGE_MASK
    }

    /// Index of the page containing this address.
    pub const fn page_number(self) -> usize {
        self.inner >> PAGE_SHIFT
    }
}

/// A virtual address.
pub type VA = Address<Virtual>;
/// A physical address.
pub type PA = Address<Physical>;

impl Display for VA {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Vx{:016x}", self.inner)
    }
}

impl Display for PA {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Px{:08x}", self.inner)
    }
}

impl PA {
    /// The page frame number of this physical address.
    pub const fn to_pfn(self) -> usize {
        self.page_number()
    }

    pub const fn from_pfn(pfn: usize) -> Self {
        Self::from_value(pfn << PAGE_SHIFT)
    }
}
