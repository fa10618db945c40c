//! Architecture fault front ends.
//!
//! Each constructor turns raw trap information into the common
//! [`PageFault`] classification consumed by [`Region::handle_fault`].
//!
//! [`Region::handle_fault`]: super::Region::handle_fault

use super::fault::{AccessKind, FaultKind, PageFault};
use crate::memory::{address::VA, page_directory::PageDirectory};

// x86 #PF error code bits.
const X86_PF_PROT: u64 = 1 << 0;
const X86_PF_WRITE: u64 = 1 << 1;
const X86_PF_INSTR: u64 = 1 << 4;

// AArch64 ESR_ELx exception classes.
const ESR_EC_SHIFT: u64 = 26;
const ESR_EC_MASK: u64 = 0x3f;
const EC_IABT_LOW: u64 = 0x20;
const EC_IABT_CUR: u64 = 0x21;
const EC_DABT_LOW: u64 = 0x24;
const EC_DABT_CUR: u64 = 0x25;

// Data abort ISS bits.
const ISS_WNR: u64 = 1 << 6;
const ISS_CM: u64 = 1 << 8;
const ISS_FSC_MASK: u64 = 0x3f;

// RISC-V scause values for page faults.
const SCAUSE_INSTR_PAGE_FAULT: u64 = 12;
const SCAUSE_LOAD_PAGE_FAULT: u64 = 13;
const SCAUSE_STORE_PAGE_FAULT: u64 = 15;

/// Coarse grouping of the AArch64 DFSC/IFSC fault status codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FscCategory {
    TranslationFault,
    AccessFlagFault,
    PermissionFault,
    Other,
}

impl FscCategory {
    pub fn from_fsc(fsc: u64) -> Self {
        match fsc & ISS_FSC_MASK {
            0b00_0100..=0b00_0111 => Self::TranslationFault,
            0b00_1000..=0b00_1011 => Self::AccessFlagFault,
            0b00_1100..=0b00_1111 => Self::PermissionFault,
            _ => Self::Other,
        }
    }
}

impl PageFault {
    /// Decode an x86 page-fault error code, with `vaddr` taken from CR2.
    pub fn from_x86_error_code(vaddr: VA, code: u64) -> Self {
        let kind = if code & X86_PF_PROT != 0 {
            FaultKind::ProtectionViolation
        } else {
            FaultKind::NotPresent
        };

        let access = if code & X86_PF_INSTR != 0 {
            AccessKind::Execute
        } else if code & X86_PF_WRITE != 0 {
            AccessKind::Write
        } else {
            AccessKind::Read
        };

        Self::new(vaddr, kind, access)
    }

    /// Decode an AArch64 instruction or data abort.
    ///
    /// Returns `None` if `esr` is not an abort, or reports a fault the VM
    /// layer cannot resolve (alignment, external aborts, TLB conflicts).
    pub fn from_aarch64_abort(esr: u64, far: u64) -> Option<Self> {
        let ec = (esr >> ESR_EC_SHIFT) & ESR_EC_MASK;

        let access = match ec {
            EC_IABT_LOW | EC_IABT_CUR => AccessKind::Execute,
            // Cache maintenance reports WnR as set, but only needs read access.
            EC_DABT_LOW | EC_DABT_CUR if esr & ISS_WNR != 0 && esr & ISS_CM == 0 => {
                AccessKind::Write
            }
            EC_DABT_LOW | EC_DABT_CUR => AccessKind::Read,
            _ => return None,
        };

        let kind = match FscCategory::from_fsc(esr) {
            FscCategory::TranslationFault | FscCategory::AccessFlagFault => FaultKind::NotPresent,
            FscCategory::PermissionFault => FaultKind::ProtectionViolation,
            FscCategory::Other => return None,
        };

        Some(Self::new(VA::from_value(far as usize), kind, access))
    }

    /// Classify a fault for hardware that reports only the access type.
    ///
    /// A present PTE means the access was refused by its protection bits.
    pub fn from_access_only(vaddr: VA, access: AccessKind, page_directory: &PageDirectory) -> Self {
        let kind = if page_directory.lock().translate(vaddr).is_some() {
            FaultKind::ProtectionViolation
        } else {
            FaultKind::NotPresent
        };

        Self::new(vaddr, kind, access)
    }

    /// Decode a RISC-V page fault from `scause` and `stval`.
    pub fn from_riscv_cause(
        scause: u64,
        stval: u64,
        page_directory: &PageDirectory,
    ) -> Option<Self> {
        let access = match scause {
            SCAUSE_INSTR_PAGE_FAULT => AccessKind::Execute,
            SCAUSE_LOAD_PAGE_FAULT => AccessKind::Read,
            SCAUSE_STORE_PAGE_FAULT => AccessKind::Write,
            _ => return None,
        };

        Some(Self::from_access_only(
            VA::from_value(stval as usize),
            access,
            page_directory,
        ))
    }
}
