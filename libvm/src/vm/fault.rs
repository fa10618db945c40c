//! Page-fault description and the resolution state machine.
//!
//! The trap handler normalizes whatever the hardware reported into a
//! [`PageFault`] (see [`super::arch`]), finds the owning [`Region`] and calls
//! [`Region::handle_fault`]. The returned [`FaultResponse`] tells it whether
//! to retry the faulting instruction or to signal the thread.

use super::{object::VMObject, region::Region, thread::FaultingThread};
use crate::memory::{
    PAGE_SIZE,
    address::VA,
    page::PageSlot,
    page_alloc::PageFill,
};
use alloc::vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use log::{debug, error, trace, warn};


/// Describes the kind of access that occured during a page fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessKind {
    /// The CPU attempted to read the faulting address.
    Read,
    /// The CPU attempted to write to the faulting address.
    Write,
    /// The CPU attempted to execute the instruction at the faulting address.
    Execute,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultKind {
    /// No valid translation exists for the address.
    NotPresent,
    /// A translation exists but its protection bits refused the access.
    ProtectionViolation,
}

/// An architecture-neutral page fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageFault {
    vaddr: VA,
    kind: FaultKind,
    access: AccessKind,
}

impl PageFault {
    pub fn new(vaddr: VA, kind: FaultKind, access: AccessKind) -> Self {
        Self {
            vaddr,
            kind,
            access,
        }
    }

    pub fn vaddr(&self) -> VA {
        self.vaddr
    }

    pub fn kind(&self) -> FaultKind {
        self.kind
    }

    pub fn access(&self) -> AccessKind {
        self.access
    }

    pub fn is_not_present(&self) -> bool {
        self.kind == FaultKind::NotPresent
    }

    pub fn is_protection_violation(&self) -> bool {
        self.kind == FaultKind::ProtectionViolation
    }

    pub fn is_read(&self) -> bool {
        self.access == AccessKind::Read
    }

    pub fn is_write(&self) -> bool {
        self.access == AccessKind::Write
    }

    pub fn is_instruction_fetch(&self) -> bool {
        self.access == AccessKind::Execute
    }
}

/// What the trap handler should do once a fault has been handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultResponse {
    /// The page is now mapped; retry the faulting instruction.
    Continue,
    /// The access was invalid; terminate the faulting thread.
    ShouldCrash,
    /// A frame or page table could not be allocated.
    OutOfMemory,
    /// The access lies past the end of a mapped file.
    BusError,
}

/// Keeps a region's in-progress fault count raised for its lifetime.
struct FaultScope<'a>(&'a AtomicUsize);

impl<'a> FaultScope<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for FaultScope<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Region {
    /// Resolve `fault`, which the trap handler has attributed to this region.
    ///
    /// May block on file I/O, so it must be called without the address
    /// space lock or the scheduler lock held.
    pub fn handle_fault(
        &self,
        fault: &PageFault,
        thread: Option<&dyn FaultingThread>,
    ) -> FaultResponse {
        if let Some(thread) = thread {
            assert!(
                !thread.holds_scheduler_lock(),
                "page fault handled with the scheduler lock held"
            );
        }

        let _scope = FaultScope::enter(self.fault_counter());

        if self.is_dying() {
            debug!("fault at {} on region {:?} being destroyed", fault.vaddr(), self.id());
            return FaultResponse::ShouldCrash;
        }

        if !self.contains(fault.vaddr()) {
            warn!("fault at {} outside region {:?}", fault.vaddr(), self.id());
            return FaultResponse::ShouldCrash;
        }

        let Some(vmobject) = self.vmobject() else {
            warn!("fault at {} on unbacked region {:?}", fault.vaddr(), self.id());
            return FaultResponse::ShouldCrash;
        };

        let page_index = self.page_index_from_address(fault.vaddr());
        let vmobject_index = self.translate_to_vmobject_page(page_index);

        if vmobject_index >= vmobject.page_count() {
            warn!(
                "fault at {} beyond the end of object {}",
                fault.vaddr(),
                vmobject.id()
            );
            return FaultResponse::ShouldCrash;
        }

        match fault.kind() {
            FaultKind::NotPresent => {
                self.handle_not_present_fault(fault, &vmobject, vmobject_index, thread)
            }
            FaultKind::ProtectionViolation => {
                self.handle_protection_violation(fault, &vmobject, vmobject_index, thread)
            }
        }
    }

    fn handle_not_present_fault(
        &self,
        fault: &PageFault,
        vmobject: &VMObject,
        index: usize,
        thread: Option<&dyn FaultingThread>,
    ) -> FaultResponse {
        if fault.is_read() && !self.is_readable() {
            debug!("NP(non-readable) fault at {} in region {:?}", fault.vaddr(), self.id());
            return FaultResponse::ShouldCrash;
        }

        if fault.is_write() && !self.is_writable() {
            debug!("NP(non-writable) fault at {} in region {:?}", fault.vaddr(), self.id());
            return FaultResponse::ShouldCrash;
        }

        if vmobject.is_inode() {
            trace!("NP(inode) fault at {} in region {:?}", fault.vaddr(), self.id());
            return self.handle_inode_fault(vmobject, index, false, thread);
        }

        let mut pages = vmobject.lock_pages();

        if pages.slot(index).is_lazy_committed() {
            trace!("NP(lazy) fault at {} in region {:?}", fault.vaddr(), self.id());
            let page = pages.allocate_committed_page();
            *pages.slot_mut(index) = PageSlot::Present(page);
            drop(pages);

            return self.remap_or_oom(index);
        }

        let slot = pages.slot(index);
        warn!(
            "unexpected NP fault at {} in region {:?}: slot {:?}, paddr {:?}, lazy committed {}, shared zero {}",
            fault.vaddr(),
            self.id(),
            slot,
            slot.page().map(|page| page.paddr()),
            slot.is_lazy_committed(),
            slot.is_shared_zero(),
        );

        FaultResponse::ShouldCrash
    }

    fn handle_protection_violation(
        &self,
        fault: &PageFault,
        vmobject: &VMObject,
        index: usize,
        thread: Option<&dyn FaultingThread>,
    ) -> FaultResponse {
        if fault.is_write() && self.is_writable() {
            let (should_cow, is_sentinel) = {
                let pages = vmobject.lock_pages();
                (self.should_cow(&pages, index), pages.slot(index).is_sentinel())
            };

            if should_cow {
                if is_sentinel {
                    trace!("PV(zero) fault at {} in region {:?}", fault.vaddr(), self.id());
                    return self.handle_zero_fault(vmobject, index, thread);
                }

                trace!("PV(cow) fault at {} in region {:?}", fault.vaddr(), self.id());
                return self.handle_cow_fault(vmobject, index, fault.vaddr(), thread);
            }

            if vmobject.is_inode() {
                trace!(
                    "PV(dirty_on_write) fault at {} in region {:?}",
                    fault.vaddr(),
                    self.id()
                );
                return self.handle_dirty_on_write_fault(vmobject, index, thread);
            }

            // Another fault installed a writable page after this PTE was read.
            if vmobject.is_anonymous() {
                trace!("PV(stale) fault at {} in region {:?}", fault.vaddr(), self.id());
                return self.remap_or_oom(index);
            }
        }

        debug!("PV(error) fault at {} in region {:?}", fault.vaddr(), self.id());
        FaultResponse::ShouldCrash
    }

    fn remap_or_oom(&self, index: usize) -> FaultResponse {
        if self.remap_vmobject_page(index) {
            FaultResponse::Continue
        } else {
            error!("out of page tables remapping page {index} of region {:?}", self.id());
            FaultResponse::OutOfMemory
        }
    }

    fn handle_zero_fault(
        &self,
        vmobject: &VMObject,
        index: usize,
        thread: Option<&dyn FaultingThread>,
    ) -> FaultResponse {
        if let Some(thread) = thread {
            thread.did_zero_fault();
        }

        // Lazily committed slots draw from their commitment once the lock is
        // retaken; only shared-zero slots need a frame from the allocator.
        let mut fresh = None;
        if vmobject.lock_pages().slot(index).is_shared_zero() {
            match vmobject.allocator().allocate_physical_page(PageFill::Zeroed) {
                Ok(page) => fresh = Some(page),
                Err(_) => {
                    error!("unable to allocate a page for zero fault in region {:?}", self.id());
                    return FaultResponse::OutOfMemory;
                }
            }
        }

        {
            let mut pages = vmobject.lock_pages();

            if pages.slot(index).page().is_some() {
                debug!("zero fault on page {index} already handled, using existing page");
            } else if pages.slot(index).is_lazy_committed() {
                let page = pages.allocate_committed_page();
                *pages.slot_mut(index) = PageSlot::Present(page);
            } else {
                let page = match fresh.take() {
                    Some(page) => page,
                    None => match vmobject.allocator().allocate_physical_page(PageFill::Zeroed) {
                        Ok(page) => page,
                        Err(_) => {
                            error!(
                                "unable to allocate a page for zero fault in region {:?}",
                                self.id()
                            );
                            return FaultResponse::OutOfMemory;
                        }
                    },
                };

                *pages.slot_mut(index) = PageSlot::Present(page);
            }
        }

        // A frame that lost the race goes back to the allocator here.
        drop(fresh);

        let remapped = if self.is_shared() {
            vmobject.remap_regions_one_page(index)
        } else {
            self.remap_vmobject_page(index)
        };

        if remapped {
            FaultResponse::Continue
        } else {
            error!("out of page tables after zero fault in region {:?}", self.id());
            FaultResponse::OutOfMemory
        }
    }

    fn handle_cow_fault(
        &self,
        vmobject: &VMObject,
        index: usize,
        vaddr: VA,
        thread: Option<&dyn FaultingThread>,
    ) -> FaultResponse {
        if let Some(thread) = thread {
            thread.did_cow_fault();
        }

        if !vmobject.is_anonymous() {
            return FaultResponse::ShouldCrash;
        }

        let response = {
            let mut pages = vmobject.lock_pages();
            vmobject.handle_cow_fault(&mut pages, index, vaddr)
        };

        if !self.remap_vmobject_page(index) {
            error!("out of page tables after COW fault in region {:?}", self.id());
            return FaultResponse::OutOfMemory;
        }

        response
    }

    fn handle_inode_fault(
        &self,
        vmobject: &VMObject,
        index: usize,
        mark_dirty: bool,
        thread: Option<&dyn FaultingThread>,
    ) -> FaultResponse {
        let Some(inode) = vmobject.inode() else {
            return FaultResponse::ShouldCrash;
        };

        {
            let mut pages = vmobject.lock_pages();

            if pages.slot(index).page().is_some() {
                debug!("inode page {index} faulted in by someone else before reading, remapping");
                if mark_dirty {
                    pages.set_page_dirty(index, true);
                }
                drop(pages);

                return self.remap_or_oom(index);
            }
        }

        trace!("inode fault on page {index} of region {:?}", self.id());

        if let Some(thread) = thread {
            thread.did_inode_fault();
        }

        let mut buffer = vec![0u8; PAGE_SIZE];

        let nread = match inode.read_bytes((index * PAGE_SIZE) as u64, &mut buffer) {
            Ok(nread) => core::cmp::min(nread, PAGE_SIZE),
            Err(e) => {
                error!(
                    "error ({e}) while reading page {index} from inode {:?}",
                    inode.id()
                );
                return FaultResponse::ShouldCrash;
            }
        };

        // Nothing left in the file at this offset.
        if nread == 0 {
            return FaultResponse::BusError;
        }

        buffer[nread..].fill(0);

        let page = match vmobject.allocator().allocate_physical_page(PageFill::Uninit) {
            Ok(page) => page,
            Err(_) => {
                error!("unable to allocate a page for inode fault in region {:?}", self.id());
                return FaultResponse::OutOfMemory;
            }
        };

        page.write(0, &buffer);

        if self.is_executable() {
            vmobject.allocator().sync_icache(page.paddr());
        }

        let unused = {
            let mut pages = vmobject.lock_pages();

            if pages.slot(index).page().is_some() {
                debug!("inode page {index} faulted in by someone else, remapping");
                if mark_dirty {
                    pages.set_page_dirty(index, true);
                }
                Some(page)
            } else {
                assert!(
                    !pages.is_page_dirty(index),
                    "freshly loaded inode page {index} is already dirty"
                );
                *pages.slot_mut(index) = PageSlot::Present(page);
                if mark_dirty {
                    pages.set_page_dirty(index, true);
                }
                None
            }
        };

        drop(unused);

        self.remap_or_oom(index)
    }

    fn handle_dirty_on_write_fault(
        &self,
        vmobject: &VMObject,
        index: usize,
        thread: Option<&dyn FaultingThread>,
    ) -> FaultResponse {
        {
            let mut pages = vmobject.lock_pages();

            if pages.slot(index).page().is_some() {
                pages.set_page_dirty(index, true);
                drop(pages);

                return self.remap_or_oom(index);
            }
        }

        debug!("inode page {index} purged before dirty-on-write fault, reloading");
        self.handle_inode_fault(vmobject, index, true, thread)
    }
}
