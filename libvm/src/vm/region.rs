//! Regions: contiguous mappings of a [`VMObject`] into an address space.
//!
//! A region is created either unplaced (range still to be chosen by the
//! address-space allocator) or placed. Mapping binds it to one
//! [`PageDirectory`] and installs a PTE for every page; from then on the
//! fault handler keeps those PTEs in sync with the object's page slots.
//!
//! COW and file dirty tracking are enforced purely through PTE protection:
//! a page that needs either is mapped read-only, so the first write to it
//! traps into [`Region::handle_fault`].

use super::{
    object::{PageSlots, VMObject},
    registry::KernelRegionRegistry,
};
use crate::{
    error::{KernelError, MapError, Result},
    memory::{
        KERNEL_BASE, PAGE_SIZE, USER_RANGE_BASE,
        address::{PA, VA},
        is_user_accessible,
        page::PageSlot,
        page_directory::{CpuFeatures, ENTRIES_PER_TABLE, MemoryType, PageDirectory, PageTables},
        range::VirtRange,
    },
    sync::{SpinLock, spin_until},
};
use alloc::{
    string::String,
    sync::{Arc, Weak},
    vec::Vec,
};
use bitflags::bitflags;
use core::{
    mem,
    sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering},
};
use log::{error, trace, warn};

#[cfg(test)]
mod tests;

bitflags! {
    /// Access rights of a region.
    ///
    /// Granting a right also sets its sticky `HAS_BEEN_*` bit, which survives
    /// the right being revoked again.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Access: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
        const HAS_BEEN_READABLE = 1 << 4;
        const HAS_BEEN_WRITABLE = 1 << 5;
        const HAS_BEEN_EXECUTABLE = 1 << 6;
    }
}

impl Access {
    pub const RW: Self = Self::READ.union(Self::WRITE);
    pub const RX: Self = Self::READ.union(Self::EXECUTE);

    /// The rights currently granted, without the sticky bits.
    pub fn current(self) -> Self {
        self & (Self::READ | Self::WRITE | Self::EXECUTE)
    }

    fn with_shadow_bits(self) -> Self {
        let current = self.current();
        current | Self::from_bits_truncate(current.bits() << 4) | self
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct RegionFlags: u8 {
        const STACK = 1 << 0;
        const MMAP = 1 << 1;
        const MMAPPED_FROM_READABLE = 1 << 2;
        const MMAPPED_FROM_WRITABLE = 1 << 3;
        const SYSCALL_REGION = 1 << 4;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShouldFlushTlb {
    No,
    Yes,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegionId(u64);

static NEXT_REGION_ID: AtomicU64 = AtomicU64::new(1);

pub struct Region {
    id: RegionId,
    weak_self: Weak<Region>,
    range: SpinLock<VirtRange>,
    offset_in_vmobject: usize,
    vmobject: SpinLock<Option<Arc<VMObject>>>,
    name: SpinLock<Option<String>>,
    access: AtomicU8,
    flags: AtomicU8,
    memory_type: MemoryType,
    shared: AtomicBool,
    page_directory: SpinLock<Option<Arc<PageDirectory>>>,
    kernel_registry: SpinLock<Option<Weak<dyn KernelRegionRegistry>>>,
    in_progress_faults: AtomicUsize,
    dying: AtomicBool,
}

fn validate_range(range: VirtRange) -> core::result::Result<(), MapError> {
    if !range.start_address().is_page_aligned() {
        return Err(MapError::VirtNotAligned);
    }

    if range.is_empty() || !range.is_page_aligned() {
        return Err(MapError::BadSize);
    }

    Ok(())
}

fn try_clone_string(s: &str) -> Result<String> {
    let mut new = String::new();
    new.try_reserve_exact(s.len())
        .map_err(|_| KernelError::NoMemory)?;
    new.push_str(s);
    Ok(new)
}

impl Region {
    fn construct(
        range: VirtRange,
        vmobject: Option<Arc<VMObject>>,
        offset_in_vmobject: usize,
        name: Option<String>,
        access: Access,
        memory_type: MemoryType,
        shared: bool,
    ) -> Arc<Self> {
        let region = Arc::new_cyclic(|weak_self| Self {
            id: RegionId(NEXT_REGION_ID.fetch_add(1, Ordering::Relaxed)),
            weak_self: weak_self.clone(),
            range: SpinLock::new(range),
            offset_in_vmobject,
            vmobject: SpinLock::new(vmobject.clone()),
            name: SpinLock::new(name),
            access: AtomicU8::new(access.with_shadow_bits().bits()),
            flags: AtomicU8::new(0),
            memory_type,
            shared: AtomicBool::new(shared),
            page_directory: SpinLock::new(None),
            kernel_registry: SpinLock::new(None),
            in_progress_faults: AtomicUsize::new(0),
            dying: AtomicBool::new(false),
        });

        if let Some(vmobject) = vmobject {
            vmobject.add_region(&region);
        }

        region
    }

    /// A placeholder region with no backing object and an empty range.
    pub fn create_unbacked() -> Arc<Self> {
        Self::construct(
            VirtRange::empty(),
            None,
            0,
            None,
            Access::empty(),
            MemoryType::Normal,
            false,
        )
    }

    /// A region over `vmobject` whose range is assigned later with
    /// [`Region::set_range`].
    pub fn create_unplaced(
        vmobject: Arc<VMObject>,
        offset_in_vmobject: usize,
        name: Option<String>,
        access: Access,
        memory_type: MemoryType,
        shared: bool,
    ) -> Arc<Self> {
        Self::construct(
            VirtRange::empty(),
            Some(vmobject),
            offset_in_vmobject,
            name,
            access,
            memory_type,
            shared,
        )
    }

    /// A region over `vmobject` at `range`.
    ///
    /// # Panics
    ///
    /// Panics if `range` is not page-aligned or is empty. Nothing is
    /// registered with `vmobject` in that case.
    pub fn create_placed(
        range: VirtRange,
        vmobject: Arc<VMObject>,
        offset_in_vmobject: usize,
        name: Option<String>,
        access: Access,
        memory_type: MemoryType,
        shared: bool,
    ) -> Arc<Self> {
        if let Err(e) = validate_range(range) {
            panic!(
                "invalid range for placed region {}+{:#x}: {e}",
                range.start_address(),
                range.size()
            );
        }

        Self::construct(
            range,
            Some(vmobject),
            offset_in_vmobject,
            name,
            access,
            memory_type,
            shared,
        )
    }

    /// Like [`Region::create_placed`], but reports a bad range as an error.
    pub fn try_create_placed(
        range: VirtRange,
        vmobject: Arc<VMObject>,
        offset_in_vmobject: usize,
        name: Option<String>,
        access: Access,
        memory_type: MemoryType,
        shared: bool,
    ) -> Result<Arc<Self>> {
        validate_range(range)?;

        Ok(Self::construct(
            range,
            Some(vmobject),
            offset_in_vmobject,
            name,
            access,
            memory_type,
            shared,
        ))
    }

    pub fn id(&self) -> RegionId {
        self.id
    }

    pub(crate) fn weak_ref(&self) -> Weak<Region> {
        self.weak_self.clone()
    }

    pub fn range(&self) -> VirtRange {
        *self.range.lock()
    }

    pub fn vaddr(&self) -> VA {
        self.range().start_address()
    }

    pub fn size(&self) -> usize {
        self.range().size()
    }

    pub fn page_count(&self) -> usize {
        self.range().page_count()
    }

    /// Assign the range of an unplaced region.
    ///
    /// # Panics
    ///
    /// Panics if `range` is not page-aligned or is empty.
    pub fn set_range(&self, range: VirtRange) {
        if let Err(e) = validate_range(range) {
            panic!("invalid range for region placement: {e}");
        }

        *self.range.lock() = range;
    }

    pub fn offset_in_vmobject(&self) -> usize {
        self.offset_in_vmobject
    }

    /// Index of this region's first page within its object.
    pub fn first_page_index(&self) -> usize {
        self.offset_in_vmobject / PAGE_SIZE
    }

    pub fn vmobject(&self) -> Option<Arc<VMObject>> {
        self.vmobject.lock().clone()
    }

    /// Move this region onto a different object.
    pub fn set_vmobject(&self, vmobject: Arc<VMObject>) {
        let mut current = self.vmobject.lock();

        if let Some(old) = current.as_ref() {
            if Arc::ptr_eq(old, &vmobject) {
                return;
            }

            old.remove_region(self);
        }

        vmobject.add_region(self);
        *current = Some(vmobject);
    }

    pub fn name(&self) -> Option<String> {
        self.name.lock().clone()
    }

    pub fn set_name(&self, name: Option<String>) {
        *self.name.lock() = name;
    }

    pub fn access(&self) -> Access {
        Access::from_bits_truncate(self.access.load(Ordering::Acquire))
    }

    fn set_access_bit(&self, bit: Access, value: bool) {
        if value {
            self.access
                .fetch_or(bit.with_shadow_bits().bits(), Ordering::AcqRel);
        } else {
            self.access.fetch_and(!bit.bits(), Ordering::AcqRel);
        }
    }

    pub fn is_readable(&self) -> bool {
        self.access().contains(Access::READ)
    }

    pub fn is_writable(&self) -> bool {
        self.access().contains(Access::WRITE)
    }

    pub fn is_executable(&self) -> bool {
        self.access().contains(Access::EXECUTE)
    }

    pub fn has_been_readable(&self) -> bool {
        self.access().contains(Access::HAS_BEEN_READABLE)
    }

    pub fn has_been_writable(&self) -> bool {
        self.access().contains(Access::HAS_BEEN_WRITABLE)
    }

    pub fn has_been_executable(&self) -> bool {
        self.access().contains(Access::HAS_BEEN_EXECUTABLE)
    }

    /// Changing access does not touch the page tables; call
    /// [`Region::remap`] afterwards.
    pub fn set_readable(&self, value: bool) {
        self.set_access_bit(Access::READ, value);
    }

    pub fn set_writable(&self, value: bool) {
        self.set_access_bit(Access::WRITE, value);
    }

    pub fn set_executable(&self, value: bool) {
        self.set_access_bit(Access::EXECUTE, value);
    }

    pub fn memory_type(&self) -> MemoryType {
        self.memory_type
    }

    pub fn is_shared(&self) -> bool {
        self.shared.load(Ordering::Acquire)
    }

    pub fn set_shared(&self, shared: bool) {
        self.shared.store(shared, Ordering::Release);
    }

    pub fn flags(&self) -> RegionFlags {
        RegionFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    fn set_flag(&self, flag: RegionFlags, value: bool) {
        if value {
            self.flags.fetch_or(flag.bits(), Ordering::AcqRel);
        } else {
            self.flags.fetch_and(!flag.bits(), Ordering::AcqRel);
        }
    }

    pub fn is_stack(&self) -> bool {
        self.flags().contains(RegionFlags::STACK)
    }

    pub fn set_stack(&self, stack: bool) {
        self.set_flag(RegionFlags::STACK, stack);
    }

    pub fn is_mmap(&self) -> bool {
        self.flags().contains(RegionFlags::MMAP)
    }

    pub fn mmapped_from_readable(&self) -> bool {
        self.flags().contains(RegionFlags::MMAPPED_FROM_READABLE)
    }

    pub fn mmapped_from_writable(&self) -> bool {
        self.flags().contains(RegionFlags::MMAPPED_FROM_WRITABLE)
    }

    /// Record that this region was created by `mmap`, and with which rights
    /// the file it maps was opened.
    pub fn set_mmap(&self, mmap: bool, from_readable: bool, from_writable: bool) {
        self.set_flag(RegionFlags::MMAP, mmap);
        self.set_flag(RegionFlags::MMAPPED_FROM_READABLE, from_readable);
        self.set_flag(RegionFlags::MMAPPED_FROM_WRITABLE, from_writable);
    }

    pub fn is_syscall_region(&self) -> bool {
        self.flags().contains(RegionFlags::SYSCALL_REGION)
    }

    pub fn set_syscall_region(&self, value: bool) {
        self.set_flag(RegionFlags::SYSCALL_REGION, value);
    }

    pub fn is_kernel(&self) -> bool {
        let base = self.vaddr().value();
        base < USER_RANGE_BASE || base >= KERNEL_BASE
    }

    pub fn is_user(&self) -> bool {
        !self.is_kernel()
    }

    pub fn contains(&self, vaddr: VA) -> bool {
        self.range().contains_address(vaddr)
    }

    pub fn page_index_from_address(&self, vaddr: VA) -> usize {
        (vaddr.value() - self.vaddr().value()) / PAGE_SIZE
    }

    pub fn vaddr_from_page_index(&self, page_index: usize) -> VA {
        self.vaddr().add_pages(page_index)
    }

    pub fn translate_to_vmobject_page(&self, page_index: usize) -> usize {
        self.first_page_index() + page_index
    }

    /// Convert an object page index into an index within this region, if
    /// this region maps that page.
    pub fn translate_vmobject_page(&self, vmobject_index: usize) -> Option<usize> {
        let first = self.first_page_index();

        if vmobject_index < first || vmobject_index >= first + self.page_count() {
            return None;
        }

        Some(vmobject_index - first)
    }

    pub fn page_directory(&self) -> Option<Arc<PageDirectory>> {
        self.page_directory.lock().clone()
    }

    fn is_bound_to(&self, page_directory: &Arc<PageDirectory>) -> bool {
        self.page_directory
            .lock()
            .as_ref()
            .is_some_and(|pd| Arc::ptr_eq(pd, page_directory))
    }

    fn bind_page_directory(&self, page_directory: &Arc<PageDirectory>) {
        let mut binding = self.page_directory.lock();

        match binding.as_ref() {
            Some(current) if !Arc::ptr_eq(current, page_directory) => {
                panic!("region {:?} is already mapped into another page directory", self.id)
            }
            Some(_) => {}
            None => *binding = Some(page_directory.clone()),
        }
    }

    /// Number of faults currently being resolved against this region.
    pub fn in_progress_faults(&self) -> usize {
        self.in_progress_faults.load(Ordering::SeqCst)
    }

    pub(super) fn fault_counter(&self) -> &AtomicUsize {
        &self.in_progress_faults
    }

    pub fn is_dying(&self) -> bool {
        self.dying.load(Ordering::SeqCst)
    }

    /// Add this kernel region to `registry`; destruction removes it again.
    pub fn register_kernel(self: &Arc<Self>, registry: &Arc<dyn KernelRegionRegistry>) {
        assert!(self.is_kernel(), "registering a user region as a kernel region");

        *self.kernel_registry.lock() = Some(Arc::downgrade(registry));
        registry.register(self);
    }

    fn page_slots_in_range<'a>(&self, pages: &'a PageSlots) -> impl Iterator<Item = &'a PageSlot> {
        let first = self.first_page_index();
        let end = core::cmp::min(first + self.page_count(), pages.len());

        (first..end).map(move |i| pages.slot(i))
    }

    /// Bytes of this region backed by real frames.
    pub fn amount_resident(&self) -> usize {
        let Some(vmobject) = self.vmobject() else {
            return 0;
        };
        let pages = vmobject.lock_pages();

        self.page_slots_in_range(&pages)
            .filter(|slot| slot.page().is_some())
            .count()
            * PAGE_SIZE
    }

    /// Bytes of this region backed by frames also referenced elsewhere.
    pub fn amount_shared(&self) -> usize {
        let Some(vmobject) = self.vmobject() else {
            return 0;
        };
        let pages = vmobject.lock_pages();

        self.page_slots_in_range(&pages)
            .filter(|slot| slot.page().is_some_and(|page| Arc::strong_count(page) > 1))
            .count()
            * PAGE_SIZE
    }

    /// Bytes of this region that differ from their backing store.
    pub fn amount_dirty(&self) -> usize {
        match self.vmobject() {
            Some(vmobject) if vmobject.is_inode() => vmobject.amount_dirty(),
            _ => self.amount_resident(),
        }
    }

    /// Whether a write to object page `vmobject_index` needs a private copy.
    pub fn should_cow(&self, pages: &PageSlots, vmobject_index: usize) -> bool {
        pages.should_cow(vmobject_index, self.is_shared())
    }

    fn should_dirty_on_write(
        &self,
        vmobject: &VMObject,
        pages: &PageSlots,
        vmobject_index: usize,
    ) -> bool {
        vmobject.is_inode() && !pages.is_page_dirty(vmobject_index)
    }

    /// Duplicate this region for a child address space.
    ///
    /// Shared regions keep their object; private regions get a clone of it,
    /// after which neither side can observe the other's writes.
    ///
    /// Only meaningful while the owning address space is being duplicated.
    pub fn try_clone(&self) -> Result<Arc<Region>> {
        let vmobject = self.vmobject().ok_or(KernelError::NotSupported)?;

        let name = match self.name.lock().as_deref() {
            Some(name) => Some(try_clone_string(name)?),
            None => None,
        };

        if self.is_shared() {
            assert!(!self.is_stack(), "shared stack region");
            if vmobject.is_inode() {
                assert!(
                    vmobject.is_shared_inode(),
                    "shared region over a private file mapping"
                );
            }

            let region = Self::construct(
                self.range(),
                Some(vmobject),
                self.offset_in_vmobject,
                name,
                self.access(),
                self.memory_type,
                true,
            );
            region.copy_mmap_flags_from(self);

            return Ok(region);
        }

        if vmobject.is_inode() {
            assert!(
                vmobject.is_private_inode(),
                "private region over a shared file mapping"
            );
        }

        let vmobject_clone = vmobject.try_clone()?;

        // The parent's writable PTEs predate the COW marks set by the clone.
        if self.is_writable() {
            self.remap();
        }

        let region = Self::construct(
            self.range(),
            Some(vmobject_clone),
            self.offset_in_vmobject,
            name,
            self.access(),
            self.memory_type,
            false,
        );

        if self.is_stack() {
            assert!(vmobject.is_anonymous(), "stack region over a non-anonymous object");
            region.set_stack(true);
        }
        region.copy_mmap_flags_from(self);

        Ok(region)
    }

    fn copy_mmap_flags_from(&self, other: &Region) {
        self.set_mmap(
            other.is_mmap(),
            other.mmapped_from_readable(),
            other.mmapped_from_writable(),
        );
        self.set_syscall_region(other.is_syscall_region());
    }

    /// Install or clear the PTE for page `page_index` of this region.
    ///
    /// `paddr` of `None`, or a request for neither read nor write, clears
    /// the entry. Returns `false` if the page table could not be allocated.
    fn map_individual_page_impl(
        &self,
        tables: &mut PageTables,
        features: CpuFeatures,
        page_index: usize,
        paddr: Option<PA>,
        writable: bool,
    ) -> bool {
        let page_vaddr = self.vaddr_from_page_index(page_index);
        let user_allowed = is_user_accessible(page_vaddr);

        if self.is_mmap() && !user_allowed {
            panic!("about to map mmap'ed page at kernel address {page_vaddr}");
        }

        let Some(pte) = tables.ensure_pte(page_vaddr) else {
            return false;
        };

        let paddr = match paddr {
            Some(paddr) if self.is_readable() || self.is_writable() => paddr,
            _ => {
                pte.clear();
                return true;
            }
        };

        pte.set_memory_type(self.memory_type);
        pte.set_physical_page_base(paddr);
        pte.set_present(true);
        pte.set_writable(writable);
        if features.no_execute {
            pte.set_execute_disabled(!self.is_executable());
        }
        pte.set_user_allowed(user_allowed);

        trace!("mapped {page_vaddr} -> {paddr} writable={writable}");

        true
    }

    /// Map page `page_index` from the object's slot.
    fn map_slot(
        &self,
        tables: &mut PageTables,
        features: CpuFeatures,
        page_index: usize,
        vmobject: &VMObject,
        pages: &PageSlots,
    ) -> bool {
        let index = self.translate_to_vmobject_page(page_index);

        if index >= pages.len() {
            return self.map_individual_page_impl(tables, features, page_index, None, false);
        }

        let paddr = pages
            .slot(index)
            .paddr(vmobject.allocator().zero_page_address());

        let writable = self.is_writable()
            && !self.should_cow(pages, index)
            && !self.should_dirty_on_write(vmobject, pages, index);

        self.map_individual_page_impl(tables, features, page_index, paddr, writable)
    }

    /// Install every page into `page_directory`.
    ///
    /// With `bind` unset the region must already be bound to
    /// `page_directory`; if it was unmapped in the meantime nothing is
    /// installed.
    fn map_impl(
        &self,
        page_directory: &Arc<PageDirectory>,
        paddr: Option<PA>,
        flush: ShouldFlushTlb,
        bind: bool,
    ) -> Result<()> {
        let vmobject = self.vmobject();
        let pages = vmobject.as_ref().map(|vmobject| vmobject.lock_pages());
        let features = page_directory.cpu_features();
        let mut tables = page_directory.lock();

        if bind {
            self.bind_page_directory(page_directory);
        } else if !self.is_bound_to(page_directory) {
            trace!("region {:?} unmapped before remap, skipping", self.id);
            return Ok(());
        }

        let count = self.page_count();
        let mut page_index = 0;

        while page_index < count {
            let mapped = match (paddr, vmobject.as_deref(), pages.as_deref()) {
                (Some(base), _, _) => self.map_individual_page_impl(
                    &mut tables,
                    features,
                    page_index,
                    Some(base.add_pages(page_index)),
                    self.is_writable(),
                ),
                (None, Some(vmobject), Some(pages)) => {
                    self.map_slot(&mut tables, features, page_index, vmobject, pages)
                }
                _ => self.map_individual_page_impl(&mut tables, features, page_index, None, false),
            };

            if !mapped {
                break;
            }

            page_index += 1;
        }

        if page_index > 0 && flush == ShouldFlushTlb::Yes {
            tables.flush_tlb(VirtRange::new(self.vaddr(), page_index * PAGE_SIZE));
        }

        if page_index == count {
            Ok(())
        } else {
            error!(
                "region {:?}: mapped only {page_index} of {count} pages",
                self.id
            );
            Err(KernelError::NoMemory)
        }
    }

    /// Bind this region to `page_directory` and install every page from the
    /// object's slots, in index order.
    ///
    /// On failure the pages installed before the failing one stay mapped.
    pub fn map(&self, page_directory: &Arc<PageDirectory>, flush: ShouldFlushTlb) -> Result<()> {
        self.map_impl(page_directory, None, flush, true)
    }

    /// Like [`Region::map`], but maps consecutive frames starting at `paddr`.
    pub fn map_physical(
        &self,
        page_directory: &Arc<PageDirectory>,
        paddr: PA,
        flush: ShouldFlushTlb,
    ) -> Result<()> {
        self.map_impl(page_directory, Some(paddr), flush, true)
    }

    /// Rebuild every PTE of a mapped region. Does nothing if unmapped,
    /// including when an unmap races with the rebuild.
    ///
    /// # Panics
    ///
    /// Panics if a PTE cannot be installed: the range was mapped before, so
    /// its page tables already exist.
    pub fn remap(&self) {
        let Some(page_directory) = self.page_directory() else {
            return;
        };

        let mmio_base = self
            .vmobject()
            .and_then(|vmobject| vmobject.base_address())
            .map(|base| base.add_bytes(self.offset_in_vmobject));

        let result = self.map_impl(&page_directory, mmio_base, ShouldFlushTlb::Yes, false);

        if let Err(e) = result {
            panic!("remap of region {:?} failed: {e}", self.id);
        }
    }

    /// Bring the PTE for object page `vmobject_index` in line with its slot.
    ///
    /// Returns `true` if this region does not map that page or is not mapped
    /// at all. Must be called without the object's page lock held.
    pub fn remap_vmobject_page(&self, vmobject_index: usize) -> bool {
        let Some(page_index) = self.translate_vmobject_page(vmobject_index) else {
            return true;
        };
        let (Some(vmobject), Some(page_directory)) = (self.vmobject(), self.page_directory())
        else {
            return true;
        };

        let pages = vmobject.lock_pages();
        let mut tables = page_directory.lock();

        // Unmapped while we were waiting for the lock.
        if !self.is_bound_to(&page_directory) {
            return true;
        }

        let mapped = self.map_slot(
            &mut tables,
            page_directory.cpu_features(),
            page_index,
            &vmobject,
            &pages,
        );

        tables.flush_tlb(VirtRange::new(
            self.vaddr_from_page_index(page_index),
            PAGE_SIZE,
        ));

        mapped
    }

    fn unmap_with_locks_held(&self, tables: &mut PageTables, flush: ShouldFlushTlb) {
        let count = self.page_count();

        for page_index in 0..count {
            let vaddr = self.vaddr_from_page_index(page_index);
            let last_in_table = (vaddr.page_number() + 1) % ENTRIES_PER_TABLE == 0;

            tables.release_pte(vaddr, last_in_table || page_index + 1 == count);
        }

        if flush == ShouldFlushTlb::Yes && count > 0 {
            tables.flush_tlb(self.range());
        }

        *self.page_directory.lock() = None;
    }

    /// Remove every PTE of this region and drop the page-directory binding.
    pub fn unmap(&self, flush: ShouldFlushTlb) {
        let Some(page_directory) = self.page_directory() else {
            return;
        };

        let mut tables = page_directory.lock();

        if self.is_bound_to(&page_directory) {
            self.unmap_with_locks_held(&mut tables, flush);
        }
    }

    /// Point every page of this anonymous region back at the zero page.
    ///
    /// # Panics
    ///
    /// Panics if the region is not backed by anonymous memory.
    pub fn clear_to_zero(&self) {
        let Some(vmobject) = self.vmobject() else {
            return;
        };

        assert!(vmobject.is_anonymous(), "clear_to_zero on non-anonymous region");

        let released = {
            let mut pages = vmobject.lock_pages();
            let first = self.first_page_index();
            let end = core::cmp::min(first + self.page_count(), pages.len());
            let mut released = Vec::new();

            for index in first..end {
                if !pages.slot(index).is_shared_zero() {
                    released.push(mem::replace(pages.slot_mut(index), PageSlot::SharedZero));
                }
            }

            released
        };

        self.remap();

        // Old frames are released only after no PTE refers to them.
        drop(released);
    }

    /// Tear the region down: flush shared file pages, leave the object,
    /// unmap and leave the kernel registry.
    ///
    /// Faults already being handled are waited for first; faults arriving
    /// afterwards are refused. Calling this more than once has no effect.
    pub fn destroy(&self) {
        if self.dying.swap(true, Ordering::SeqCst) {
            return;
        }

        spin_until(|| self.in_progress_faults.load(Ordering::SeqCst) == 0);

        if let Some(vmobject) = self.vmobject() {
            if self.is_writable() && vmobject.is_shared_inode() {
                if let Err(e) = vmobject.sync_dirty_pages() {
                    warn!(
                        "region {:?}: failed to write back dirty pages: {e}",
                        self.id
                    );
                }
            }

            vmobject.remove_region(self);
        }

        if let Some(page_directory) = self.page_directory() {
            let mut tables = page_directory.lock();

            if self.access().current().is_empty() {
                // Nothing was mapped for a region without any access.
                *self.page_directory.lock() = None;
            } else {
                self.unmap_with_locks_held(&mut tables, ShouldFlushTlb::Yes);
            }
        }

        if self.is_kernel() {
            let registry = self.kernel_registry.lock().take();

            if let Some(registry) = registry.and_then(|r| r.upgrade()) {
                registry.unregister(self);
            }
        }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        self.destroy();
    }
}
