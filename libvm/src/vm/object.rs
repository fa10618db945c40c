//! Backing stores for regions.
//!
//! A [`VMObject`] owns one [`PageSlot`] per page and is shared by every
//! [`Region`] mapping it. Slots, dirty bits and copy-on-write state live
//! together behind one lock, reached through [`VMObject::lock_pages`]. Regions
//! register themselves with the object they map so that a change to one slot
//! can be propagated to every mapping of it.
//!
//! Lock order: a VM object's page lock is taken before any page directory
//! lock. The registered-region list is only ever locked on its own.

use super::{
    fault::FaultResponse,
    region::{Region, RegionId},
};
use crate::{
    error::{IoError, KernelError, Result},
    fs::Inode,
    memory::{
        PAGE_SIZE,
        address::{PA, VA},
        page::{PageSlot, PhysicalPageRef},
        page_alloc::{CommittedPages, FrameAllocator, PageFill},
    },
    sync::{SpinLock, SpinLockGuard},
};
use alloc::{
    sync::{Arc, Weak},
    vec,
    vec::Vec,
};
use core::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};
use log::{debug, warn};

static NEXT_VMOBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// How the frames of a new anonymous object are provided.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocationStrategy {
    /// Every page reads as zero; frames are allocated by the first write.
    None,
    /// Frames are committed up front but handed out on first touch.
    Reserve,
    /// Zeroed frames are installed immediately.
    AllocateNow,
}

enum Backing {
    Anonymous,
    Inode { inode: Arc<dyn Inode>, shared: bool },
    Mmio { base: PA },
}

struct AnonymousPages {
    cow: Vec<bool>,
    /// Frames promised to `LazyCommitted` slots.
    unused_committed: Option<CommittedPages>,
    /// Frames reserved when this object was last cloned, shared with the
    /// other side of the clone so that either can break COW sharing.
    shared_committed_cow: Option<Arc<SpinLock<CommittedPages>>>,
}

/// The page state of a [`VMObject`], reachable only while its lock is held.
pub struct PageSlots {
    slots: Vec<PageSlot>,
    dirty: Vec<bool>,
    anon: Option<AnonymousPages>,
}

impl PageSlots {
    fn new(slots: Vec<PageSlot>, anon: Option<AnonymousPages>) -> Self {
        let dirty = vec![false; slots.len()];
        Self { slots, dirty, anon }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slot(&self, index: usize) -> &PageSlot {
        &self.slots[index]
    }

    pub fn slot_mut(&mut self, index: usize) -> &mut PageSlot {
        &mut self.slots[index]
    }

    pub fn iter(&self) -> impl Iterator<Item = &PageSlot> {
        self.slots.iter()
    }

    pub fn is_page_dirty(&self, index: usize) -> bool {
        self.dirty[index]
    }

    pub fn set_page_dirty(&mut self, index: usize, dirty: bool) {
        self.dirty[index] = dirty;
    }

    /// Returns `true` if a write to `index` must first give the writer a
    /// private frame.
    ///
    /// Placeholder slots always do. Otherwise only private mappings of a
    /// page still marked in the COW map do.
    pub fn should_cow(&self, index: usize, shared: bool) -> bool {
        let Some(anon) = &self.anon else {
            return false;
        };

        if self.slots[index].is_sentinel() {
            return true;
        }

        !shared && anon.cow[index]
    }

    pub fn set_should_cow(&mut self, index: usize, cow: bool) {
        if let Some(anon) = &mut self.anon {
            anon.cow[index] = cow;
        }
    }

    /// Take a frame from the reservation backing `LazyCommitted` slots.
    ///
    /// # Panics
    ///
    /// Panics if this is not an anonymous object, or if the reservation is
    /// exhausted.
    pub fn allocate_committed_page(&mut self) -> PhysicalPageRef {
        match self.anon.as_mut().and_then(|a| a.unused_committed.as_mut()) {
            Some(committed) => committed.take_one(),
            None => panic!("lazily committed page without a commitment"),
        }
    }

    /// Number of slots holding a real frame.
    pub fn resident_pages(&self) -> usize {
        self.slots.iter().filter(|s| s.page().is_some()).count()
    }

    fn reset_cow_map(&mut self) {
        if let Some(anon) = &mut self.anon {
            anon.cow.fill(true);
        }
    }
}

pub struct VMObject {
    id: u64,
    backing: Backing,
    allocator: Arc<FrameAllocator>,
    pages: SpinLock<PageSlots>,
    regions: SpinLock<Vec<(RegionId, Weak<Region>)>>,
}

impl fmt::Debug for VMObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.backing {
            Backing::Anonymous => "anonymous",
            Backing::Inode { shared: true, .. } => "shared inode",
            Backing::Inode { shared: false, .. } => "private inode",
            Backing::Mmio { .. } => "mmio",
        };

        f.debug_struct("VMObject")
            .field("id", &self.id)
            .field("kind", &kind)
            .finish()
    }
}

fn page_count_for(size: usize) -> usize {
    size.div_ceil(PAGE_SIZE)
}

impl VMObject {
    fn new(backing: Backing, allocator: &Arc<FrameAllocator>, pages: PageSlots) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_VMOBJECT_ID.fetch_add(1, Ordering::Relaxed),
            backing,
            allocator: allocator.clone(),
            pages: SpinLock::new(pages),
            regions: SpinLock::new(Vec::new()),
        })
    }

    /// Create an anonymous object of `size` bytes.
    pub fn create_anonymous(
        allocator: &Arc<FrameAllocator>,
        size: usize,
        strategy: AllocationStrategy,
    ) -> Result<Arc<Self>> {
        if size == 0 || size % PAGE_SIZE != 0 {
            return Err(KernelError::InvalidValue);
        }

        let count = size / PAGE_SIZE;

        let (slots, unused_committed) = match strategy {
            AllocationStrategy::None => (vec![PageSlot::SharedZero; count], None),
            AllocationStrategy::Reserve => (
                vec![PageSlot::LazyCommitted; count],
                Some(allocator.commit_pages(count)?),
            ),
            AllocationStrategy::AllocateNow => {
                let mut committed = allocator.commit_pages(count)?;
                let slots = (0..count)
                    .map(|_| PageSlot::Present(committed.take_one()))
                    .collect();
                (slots, None)
            }
        };

        let anon = AnonymousPages {
            cow: vec![false; count],
            unused_committed,
            shared_committed_cow: None,
        };

        Ok(Self::new(
            Backing::Anonymous,
            allocator,
            PageSlots::new(slots, Some(anon)),
        ))
    }

    fn create_inode(
        allocator: &Arc<FrameAllocator>,
        inode: Arc<dyn Inode>,
        size: usize,
        shared: bool,
    ) -> Arc<Self> {
        let slots = vec![PageSlot::Empty; page_count_for(size)];

        Self::new(
            Backing::Inode { inode, shared },
            allocator,
            PageSlots::new(slots, None),
        )
    }

    /// Create a file-backed object whose writes reach the file.
    pub fn create_shared_inode(
        allocator: &Arc<FrameAllocator>,
        inode: Arc<dyn Inode>,
        size: usize,
    ) -> Arc<Self> {
        Self::create_inode(allocator, inode, size, true)
    }

    /// Create a file-backed object whose writes stay private to it.
    pub fn create_private_inode(
        allocator: &Arc<FrameAllocator>,
        inode: Arc<dyn Inode>,
        size: usize,
    ) -> Arc<Self> {
        Self::create_inode(allocator, inode, size, false)
    }

    /// Create an object covering device memory at `base`.
    pub fn create_mmio(allocator: &Arc<FrameAllocator>, base: PA, size: usize) -> Result<Arc<Self>> {
        if !base.is_page_aligned() || size == 0 {
            return Err(KernelError::InvalidValue);
        }

        let slots = vec![PageSlot::Empty; page_count_for(size)];

        Ok(Self::new(
            Backing::Mmio { base },
            allocator,
            PageSlots::new(slots, None),
        ))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn page_count(&self) -> usize {
        self.pages.lock().len()
    }

    pub fn size(&self) -> usize {
        self.page_count() * PAGE_SIZE
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self.backing, Backing::Anonymous)
    }

    pub fn is_inode(&self) -> bool {
        matches!(self.backing, Backing::Inode { .. })
    }

    pub fn is_shared_inode(&self) -> bool {
        matches!(self.backing, Backing::Inode { shared: true, .. })
    }

    pub fn is_private_inode(&self) -> bool {
        matches!(self.backing, Backing::Inode { shared: false, .. })
    }

    pub fn is_mmio(&self) -> bool {
        matches!(self.backing, Backing::Mmio { .. })
    }

    pub fn inode(&self) -> Option<&Arc<dyn Inode>> {
        match &self.backing {
            Backing::Inode { inode, .. } => Some(inode),
            _ => None,
        }
    }

    /// Physical base of an MMIO object.
    pub fn base_address(&self) -> Option<PA> {
        match self.backing {
            Backing::Mmio { base } => Some(base),
            _ => None,
        }
    }

    pub fn allocator(&self) -> &Arc<FrameAllocator> {
        &self.allocator
    }

    pub fn lock_pages(&self) -> SpinLockGuard<'_, PageSlots> {
        self.pages.lock()
    }

    /// Give the faulting mapping a private copy of page `index`.
    ///
    /// If nobody else references the frame any more the COW mark is simply
    /// dropped. The caller must remap the page afterwards.
    pub fn handle_cow_fault(&self, pages: &mut PageSlots, index: usize, vaddr: VA) -> FaultResponse {
        let Some(anon) = pages.anon.as_mut() else {
            warn!("COW fault at {vaddr} on non-anonymous object {}", self.id);
            return FaultResponse::ShouldCrash;
        };

        // The other side of the clone exhausted the shared reservation.
        if anon
            .shared_committed_cow
            .as_ref()
            .is_some_and(|pool| pool.lock().is_empty())
        {
            anon.shared_committed_cow = None;
        }

        let Some(old) = pages.slots[index].page().cloned() else {
            warn!("COW fault at {vaddr} on placeholder slot {index}");
            return FaultResponse::ShouldCrash;
        };

        // `old` plus the reference held by the slot.
        if Arc::strong_count(&old) == 2 {
            debug!("COW page at {vaddr} no longer shared, remapping r/w");
            anon.cow[index] = false;

            if let Some(pool) = &anon.shared_committed_cow {
                let mut pool = pool.lock();
                pool.uncommit_one();
                if pool.is_empty() {
                    drop(pool);
                    anon.shared_committed_cow = None;
                }
            }

            return FaultResponse::Continue;
        }

        let new = match &anon.shared_committed_cow {
            Some(pool) => pool.lock().take_one(),
            None => match self.allocator.allocate_physical_page(PageFill::Uninit) {
                Ok(page) => page,
                Err(_) => {
                    log::error!("unable to allocate a page for COW fault at {vaddr}");
                    return FaultResponse::OutOfMemory;
                }
            },
        };

        debug!(
            "COW fault at {vaddr}: copying {} -> {}",
            old.paddr(),
            new.paddr()
        );

        new.copy_from(&old);
        anon.cow[index] = false;
        pages.slots[index] = PageSlot::Present(new);

        FaultResponse::Continue
    }

    /// Duplicate this object for a private clone of a region mapping it.
    pub fn try_clone(&self) -> Result<Arc<Self>> {
        match &self.backing {
            Backing::Anonymous => self.try_clone_anonymous(),
            Backing::Inode { inode, shared } => self.try_clone_inode(inode.clone(), *shared),
            Backing::Mmio { .. } => Err(KernelError::NotSupported),
        }
    }

    fn try_clone_anonymous(&self) -> Result<Arc<Self>> {
        let mut pages = self.pages.lock();

        // Both sides become COW: reserve one frame per real page so that
        // breaking the sharing can never fail.
        let new_cow_pages_needed = pages.resident_pages();

        if new_cow_pages_needed == 0 {
            return Self::create_anonymous(
                &self.allocator,
                pages.len() * PAGE_SIZE,
                AllocationStrategy::None,
            );
        }

        let committed = self.allocator.commit_pages(new_cow_pages_needed)?;
        let shared_pool = Arc::new(SpinLock::new(committed));

        let overcommit = pages
            .anon
            .as_ref()
            .and_then(|anon| anon.unused_committed.as_ref())
            .is_some_and(|committed| !committed.is_empty());

        let slots = pages
            .slots
            .iter()
            .map(|slot| match slot {
                // The parent keeps its commitment; the child's untouched
                // pages fall back to the zero page.
                PageSlot::LazyCommitted if overcommit => PageSlot::SharedZero,
                other => other.clone(),
            })
            .collect();

        let mut child_pages = PageSlots::new(
            slots,
            Some(AnonymousPages {
                cow: vec![true; pages.len()],
                unused_committed: None,
                shared_committed_cow: Some(shared_pool.clone()),
            }),
        );
        child_pages.dirty.copy_from_slice(&pages.dirty);

        pages.reset_cow_map();
        if let Some(anon) = pages.anon.as_mut() {
            anon.shared_committed_cow = Some(shared_pool);
        }

        debug!(
            "cloned anonymous object {} with {} COW pages",
            self.id, new_cow_pages_needed
        );

        Ok(Self::new(Backing::Anonymous, &self.allocator, child_pages))
    }

    fn try_clone_inode(&self, inode: Arc<dyn Inode>, shared: bool) -> Result<Arc<Self>> {
        let pages = self.pages.lock();
        let mut slots = Vec::with_capacity(pages.len());
        let mut dirty = Vec::with_capacity(pages.len());

        for (index, slot) in pages.slots.iter().enumerate() {
            match slot.page() {
                Some(page) if pages.dirty[index] => {
                    let copy = self.allocator.allocate_physical_page(PageFill::Uninit)?;
                    copy.copy_from(page);
                    slots.push(PageSlot::Present(copy));
                    dirty.push(true);
                }
                // Clean pages are reloaded from the file on demand.
                _ => {
                    slots.push(PageSlot::Empty);
                    dirty.push(false);
                }
            }
        }

        let mut child_pages = PageSlots::new(slots, None);
        child_pages.dirty = dirty;

        Ok(Self::new(
            Backing::Inode { inode, shared },
            &self.allocator,
            child_pages,
        ))
    }

    pub fn add_region(&self, region: &Region) {
        self.regions.lock().push((region.id(), region.weak_ref()));
    }

    pub fn remove_region(&self, region: &Region) {
        self.regions.lock().retain(|(id, _)| *id != region.id());
    }

    pub fn region_count(&self) -> usize {
        self.regions.lock().len()
    }

    /// Every live region currently mapping this object.
    pub fn regions(&self) -> Vec<Arc<Region>> {
        let weak: Vec<Weak<Region>> = self
            .regions
            .lock()
            .iter()
            .map(|(_, region)| region.clone())
            .collect();

        weak.iter().filter_map(Weak::upgrade).collect()
    }

    /// Remap page `index` in every region mapping this object.
    ///
    /// Must be called without the page lock held.
    pub fn remap_regions_one_page(&self, index: usize) -> bool {
        let mut success = true;

        for region in self.regions() {
            success &= region.remap_vmobject_page(index);
        }

        success
    }

    fn remap_regions(&self) {
        for region in self.regions() {
            region.remap();
        }
    }

    /// Bytes of this object held in dirty frames.
    pub fn amount_dirty(&self) -> usize {
        let pages = self.pages.lock();

        pages
            .slots
            .iter()
            .zip(pages.dirty.iter())
            .filter(|(slot, dirty)| **dirty && slot.page().is_some())
            .count()
            * PAGE_SIZE
    }

    /// Drop every clean file-backed frame. Returns the number released.
    ///
    /// Regions are remapped so the next access reloads the page.
    pub fn release_clean_pages(&self) -> usize {
        if !self.is_inode() {
            return 0;
        }

        let released: Vec<PhysicalPageRef> = {
            let mut pages = self.pages.lock();
            let PageSlots { slots, dirty, .. } = &mut *pages;

            slots
                .iter_mut()
                .zip(dirty.iter())
                .filter(|(slot, dirty)| !**dirty && slot.page().is_some())
                .filter_map(|(slot, _)| match core::mem::take(slot) {
                    PageSlot::Present(page) => Some(page),
                    _ => None,
                })
                .collect()
        };

        if !released.is_empty() {
            debug!(
                "released {} clean pages of object {}",
                released.len(),
                self.id
            );
            self.remap_regions();
        }

        // Frames are freed only once no PTE can reach them.
        released.len()
    }

    /// Write every dirty page of a shared file-backed object back to its
    /// file.
    ///
    /// Pages are write-protected again before being written, so stores made
    /// during the write-back mark them dirty once more.
    pub fn sync_dirty_pages(&self) -> Result<()> {
        let Backing::Inode {
            inode,
            shared: true,
        } = &self.backing
        else {
            return Ok(());
        };

        let dirty: Vec<(usize, PhysicalPageRef)> = {
            let mut pages = self.pages.lock();
            let PageSlots { slots, dirty, .. } = &mut *pages;

            slots
                .iter()
                .zip(dirty.iter_mut())
                .enumerate()
                .filter(|(_, (_, dirty))| **dirty)
                .filter_map(|(index, (slot, dirty))| {
                    let page = slot.page()?.clone();
                    *dirty = false;
                    Some((index, page))
                })
                .collect()
        };

        if dirty.is_empty() {
            return Ok(());
        }

        self.remap_regions();

        let file_size = inode.size();
        let mut buf = vec![0u8; PAGE_SIZE];

        for (pos, (index, page)) in dirty.iter().enumerate() {
            let offset = (*index * PAGE_SIZE) as u64;

            if offset >= file_size {
                continue;
            }

            let len = core::cmp::min(PAGE_SIZE as u64, file_size - offset) as usize;
            page.read(0, &mut buf[..len]);

            match inode.write_bytes(offset, &buf[..len]) {
                Ok(written) if written == len => {}
                Ok(written) => {
                    warn!(
                        "short write-back of page {index} of object {}: {written} of {len} bytes",
                        self.id
                    );
                    self.redirty(&dirty[pos..]);
                    return Err(KernelError::Io(IoError::DeviceError));
                }
                Err(e) => {
                    self.redirty(&dirty[pos..]);
                    return Err(e);
                }
            }
        }

        debug!(
            "wrote back {} dirty pages of object {}",
            dirty.len(),
            self.id
        );

        Ok(())
    }

    fn redirty(&self, unwritten: &[(usize, PhysicalPageRef)]) {
        let mut pages = self.pages.lock();

        for (index, page) in unwritten {
            if pages.slots[*index]
                .page()
                .is_some_and(|current| Arc::ptr_eq(current, page))
            {
                pages.dirty[*index] = true;
            }
        }
    }
}
