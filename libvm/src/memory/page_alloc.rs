//! Physical frame allocation and commit accounting.
//!
//! Frame contents live in host memory so the VM layer can be exercised end to
//! end: the software MMU reads and writes through [`FrameAllocator::read_phys`]
//! and [`FrameAllocator::write_phys`]. The first frame is reserved as the
//! global zero frame and is never handed out.

use super::{
    PAGE_SIZE,
    address::PA,
    page::{PhysicalPage, PhysicalPageRef},
};
use crate::{
    error::{KernelError, Result},
    sync::SpinLock,
};
use alloc::{boxed::Box, sync::Arc, vec, vec::Vec};
use core::sync::atomic::{AtomicUsize, Ordering};

/// Physical address of the first frame managed by an allocator.
pub const RAM_BASE: usize = 0x4000_0000;

/// Pattern written into frames on release, so stale data is recognisable.
const FRAME_POISON: u8 = 0x5a;

/// How a freshly allocated frame should be initialised.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageFill {
    Zeroed,
    /// Leave whatever the previous owner wrote. Callers must overwrite the
    /// whole frame.
    Uninit,
}

struct FrameState {
    free: Vec<usize>,
    committed: usize,
}

pub struct FrameAllocator {
    frames: Vec<SpinLock<Box<[u8]>>>,
    state: SpinLock<FrameState>,
    icache_syncs: AtomicUsize,
    capacity: usize,
    #[cfg(test)]
    after_allocation: SpinLock<Option<Box<dyn FnOnce() + Send>>>,
}

impl FrameAllocator {
    /// Create an allocator managing `capacity` allocatable frames plus the
    /// zero frame.
    pub fn new(capacity: usize) -> Arc<Self> {
        let base_pfn = PA::from_value(RAM_BASE).to_pfn();
        let frames = (0..=capacity)
            .map(|_| SpinLock::new(vec![0u8; PAGE_SIZE].into_boxed_slice()))
            .collect();

        // Lowest frames are handed out first.
        let free = (base_pfn + 1..=base_pfn + capacity).rev().collect();

        Arc::new(Self {
            frames,
            state: SpinLock::new(FrameState { free, committed: 0 }),
            icache_syncs: AtomicUsize::new(0),
            capacity,
            #[cfg(test)]
            after_allocation: SpinLock::new(None),
        })
    }

    fn frame(&self, pa: PA) -> &SpinLock<Box<[u8]>> {
        let idx = pa
            .page_number()
            .checked_sub(PA::from_value(RAM_BASE).to_pfn())
            .filter(|idx| *idx < self.frames.len());

        match idx {
            Some(idx) => &self.frames[idx],
            None => panic!("physical address {pa} is not managed by this allocator"),
        }
    }

    /// The frame that backs every shared-zero mapping.
    pub fn zero_page_address(&self) -> PA {
        PA::from_value(RAM_BASE)
    }

    /// Allocate one frame outside of any commitment.
    ///
    /// Frames reserved by outstanding [`CommittedPages`] are not available.
    pub fn allocate_physical_page(self: &Arc<Self>, fill: PageFill) -> Result<PhysicalPageRef> {
        let pfn = {
            let mut state = self.state.lock();

            if state.free.len() <= state.committed {
                return Err(KernelError::NoMemory);
            }

            state.free.pop().ok_or(KernelError::NoMemory)?
        };

        let page = self.make_page(pfn, fill);

        #[cfg(test)]
        {
            let hook = self.after_allocation.lock().take();
            if let Some(hook) = hook {
                hook();
            }
        }

        Ok(page)
    }

    /// Run `hook` once, right after the next successful
    /// [`Self::allocate_physical_page`] and before the page is returned.
    #[cfg(test)]
    pub(crate) fn on_next_allocation(&self, hook: impl FnOnce() + Send + 'static) {
        *self.after_allocation.lock() = Some(Box::new(hook));
    }

    /// Reserve `count` frames so that later allocations from the returned
    /// [`CommittedPages`] cannot fail.
    pub fn commit_pages(self: &Arc<Self>, count: usize) -> Result<CommittedPages> {
        let mut state = self.state.lock();

        if state.free.len() - state.committed < count {
            return Err(KernelError::NoMemory);
        }

        state.committed += count;

        Ok(CommittedPages {
            allocator: self.clone(),
            remaining: count,
        })
    }

    fn allocate_committed(self: &Arc<Self>) -> PhysicalPageRef {
        let pfn = {
            let mut state = self.state.lock();

            assert!(state.committed > 0, "committed frame count underflow");
            state.committed -= 1;

            match state.free.pop() {
                Some(pfn) => pfn,
                None => panic!("committed frame missing from the free list"),
            }
        };

        self.make_page(pfn, PageFill::Zeroed)
    }

    fn uncommit(&self, count: usize) {
        let mut state = self.state.lock();

        assert!(state.committed >= count, "committed frame count underflow");
        state.committed -= count;
    }

    fn make_page(self: &Arc<Self>, pfn: usize, fill: PageFill) -> PhysicalPageRef {
        let pa = PA::from_pfn(pfn);

        if fill == PageFill::Zeroed {
            self.frame(pa).lock().fill(0);
        }

        Arc::new(PhysicalPage::new(pa, self.clone()))
    }

    pub(super) fn free_frame(&self, pa: PA) {
        self.frame(pa).lock().fill(FRAME_POISON);
        self.state.lock().free.push(pa.to_pfn());
    }

    /// Read bytes starting at `pa`. The access must not cross a frame.
    pub fn read_phys(&self, pa: PA, buf: &mut [u8]) {
        let off = pa.page_offset();
        assert!(off + buf.len() <= PAGE_SIZE, "physical read crosses a frame");

        buf.copy_from_slice(&self.frame(pa.page_aligned()).lock()[off..off + buf.len()]);
    }

    /// Write bytes starting at `pa`. The access must not cross a frame.
    ///
    /// # Panics
    ///
    /// Panics if `pa` lies in the zero frame.
    pub fn write_phys(&self, pa: PA, data: &[u8]) {
        let off = pa.page_offset();
        assert!(off + data.len() <= PAGE_SIZE, "physical write crosses a frame");
        assert!(
            pa.page_aligned() != self.zero_page_address(),
            "write to the shared zero frame"
        );

        self.frame(pa.page_aligned()).lock()[off..off + data.len()].copy_from_slice(data);
    }

    pub(super) fn copy_frame(&self, src: PA, dst: PA) {
        if src == dst {
            return;
        }

        let mut tmp = vec![0u8; PAGE_SIZE];
        self.read_phys(src, &mut tmp);
        self.write_phys(dst, &tmp);
    }

    /// Make instruction fetches from `pa` observe prior data writes.
    pub fn sync_icache(&self, pa: PA) {
        log::trace!("icache sync for {pa}");
        self.icache_syncs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn icache_sync_count(&self) -> usize {
        self.icache_syncs.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frames on the free list, including those reserved by commitments.
    pub fn free_frames(&self) -> usize {
        self.state.lock().free.len()
    }

    pub fn allocated_frames(&self) -> usize {
        self.capacity - self.free_frames()
    }

    pub fn committed_frames(&self) -> usize {
        self.state.lock().committed
    }
}

/// A reservation of frames taken with [`FrameAllocator::commit_pages`].
///
/// Unused frames are returned to the uncommitted pool when dropped.
pub struct CommittedPages {
    allocator: Arc<FrameAllocator>,
    remaining: usize,
}

impl CommittedPages {
    pub fn len(&self) -> usize {
        self.remaining
    }

    pub fn is_empty(&self) -> bool {
        self.remaining == 0
    }

    /// Take one zeroed frame from the reservation.
    ///
    /// # Panics
    ///
    /// Panics if the reservation is exhausted.
    pub fn take_one(&mut self) -> PhysicalPageRef {
        assert!(self.remaining > 0, "committed page reservation exhausted");
        self.remaining -= 1;
        self.allocator.allocate_committed()
    }

    /// Give one reserved frame back without using it.
    pub fn uncommit_one(&mut self) {
        assert!(self.remaining > 0, "committed page reservation exhausted");
        self.remaining -= 1;
        self.allocator.uncommit(1);
    }
}

impl Drop for CommittedPages {
    fn drop(&mut self) {
        if self.remaining > 0 {
            self.allocator.uncommit(self.remaining);
        }
    }
}
