//! Reference-counted physical frames and the page slots that hold them.

use super::{address::PA, page_alloc::FrameAllocator};
use alloc::sync::Arc;
use core::fmt::{self, Debug};

/// One physical frame owned by a [`FrameAllocator`].
///
/// The frame is returned to its allocator when the last [`PhysicalPageRef`]
/// is dropped.
pub struct PhysicalPage {
    pa: PA,
    allocator: Arc<FrameAllocator>,
}

/// A shared handle to a [`PhysicalPage`].
pub type PhysicalPageRef = Arc<PhysicalPage>;

impl PhysicalPage {
    pub(super) fn new(pa: PA, allocator: Arc<FrameAllocator>) -> Self {
        Self { pa, allocator }
    }

    /// Base physical address of the frame.
    pub fn paddr(&self) -> PA {
        self.pa
    }

    /// Copy `data` into the frame starting at `offset`.
    pub fn write(&self, offset: usize, data: &[u8]) {
        self.allocator.write_phys(self.pa.add_bytes(offset), data);
    }

    /// Copy bytes out of the frame starting at `offset`.
    pub fn read(&self, offset: usize, buf: &mut [u8]) {
        self.allocator.read_phys(self.pa.add_bytes(offset), buf);
    }

    /// Overwrite this frame with the contents of `src`.
    pub fn copy_from(&self, src: &PhysicalPage) {
        self.allocator.copy_frame(src.pa, self.pa);
    }
}

impl Debug for PhysicalPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhysicalPage").field("pa", &self.pa).finish()
    }
}

impl Drop for PhysicalPage {
    fn drop(&mut self) {
        self.allocator.free_frame(self.pa);
    }
}

/// The content of one page index of a VM object.
///
/// Placeholder states are explicit variants so every "is this page really
/// there" check is an exhaustive match.
#[derive(Clone, Debug, Default)]
pub enum PageSlot {
    /// Nothing is mapped; a fault must populate the slot first.
    #[default]
    Empty,
    /// Reads see the global zero frame; the first write allocates.
    SharedZero,
    /// A frame has been committed for this slot but not yet handed out.
    LazyCommitted,
    /// A real frame.
    Present(PhysicalPageRef),
}

impl PageSlot {
    pub fn is_empty(&self) -> bool {
        matches!(self, PageSlot::Empty)
    }

    pub fn is_shared_zero(&self) -> bool {
        matches!(self, PageSlot::SharedZero)
    }

    pub fn is_lazy_committed(&self) -> bool {
        matches!(self, PageSlot::LazyCommitted)
    }

    /// Returns `true` for the two placeholder states that read as zeroes.
    pub fn is_sentinel(&self) -> bool {
        matches!(self, PageSlot::SharedZero | PageSlot::LazyCommitted)
    }

    /// The real frame behind this slot, if any.
    pub fn page(&self) -> Option<&PhysicalPageRef> {
        match self {
            PageSlot::Present(page) => Some(page),
            _ => None,
        }
    }

    /// The physical address a PTE for this slot should point at.
    ///
    /// Sentinels resolve to `zero_frame`; an empty slot has no address.
    pub fn paddr(&self, zero_frame: PA) -> Option<PA> {
        match self {
            PageSlot::Empty => None,
            PageSlot::SharedZero | PageSlot::LazyCommitted => Some(zero_frame),
            PageSlot::Present(page) => Some(page.paddr()),
        }
    }
}
