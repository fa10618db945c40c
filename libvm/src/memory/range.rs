//! Contiguous virtual address ranges.
//!
//! [`VirtRange`] is the `[base, base + size)` span covered by a mapping. A
//! range that backs a placed region is always page-aligned at both ends.

use super::{PAGE_MASK, PAGE_SHIFT, address::VA};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct VirtRange {
    base: VA,
    size: usize,
}

impl VirtRange {
    /// Create a new range from a start address and a size in bytes.
    pub const fn new(base: VA, size: usize) -> Self {
        Self { base, size }
    }

    /// Create an empty range with a size of 0 and address 0.
    pub const fn empty() -> Self {
        Self {
            base: VA::null(),
            size: 0,
        }
    }

    /// Create a range from a start and end address.
    pub const fn from_start_end_address(start: VA, end: VA) -> Self {
        assert!(end.value() >= start.value());

        Self {
            base: start,
            size: end.value() - start.value(),
        }
    }

    /// Return the starting address of the range.
    pub const fn start_address(self) -> VA {
        self.base
    }

    /// Return the size of the range in bytes.
    pub const fn size(self) -> usize {
        self.size
    }

    pub const fn is_empty(self) -> bool {
        self.size == 0
    }

    /// Return the end address (exclusive) of the range.
    pub const fn end_address(self) -> VA {
        VA::from_value(self.base.value() + self.size)
    }

    /// Returns `true` if both the base and the size are page multiples.
    pub const fn is_page_aligned(self) -> bool {
        self.base.is_page_aligned() && self.size & PAGE_MASK == 0
    }

    /// Number of whole pages covered by the range.
    pub const fn page_count(self) -> usize {
        self.size >> PAGE_SHIFT
    }

    /// Address of the `index`th page of the range.
    pub const fn page_address(self, index: usize) -> VA {
        self.base.add_pages(index)
    }

    /// Returns `true` if this range contains the given address.
    pub fn contains_address(self, addr: VA) -> bool {
        addr >= self.base && addr < self.end_address()
    }

    /// Returns `true` if this range fully contains `other`.
    pub fn contains(self, other: Self) -> bool {
        self.base <= other.base && self.end_address() >= other.end_address()
    }

    /// Calculates the common overlapping range between `self` and `other`.
    ///
    /// Adjacent or disjoint ranges have no intersection.
    pub fn intersection(self, other: Self) -> Option<Self> {
        let start = core::cmp::max(self.base, other.base);
        let end = core::cmp::min(self.end_address(), other.end_address());

        if start < end {
            Some(Self::from_start_end_address(start, end))
        } else {
            None
        }
    }

    /// Returns an iterator over the start address of each whole page.
    pub fn iter_pages(self) -> impl Iterator<Item = VA> {
        (0..self.page_count()).map(move |i| self.page_address(i))
    }
}
