//! Pages, frames, and the architecture's translation granularities.

use super::addr::{Length, PhysAddress, PhysExtent, VirtAddress, VirtExtent};

/// Base-2 log of the smallest translation granule.
pub const PAGE_SHIFT: u32 = 12;

/// Smallest translation granule: one 4 KiB page.
pub const PAGE_SIZE: Length = Length::from_raw(1 << PAGE_SHIFT);

/// A level-2 leaf entry maps this much at once (2 MiB).
pub const LARGE_PAGE_SIZE: Length = Length::from_raw(1 << 21);

/// A level-3 leaf entry maps this much at once (1 GiB).
pub const HUGE_PAGE_SIZE: Length = Length::from_raw(1 << 30);

/// Entries per translation table, at every level.
pub const TABLE_ENTRY_COUNT: usize = 512;

/// Translation levels between the root table and a 4 KiB leaf.
pub const TABLE_LEVELS: usize = 4;

/// A page-aligned, page-sized range of physical memory.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd, Hash)]
pub struct Frame {
    start: PhysAddress,
}

impl Frame {
    /// # Panics
    ///
    /// Panics if `start` is not page-aligned.
    pub fn new(start: PhysAddress) -> Frame {
        assert!(start.is_aligned_to_length(PAGE_SIZE));
        Frame { start }
    }

    /// The frame containing `addr`.
    pub fn containing(addr: PhysAddress) -> Frame {
        Frame {
            start: addr.align_down(PAGE_SIZE.as_raw()),
        }
    }

    pub fn start(self) -> PhysAddress {
        self.start
    }

    pub fn extent(self) -> PhysExtent {
        PhysExtent::new(self.start, PAGE_SIZE)
    }

    /// Position of the frame counted from physical address zero.
    pub fn index(self) -> u64 {
        self.start.as_raw() >> PAGE_SHIFT
    }

    /// The nth frame after `self`, or `None` past the end of the address
    /// space.
    pub fn next(self, n: u64) -> Option<Frame> {
        let offset = Length::from_raw(PAGE_SIZE.as_raw().checked_mul(n)?);
        Some(Frame {
            start: self.start.checked_add(offset)?,
        })
    }
}

/// A page-aligned, page-sized range of one virtual address space.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd, Hash)]
pub struct Page {
    start: VirtAddress,
}

impl Page {
    /// # Panics
    ///
    /// Panics if `start` is not page-aligned.
    pub fn new(start: VirtAddress) -> Page {
        assert!(start.is_aligned_to_length(PAGE_SIZE));
        Page { start }
    }

    /// The page containing `addr`.
    pub fn containing(addr: VirtAddress) -> Page {
        Page {
            start: addr.align_down(PAGE_SIZE.as_raw()),
        }
    }

    pub fn start(self) -> VirtAddress {
        self.start
    }

    pub fn extent(self) -> VirtExtent {
        VirtExtent::new(self.start, PAGE_SIZE)
    }

    pub fn next(self, n: u64) -> Option<Page> {
        let offset = Length::from_raw(PAGE_SIZE.as_raw().checked_mul(n)?);
        Some(Page {
            start: self.start.checked_add(offset)?,
        })
    }
}

/// A non-empty run of contiguous frames.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FrameRange {
    first: Frame,
    count: u64,
}

impl FrameRange {
    pub fn new(first: Frame, count: u64) -> Option<FrameRange> {
        if count == 0 || first.next(count - 1).is_none() {
            return None;
        }
        Some(FrameRange { first, count })
    }

    pub fn one(frame: Frame) -> FrameRange {
        FrameRange {
            first: frame,
            count: 1,
        }
    }

    /// The smallest range of whole frames covering `extent`.
    pub fn containing_extent(extent: PhysExtent) -> FrameRange {
        let first = Frame::containing(extent.address());
        let last = Frame::containing(extent.last_address());
        FrameRange {
            first,
            count: last.index() - first.index() + 1,
        }
    }

    pub fn first(self) -> Frame {
        self.first
    }

    pub fn count(self) -> u64 {
        self.count
    }

    pub fn last(self) -> Frame {
        self.first.next(self.count - 1).unwrap()
    }

    pub fn iter(self) -> impl Iterator<Item = Frame> {
        (0..self.count).map(move |i| self.first.next(i).unwrap())
    }
}

/// A non-empty run of contiguous pages.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PageRange {
    first: Page,
    count: u64,
}

impl PageRange {
    pub fn new(first: Page, count: u64) -> Option<PageRange> {
        if count == 0 || first.next(count - 1).is_none() {
            return None;
        }
        Some(PageRange { first, count })
    }

    pub fn first(self) -> Page {
        self.first
    }

    pub fn count(self) -> u64 {
        self.count
    }

    pub fn last(self) -> Page {
        self.first.next(self.count - 1).unwrap()
    }

    pub fn iter(self) -> impl Iterator<Item = Page> {
        (0..self.count).map(move |i| self.first.next(i).unwrap())
    }
}
