//! The boot-time view of physical memory.
//!
//! Firmware hands the kernel a list of physical ranges and what they may be
//! used for. Everything the memory subsystem builds is reconstructed from
//! this map on every boot; nothing is persisted.

pub mod addr;
pub mod page;

use arrayvec::ArrayVec;
use itertools::put_back;
use itertools::structs::PutBack;

pub use addr::*;
pub use page::*;

const MAP_MAX_ENTRIES: usize = 64;

/// A map of the machine's physical memory.
#[derive(Clone, Debug)]
pub struct Map {
    entries: ArrayVec<MapEntry, MAP_MAX_ENTRIES>,
}

impl Map {
    /// `src` must be sorted by start address with non-overlapping extents.
    ///
    /// # Panics
    ///
    /// Panics if `src` has more than `MAP_MAX_ENTRIES` entries.
    pub fn from_entries<T: IntoIterator<Item = MapEntry>>(src: T) -> Map {
        Map {
            entries: src.into_iter().collect(),
        }
    }

    pub fn entries(&self) -> &[MapEntry] {
        &self.entries
    }

    pub fn iter_type(&self, mem_type: MemoryType) -> impl Iterator<Item = PhysExtent> + '_ {
        self.entries
            .iter()
            .filter(move |e| e.mem_type == mem_type)
            .map(|e| e.extent)
    }

    /// One past the highest address named by any entry.
    pub fn top(&self) -> PhysAddress {
        self.entries
            .last()
            .map(|e| e.extent.end_address())
            .unwrap_or(PhysAddress::zero())
    }
}

#[derive(Clone, Copy, Debug)]
pub struct MapEntry {
    pub extent: PhysExtent,
    pub mem_type: MemoryType,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MemoryType {
    /// General memory, available for use.
    Available,
    /// Contains ACPI information, but otherwise usable.
    Acpi,
    /// Reserved and must be preserved on hibernation.
    ReservedPreserveOnHibernation,
    /// Corrupt and unusable.
    Defective,
    /// Cannot be used.
    Reserved,
}

/// Removes specified regions from a list of memory blocks.
///
/// Given `blocks`, a list of available memory, removes the regions
/// specified in `holes` and returns the remaining free memory. This may
/// involve splitting extents in `blocks`, so the result may have more
/// entries than `blocks`.
///
/// Both lists must be sorted by start address and non-overlapping.
pub fn remove_reserved<T, U>(blocks: T, holes: U) -> impl Iterator<Item = PhysExtent>
where
    T: IntoIterator<Item = PhysExtent>,
    U: IntoIterator<Item = PhysExtent>,
{
    ReserveIter {
        blocks: put_back(blocks.into_iter()),
        holes: put_back(holes.into_iter()),
    }
    .flatten()
}

struct ReserveIter<I1: Iterator, I2: Iterator> {
    blocks: PutBack<I1>,
    holes: PutBack<I2>,
}

impl<I1, I2> Iterator for ReserveIter<I1, I2>
where
    I1: Iterator<Item = PhysExtent>,
    I2: Iterator<Item = PhysExtent>,
{
    type Item = Option<PhysExtent>;

    fn next(&mut self) -> Option<Option<PhysExtent>> {
        let block = self.blocks.next()?;

        // Holes entirely below `block` can never matter again.
        while let Some(hole) = self.holes.next() {
            if hole.last_address() >= block.address() {
                self.holes.put_back(hole);
                break;
            }
        }

        let hole = match self.holes.next() {
            Some(hole) => hole,
            None => return Some(Some(block)),
        };

        // A hole entirely above `block` may still intersect a later block.
        if block.last_address() < hole.address() {
            self.holes.put_back(hole);
            return Some(Some(block));
        }

        assert!(block.has_overlap(hole));
        let left = block.left_difference(hole);
        let right = block.right_difference(hole);

        if let Some(right) = right {
            // Another hole may intersect the right part; revisit it. The
            // hole itself is spent.
            self.blocks.put_back(right);
        } else {
            // The hole may extend past `block` into the next one.
            self.holes.put_back(hole);
        }

        Some(left)
    }
}

pub fn is_sorted_and_nonoverlapping<Kind, T>(blocks: T) -> bool
where
    Kind: AddressKind,
    T: IntoIterator<Item = Extent<Kind>>,
{
    let mut iter = blocks.into_iter().peekable();
    while let Some(cur) = iter.next() {
        let Some(&next) = iter.peek() else {
            return true;
        };
        if cur.address() >= next.address() || cur.has_overlap(next) {
            return false;
        }
    }
    true
}
