//! Shareable, demand-populatable memory mappings.
//!
//! A mapping is a refcounted set of *portions*, each binding a half-open
//! page range either to physical memory directly or to another mapping at
//! an offset. Address spaces reference mappings from their descriptors;
//! the same mapping may back ranges in many spaces at once. Dropping the
//! last reference frees every portion the mapping owns.

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use shared::memory::addr::{Length, PhysAddress};
use shared::memory::page::PAGE_SIZE;

use crate::arch::ArchMmu;
use crate::mm::physmem::{zero_frames, FrameAllocator};
use crate::mm::{MapFlags, MemError};

pub struct SharedMapping {
    page_count: u64,
    flags: MapFlags,
    arch: &'static dyn ArchMmu,
    frames: &'static FrameAllocator,
    portions: Mutex<Vec<Portion>>,
}

#[derive(Clone)]
struct Portion {
    offset: u64,
    count: u64,
    backing: Backing,
}

#[derive(Clone)]
enum Backing {
    /// A physical range; `owned` ranges are freed when the mapping dies.
    Direct { start: PhysAddress, owned: bool },
    /// The range is whatever `target` holds at `target_offset`.
    Indirect {
        target: Arc<SharedMapping>,
        target_offset: u64,
    },
}

/// What resolution found before leaving the portion lock.
enum Hit {
    Direct(PhysAddress),
    Chain(Arc<SharedMapping>, u64),
}

impl SharedMapping {
    /// A new mapping of `page_count` logical pages with no portions bound.
    /// The reference returned is the initial reference.
    pub fn create(
        arch: &'static dyn ArchMmu,
        frames: &'static FrameAllocator,
        page_count: u64,
        flags: MapFlags,
    ) -> Result<Arc<SharedMapping>, MemError> {
        if page_count == 0 {
            return Err(MemError::InvalidArgument);
        }
        Ok(Arc::new(SharedMapping {
            page_count,
            flags,
            arch,
            frames,
            portions: Mutex::new(Vec::new()),
        }))
    }

    pub fn page_count(&self) -> u64 {
        self.page_count
    }

    pub fn flags(&self) -> MapFlags {
        self.flags
    }

    /// Bind `[offset, offset + count)` to physical memory. With `phys`
    /// given, the range is recorded without taking ownership; without it,
    /// a contiguous block is allocated (zeroed when the mapping was
    /// created with `MapFlags::ZERO`) and owned by the mapping.
    ///
    /// Binding over any already-bound page fails with `AlreadyInProgress`.
    pub fn bind(&self, offset: u64, count: u64, phys: Option<PhysAddress>) -> Result<(), MemError> {
        self.check_range(offset, count)?;

        let mut portions = self.portions.lock();
        Self::check_unbound(&portions, offset, count)?;

        let backing = match phys {
            Some(start) => Backing::Direct {
                start,
                owned: false,
            },
            None => {
                let start = self.frames.allocate(count, 0, 0)?;
                if self.flags.contains(MapFlags::ZERO) {
                    // SAFETY: the block was just allocated for this
                    // portion.
                    unsafe { zero_frames(self.arch, start, count) };
                }
                Backing::Direct { start, owned: true }
            }
        };

        Self::insert(&mut portions, Portion {
            offset,
            count,
            backing,
        });
        Ok(())
    }

    /// Bind `[offset, offset + count)` to `target`'s pages starting at
    /// `target_offset`. Lookups chain through; the binder must not create
    /// a cycle (bindings are append-only, so refusing self-reference and
    /// honouring that rule keeps the chain finite).
    pub fn bind_indirect(
        &self,
        offset: u64,
        count: u64,
        target: &Arc<SharedMapping>,
        target_offset: u64,
    ) -> Result<(), MemError> {
        self.check_range(offset, count)?;
        if core::ptr::eq(self, Arc::as_ptr(target))
            || target_offset.checked_add(count).map_or(true, |e| e > target.page_count)
        {
            return Err(MemError::InvalidArgument);
        }

        let mut portions = self.portions.lock();
        Self::check_unbound(&portions, offset, count)?;
        Self::insert(&mut portions, Portion {
            offset,
            count,
            backing: Backing::Indirect {
                target: Arc::clone(target),
                target_offset,
            },
        });
        Ok(())
    }

    /// The physical page backing logical page `page`, chasing indirect
    /// portions. `None` when no bound portion covers it, a valid state
    /// the caller may answer by binding on demand.
    pub fn resolve(&self, page: u64) -> Option<PhysAddress> {
        match self.lookup(page)? {
            Hit::Direct(phys) => Some(phys),
            Hit::Chain(target, target_page) => target.resolve(target_page),
        }
    }

    /// `resolve`, binding a single freshly-allocated page wherever the
    /// chain runs out. This is the fault path's workhorse.
    pub fn resolve_or_bind(&self, page: u64) -> Result<PhysAddress, MemError> {
        if page >= self.page_count {
            return Err(MemError::InvalidArgument);
        }
        loop {
            match self.lookup(page) {
                Some(Hit::Direct(phys)) => return Ok(phys),
                Some(Hit::Chain(target, target_page)) => {
                    return target.resolve_or_bind(target_page)
                }
                None => match self.bind(page, 1, None) {
                    // Either we bound it or someone beat us to it; look
                    // again.
                    Ok(()) | Err(MemError::AlreadyInProgress) => continue,
                    Err(e) => return Err(e),
                },
            }
        }
    }

    fn lookup(&self, page: u64) -> Option<Hit> {
        let portions = self.portions.lock();
        let p = portions
            .iter()
            .find(|p| page >= p.offset && page < p.offset + p.count)?;
        Some(match &p.backing {
            Backing::Direct { start, .. } => {
                Hit::Direct(*start + Length::from_raw((page - p.offset) * PAGE_SIZE.as_raw()))
            }
            Backing::Indirect {
                target,
                target_offset,
            } => Hit::Chain(Arc::clone(target), target_offset + (page - p.offset)),
        })
    }

    fn check_range(&self, offset: u64, count: u64) -> Result<(), MemError> {
        if count == 0 || offset.checked_add(count).map_or(true, |e| e > self.page_count) {
            return Err(MemError::InvalidArgument);
        }
        Ok(())
    }

    fn check_unbound(portions: &[Portion], offset: u64, count: u64) -> Result<(), MemError> {
        for p in portions {
            if offset < p.offset + p.count && p.offset < offset + count {
                return Err(MemError::AlreadyInProgress);
            }
        }
        Ok(())
    }

    /// Keep the vector ordered by page offset.
    fn insert(portions: &mut Vec<Portion>, portion: Portion) {
        let at = portions
            .iter()
            .position(|p| p.offset > portion.offset)
            .unwrap_or(portions.len());
        portions.insert(at, portion);
    }
}

impl Drop for SharedMapping {
    fn drop(&mut self) {
        for p in self.portions.get_mut().drain(..) {
            if let Backing::Direct { start, owned: true } = p.backing {
                self.frames.free(start, p.count);
            }
            // Indirect portions drop their target references here,
            // releasing sub-mappings in turn.
        }
    }
}
