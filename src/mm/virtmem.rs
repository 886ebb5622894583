//! Virtual region allocation within one address space.
//!
//! The same buddy discipline as physical frame allocation, with the
//! bookkeeping turned inside out: a region's header and bitmap occupy the
//! low pages of the virtual range it governs (backed by one contiguous
//! physical block, mapped at region creation), and free-block list nodes
//! are backed page-by-page: inserting a free block binds a frame to the
//! block's first page for the node to live in, removing it gives the
//! frame back.
//!
//! Frame allocation for node backing never happens while a per-region
//! lock is held; callers serialize whole operations through the address
//! space's allocation lock.

use core::mem;
use core::ptr;
use core::sync::atomic::{AtomicU64, Ordering};

use alloc::boxed::Box;
use arrayvec::ArrayVec;
use intrusive_collections::{intrusive_adapter, LinkedList, LinkedListLink};
use log::warn;
use spin::{Mutex, MutexGuard};

use shared::memory::addr::{align_u64_up, PhysAddress, VirtAddress, VirtExtent};
use shared::memory::page::{PAGE_SHIFT, PAGE_SIZE};

use crate::arch::ArchMmu;
use crate::mm::buddy::{
    self, aligned_block_start, bitmap_all_equal, bitmap_mark, buddy_offset, min_order,
    order_bytes, order_pages, Buckets, FreeNode, MAX_ORDER, NO_NODE,
};
use crate::mm::paging::{self, FlushOpts};
use crate::mm::physmem::FrameAllocator;
use crate::mm::{MapFlags, MemError};

const PAGE: u64 = PAGE_SIZE.as_raw();

/// Lives at the base of the governed virtual range, reached through its
/// cached physical backing. The in-use bitmap follows it.
#[repr(C)]
struct RegionHeader {
    base: u64,
    page_count: u64,
    reserved_pages: u64,
    inner: Mutex<Buckets>,
}

const BITMAP_OFFSET: usize = align_u64_up(mem::size_of::<RegionHeader>() as u64, 8) as usize;

/// One region in the space's region list. `header_phys` caches where the
/// in-range header landed so list walks don't re-translate it.
struct Region {
    link: LinkedListLink,
    base: u64,
    page_count: u64,
    header_phys: PhysAddress,
}

intrusive_adapter!(RegionAdapter = Box<Region>: Region { link: LinkedListLink });

/// The virtual-range allocator owned by one address space.
pub struct VirtAllocator {
    /// Region-head lock and list in one.
    regions: Mutex<LinkedList<RegionAdapter>>,
    /// Hard ceiling on pages this allocator may govern, fixed at
    /// construction to bound bitmap overhead.
    cap_pages: u64,
    served_pages: AtomicU64,
}

struct Candidate<'a> {
    hdr: &'a RegionHeader,
    inner: MutexGuard<'a, Buckets>,
    bucket: u8,
    block: u64,
    start: u64,
}

impl VirtAllocator {
    pub fn new(cap_pages: u64) -> VirtAllocator {
        VirtAllocator {
            regions: Mutex::new(LinkedList::new(RegionAdapter::new())),
            cap_pages,
            served_pages: AtomicU64::new(0),
        }
    }

    /// Pages this allocator currently governs.
    pub fn served_pages(&self) -> u64 {
        self.served_pages.load(Ordering::Relaxed)
    }

    pub fn cap_pages(&self) -> u64 {
        self.cap_pages
    }

    /// Start governing `[base, base + page_count pages)` in the space whose
    /// root table is `root`. The range is clipped to the construction cap;
    /// the pages actually taken on are returned.
    pub fn add_region(
        &self,
        arch: &dyn ArchMmu,
        frames: &FrameAllocator,
        root: PhysAddress,
        base: VirtAddress,
        page_count: u64,
    ) -> Result<u64, MemError> {
        if base.is_zero() || !base.is_aligned_to_length(PAGE_SIZE) || page_count == 0 {
            return Err(MemError::InvalidArgument);
        }

        let remaining = self.cap_pages - self.served_pages();
        let page_count = page_count.min(remaining);
        let bitmap_bytes = (page_count + 7) / 8;
        // The header's backing is one physical block; reserve the whole
        // rounded block so teardown accounts for every mapped page.
        let reserved_pages =
            (align_u64_up(BITMAP_OFFSET as u64 + bitmap_bytes, PAGE) >> PAGE_SHIFT)
                .next_power_of_two();
        if page_count == 0 || reserved_pages >= page_count {
            return Err(MemError::TemporaryOutage);
        }

        // Header and bitmap get one contiguous physical block, mapped at
        // the low pages of the range they describe.
        let header_phys = frames.allocate(reserved_pages, 0, 0)?;
        paging::map_fixed(
            arch,
            frames,
            root,
            header_phys,
            base,
            reserved_pages,
            MapFlags::empty(),
        )?;

        let hdr_ptr: *mut RegionHeader = arch.phys_to_virt(header_phys).as_mut_ptr();
        // SAFETY: the backing block is fresh and mapped through the
        // window; nothing references it yet.
        unsafe {
            hdr_ptr.write(RegionHeader {
                base: base.as_raw(),
                page_count,
                reserved_pages,
                inner: Mutex::new(Buckets::new()),
            });
            let bm = (hdr_ptr as *mut u8).add(BITMAP_OFFSET);
            ptr::write_bytes(bm, 0, bitmap_bytes as usize);
            bitmap_mark(bm, 0, reserved_pages, true);
        }

        // SAFETY: header just initialized above.
        let hdr = unsafe { &*hdr_ptr };
        for (page_off, order) in buddy::cascade(reserved_pages, page_count - reserved_pages) {
            let block = base.as_raw() + (page_off << PAGE_SHIFT);
            if let Err(e) = self.insert_free_block(arch, frames, root, hdr, block, order) {
                warn!("dropping {} virtual pages at {:#x}: {:?}", order_pages(order), block, e);
            }
        }

        self.regions.lock().push_back(Box::new(Region {
            link: LinkedListLink::new(),
            base: base.as_raw(),
            page_count,
            header_phys,
        }));
        self.served_pages.fetch_add(page_count, Ordering::Relaxed);
        Ok(page_count)
    }

    /// Reserve a run of `count` pages aligned to `2^align_pow`, crossing no
    /// `2^boundary_pow` boundary. The returned range has no leaves
    /// installed; backing it is the caller's business.
    pub fn allocate(
        &self,
        arch: &dyn ArchMmu,
        frames: &FrameAllocator,
        root: PhysAddress,
        count: u64,
        align_pow: u8,
        boundary_pow: u8,
    ) -> Result<VirtAddress, MemError> {
        if count == 0 || align_pow >= 64 || boundary_pow >= 64 {
            return Err(MemError::InvalidArgument);
        }
        let order = min_order(count);
        if order as usize >= MAX_ORDER {
            return Err(MemError::InvalidArgument);
        }
        if boundary_pow != 0 && (1u64 << boundary_pow) < order_bytes(order) {
            return Err(MemError::InvalidArgument);
        }

        let regions = self.regions.lock();

        let mut best: Option<Candidate<'_>> = None;
        for region in regions.iter() {
            let hdr = self.header(arch, region.header_phys);
            let inner = hdr.inner.lock();

            let mut found = None;
            for k in order..MAX_ORDER as u8 {
                if best.as_ref().map_or(false, |b| b.bucket <= k) {
                    break;
                }
                let block = inner.heads[k as usize];
                if block == NO_NODE {
                    continue;
                }
                if let Some(start) = aligned_block_start(
                    hdr.base,
                    block - hdr.base,
                    k,
                    order,
                    align_pow,
                    boundary_pow,
                ) {
                    found = Some(Candidate {
                        hdr,
                        inner,
                        bucket: k,
                        block,
                        start,
                    });
                    break;
                }
            }
            if let Some(c) = found {
                best = Some(c);
            }
        }

        let mut c = best.ok_or(MemError::TemporaryOutage)?;
        let hdr = c.hdr;
        let bm = self.bitmap_ptr(arch, hdr);
        let target = c.start - hdr.base;
        let block_off = c.block - hdr.base;

        // Unlink the donor and mark the whole of it allocated, still under
        // the region lock.
        let mut resolve = node_resolver(arch, root);
        // SAFETY: region locked; nodes of linked blocks are backed.
        unsafe {
            buddy::list_remove(&mut c.inner.heads[c.bucket as usize], c.block, &mut resolve);
            bitmap_mark(bm, block_off >> PAGE_SHIFT, order_pages(c.bucket), true);
        }

        // Plan the split; the re-inserts happen after the lock drops
        // because each needs a node-backing frame.
        let mut siblings: ArrayVec<(u64, u8), MAX_ORDER> = ArrayVec::new();
        let mut cur = block_off;
        let mut k = c.bucket;
        while k > order {
            k -= 1;
            let half = order_bytes(k);
            let sibling = if target < cur + half {
                cur + half
            } else {
                let s = cur;
                cur += half;
                s
            };
            siblings.push((hdr.base + sibling, k));
        }
        debug_assert_eq!(cur, target);
        drop(c.inner);

        // The donor's node page either lands inside the handed-out range
        // (unbind it) or inside the lowest sibling (reused below).
        let size = order_bytes(order);
        if c.block >= c.start && c.block < c.start + size {
            release_node_page(arch, frames, root, c.block);
        }

        for (block, k) in siblings {
            if let Err(e) = self.insert_free_block(arch, frames, root, hdr, block, k) {
                warn!("dropping {} virtual pages at {:#x}: {:?}", order_pages(k), block, e);
            }
        }

        drop(regions);
        Ok(VirtAddress::from_raw(c.start))
    }

    /// Return the block of `2^ceil(log2(count))` pages at `virt`. The
    /// caller must already have torn down any leaves in the range.
    pub fn free(
        &self,
        arch: &dyn ArchMmu,
        frames: &FrameAllocator,
        root: PhysAddress,
        virt: VirtAddress,
        count: u64,
    ) -> Result<(), MemError> {
        if count == 0 || !virt.is_aligned_to_length(PAGE_SIZE) {
            return Err(MemError::InvalidArgument);
        }
        let order = min_order(count);
        let pages = order_pages(order);
        let a = virt.as_raw();

        let regions = self.regions.lock();
        let region = regions
            .iter()
            .find(|r| a >= r.base && a < r.base + (r.page_count << PAGE_SHIFT))
            .ok_or(MemError::NoSuchResource)?;
        let hdr = self.header(arch, region.header_phys);
        let bm = self.bitmap_ptr(arch, hdr);

        let first_page = (a - hdr.base) >> PAGE_SHIFT;
        assert!(
            first_page >= hdr.reserved_pages && first_page + pages <= hdr.page_count,
            "freeing virtual {:#x}: outside the region's usable range",
            a
        );
        assert_eq!(
            (a - hdr.base) % order_bytes(order),
            0,
            "freeing virtual {:#x}: not the base of an order-{} block",
            a,
            order
        );

        let mut inner = hdr.inner.lock();
        let mut removed: ArrayVec<u64, MAX_ORDER> = ArrayVec::new();
        let (fin, fin_order);
        // SAFETY: region locked; this allocator's own bitmap and nodes.
        unsafe {
            assert!(
                bitmap_all_equal(bm, first_page, pages, true),
                "freeing virtual {:#x}: pages not in use",
                a
            );
            bitmap_mark(bm, first_page, pages, false);

            let mut resolve = node_resolver(arch, root);
            let region_bytes = hdr.page_count << PAGE_SHIFT;
            let mut off = a - hdr.base;
            let mut k = order;
            while (k as usize) < MAX_ORDER - 1 {
                let buddy = buddy_offset(off, k);
                if buddy + order_bytes(k) > region_bytes {
                    break;
                }
                if !bitmap_all_equal(bm, buddy >> PAGE_SHIFT, order_pages(k), false) {
                    break;
                }
                if !buddy::list_contains(inner.heads[k as usize], hdr.base + buddy, &mut resolve) {
                    break;
                }
                buddy::list_remove(&mut inner.heads[k as usize], hdr.base + buddy, &mut resolve);
                removed.push(hdr.base + buddy);
                off = off.min(buddy);
                k += 1;
            }
            fin = hdr.base + off;
            fin_order = k;
        }
        drop(inner);

        // Absorbed buddies lose their node backing; the surviving block's
        // node page is reused if one of them supplied it.
        for addr in removed {
            if addr != fin {
                release_node_page(arch, frames, root, addr);
            }
        }
        if let Err(e) = self.insert_free_block(arch, frames, root, hdr, fin, fin_order) {
            warn!("dropping {} virtual pages at {:#x}: {:?}", order_pages(fin_order), fin, e);
        }

        drop(regions);
        Ok(())
    }

    /// Does any region govern `virt`?
    pub fn governs(&self, virt: VirtAddress) -> bool {
        let v = virt.as_raw();
        self.regions
            .lock()
            .iter()
            .any(|r| v >= r.base && v < r.base + (r.page_count << PAGE_SHIFT))
    }

    /// Does `extent` overlap any governed range?
    pub fn overlaps(&self, extent: VirtExtent) -> bool {
        self.regions.lock().iter().any(|r| {
            VirtExtent::from_raw(r.base, r.page_count << PAGE_SHIFT).has_overlap(extent)
        })
    }

    /// Bind a node frame to the block's first page (reusing a live
    /// mapping if the page already has one), then link the block into its
    /// bucket. Bitmap before linkage.
    fn insert_free_block(
        &self,
        arch: &dyn ArchMmu,
        frames: &FrameAllocator,
        root: PhysAddress,
        hdr: &RegionHeader,
        block: u64,
        order: u8,
    ) -> Result<(), MemError> {
        let virt = VirtAddress::from_raw(block);
        if paging::translate(arch, root, virt).is_none() {
            let frame = frames.allocate_one()?;
            if let Err(e) = paging::map_fixed(arch, frames, root, frame.start(), virt, 1, MapFlags::empty()) {
                frames.free(frame.start(), 1);
                return Err(e);
            }
        }

        let bm = self.bitmap_ptr(arch, hdr);
        let mut inner = hdr.inner.lock();
        let mut resolve = node_resolver(arch, root);
        // SAFETY: region locked; the node page was just backed.
        unsafe {
            bitmap_mark(bm, (block - hdr.base) >> PAGE_SHIFT, order_pages(order), false);
            buddy::list_push(&mut inner.heads[order as usize], block, &mut resolve);
        }
        Ok(())
    }

    fn header<'a>(&'a self, arch: &dyn ArchMmu, phys: PhysAddress) -> &'a RegionHeader {
        // SAFETY: written once in `add_region`; backing lives as long as
        // the allocator.
        unsafe { &*arch.phys_to_virt(phys).as_mut_ptr::<RegionHeader>() }
    }

    fn bitmap_ptr(&self, arch: &dyn ArchMmu, hdr: &RegionHeader) -> *mut u8 {
        (hdr as *const RegionHeader as *mut u8).wrapping_add(BITMAP_OFFSET)
    }
}

fn node_resolver<'a>(
    arch: &'a dyn ArchMmu,
    root: PhysAddress,
) -> impl FnMut(u64) -> *mut FreeNode + 'a {
    move |addr| {
        let phys = paging::translate(arch, root, VirtAddress::from_raw(addr))
            .expect("free-list node page lost its backing");
        arch.phys_to_virt(phys).as_mut_ptr()
    }
}

/// Drop a node page's leaf and give its frame back.
fn release_node_page(arch: &dyn ArchMmu, frames: &FrameAllocator, root: PhysAddress, virt: u64) {
    paging::flush_range(
        arch,
        frames,
        root,
        VirtAddress::from_raw(virt),
        1,
        FlushOpts::BREAK | FlushOpts::FREE,
    );
}

#[cfg(test)]
impl VirtAllocator {
    pub(crate) fn free_blocks(&self, arch: &dyn ArchMmu, root: PhysAddress) -> Vec<(u64, u8)> {
        let mut out = Vec::new();
        let mut resolve = node_resolver(arch, root);
        for region in self.regions.lock().iter() {
            let hdr = self.header(arch, region.header_phys);
            let inner = hdr.inner.lock();
            for (k, &head) in inner.heads.iter().enumerate() {
                let mut cursor = head;
                while cursor != NO_NODE {
                    out.push((cursor, k as u8));
                    cursor = unsafe { (*resolve(cursor)).next };
                }
            }
        }
        out.sort_unstable();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    use crate::arch::USER_SPACE_BASE;
    use crate::mm::paging::range_is_unmapped;
    use crate::mm::physmem::zero_frames;
    use crate::testutil::SimMmu;

    struct Fixture {
        arch: &'static SimMmu,
        frames: FrameAllocator,
        root: PhysAddress,
    }

    fn fixture(pages: u64) -> Fixture {
        let arch = SimMmu::leak_arena(pages);
        let frames = FrameAllocator::new(arch);
        frames.add_region(arch.phys_extent()).unwrap();
        let root = frames.allocate_one().unwrap().start();
        unsafe { zero_frames(arch, root, 1) };
        Fixture { arch, frames, root }
    }

    fn valloc(f: &Fixture, region_pages: u64) -> VirtAllocator {
        let v = VirtAllocator::new(f.frames.total_pages() * 16);
        v.add_region(f.arch, &f.frames, f.root, USER_SPACE_BASE, region_pages)
            .unwrap();
        v
    }

    #[test]
    fn allocation_is_inside_the_region_and_unmapped() {
        let f = fixture(128);
        let v = valloc(&f, 64);

        let got = v
            .allocate(f.arch, &f.frames, f.root, 4, 0, 0)
            .unwrap();
        let base = USER_SPACE_BASE.as_raw();
        assert!(got.as_raw() >= base && got.as_raw() + 4 * PAGE <= base + 64 * PAGE);
        // The handed-out range carries no leaves, not even stale node
        // backings.
        assert!(range_is_unmapped(f.arch, f.root, got, 4));
    }

    #[test]
    fn free_block_nodes_are_backed() {
        let f = fixture(128);
        let v = valloc(&f, 64);

        for (block, _) in v.free_blocks(f.arch, f.root) {
            assert!(
                paging::translate(f.arch, f.root, VirtAddress::from_raw(block)).is_some(),
                "free block at {block:#x} has no node backing"
            );
        }
    }

    #[test]
    fn allocate_free_round_trip_restores_everything() {
        let f = fixture(128);
        let v = valloc(&f, 64);

        let pristine_blocks = v.free_blocks(f.arch, f.root);
        let pristine_frames = f.frames.frames_in_use();

        let a = v.allocate(f.arch, &f.frames, f.root, 4, 0, 0).unwrap();
        let b = v.allocate(f.arch, &f.frames, f.root, 1, 0, 0).unwrap();
        v.free(f.arch, &f.frames, f.root, a, 4).unwrap();
        v.free(f.arch, &f.frames, f.root, b, 1).unwrap();

        assert_eq!(v.free_blocks(f.arch, f.root), pristine_blocks);
        // Node-backing frames balanced out: the physical allocator is
        // exactly where it started.
        assert_eq!(f.frames.frames_in_use(), pristine_frames);
    }

    #[test]
    fn alignment_is_honoured() {
        let f = fixture(256);
        let v = valloc(&f, 128);

        let got = v.allocate(f.arch, &f.frames, f.root, 1, 14, 0).unwrap();
        assert_eq!(got.as_raw() % (1 << 14), 0);
    }

    #[test]
    fn cap_bounds_served_pages() {
        let f = fixture(128);
        let v = VirtAllocator::new(32);
        let served = v
            .add_region(f.arch, &f.frames, f.root, USER_SPACE_BASE, 1000)
            .unwrap();
        assert_eq!(served, 32);
        assert_eq!(v.served_pages(), 32);

        // Nothing left under the cap.
        let next_base = VirtAddress::from_raw(USER_SPACE_BASE.as_raw() + (served << PAGE_SHIFT));
        assert_eq!(
            v.add_region(f.arch, &f.frames, f.root, next_base, 16),
            Err(MemError::TemporaryOutage)
        );
    }

    #[test]
    fn governs_and_overlaps() {
        let f = fixture(128);
        let v = valloc(&f, 64);
        let base = USER_SPACE_BASE.as_raw();

        assert!(v.governs(VirtAddress::from_raw(base + PAGE)));
        assert!(!v.governs(VirtAddress::from_raw(base + 64 * PAGE)));
        assert!(v.overlaps(VirtExtent::from_raw(base + 63 * PAGE, 16 * PAGE)));
        assert!(!v.overlaps(VirtExtent::from_raw(base + 64 * PAGE, PAGE)));
    }

    #[test]
    fn freeing_unknown_range_reports_miss() {
        let f = fixture(128);
        let v = valloc(&f, 64);
        assert_eq!(
            v.free(f.arch, &f.frames, f.root, VirtAddress::from_raw(0x7000_0000_0000), 1),
            Err(MemError::NoSuchResource)
        );
    }

    #[test]
    #[should_panic(expected = "pages not in use")]
    fn double_free_panics() {
        let f = fixture(128);
        let v = valloc(&f, 64);
        let a = v.allocate(f.arch, &f.frames, f.root, 2, 0, 0).unwrap();
        v.free(f.arch, &f.frames, f.root, a, 2).unwrap();
        let _ = v.free(f.arch, &f.frames, f.root, a, 2);
    }
}
