//! Physical frame allocation.
//!
//! Physical memory is split into boot-donated regions, each run as an
//! independent buddy allocator. A region's bookkeeping lives inside the
//! region itself: the first page(s) hold the header and the per-page
//! in-use bitmap, and free-block list nodes are written into the free
//! blocks they describe. All of it is reached through the kernel's
//! fixed-offset window, so nothing here needs a heap.

use core::mem;
use core::ptr;
use core::sync::atomic::{AtomicU64, Ordering};

use log::info;
use spin::{Mutex, MutexGuard};
use static_assertions as sa;

use shared::memory::addr::{align_u64_up, PhysAddress, PhysExtent};
use shared::memory::page::{Frame, PAGE_SHIFT, PAGE_SIZE};

use crate::arch::ArchMmu;
use crate::mm::buddy::{
    self, aligned_block_start, bitmap_all_equal, bitmap_mark, buddy_offset, min_order,
    order_bytes, order_pages, Buckets, FreeNode, MAX_ORDER, NO_NODE,
};
use crate::mm::MemError;

const PAGE: u64 = PAGE_SIZE.as_raw();

/// Lives in the first page of every region. The in-use bitmap follows it
/// immediately; both are only touched through the kernel window.
#[repr(C)]
struct RegionHeader {
    /// Physical address of the next region's header; 0 at the tail. Only
    /// written while regions are registered at boot.
    next: u64,
    /// Physical address of the region (this header's own page).
    base: u64,
    page_count: u64,
    /// Header + bitmap pages at the start of the region, never handed out.
    reserved_pages: u64,
    /// Guards the bitmap and the bucket heads.
    inner: Mutex<Buckets>,
}

sa::const_assert!(mem::size_of::<RegionHeader>() <= 2048);

const BITMAP_OFFSET: usize = align_u64_up(mem::size_of::<RegionHeader>() as u64, 8) as usize;

/// The system-wide physical frame allocator.
pub struct FrameAllocator {
    arch: &'static dyn ArchMmu,
    /// Head of the region list. Mutated only during boot; the listing
    /// itself is immutable afterwards.
    head: Mutex<u64>,
    frames_in_use: AtomicU64,
    total_pages: AtomicU64,
}

/// A block selected but not yet carved: the owning region stays locked
/// until the allocation commits.
struct Candidate<'a> {
    hdr: &'a RegionHeader,
    inner: MutexGuard<'a, Buckets>,
    bucket: u8,
    block: u64,
    start: u64,
}

impl FrameAllocator {
    pub const fn new(arch: &'static dyn ArchMmu) -> FrameAllocator {
        FrameAllocator {
            arch,
            head: Mutex::new(0),
            frames_in_use: AtomicU64::new(0),
            total_pages: AtomicU64::new(0),
        }
    }

    /// Donate a physical extent as general memory. Returns the number of
    /// usable pages added. Boot-time only: concurrent allocation from
    /// already-registered regions is fine, but two `add_region` calls must
    /// not race.
    pub fn add_region(&self, extent: PhysExtent) -> Result<u64, MemError> {
        let aligned = extent
            .shrink_to_alignment(PAGE)
            .ok_or(MemError::InvalidArgument)?;

        // Never manage page zero; a zero address doubles as "no node".
        let mut base = aligned.address();
        let mut length = aligned.length();
        if base.is_zero() {
            if length == PAGE_SIZE {
                return Err(MemError::InvalidArgument);
            }
            base += PAGE_SIZE;
            length -= PAGE_SIZE;
        }

        let page_count = length.as_raw() >> PAGE_SHIFT;
        let bitmap_bytes = (page_count + 7) / 8;
        let reserved_pages = align_u64_up(BITMAP_OFFSET as u64 + bitmap_bytes, PAGE) >> PAGE_SHIFT;
        if reserved_pages >= page_count {
            return Err(MemError::InvalidArgument);
        }

        let hdr_ptr = self.header_ptr(base.as_raw());
        // SAFETY: the extent was donated as unused general memory and the
        // window maps it writably; nothing references it yet.
        unsafe {
            hdr_ptr.write(RegionHeader {
                next: 0,
                base: base.as_raw(),
                page_count,
                reserved_pages,
                inner: Mutex::new(Buckets::new()),
            });

            let hdr = &*hdr_ptr;
            let mut inner = hdr.inner.lock();
            let bm = self.bitmap_ptr(hdr);
            ptr::write_bytes(bm, 0, bitmap_bytes as usize);
            bitmap_mark(bm, 0, reserved_pages, true);

            let mut resolve = self.resolver();
            for (page_off, order) in buddy::cascade(reserved_pages, page_count - reserved_pages) {
                buddy::list_push(
                    &mut inner.heads[order as usize],
                    hdr.base + (page_off << PAGE_SHIFT),
                    &mut resolve,
                );
            }
        }

        // Append to the region list so earlier donations win allocation
        // ties.
        let mut head = self.head.lock();
        if *head == 0 {
            *head = base.as_raw();
        } else {
            let mut cursor = *head;
            loop {
                // SAFETY: registration is single-threaded; only the tail's
                // `next` is written, and no shared reference to it is held.
                let next = unsafe { ptr::addr_of!((*self.header_ptr(cursor)).next).read() };
                if next == 0 {
                    unsafe {
                        ptr::addr_of_mut!((*self.header_ptr(cursor)).next).write(base.as_raw());
                    }
                    break;
                }
                cursor = next;
            }
        }
        drop(head);

        let usable = page_count - reserved_pages;
        self.total_pages.fetch_add(usable, Ordering::Relaxed);
        info!(
            "physical region at {:#x}: {} pages, {} usable",
            base.as_raw(),
            page_count,
            usable
        );
        Ok(usable)
    }

    /// Allocate `count` contiguous frames whose start is aligned to
    /// `2^align_pow` and which cross no `2^boundary_pow` boundary
    /// (`boundary_pow` 0 means unconstrained). The allocation is rounded up
    /// to a whole block of `2^ceil(log2(count))` frames.
    pub fn allocate(
        &self,
        count: u64,
        align_pow: u8,
        boundary_pow: u8,
    ) -> Result<PhysAddress, MemError> {
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

        // Walk the regions, keeping the best candidate's region locked.
        // The candidate with the smallest donor block wins; ties go to the
        // earlier region.
        let mut best: Option<Candidate<'_>> = None;
        let mut region = *self.head.lock();
        while region != 0 {
            let hdr = self.header(region);
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

            region = hdr.next;
            if let Some(c) = found {
                // Replacing `best` drops the previous region's lock.
                best = Some(c);
            }
        }

        let mut c = best.ok_or(MemError::TemporaryOutage)?;
        // SAFETY: the candidate's region is locked and `block` is linked in
        // its bucket; node and bitmap memory are window-mapped.
        unsafe {
            self.carve(&mut c, order);
        }
        self.frames_in_use
            .fetch_add(order_pages(order), Ordering::Relaxed);
        Ok(PhysAddress::from_raw(c.start))
    }

    /// Allocate a single frame.
    pub fn allocate_one(&self) -> Result<Frame, MemError> {
        Ok(Frame::new(self.allocate(1, 0, 0)?))
    }

    /// Take the chosen block out of its bucket and split it down to the
    /// target, re-inserting every sibling that is not an ancestor of the
    /// target block.
    unsafe fn carve(&self, c: &mut Candidate<'_>, order: u8) {
        let base = c.hdr.base;
        let bm = self.bitmap_ptr(c.hdr);
        let mut resolve = self.resolver();

        buddy::list_remove(&mut c.inner.heads[c.bucket as usize], c.block, &mut resolve);
        bitmap_mark(bm, (c.block - base) >> PAGE_SHIFT, order_pages(c.bucket), true);

        let target = c.start - base;
        let mut cur = c.block - base;
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
            // Bitmap first, linkage second: a linked node is always free in
            // the bitmap.
            bitmap_mark(bm, sibling >> PAGE_SHIFT, order_pages(k), false);
            buddy::list_push(&mut c.inner.heads[k as usize], base + sibling, &mut resolve);
        }
        debug_assert_eq!(cur, target);
    }

    /// Return the block of `2^ceil(log2(count))` frames at `addr`.
    ///
    /// # Panics
    ///
    /// Freeing memory no region claims, freeing frames that are not
    /// allocated, or freeing with a size that does not match the block
    /// layout all panic: each one means corrupted accounting somewhere.
    pub fn free(&self, addr: PhysAddress, count: u64) {
        assert!(count > 0, "freeing an empty range at {:#x}", addr.as_raw());
        assert!(
            addr.is_aligned_to_length(PAGE_SIZE),
            "freeing unaligned address {:#x}",
            addr.as_raw()
        );
        let order = min_order(count);
        let pages = order_pages(order);
        let a = addr.as_raw();

        let mut region = *self.head.lock();
        let hdr = loop {
            if region == 0 {
                panic!("freeing {:#x}: no region claims it", a);
            }
            let hdr = self.header(region);
            if a >= hdr.base && a < hdr.base + (hdr.page_count << PAGE_SHIFT) {
                break hdr;
            }
            region = hdr.next;
        };

        let mut inner = hdr.inner.lock();
        let bm = self.bitmap_ptr(hdr);
        let first_page = (a - hdr.base) >> PAGE_SHIFT;
        assert!(
            first_page >= hdr.reserved_pages && first_page + pages <= hdr.page_count,
            "freeing {:#x}: outside the region's usable range",
            a
        );
        assert_eq!(
            (a - hdr.base) % order_bytes(order),
            0,
            "freeing {:#x}: not the base of an order-{} block",
            a,
            order
        );

        // SAFETY: the region is locked; bitmap and nodes are
        // window-mapped.
        unsafe {
            assert!(
                bitmap_all_equal(bm, first_page, pages, true),
                "freeing {:#x}: frames not in use",
                a
            );
            bitmap_mark(bm, first_page, pages, false);

            let mut resolve = self.resolver();
            let region_bytes = hdr.page_count << PAGE_SHIFT;
            let mut off = a - hdr.base;
            let mut k = order;
            while (k as usize) < MAX_ORDER - 1 {
                let buddy = buddy_offset(off, k);
                if buddy + order_bytes(k) > region_bytes {
                    break;
                }
                // The buddy must be free in the bitmap *and* currently be
                // a block of exactly this order; a bigger or smaller free
                // neighbor does not merge.
                if !bitmap_all_equal(bm, buddy >> PAGE_SHIFT, order_pages(k), false) {
                    break;
                }
                if !buddy::list_contains(inner.heads[k as usize], hdr.base + buddy, &mut resolve) {
                    break;
                }
                buddy::list_remove(&mut inner.heads[k as usize], hdr.base + buddy, &mut resolve);
                off = off.min(buddy);
                k += 1;
            }
            buddy::list_push(&mut inner.heads[k as usize], hdr.base + off, &mut resolve);
        }

        let prev = self.frames_in_use.fetch_sub(pages, Ordering::Relaxed);
        assert!(prev >= pages, "frame accounting underflow");
    }

    /// Frames currently handed out.
    pub fn frames_in_use(&self) -> u64 {
        self.frames_in_use.load(Ordering::Relaxed)
    }

    /// Usable frames across all regions.
    pub fn total_pages(&self) -> u64 {
        self.total_pages.load(Ordering::Relaxed)
    }

    fn header_ptr(&self, region: u64) -> *mut RegionHeader {
        self.arch
            .phys_to_virt(PhysAddress::from_raw(region))
            .as_mut_ptr()
    }

    fn header(&self, region: u64) -> &RegionHeader {
        // SAFETY: headers are initialized in `add_region` before they are
        // linked and live for the allocator's lifetime.
        unsafe { &*self.header_ptr(region) }
    }

    fn bitmap_ptr(&self, hdr: &RegionHeader) -> *mut u8 {
        (hdr as *const RegionHeader as *mut u8).wrapping_add(BITMAP_OFFSET)
    }

    fn resolver(&self) -> impl FnMut(u64) -> *mut FreeNode + '_ {
        move |addr| {
            self.arch
                .phys_to_virt(PhysAddress::from_raw(addr))
                .as_mut_ptr()
        }
    }
}

/// Fill `count` frames starting at `start` with zeroes through the kernel
/// window.
///
/// # Safety
///
/// The caller must own the frames.
pub unsafe fn zero_frames(arch: &dyn ArchMmu, start: PhysAddress, count: u64) {
    ptr::write_bytes(
        arch.phys_to_virt(start).as_mut_ptr::<u8>(),
        0,
        (count << PAGE_SHIFT) as usize,
    );
}

#[cfg(test)]
impl FrameAllocator {
    /// Every free block as `(address, order)`, for inspection.
    pub(crate) fn free_blocks(&self) -> Vec<(u64, u8)> {
        let mut out = Vec::new();
        let mut resolve = self.resolver();
        let mut region = *self.head.lock();
        while region != 0 {
            let hdr = self.header(region);
            let inner = hdr.inner.lock();
            for (k, &head) in inner.heads.iter().enumerate() {
                let mut cursor = head;
                while cursor != NO_NODE {
                    out.push((cursor, k as u8));
                    cursor = unsafe { (*resolve(cursor)).next };
                }
            }
            region = hdr.next;
        }
        out.sort_unstable();
        out
    }

    /// No two free blocks of equal order may be buddies: they should have
    /// merged.
    pub(crate) fn assert_buddies_merged(&self) {
        let blocks = self.free_blocks();
        let mut region = *self.head.lock();
        while region != 0 {
            let hdr = self.header(region);
            for &(addr, order) in &blocks {
                if addr < hdr.base || addr >= hdr.base + (hdr.page_count << PAGE_SHIFT) {
                    continue;
                }
                let buddy = hdr.base + buddy_offset(addr - hdr.base, order);
                assert!(
                    !blocks.contains(&(buddy, order)),
                    "unmerged buddies at {:#x}/{:#x} order {}",
                    addr,
                    buddy,
                    order
                );
            }
            region = hdr.next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::testutil::SimMmu;

    const PB: u64 = crate::testutil::SIM_PHYS_BASE;

    fn fixture(pages: u64) -> (&'static SimMmu, FrameAllocator) {
        let arch = SimMmu::leak_arena(pages);
        let alloc = FrameAllocator::new(arch);
        alloc.add_region(arch.phys_extent()).unwrap();
        (arch, alloc)
    }

    /// Allocate single frames until the well runs dry.
    fn drain(alloc: &FrameAllocator) -> Vec<u64> {
        let mut out = Vec::new();
        while let Ok(a) = alloc.allocate(1, 0, 0) {
            out.push(a.as_raw());
        }
        out
    }

    #[test_log::test]
    fn first_allocation_is_lowest_usable_page() {
        let (_, alloc) = fixture(64);
        // Page 0 of the region holds the header and bitmap.
        let got = alloc.allocate(1, 0, 0).unwrap();
        assert_eq!(got.as_raw(), PB + PAGE);
        assert_eq!(alloc.frames_in_use(), 1);
    }

    #[test]
    fn accounting_rounds_to_blocks() {
        let (_, alloc) = fixture(64);
        let a = alloc.allocate(3, 0, 0).unwrap();
        assert_eq!(alloc.frames_in_use(), 4);
        alloc.free(a, 3);
        assert_eq!(alloc.frames_in_use(), 0);
    }

    #[test]
    fn exhaustion_reports_outage() {
        let (_, alloc) = fixture(16);
        assert_eq!(alloc.allocate(64, 0, 0), Err(MemError::TemporaryOutage));
        assert_eq!(alloc.allocate(0, 0, 0), Err(MemError::InvalidArgument));
    }

    #[test]
    fn coalesces_adjacent_singles() {
        let (_, alloc) = fixture(64);
        let a = alloc.allocate(2, 0, 0).unwrap();
        let a = a.as_raw();

        alloc.free(PhysAddress::from_raw(a), 1);
        alloc.free(PhysAddress::from_raw(a + PAGE), 1);

        let blocks = alloc.free_blocks();
        assert!(blocks.contains(&(a, 1)), "expected order-1 block at {a:#x}: {blocks:x?}");
        assert!(!blocks.contains(&(a, 0)));
        assert!(!blocks.contains(&(a + PAGE, 0)));
        alloc.assert_buddies_merged();
    }

    #[test]
    fn aligned_extraction_recovers_remainder_exactly() {
        // Region base at PB + 0x1000 so the order-2 grid is misaligned
        // with respect to 8 KiB absolute alignment.
        let arch = SimMmu::leak_arena(64);
        let alloc = FrameAllocator::new(arch);
        let ext = arch.phys_extent();
        alloc
            .add_region(PhysExtent::new(
                ext.address() + PAGE_SIZE,
                ext.length() - PAGE_SIZE,
            ))
            .unwrap();
        let base = PB + PAGE;

        // Shape the region into a single free order-2 block at base +
        // 0x4000 (absolute PB + 0x5000, which is not 8 KiB aligned).
        let everything = drain(&alloc);
        assert!(everything.contains(&(base + 0x4000)));
        alloc.free(PhysAddress::from_raw(base + 0x4000), 4);

        let got = alloc.allocate(1, 13, 0).unwrap();
        assert_eq!(got.as_raw(), base + 0x5000);
        assert_eq!(got.as_raw() % (1 << 13), 0);

        // The remainder comes back as one order-0 and one order-1 block.
        let blocks = alloc.free_blocks();
        assert_eq!(blocks, vec![(base + 0x4000, 0), (base + 0x6000, 1)]);
        alloc.assert_buddies_merged();
    }

    #[test]
    fn boundary_constraint_honoured() {
        let (_, alloc) = fixture(128);
        // Two frames that must not straddle a 64 KiB line.
        let a = alloc.allocate(2, 0, 16).unwrap().as_raw();
        assert_eq!(a >> 16, (a + 2 * PAGE - 1) >> 16);
    }

    #[test]
    fn earlier_region_wins_ties() {
        let arch = SimMmu::leak_arena(64);
        let alloc = FrameAllocator::new(arch);
        let ext = arch.phys_extent();
        let half = shared::memory::addr::Length::from_raw(32 * PAGE);
        let first = PhysExtent::new(ext.address(), half);
        let second = PhysExtent::new(ext.address() + half, half);
        alloc.add_region(first).unwrap();
        alloc.add_region(second).unwrap();

        let a = alloc.allocate(1, 0, 0).unwrap();
        assert!(first.contains_address(a));
    }

    #[test]
    #[should_panic(expected = "no region claims")]
    fn freeing_foreign_memory_panics() {
        let (_, alloc) = fixture(16);
        alloc.free(PhysAddress::from_raw(0x4000_0000), 1);
    }

    #[test]
    #[should_panic(expected = "frames not in use")]
    fn double_free_panics() {
        let (_, alloc) = fixture(16);
        let a = alloc.allocate(1, 0, 0).unwrap();
        alloc.free(a, 1);
        alloc.free(a, 1);
    }

    #[test]
    #[should_panic(expected = "not the base")]
    fn size_mismatch_panics() {
        let (_, alloc) = fixture(64);
        let a = alloc.allocate(4, 0, 0).unwrap();
        // Freeing the middle of the block with a bogus size trips the
        // grid check.
        alloc.free(PhysAddress::from_raw(a.as_raw() + PAGE), 4);
    }

    #[test]
    fn zeroing_fills_frames() {
        let (arch, alloc) = fixture(16);
        let a = alloc.allocate(2, 0, 0).unwrap();
        unsafe {
            let p = arch.phys_to_virt(a).as_mut_ptr::<u8>();
            p.write_bytes(0xaa, 2 * PAGE as usize);
            zero_frames(arch, a, 2);
            for i in 0..2 * PAGE as usize {
                assert_eq!(*p.add(i), 0);
            }
        }
    }

    use proptest::collection::vec as pvec;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn allocate_free_round_trip(ops in pvec((1u64..9, 0usize..4), 1..40)) {
            let arch = SimMmu::leak_arena(256);
            let alloc = FrameAllocator::new(arch);
            alloc.add_region(arch.phys_extent()).unwrap();
            let pristine = alloc.free_blocks();

            let mut live: Vec<(u64, u64)> = Vec::new();
            for (count, action) in ops {
                if action == 0 && !live.is_empty() {
                    let (addr, n) = live.swap_remove(count as usize % live.len());
                    alloc.free(PhysAddress::from_raw(addr), n);
                } else if let Ok(a) = alloc.allocate(count, 0, 0) {
                    // No two outstanding allocations may overlap.
                    let bytes = order_bytes(min_order(count));
                    for &(other, n) in &live {
                        let other_bytes = order_bytes(min_order(n));
                        prop_assert!(a.as_raw() + bytes <= other || other + other_bytes <= a.as_raw());
                    }
                    live.push((a.as_raw(), count));
                }
                alloc.assert_buddies_merged();
            }

            let outstanding: u64 = live.iter().map(|&(_, n)| order_pages(min_order(n))).sum();
            prop_assert_eq!(alloc.frames_in_use(), outstanding);

            for (addr, n) in live.drain(..) {
                alloc.free(PhysAddress::from_raw(addr), n);
            }
            prop_assert_eq!(alloc.frames_in_use(), 0);
            prop_assert_eq!(alloc.free_blocks(), pristine);
        }

        #[test]
        fn alignment_and_boundary_honoured(
            count in 1u64..9,
            align_pow in 12u8..16,
            boundary_pow in prop::sample::select(vec![0u8, 15, 16]),
        ) {
            let arch = SimMmu::leak_arena(256);
            let alloc = FrameAllocator::new(arch);
            alloc.add_region(arch.phys_extent()).unwrap();

            if let Ok(a) = alloc.allocate(count, align_pow, boundary_pow) {
                prop_assert_eq!(a.as_raw() % (1u64 << align_pow), 0);
                if boundary_pow != 0 {
                    let last = a.as_raw() + count * PAGE - 1;
                    prop_assert_eq!(a.as_raw() >> boundary_pow, last >> boundary_pow);
                }
            }
        }
    }
}
