//! Page-table primitives.
//!
//! Four levels, 512 entries each. Level 1 tables hold 4 KiB leaves;
//! levels 2 and 3 may hold 2 MiB / 1 GiB leaves directly. All tables are
//! edited through the kernel window, so these routines work on any
//! address space, active or not.

use core::ptr;

use static_assertions as sa;

use shared::memory::addr::{PhysAddress, VirtAddress};
use shared::memory::page::{PAGE_SHIFT, PAGE_SIZE, TABLE_ENTRY_COUNT};

use crate::arch::ArchMmu;
use crate::mm::physmem::{zero_frames, FrameAllocator};
use crate::mm::{MapFlags, MemError};

const PAGE: u64 = PAGE_SIZE.as_raw();

/// Slots `256..512` of the top-level table are the kernel half, common to
/// every address space.
pub const KERNEL_HALF_FIRST_SLOT: usize = 256;

/// The distinguished frame address stored (present bit clear) in a leaf to
/// mean "bind this page on first fault". Non-canonical on purpose: it can
/// never be a real frame.
pub const ON_DEMAND_FRAME: PhysAddress = PhysAddress::from_raw(0x000f_ffff_ffff_f000);

bitflags::bitflags! {
    /// Hardware entry bits, plus the software bits this kernel claims.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct PteFlags: u64 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE = 1 << 4;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
        const LARGE = 1 << 7;
        const GLOBAL = 1 << 8;
        /// Software: the leaf names memory this table tree does not own
        /// (a shareable mapping's page, device memory, the physical
        /// window); teardown must not free it.
        const BORROWED = 1 << 9;
        const NO_EXECUTE = 1 << 63;
    }
}

const ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

#[derive(Clone, Copy, Eq, PartialEq)]
#[repr(transparent)]
pub struct PageTableEntry {
    raw: u64,
}

impl PageTableEntry {
    pub const fn empty() -> PageTableEntry {
        PageTableEntry { raw: 0 }
    }

    pub fn new(addr: PhysAddress, flags: PteFlags) -> PageTableEntry {
        debug_assert_eq!(addr.as_raw() & !ADDR_MASK, 0);
        PageTableEntry {
            raw: (addr.as_raw() & ADDR_MASK) | flags.bits(),
        }
    }

    pub const fn raw(self) -> u64 {
        self.raw
    }

    pub fn addr(self) -> PhysAddress {
        PhysAddress::from_raw(self.raw & ADDR_MASK)
    }

    pub fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.raw)
    }

    pub fn is_present(self) -> bool {
        self.flags().contains(PteFlags::PRESENT)
    }

    /// Only meaningful for level-2 and level-3 entries.
    pub fn is_large(self) -> bool {
        self.flags().contains(PteFlags::LARGE)
    }

    /// A lazily-bound leaf: present bit clear, frame field holding the
    /// on-demand marker.
    pub fn is_on_demand(self) -> bool {
        !self.is_present() && self.raw & ADDR_MASK == ON_DEMAND_FRAME.as_raw()
    }
}

impl core::fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PageTableEntry")
            .field("addr", &self.addr())
            .field("flags", &self.flags())
            .finish()
    }
}

#[repr(C, align(4096))]
pub struct PageTable {
    pub entries: [PageTableEntry; TABLE_ENTRY_COUNT],
}

sa::assert_eq_size!(PageTable, [u8; 4096]);

/// Entry index for `virt` at `level` (1 = leaf tables, 4 = root).
fn index(virt: u64, level: usize) -> usize {
    ((virt >> (PAGE_SHIFT as usize + 9 * (level - 1))) & 0x1ff) as usize
}

/// Bytes covered by one entry at `level`.
const fn span_bytes(level: usize) -> u64 {
    1 << (PAGE_SHIFT as usize + 9 * (level - 1))
}

const fn span_pages(level: usize) -> u64 {
    1 << (9 * (level - 1))
}

unsafe fn table_mut<'a>(arch: &dyn ArchMmu, phys: PhysAddress) -> &'a mut PageTable {
    &mut *arch.phys_to_virt(phys).as_mut_ptr::<PageTable>()
}

/// Hardware leaf bits for an installation request.
fn leaf_flags(flags: MapFlags) -> PteFlags {
    let mut f = PteFlags::PRESENT | PteFlags::WRITABLE;
    if flags.contains(MapFlags::INACTIVE) {
        f.remove(PteFlags::PRESENT);
    }
    if user_accessible(flags) {
        f.insert(PteFlags::USER);
    }
    if flags.contains(MapFlags::UNCACHEABLE) || flags.contains(MapFlags::NO_CACHE) {
        f.insert(PteFlags::NO_CACHE);
    }
    if flags.contains(MapFlags::BORROWED) {
        f.insert(PteFlags::BORROWED);
    }
    f
}

/// Explicit `PRIVILEGED` beats a conflicting `UNPRIVILEGED`.
fn user_accessible(flags: MapFlags) -> bool {
    flags.contains(MapFlags::UNPRIVILEGED) && !flags.contains(MapFlags::PRIVILEGED)
}

/// What a walk found at a virtual address.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Probe {
    /// Nothing installed anywhere on the path.
    Unmapped,
    /// A lazily-bound leaf waiting for its first fault.
    OnDemand,
    Mapped { phys: PhysAddress, flags: PteFlags },
}

/// Walk `root` for `virt`, honouring large leaves.
pub fn translate(arch: &dyn ArchMmu, root: PhysAddress, virt: VirtAddress) -> Option<PhysAddress> {
    match probe(arch, root, virt) {
        Probe::Mapped { phys, .. } => Some(phys),
        _ => None,
    }
}

pub fn probe(arch: &dyn ArchMmu, root: PhysAddress, virt: VirtAddress) -> Probe {
    let v = virt.as_raw();
    let mut table_phys = root;
    let mut level = 4;
    loop {
        // SAFETY: table frames on the walk are owned by this table tree.
        let table = unsafe { table_mut(arch, table_phys) };
        let entry = table.entries[index(v, level)];

        if level == 1 || (entry.is_present() && entry.is_large() && level < 4) {
            if entry.is_on_demand() {
                return Probe::OnDemand;
            }
            if !entry.is_present() {
                return Probe::Unmapped;
            }
            let span = span_bytes(level);
            return Probe::Mapped {
                phys: PhysAddress::from_raw(entry.addr().as_raw() + (v & (span - 1))),
                flags: entry.flags(),
            };
        }

        if !entry.is_present() {
            return Probe::Unmapped;
        }
        table_phys = entry.addr();
        level -= 1;
    }
}

/// Walk from the root to the table holding `virt`'s entry at
/// `stop_level`, allocating missing intermediate tables. `user` upgrades
/// intermediate entries so user-accessible leaves below them work.
fn ensure_chain(
    arch: &dyn ArchMmu,
    frames: &FrameAllocator,
    root: PhysAddress,
    virt: u64,
    stop_level: usize,
    user: bool,
) -> Result<PhysAddress, MemError> {
    let mut table_phys = root;
    for level in (stop_level + 1..=4).rev() {
        // SAFETY: walk stays within this tree's table frames.
        let table = unsafe { table_mut(arch, table_phys) };
        let slot = &mut table.entries[index(virt, level)];

        if slot.is_present() {
            if slot.is_large() {
                panic!(
                    "installing a mapping beneath a large page at {:#x} (level {})",
                    virt, level
                );
            }
            if user && !slot.flags().contains(PteFlags::USER) {
                let upgraded = PageTableEntry::new(slot.addr(), slot.flags() | PteFlags::USER);
                // SAFETY: slot is a live entry in a mapped table.
                unsafe { ptr::write_volatile(slot, upgraded) };
                arch.invalidate_page(VirtAddress::from_raw(virt));
            }
            table_phys = slot.addr();
        } else {
            let frame = frames.allocate_one()?;
            // SAFETY: fresh frame, owned by us until linked.
            unsafe { zero_frames(arch, frame.start(), 1) };
            let mut flags = PteFlags::PRESENT | PteFlags::WRITABLE;
            if user {
                flags.insert(PteFlags::USER);
            }
            // SAFETY: as above.
            unsafe { ptr::write_volatile(slot, PageTableEntry::new(frame.start(), flags)) };
            table_phys = frame.start();
        }
    }
    Ok(table_phys)
}

/// Install `count` leaves translating `virt..` to `phys..`.
///
/// Ranges aligned to a large or very large boundary with enough pages left
/// are installed as single large leaves, releasing any sub-table the large
/// leaf replaces. `MapFlags::INACTIVE` installs leaves with the present
/// bit clear (the frame field still populated); `MapFlags::REPEAT` maps
/// every page to `phys` instead of advancing; the two combine to plant
/// the on-demand marker across a range.
pub fn map_fixed(
    arch: &dyn ArchMmu,
    frames: &FrameAllocator,
    root: PhysAddress,
    phys: PhysAddress,
    virt: VirtAddress,
    count: u64,
    flags: MapFlags,
) -> Result<(), MemError> {
    if count == 0
        || !virt.is_aligned_to_length(PAGE_SIZE)
        || !phys.is_aligned_to_length(PAGE_SIZE)
    {
        return Err(MemError::InvalidArgument);
    }

    let repeat = flags.contains(MapFlags::REPEAT);
    let user = user_accessible(flags);
    let large_ok = !flags.contains(MapFlags::INACTIVE) && !repeat;
    let leaf = leaf_flags(flags);

    let mut v = virt.as_raw();
    let mut p = phys.as_raw();
    let mut remaining = count;
    while remaining > 0 {
        let level = if large_ok
            && remaining >= span_pages(3)
            && v % span_bytes(3) == 0
            && p % span_bytes(3) == 0
        {
            3
        } else if large_ok
            && remaining >= span_pages(2)
            && v % span_bytes(2) == 0
            && p % span_bytes(2) == 0
        {
            2
        } else {
            1
        };

        let table_phys = ensure_chain(arch, frames, root, v, level, user)?;
        let entry_flags = if level > 1 { leaf | PteFlags::LARGE } else { leaf };
        install_leaf(arch, frames, table_phys, v, level, p, entry_flags);

        v += span_bytes(level);
        if !repeat {
            p += span_bytes(level);
        }
        remaining -= span_pages(level);
    }

    arch.table_barrier();
    Ok(())
}

fn install_leaf(
    arch: &dyn ArchMmu,
    frames: &FrameAllocator,
    table_phys: PhysAddress,
    v: u64,
    level: usize,
    p: u64,
    flags: PteFlags,
) {
    // SAFETY: `table_phys` came off this tree's walk.
    let table = unsafe { table_mut(arch, table_phys) };
    let slot = &mut table.entries[index(v, level)];
    let old = *slot;

    if old.is_present() && level > 1 && !old.is_large() {
        // A large leaf replaces a whole sub-table; its frames go back to
        // the allocator (the leaves it translated are the caller's
        // problem, the tables are ours).
        free_table_tree(arch, frames, old.addr(), level - 1);
    }

    // SAFETY: slot is a live entry in a mapped table.
    unsafe { ptr::write_volatile(slot, PageTableEntry::new(PhysAddress::from_raw(p), flags)) };

    if old.is_present() {
        arch.invalidate_range(
            VirtAddress::from_raw(v),
            VirtAddress::from_raw(v + span_bytes(level)),
        );
    }
}

/// Free every table frame in the tree below (and including) `table_phys`.
/// Leaf frames are left alone.
fn free_table_tree(arch: &dyn ArchMmu, frames: &FrameAllocator, table_phys: PhysAddress, level: usize) {
    if level > 1 {
        // SAFETY: the subtree is unlinked or about to be.
        let table = unsafe { table_mut(arch, table_phys) };
        for entry in table.entries.iter() {
            if entry.is_present() && !entry.is_large() {
                free_table_tree(arch, frames, entry.addr(), level - 1);
            }
        }
    }
    frames.free(table_phys, 1);
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct FlushOpts: u8 {
        /// Clear each visited leaf.
        const BREAK = 1 << 0;
        /// Return each present leaf's frame to the allocator (frames
        /// marked `BORROWED` stay put).
        const FREE = 1 << 1;
    }
}

/// Invalidate, and optionally tear down, the leaves covering
/// `virt..virt + count pages`. Only installed entries are visited; absent
/// upper levels are skipped without ever descending them.
///
/// # Panics
///
/// Panics if the range covers part of a large leaf but not all of it.
pub fn flush_range(
    arch: &dyn ArchMmu,
    frames: &FrameAllocator,
    root: PhysAddress,
    virt: VirtAddress,
    count: u64,
    opts: FlushOpts,
) {
    let mut v = virt.as_raw();
    let end = v + count * PAGE;

    while v < end {
        let (slot_table, level) = match locate_leaf_table(arch, root, v) {
            Some(hit) => hit,
            None => {
                // Skip to the end of the absent span.
                let span = span_bytes(absent_level(arch, root, v));
                v = (v & !(span - 1)) + span;
                continue;
            }
        };

        // SAFETY: located within this tree.
        let table = unsafe { table_mut(arch, slot_table) };
        let slot = &mut table.entries[index(v, level)];
        let entry = *slot;
        let span = span_bytes(level);

        if entry.raw() != 0 {
            if level > 1 && (v % span != 0 || end - v < span) {
                panic!("range partially covers a large mapping at {:#x}", v);
            }

            if opts.contains(FlushOpts::BREAK) {
                // SAFETY: live entry in a mapped table.
                unsafe { ptr::write_volatile(slot, PageTableEntry::empty()) };
            }
            if entry.is_present() {
                arch.invalidate_range(
                    VirtAddress::from_raw(v),
                    VirtAddress::from_raw(v + span),
                );
                if opts.contains(FlushOpts::FREE) && !entry.flags().contains(PteFlags::BORROWED) {
                    frames.free(entry.addr(), span_pages(level));
                }
            }
        }

        v += span;
    }

    arch.table_barrier();
}

/// Find the table and level holding the leaf entry for `v`, descending
/// only present, non-large entries. `None` when an upper level is absent.
fn locate_leaf_table(arch: &dyn ArchMmu, root: PhysAddress, v: u64) -> Option<(PhysAddress, usize)> {
    let mut table_phys = root;
    for level in (2..=4).rev() {
        // SAFETY: walk within the tree.
        let table = unsafe { table_mut(arch, table_phys) };
        let entry = table.entries[index(v, level)];
        if !entry.is_present() {
            return None;
        }
        if level < 4 && entry.is_large() {
            return Some((table_phys, level));
        }
        table_phys = entry.addr();
    }
    Some((table_phys, 1))
}

/// Highest level at which the walk for `v` stops on an absent entry.
fn absent_level(arch: &dyn ArchMmu, root: PhysAddress, v: u64) -> usize {
    let mut table_phys = root;
    for level in (2..=4).rev() {
        // SAFETY: walk within the tree.
        let table = unsafe { table_mut(arch, table_phys) };
        let entry = table.entries[index(v, level)];
        if !entry.is_present() {
            return level;
        }
        table_phys = entry.addr();
    }
    1
}

/// Rewrite the cache/privilege bits of every installed leaf in the range,
/// preserving the frame, size, and ownership marker.
pub fn change_flags(
    arch: &dyn ArchMmu,
    root: PhysAddress,
    virt: VirtAddress,
    count: u64,
    flags: MapFlags,
) -> Result<(), MemError> {
    if count == 0 || !virt.is_aligned_to_length(PAGE_SIZE) {
        return Err(MemError::InvalidArgument);
    }

    let fresh = leaf_flags(flags);
    let mut v = virt.as_raw();
    let end = v + count * PAGE;

    while v < end {
        let (slot_table, level) = match locate_leaf_table(arch, root, v) {
            Some(hit) => hit,
            None => {
                let span = span_bytes(absent_level(arch, root, v));
                v = (v & !(span - 1)) + span;
                continue;
            }
        };

        // SAFETY: located within this tree.
        let table = unsafe { table_mut(arch, slot_table) };
        let slot = &mut table.entries[index(v, level)];
        let entry = *slot;
        let span = span_bytes(level);

        if entry.is_present() {
            if level > 1 && (v % span != 0 || end - v < span) {
                panic!("permission change partially covers a large mapping at {:#x}", v);
            }
            let keep = entry.flags() & (PteFlags::LARGE | PteFlags::BORROWED);
            // SAFETY: live entry in a mapped table.
            unsafe {
                ptr::write_volatile(slot, PageTableEntry::new(entry.addr(), fresh | keep));
            }
            arch.invalidate_range(
                VirtAddress::from_raw(v),
                VirtAddress::from_raw(v + span),
            );
        }

        v += span;
    }

    arch.table_barrier();
    Ok(())
}

/// Copy the kernel half of `src_root` into `dst_root`.
pub fn mirror_kernel_half(arch: &dyn ArchMmu, src_root: PhysAddress, dst_root: PhysAddress) {
    // SAFETY: both roots are owned table frames.
    let src = unsafe { table_mut(arch, src_root) };
    let dst = unsafe { table_mut(arch, dst_root) };
    for i in KERNEL_HALF_FIRST_SLOT..TABLE_ENTRY_COUNT {
        // SAFETY: in-bounds entries of mapped tables.
        unsafe { ptr::write_volatile(&mut dst.entries[i], ptr::read_volatile(&src.entries[i])) };
    }
    arch.table_barrier();
}

/// Free every owned leaf frame and every table in the tree, including the
/// root. Leaves marked `BORROWED` are skipped; so is the whole kernel half
/// when `user_only` is set (process tables only borrow it).
///
/// The space must not be active on any processor.
pub fn destroy_space(arch: &dyn ArchMmu, frames: &FrameAllocator, root: PhysAddress, user_only: bool) {
    // SAFETY: the tree is being torn down; nothing else references it.
    let top = unsafe { table_mut(arch, root) };
    let limit = if user_only {
        KERNEL_HALF_FIRST_SLOT
    } else {
        TABLE_ENTRY_COUNT
    };
    for entry in top.entries[..limit].iter() {
        if entry.is_present() {
            free_tree(arch, frames, entry.addr(), 3);
        }
    }
    frames.free(root, 1);
}

fn free_tree(arch: &dyn ArchMmu, frames: &FrameAllocator, table_phys: PhysAddress, level: usize) {
    // SAFETY: subtree owned by the tree being destroyed.
    let table = unsafe { table_mut(arch, table_phys) };
    for entry in table.entries.iter() {
        if !entry.is_present() {
            continue;
        }
        if level == 1 || entry.is_large() {
            if !entry.flags().contains(PteFlags::BORROWED) {
                frames.free(entry.addr(), span_pages(level));
            }
        } else {
            free_tree(arch, frames, entry.addr(), level - 1);
        }
    }
    frames.free(table_phys, 1);
}

/// Report maximal unmapped spans in `[start, end)` at 1 GiB granularity.
/// The callback returns `false` to stop the scan.
pub fn for_each_gap(
    arch: &dyn ArchMmu,
    root: PhysAddress,
    start: VirtAddress,
    end: VirtAddress,
    mut f: impl FnMut(VirtAddress, u64) -> bool,
) {
    let mut v = start.as_raw();
    let end = end.as_raw();
    let mut gap_start = None;

    while v < end {
        // SAFETY: the root is a mapped table frame.
        let top = unsafe { table_mut(arch, root) };
        let e4 = top.entries[index(v, 4)];
        let (mapped, span) = if e4.is_present() {
            // SAFETY: present non-leaf entries point at table frames.
            let l3 = unsafe { table_mut(arch, e4.addr()) };
            (l3.entries[index(v, 3)].raw() != 0, span_bytes(3))
        } else {
            (false, span_bytes(4))
        };

        let step = ((v & !(span - 1)) + span - v).min(end - v);
        if mapped {
            if let Some(gs) = gap_start.take() {
                if !f(VirtAddress::from_raw(gs), (v - gs) >> PAGE_SHIFT) {
                    return;
                }
            }
        } else if gap_start.is_none() {
            gap_start = Some(v);
        }
        v += step;
    }

    if let Some(gs) = gap_start {
        f(VirtAddress::from_raw(gs), (end - gs) >> PAGE_SHIFT);
    }
}

/// Is every page of the range free of leaves, installed or pending?
pub fn range_is_unmapped(
    arch: &dyn ArchMmu,
    root: PhysAddress,
    virt: VirtAddress,
    count: u64,
) -> bool {
    let mut v = virt.as_raw();
    let end = v + count * PAGE;
    while v < end {
        match locate_leaf_table(arch, root, v) {
            None => {
                let span = span_bytes(absent_level(arch, root, v));
                v = (v & !(span - 1)) + span;
            }
            Some((table_phys, level)) => {
                // SAFETY: located within this tree.
                let table = unsafe { table_mut(arch, table_phys) };
                if table.entries[index(v, level)].raw() != 0 {
                    return false;
                }
                v += span_bytes(level);
            }
        }
    }
    true
}
