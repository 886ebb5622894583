//! Address spaces.
//!
//! An address space owns its top-level table, a virtual-range allocator
//! whose metadata lives inside the ranges it governs, and a list of
//! mapping descriptors recording which virtual ranges are governed by
//! shareable mappings or by anonymous lazy allocations. The kernel space
//! is a singleton built at boot; process spaces borrow its kernel half.
//!
//! The mappings lock and the allocation lock are never held together:
//! descriptors are published after their ranges are staged, and detached
//! before their ranges are torn down. Region locks only ever nest under
//! the allocation lock (through the virtual allocator).

use core::ptr;
use core::sync::atomic::{AtomicBool, Ordering};

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use intrusive_collections::{intrusive_adapter, LinkedList, LinkedListLink};
use log::warn;
use spin::Mutex;

use shared::memory::addr::{Length, PhysAddress, VirtAddress, VirtExtent};
use shared::memory::page::{Page, PAGE_SHIFT, PAGE_SIZE};

use crate::arch::{ArchMmu, KERNEL_SPACE_BASE, KERNEL_SPACE_END, USER_SPACE_BASE, USER_SPACE_END};
use crate::mm::mapping::SharedMapping;
use crate::mm::paging::{self, FlushOpts, Probe, ON_DEMAND_FRAME};
use crate::mm::physmem::{zero_frames, FrameAllocator};
use crate::mm::virtmem::VirtAllocator;
use crate::mm::{MapFlags, MemError, VIRT_PAGES_PER_PHYS_PAGE};

const PAGE: u64 = PAGE_SIZE.as_raw();

struct Descriptor {
    link: LinkedListLink,
    start: u64,
    page_count: u64,
    /// Logical page offset into `backing`, 0 for anonymous ranges.
    page_offset: u64,
    flags: MapFlags,
    /// `Some` when a shareable mapping governs the range; `None` for
    /// anonymous lazy allocations.
    backing: Option<Arc<SharedMapping>>,
}

intrusive_adapter!(DescriptorAdapter = Box<Descriptor>: Descriptor { link: LinkedListLink });

impl Descriptor {
    fn covers(&self, virt: u64) -> bool {
        virt >= self.start && virt < self.start + (self.page_count << PAGE_SHIFT)
    }
}

/// A copy of a descriptor's fields taken under the mappings lock, used to
/// detect racing changes before a fault installs its result.
#[derive(Clone)]
pub struct DescriptorSnapshot {
    pub start: VirtAddress,
    pub page_count: u64,
    pub page_offset: u64,
    pub flags: MapFlags,
    pub backing: Option<Arc<SharedMapping>>,
}

impl DescriptorSnapshot {
    fn matches(&self, d: &Descriptor) -> bool {
        self.start.as_raw() == d.start
            && self.page_count == d.page_count
            && self.page_offset == d.page_offset
            && self.flags == d.flags
            && match (&self.backing, &d.backing) {
                (None, None) => true,
                (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                _ => false,
            }
    }
}

/// Result of the fault path's install step.
#[derive(Debug)]
pub(crate) enum InstallOutcome {
    Installed,
    /// The descriptor changed or vanished; restart the fault.
    Raced,
    /// Another fault already bound this leaf.
    AlreadyResolved,
    Failed(MemError),
}

pub struct AddressSpace {
    arch: &'static dyn ArchMmu,
    frames: &'static FrameAllocator,
    root: PhysAddress,
    kernel: bool,
    virt: VirtAllocator,
    /// Serializes virtual-range allocation and teardown.
    alloc_lock: Mutex<()>,
    mappings: Mutex<LinkedList<DescriptorAdapter>>,
    active: AtomicBool,
    destroy_hooks: Mutex<Vec<Arc<dyn Fn() + Send + Sync>>>,
}

impl AddressSpace {
    /// Adopt the loader-built root table as the kernel space. Virtual
    /// regions are registered separately once the table's final shape is
    /// known (see [`AddressSpace::add_kernel_gap_regions`]).
    pub fn kernel_from_boot(
        arch: &'static dyn ArchMmu,
        frames: &'static FrameAllocator,
        boot_root: PhysAddress,
        cap_pages: u64,
    ) -> AddressSpace {
        AddressSpace {
            arch,
            frames,
            root: boot_root,
            kernel: true,
            virt: VirtAllocator::new(cap_pages),
            alloc_lock: Mutex::new(()),
            mappings: Mutex::new(LinkedList::new(DescriptorAdapter::new())),
            active: AtomicBool::new(true),
            destroy_hooks: Mutex::new(Vec::new()),
        }
    }

    /// A fresh process space: one zeroed frame for the root table, the
    /// kernel half mirrored in, and the user portion handed to the
    /// virtual allocator.
    ///
    /// # Panics
    ///
    /// Panics when physical memory is exhausted; running out during
    /// address-space construction means the system is beyond graceful
    /// recovery.
    pub fn new(
        arch: &'static dyn ArchMmu,
        frames: &'static FrameAllocator,
        kernel: &AddressSpace,
    ) -> AddressSpace {
        let root = frames
            .allocate_one()
            .unwrap_or_else(|e| panic!("constructing an address space: {:?}", e))
            .start();
        // SAFETY: fresh frame, owned by this space from here on.
        unsafe { zero_frames(arch, root, 1) };
        paging::mirror_kernel_half(arch, kernel.root, root);

        let space = AddressSpace {
            arch,
            frames,
            root,
            kernel: false,
            virt: VirtAllocator::new(
                frames
                    .total_pages()
                    .saturating_mul(VIRT_PAGES_PER_PHYS_PAGE),
            ),
            alloc_lock: Mutex::new(()),
            mappings: Mutex::new(LinkedList::new(DescriptorAdapter::new())),
            active: AtomicBool::new(false),
            destroy_hooks: Mutex::new(Vec::new()),
        };

        let user_pages = (USER_SPACE_END - USER_SPACE_BASE).as_raw() >> PAGE_SHIFT;
        space
            .virt
            .add_region(arch, frames, root, USER_SPACE_BASE, user_pages)
            .unwrap_or_else(|e| panic!("constructing an address space: {:?}", e));
        space
    }

    /// Register every unmapped span of the kernel half as a virtual
    /// region, up to the allocator's cap. Returns the pages taken on.
    pub fn add_kernel_gap_regions(&self) -> u64 {
        assert!(self.kernel, "gap regions are a kernel-space affair");
        let _alloc = self.alloc_lock.lock();

        let mut gaps: Vec<(VirtAddress, u64)> = Vec::new();
        paging::for_each_gap(
            self.arch,
            self.root,
            KERNEL_SPACE_BASE,
            KERNEL_SPACE_END,
            |base, pages| {
                gaps.push((base, pages));
                true
            },
        );

        let mut added = 0;
        for (base, pages) in gaps {
            match self
                .virt
                .add_region(self.arch, self.frames, self.root, base, pages)
            {
                Ok(n) => added += n,
                Err(MemError::TemporaryOutage) => break,
                Err(e) => warn!("skipping kernel region at {:#x}: {:?}", base.as_raw(), e),
            }
            if self.virt.served_pages() >= self.virt.cap_pages() {
                break;
            }
        }
        added
    }

    pub fn root(&self) -> PhysAddress {
        self.root
    }

    pub fn is_kernel(&self) -> bool {
        self.kernel
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Where `virt` translates to right now, if anywhere.
    pub fn translate(&self, virt: VirtAddress) -> Option<PhysAddress> {
        paging::translate(self.arch, self.root, virt)
    }

    /// Run when the space is destroyed.
    pub fn notify_on_destroy(&self, hook: Arc<dyn Fn() + Send + Sync>) {
        self.destroy_hooks.lock().push(hook);
    }

    /// Make this the active space: mirror the kernel half, load the root,
    /// and flush the previous space's user translations.
    pub fn activate(&self, kernel: &AddressSpace, prev: Option<&AddressSpace>) {
        if !self.kernel {
            paging::mirror_kernel_half(self.arch, kernel.root, self.root);
        }
        self.arch.load_root_table(self.root);
        self.active.store(true, Ordering::Release);
        if let Some(prev) = prev {
            if !ptr::eq(prev, self) {
                prev.active.store(false, Ordering::Release);
            }
        }
        self.arch.invalidate_range(USER_SPACE_BASE, USER_SPACE_END);
    }

    /// Map `count` pages of caller-provided physical memory somewhere;
    /// returns the chosen virtual base.
    pub fn map_any(
        &self,
        phys: PhysAddress,
        count: u64,
        flags: MapFlags,
    ) -> Result<VirtAddress, MemError> {
        // Caller-provided memory is never ours to free at teardown.
        let flags = sanitize(flags) | MapFlags::BORROWED;
        let _alloc = self.alloc_lock.lock();
        let virt = self
            .virt
            .allocate(self.arch, self.frames, self.root, count, 0, 0)?;
        if let Err(e) = paging::map_fixed(self.arch, self.frames, self.root, phys, virt, count, flags)
        {
            // A partial install must not ride along with the returned
            // range.
            paging::flush_range(self.arch, self.frames, self.root, virt, count, FlushOpts::BREAK);
            let _ = self.virt.free(self.arch, self.frames, self.root, virt, count);
            return Err(e);
        }
        Ok(virt)
    }

    /// Map caller-provided physical memory at a caller-chosen virtual
    /// address, which must stay clear of the allocator's regions.
    pub fn map_fixed(
        &self,
        phys: PhysAddress,
        virt: VirtAddress,
        count: u64,
        flags: MapFlags,
    ) -> Result<(), MemError> {
        // Caller-provided memory is never ours to free at teardown.
        let flags = sanitize(flags) | MapFlags::BORROWED;
        let extent = fixed_extent(virt, count)?;
        if self.virt.overlaps(extent) {
            return Err(MemError::InvalidArgument);
        }
        let _alloc = self.alloc_lock.lock();
        paging::map_fixed(self.arch, self.frames, self.root, phys, virt, count, flags)
    }

    /// Tear the leaves down and, for allocator-owned ranges, return the
    /// range. The physical memory stays with its owner.
    pub fn unmap(&self, virt: VirtAddress, count: u64) -> Result<(), MemError> {
        if count == 0 || !virt.is_aligned_to_length(PAGE_SIZE) {
            return Err(MemError::InvalidArgument);
        }
        let _alloc = self.alloc_lock.lock();
        paging::flush_range(self.arch, self.frames, self.root, virt, count, FlushOpts::BREAK);
        match self.virt.free(self.arch, self.frames, self.root, virt, count) {
            Ok(()) | Err(MemError::NoSuchResource) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Allocate `count` pages of fresh memory. `MapFlags::PREBOUND` backs
    /// every page up front; otherwise leaves get the on-demand marker and
    /// a descriptor records the pending range for the fault path.
    pub fn allocate(&self, count: u64, flags: MapFlags) -> Result<VirtAddress, MemError> {
        let flags = sanitize(flags);
        let _alloc = self.alloc_lock.lock();
        let virt = self
            .virt
            .allocate(self.arch, self.frames, self.root, count, 0, 0)?;
        if let Err(e) = self.back_allocation(virt, count, flags) {
            paging::flush_range(self.arch, self.frames, self.root, virt, count, FlushOpts::BREAK);
            let _ = self.virt.free(self.arch, self.frames, self.root, virt, count);
            return Err(e);
        }
        drop(_alloc);

        if !flags.contains(MapFlags::PREBOUND) {
            self.push_descriptor(virt, count, 0, flags, None);
        }
        Ok(virt)
    }

    /// As [`AddressSpace::allocate`], at a caller-chosen address. The
    /// range must overlap neither the allocator's regions nor any
    /// installed or pending leaf.
    pub fn allocate_fixed(
        &self,
        virt: VirtAddress,
        count: u64,
        flags: MapFlags,
    ) -> Result<(), MemError> {
        let flags = sanitize(flags);
        let extent = fixed_extent(virt, count)?;
        if self.virt.overlaps(extent) {
            return Err(MemError::InvalidArgument);
        }
        let _alloc = self.alloc_lock.lock();
        if !paging::range_is_unmapped(self.arch, self.root, virt, count) {
            return Err(MemError::InvalidArgument);
        }
        if let Err(e) = self.back_allocation(virt, count, flags) {
            paging::flush_range(self.arch, self.frames, self.root, virt, count, FlushOpts::BREAK);
            return Err(e);
        }
        drop(_alloc);

        if !flags.contains(MapFlags::PREBOUND) {
            self.push_descriptor(virt, count, 0, flags, None);
        }
        Ok(())
    }

    /// Release an allocation made by `allocate`/`allocate_fixed`: drop
    /// the descriptor (if lazy), free space-owned frames, and return the
    /// range to the allocator.
    pub fn free(&self, virt: VirtAddress, count: u64) -> Result<(), MemError> {
        if count == 0 || !virt.is_aligned_to_length(PAGE_SIZE) {
            return Err(MemError::InvalidArgument);
        }

        let desc = match self.take_descriptor(virt.as_raw(), false) {
            Some(d) if d.page_count != count => {
                // Put it back rather than half-free a range.
                self.mappings.lock().push_back(d);
                return Err(MemError::InvalidArgument);
            }
            other => other,
        };

        let _alloc = self.alloc_lock.lock();
        paging::flush_range(
            self.arch,
            self.frames,
            self.root,
            virt,
            count,
            FlushOpts::BREAK | FlushOpts::FREE,
        );
        match self.virt.free(self.arch, self.frames, self.root, virt, count) {
            Ok(()) | Err(MemError::NoSuchResource) => {}
            Err(e) => return Err(e),
        }
        drop(desc);
        Ok(())
    }

    /// Hand `count` pages of `mapping` (starting at logical page
    /// `page_offset`) a home in this space. Pages bind on first fault.
    pub fn insert_mapping(
        &self,
        mapping: &Arc<SharedMapping>,
        page_offset: u64,
        count: u64,
        align_pow: u8,
        flags: MapFlags,
    ) -> Result<VirtAddress, MemError> {
        let flags = sanitize(flags);
        if count == 0
            || page_offset
                .checked_add(count)
                .map_or(true, |e| e > mapping.page_count())
        {
            return Err(MemError::InvalidArgument);
        }

        let _alloc = self.alloc_lock.lock();
        let virt = self
            .virt
            .allocate(self.arch, self.frames, self.root, count, align_pow, 0)?;
        if let Err(e) = paging::map_fixed(
            self.arch,
            self.frames,
            self.root,
            ON_DEMAND_FRAME,
            virt,
            count,
            flags | MapFlags::INACTIVE | MapFlags::REPEAT,
        ) {
            paging::flush_range(self.arch, self.frames, self.root, virt, count, FlushOpts::BREAK);
            let _ = self.virt.free(self.arch, self.frames, self.root, virt, count);
            return Err(e);
        }
        drop(_alloc);

        self.push_descriptor(virt, count, page_offset, flags, Some(Arc::clone(mapping)));
        Ok(virt)
    }

    /// The mapping governing `virt`, with its logical offset and the
    /// descriptor's page count. The returned reference keeps the mapping
    /// alive.
    pub fn lookup_mapping(
        &self,
        virt: VirtAddress,
    ) -> Result<(Arc<SharedMapping>, u64, u64), MemError> {
        let mappings = self.mappings.lock();
        for d in mappings.iter() {
            if d.covers(virt.as_raw()) {
                if let Some(backing) = &d.backing {
                    return Ok((Arc::clone(backing), d.page_offset, d.page_count));
                }
            }
        }
        Err(MemError::NoSuchResource)
    }

    /// Inverse of [`AddressSpace::insert_mapping`]: drop the descriptor
    /// starting at `virt`, tear down its leaves (bound pages stay with
    /// the mapping), release the reference, and return the range.
    pub fn remove_mapping(&self, virt: VirtAddress) -> Result<(), MemError> {
        let desc = self
            .take_descriptor(virt.as_raw(), true)
            .ok_or(MemError::NoSuchResource)?;

        let _alloc = self.alloc_lock.lock();
        paging::flush_range(
            self.arch,
            self.frames,
            self.root,
            virt,
            desc.page_count,
            FlushOpts::BREAK | FlushOpts::FREE,
        );
        match self
            .virt
            .free(self.arch, self.frames, self.root, virt, desc.page_count)
        {
            Ok(()) | Err(MemError::NoSuchResource) => {}
            Err(e) => return Err(e),
        }
        drop(desc);
        Ok(())
    }

    /// Rewrite the leaf flags across the range.
    pub fn change_permissions(
        &self,
        virt: VirtAddress,
        count: u64,
        flags: MapFlags,
    ) -> Result<(), MemError> {
        paging::change_flags(self.arch, self.root, virt, count, sanitize(flags))
    }

    // ---- fault-path support -------------------------------------------

    pub(crate) fn probe_leaf(&self, virt: VirtAddress) -> Probe {
        paging::probe(self.arch, self.root, virt)
    }

    pub(crate) fn frames(&self) -> &'static FrameAllocator {
        self.frames
    }

    pub(crate) fn arch(&self) -> &'static dyn ArchMmu {
        self.arch
    }

    pub(crate) fn descriptor_covering(&self, virt: VirtAddress) -> Option<DescriptorSnapshot> {
        let mappings = self.mappings.lock();
        let d = mappings.iter().find(|d| d.covers(virt.as_raw()))?;
        Some(DescriptorSnapshot {
            start: VirtAddress::from_raw(d.start),
            page_count: d.page_count,
            page_offset: d.page_offset,
            flags: d.flags,
            backing: d.backing.as_ref().map(Arc::clone),
        })
    }

    /// Step the fault to completion: re-locate the descriptor under the
    /// mappings lock, verify nothing raced, and bind `phys` at `page`.
    pub(crate) fn install_resolved(
        &self,
        snap: &DescriptorSnapshot,
        page: Page,
        phys: PhysAddress,
    ) -> InstallOutcome {
        let mappings = self.mappings.lock();
        let Some(d) = mappings.iter().find(|d| d.covers(page.start().as_raw())) else {
            return InstallOutcome::Raced;
        };
        if !snap.matches(d) {
            return InstallOutcome::Raced;
        }

        match self.probe_leaf(page.start()) {
            Probe::OnDemand => {}
            Probe::Mapped { .. } => return InstallOutcome::AlreadyResolved,
            Probe::Unmapped => return InstallOutcome::Raced,
        }

        let mut flags = d.flags;
        if d.backing.is_some() {
            // The frame belongs to the mapping; table teardown must leave
            // it alone.
            flags |= MapFlags::BORROWED;
        }
        match paging::map_fixed(
            self.arch,
            self.frames,
            self.root,
            phys,
            page.start(),
            1,
            flags,
        ) {
            Ok(()) => InstallOutcome::Installed,
            Err(e) => InstallOutcome::Failed(e),
        }
    }

    // ---- internals ----------------------------------------------------

    /// Back a fresh range: eager per-page frames for `PREBOUND`, pending
    /// markers otherwise.
    fn back_allocation(&self, virt: VirtAddress, count: u64, flags: MapFlags) -> Result<(), MemError> {
        if !flags.contains(MapFlags::PREBOUND) {
            return paging::map_fixed(
                self.arch,
                self.frames,
                self.root,
                ON_DEMAND_FRAME,
                virt,
                count,
                flags | MapFlags::INACTIVE | MapFlags::REPEAT,
            );
        }

        for i in 0..count {
            let page = VirtAddress::from_raw(virt.as_raw() + i * PAGE);
            let result = self.frames.allocate_one().and_then(|frame| {
                if flags.contains(MapFlags::ZERO) {
                    // SAFETY: fresh frame.
                    unsafe { zero_frames(self.arch, frame.start(), 1) };
                }
                paging::map_fixed(self.arch, self.frames, self.root, frame.start(), page, 1, flags)
                    .map_err(|e| {
                        self.frames.free(frame.start(), 1);
                        e
                    })
            });
            if let Err(e) = result {
                if i > 0 {
                    paging::flush_range(
                        self.arch,
                        self.frames,
                        self.root,
                        virt,
                        i,
                        FlushOpts::BREAK | FlushOpts::FREE,
                    );
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn push_descriptor(
        &self,
        virt: VirtAddress,
        page_count: u64,
        page_offset: u64,
        flags: MapFlags,
        backing: Option<Arc<SharedMapping>>,
    ) {
        self.mappings.lock().push_back(Box::new(Descriptor {
            link: LinkedListLink::new(),
            start: virt.as_raw(),
            page_count,
            page_offset,
            flags,
            backing,
        }));
    }

    fn take_descriptor(&self, start: u64, require_backing: bool) -> Option<Box<Descriptor>> {
        let mut mappings = self.mappings.lock();
        let mut cursor = mappings.front_mut();
        while let Some(d) = cursor.get() {
            if d.start == start && (!require_backing || d.backing.is_some()) {
                return cursor.remove();
            }
            cursor.move_next();
        }
        None
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        assert!(
            self.kernel || !self.is_active(),
            "destroying the active address space"
        );
        for hook in self.destroy_hooks.get_mut().drain(..) {
            hook();
        }
        // Dropping the descriptors releases their mapping references;
        // the table walk below then skips every mapping-owned leaf.
        self.mappings.get_mut().clear();
        paging::destroy_space(self.arch, self.frames, self.root, !self.kernel);
    }
}

/// Strip the installation-internal bits from caller-supplied flags.
fn sanitize(flags: MapFlags) -> MapFlags {
    flags & !(MapFlags::INACTIVE | MapFlags::REPEAT | MapFlags::BORROWED)
}

/// A caller-chosen range as an extent, with the usual argument checks.
fn fixed_extent(virt: VirtAddress, count: u64) -> Result<VirtExtent, MemError> {
    if count == 0 || !virt.is_aligned_to_length(PAGE_SIZE) {
        return Err(MemError::InvalidArgument);
    }
    let bytes = count.checked_mul(PAGE).ok_or(MemError::InvalidArgument)?;
    VirtExtent::new_checked(virt, Length::from_raw(bytes)).ok_or(MemError::InvalidArgument)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::testutil::SimMmu;

    struct Fx {
        arch: &'static SimMmu,
        frames: &'static FrameAllocator,
        kernel: &'static AddressSpace,
    }

    fn fx(pages: u64) -> Fx {
        let arch = SimMmu::leak_arena(pages);
        let frames: &'static FrameAllocator = Box::leak(Box::new(FrameAllocator::new(arch)));
        frames.add_region(arch.phys_extent()).unwrap();

        let boot_root = frames.allocate_one().unwrap().start();
        unsafe { zero_frames(arch, boot_root, 1) };
        let kernel = Box::leak(Box::new(AddressSpace::kernel_from_boot(
            arch,
            frames,
            boot_root,
            frames.total_pages() * VIRT_PAGES_PER_PHYS_PAGE,
        )));
        kernel.add_kernel_gap_regions();
        Fx {
            arch,
            frames,
            kernel,
        }
    }

    #[test]
    fn lazy_allocation_plants_markers_only() {
        let f = fx(512);
        let space = AddressSpace::new(f.arch, f.frames, f.kernel);
        let before = f.frames.frames_in_use();

        let virt = space.allocate(4, MapFlags::ZERO).unwrap();
        for i in 0..4u64 {
            assert_eq!(
                space.probe_leaf(VirtAddress::from_raw(virt.as_raw() + i * PAGE)),
                Probe::OnDemand
            );
        }
        // Only table frames for the marker leaves may have appeared (node
        // churn can even lower the count); no data pages yet.
        assert!(f.frames.frames_in_use() <= before + 3);
        assert!(space.descriptor_covering(virt).is_some());
    }

    #[test]
    fn prebound_allocation_is_backed_and_zeroed() {
        let f = fx(512);
        let space = AddressSpace::new(f.arch, f.frames, f.kernel);

        let virt = space
            .allocate(3, MapFlags::PREBOUND | MapFlags::ZERO)
            .unwrap();
        for i in 0..3u64 {
            let page = VirtAddress::from_raw(virt.as_raw() + i * PAGE);
            let phys = space.translate(page).expect("page not backed");
            // SAFETY: window over arena memory.
            unsafe {
                let p = f.arch.phys_to_virt(phys).as_ptr::<u8>();
                for b in 0..PAGE as usize {
                    assert_eq!(*p.add(b), 0);
                }
            }
        }
        // Eager allocations record no pending descriptor.
        assert!(space.descriptor_covering(virt).is_none());
    }

    #[test]
    fn free_returns_frames_and_range() {
        let f = fx(512);
        let space = AddressSpace::new(f.arch, f.frames, f.kernel);
        let before = f.frames.frames_in_use();

        let virt = space.allocate(4, MapFlags::PREBOUND).unwrap();
        space.free(virt, 4).unwrap();
        assert_eq!(f.frames.frames_in_use(), before);

        // The range is reusable.
        let again = space.allocate(4, MapFlags::empty()).unwrap();
        assert_eq!(again, virt);
    }

    #[test]
    fn free_rejects_wrong_count_for_lazy_ranges() {
        let f = fx(512);
        let space = AddressSpace::new(f.arch, f.frames, f.kernel);
        let virt = space.allocate(4, MapFlags::empty()).unwrap();
        assert_eq!(space.free(virt, 2), Err(MemError::InvalidArgument));
        // The descriptor survived the refusal.
        assert!(space.descriptor_covering(virt).is_some());
        space.free(virt, 4).unwrap();
        assert!(space.descriptor_covering(virt).is_none());
    }

    #[test]
    fn map_any_and_unmap_round_trip() {
        let f = fx(512);
        let space = AddressSpace::new(f.arch, f.frames, f.kernel);

        let phys = PhysAddress::from_raw(0x8000_0000);
        let virt = space.map_any(phys, 2, MapFlags::UNCACHEABLE).unwrap();
        let second = VirtAddress::from_raw(virt.as_raw() + PAGE);
        assert_eq!(space.translate(virt), Some(phys));
        assert_eq!(space.translate(second), Some(phys + PAGE_SIZE));

        space.unmap(virt, 2).unwrap();
        // The range went back to the allocator (its first page may carry
        // free-list bookkeeping again); the device memory is unmapped.
        assert_ne!(space.translate(virt), Some(phys));
        assert_eq!(space.translate(second), None);
    }

    #[test]
    fn fixed_mappings_must_avoid_allocator_regions() {
        let f = fx(512);
        let space = AddressSpace::new(f.arch, f.frames, f.kernel);

        // Inside the user region: refused.
        assert_eq!(
            space.map_fixed(
                PhysAddress::from_raw(0x8000_0000),
                USER_SPACE_BASE,
                1,
                MapFlags::empty()
            ),
            Err(MemError::InvalidArgument)
        );

        // Far above it: fine.
        let virt = VirtAddress::from_raw(0x6000_0000_0000);
        space
            .map_fixed(PhysAddress::from_raw(0x8000_0000), virt, 1, MapFlags::empty())
            .unwrap();
        assert_eq!(
            space.translate(virt),
            Some(PhysAddress::from_raw(0x8000_0000))
        );
    }

    #[test]
    fn allocate_fixed_refuses_collisions() {
        let f = fx(512);
        let space = AddressSpace::new(f.arch, f.frames, f.kernel);
        let virt = VirtAddress::from_raw(0x6000_0000_0000);

        space.allocate_fixed(virt, 4, MapFlags::empty()).unwrap();
        // Pending leaves count as occupied.
        assert_eq!(
            space.allocate_fixed(virt, 1, MapFlags::empty()),
            Err(MemError::InvalidArgument)
        );
        // And so does the allocator's own territory.
        assert_eq!(
            space.allocate_fixed(USER_SPACE_BASE, 1, MapFlags::empty()),
            Err(MemError::InvalidArgument)
        );
    }

    #[test]
    fn mapping_insert_lookup_remove() {
        let f = fx(512);
        let space = AddressSpace::new(f.arch, f.frames, f.kernel);
        let mapping = SharedMapping::create(f.arch, f.frames, 8, MapFlags::ZERO).unwrap();

        let virt = space
            .insert_mapping(&mapping, 2, 4, 0, MapFlags::empty())
            .unwrap();
        assert_eq!(space.probe_leaf(virt), Probe::OnDemand);

        let (found, offset, count) = space.lookup_mapping(virt).unwrap();
        assert!(Arc::ptr_eq(&found, &mapping));
        assert_eq!((offset, count), (2, 4));

        space.remove_mapping(virt).unwrap();
        assert!(matches!(
            space.lookup_mapping(virt),
            Err(MemError::NoSuchResource)
        ));
        // Past the block's first page (which may host free-list
        // bookkeeping again) the pending leaves are gone.
        assert_eq!(
            space.probe_leaf(VirtAddress::from_raw(virt.as_raw() + PAGE)),
            Probe::Unmapped
        );
    }

    #[test]
    fn change_permissions_rewrites_leaves() {
        let f = fx(512);
        let space = AddressSpace::new(f.arch, f.frames, f.kernel);
        let virt = space.allocate(2, MapFlags::PREBOUND).unwrap();

        space
            .change_permissions(virt, 2, MapFlags::UNPRIVILEGED)
            .unwrap();
        match space.probe_leaf(virt) {
            Probe::Mapped { flags, .. } => {
                assert!(flags.contains(paging::PteFlags::USER));
            }
            other => panic!("expected mapped leaf, got {other:?}"),
        }
    }

    #[test]
    fn activation_mirrors_kernel_half_and_loads_root() {
        let f = fx(512);

        // Something in the kernel half to see through the mirror.
        let kvirt = f.kernel.allocate(1, MapFlags::PREBOUND).unwrap();
        assert!(kvirt.as_raw() >= KERNEL_SPACE_BASE.as_raw());

        let space = AddressSpace::new(f.arch, f.frames, f.kernel);
        space.activate(f.kernel, Some(f.kernel));
        assert!(space.is_active());
        assert!(!f.kernel.is_active());
        assert_eq!(f.arch.root_loads.lock().last(), Some(&space.root().as_raw()));

        // The kernel allocation resolves through the process root too.
        assert_eq!(space.translate(kvirt), f.kernel.translate(kvirt));
    }

    #[test]
    fn destruction_releases_everything_but_mapping_pages() {
        let f = fx(512);
        let baseline = f.frames.frames_in_use();

        let mapping = SharedMapping::create(f.arch, f.frames, 4, MapFlags::ZERO).unwrap();
        mapping.bind(0, 4, None).unwrap();
        let mapping_frames = 4;

        {
            let space = AddressSpace::new(f.arch, f.frames, f.kernel);
            let lazy = space.allocate(8, MapFlags::ZERO).unwrap();
            let _eager = space.allocate(4, MapFlags::PREBOUND).unwrap();
            let mvirt = space
                .insert_mapping(&mapping, 0, 4, 0, MapFlags::empty())
                .unwrap();

            // Bind one mapping page into the tables so destruction has a
            // shared leaf to skip.
            let phys = mapping.resolve_or_bind(0).unwrap();
            let snap = space.descriptor_covering(mvirt).unwrap();
            assert!(matches!(
                space.install_resolved(&snap, Page::new(mvirt), phys),
                InstallOutcome::Installed
            ));
            let _ = lazy;
        }

        // Only the mapping's own pages outlive the space.
        assert_eq!(f.frames.frames_in_use(), baseline + mapping_frames);
        drop(mapping);
        assert_eq!(f.frames.frames_in_use(), baseline);
    }

    #[test]
    fn destroy_hooks_fire() {
        let f = fx(512);
        let fired = Arc::new(AtomicBool::new(false));

        let space = AddressSpace::new(f.arch, f.frames, f.kernel);
        let flag = Arc::clone(&fired);
        space.notify_on_destroy(Arc::new(move || {
            flag.store(true, Ordering::SeqCst);
        }));

        drop(space);
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn spaces_share_nothing_below_the_kernel_half() {
        let f = fx(512);
        let a = AddressSpace::new(f.arch, f.frames, f.kernel);
        let b = AddressSpace::new(f.arch, f.frames, f.kernel);

        // Probe past the first page of the block so free-list node
        // backings in `b` can't shadow the comparison.
        let va = a.allocate(2, MapFlags::PREBOUND).unwrap();
        let inner = VirtAddress::from_raw(va.as_raw() + PAGE);
        assert!(a.translate(inner).is_some());
        assert!(b.translate(inner).is_none());
    }
}
