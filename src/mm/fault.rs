//! Page-fault resolution.
//!
//! A fault is "ours" when the faulting leaf carries the on-demand marker.
//! Resolution then finds the descriptor governing the address, produces a
//! physical page (through the descriptor's shareable mapping, or freshly
//! allocated for anonymous ranges) and installs it, re-checking under
//! the mappings lock that nothing raced in between. Faults a space cannot
//! resolve are retried against the kernel space (kernel pages are visible
//! everywhere), and only then reported for thread-level handling.

use core::ptr;

use arrayvec::ArrayVec;
use spin::Mutex;

use shared::memory::addr::VirtAddress;
use shared::memory::page::{Page, PAGE_SHIFT};

use crate::mm::paging::Probe;
use crate::mm::physmem::zero_frames;
use crate::mm::space::{AddressSpace, InstallOutcome};
use crate::mm::{MapFlags, MemError};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FaultOutcome {
    /// The leaf is bound; resume the faulting instruction.
    Resolved,
    /// Not a lazy binding at all; the caller decides what the fault
    /// means (protection error, bad pointer, ...).
    NotLazy,
    /// A lazy binding we could not complete.
    Unresolved(MemError),
}

/// Resolve a fault on `addr` taken in `space`. Unresolved faults retry
/// against `kernel` before giving up.
pub fn resolve_fault(
    space: &AddressSpace,
    kernel: &AddressSpace,
    addr: VirtAddress,
) -> FaultOutcome {
    let first = resolve_in(space, addr);
    if first == FaultOutcome::Resolved || ptr::eq(space, kernel) {
        return first;
    }
    match resolve_in(kernel, addr) {
        FaultOutcome::Resolved => FaultOutcome::Resolved,
        _ => first,
    }
}

fn resolve_in(space: &AddressSpace, addr: VirtAddress) -> FaultOutcome {
    let page = Page::containing(addr);

    match space.probe_leaf(page.start()) {
        Probe::OnDemand => {}
        _ => return FaultOutcome::NotLazy,
    }

    loop {
        // Snapshot the governing descriptor; the slow work below runs
        // without the mappings lock.
        let Some(snap) = space.descriptor_covering(page.start()) else {
            return FaultOutcome::Unresolved(MemError::NoSuchResource);
        };
        let page_offset =
            snap.page_offset + ((page.start() - snap.start).as_raw() >> PAGE_SHIFT);

        let (phys, anonymous) = match &snap.backing {
            Some(mapping) => match mapping.resolve_or_bind(page_offset) {
                Ok(phys) => (phys, false),
                Err(e) => return FaultOutcome::Unresolved(e),
            },
            None => {
                let frame = match space.frames().allocate_one() {
                    Ok(frame) => frame,
                    Err(e) => return FaultOutcome::Unresolved(e),
                };
                if snap.flags.contains(MapFlags::ZERO) {
                    // SAFETY: fresh frame.
                    unsafe { zero_frames(space.arch(), frame.start(), 1) };
                }
                (frame.start(), true)
            }
        };

        match space.install_resolved(&snap, page, phys) {
            InstallOutcome::Installed => return FaultOutcome::Resolved,
            InstallOutcome::AlreadyResolved => {
                // Someone else bound the page while we worked. Mapping
                // pages are shared anyway; an anonymous frame goes back.
                if anonymous {
                    space.frames().free(phys, 1);
                }
                return FaultOutcome::Resolved;
            }
            InstallOutcome::Raced => {
                if anonymous {
                    space.frames().free(phys, 1);
                }
                // The descriptor changed under us; start over.
            }
            InstallOutcome::Failed(e) => {
                if anonymous {
                    space.frames().free(phys, 1);
                }
                return FaultOutcome::Unresolved(e);
            }
        }
    }
}

// -------------------------------------------------------------------------
// Thread-level hooks for faults the resolver cannot satisfy.

pub const MAX_FAULT_HOOKS: usize = 8;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HookDisposition {
    Resolved,
    Unresolved,
    Fatal,
}

/// A hook is identified by the function itself; registering one twice is
/// a no-op.
pub type FaultHook = fn(VirtAddress) -> HookDisposition;

/// Bounded registry of fault hooks, consulted in registration order.
pub struct FaultHooks {
    slots: Mutex<ArrayVec<FaultHook, MAX_FAULT_HOOKS>>,
}

impl FaultHooks {
    pub const fn new() -> FaultHooks {
        FaultHooks {
            slots: Mutex::new(ArrayVec::new_const()),
        }
    }

    pub fn register(&self, hook: FaultHook) -> Result<(), MemError> {
        let mut slots = self.slots.lock();
        if slots.iter().any(|h| *h == hook) {
            return Ok(());
        }
        slots.try_push(hook).map_err(|_| MemError::TemporaryOutage)
    }

    pub fn unregister(&self, hook: FaultHook) -> Result<(), MemError> {
        let mut slots = self.slots.lock();
        match slots.iter().position(|h| *h == hook) {
            Some(at) => {
                slots.remove(at);
                Ok(())
            }
            None => Err(MemError::NoSuchResource),
        }
    }

    /// Offer `addr` to each hook. The first decisive answer wins.
    pub fn dispatch(&self, addr: VirtAddress) -> HookDisposition {
        let slots = self.slots.lock().clone();
        for hook in slots {
            match hook(addr) {
                HookDisposition::Unresolved => continue,
                decisive => return decisive,
            }
        }
        HookDisposition::Unresolved
    }
}

impl Default for FaultHooks {
    fn default() -> FaultHooks {
        FaultHooks::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use alloc::sync::Arc;

    use shared::memory::page::PAGE_SIZE;

    use crate::arch::ArchMmu;
    use crate::mm::mapping::SharedMapping;
    use crate::mm::paging::{self, ON_DEMAND_FRAME};
    use crate::mm::physmem::FrameAllocator;
    use crate::mm::space::AddressSpace;
    use crate::testutil::SimMmu;

    const PAGE: u64 = PAGE_SIZE.as_raw();

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
        unsafe { crate::mm::physmem::zero_frames(arch, boot_root, 1) };
        let kernel = Box::leak(Box::new(AddressSpace::kernel_from_boot(
            arch,
            frames,
            boot_root,
            frames.total_pages() * 16,
        )));
        kernel.add_kernel_gap_regions();
        Fx {
            arch,
            frames,
            kernel,
        }
    }

    #[test_log::test]
    fn lazy_fault_binds_exactly_one_zeroed_page() {
        let f = fx(512);
        let space = AddressSpace::new(f.arch, f.frames, f.kernel);
        let virt = space.allocate(4, MapFlags::ZERO).unwrap();
        let before = f.frames.frames_in_use();

        // Fault in the middle of the third page.
        let fault_addr = VirtAddress::from_raw(virt.as_raw() + 2 * PAGE + 0x123);
        assert_eq!(
            resolve_fault(&space, f.kernel, fault_addr),
            FaultOutcome::Resolved
        );

        let bound = VirtAddress::from_raw(virt.as_raw() + 2 * PAGE);
        let phys = space.translate(bound).expect("fault did not bind the page");
        assert_eq!(f.frames.frames_in_use(), before + 1);
        // SAFETY: window over arena memory.
        unsafe {
            let p = f.arch.phys_to_virt(phys).as_ptr::<u8>();
            for i in 0..PAGE as usize {
                assert_eq!(*p.add(i), 0);
            }
        }

        // The other three pages are still pending.
        for i in [0u64, 1, 3] {
            assert_eq!(
                space.probe_leaf(VirtAddress::from_raw(virt.as_raw() + i * PAGE)),
                Probe::OnDemand
            );
        }
    }

    #[test]
    fn lazy_range_converges_to_fully_backed() {
        let f = fx(512);
        let space = AddressSpace::new(f.arch, f.frames, f.kernel);
        let baseline = f.frames.frames_in_use();
        let virt = space.allocate(4, MapFlags::ZERO).unwrap();
        let after_alloc = f.frames.frames_in_use();

        // Touch every page of the range, in a scattered order.
        for i in [2u64, 0, 3, 1] {
            let addr = VirtAddress::from_raw(virt.as_raw() + i * PAGE);
            assert_eq!(resolve_fault(&space, f.kernel, addr), FaultOutcome::Resolved);
        }
        for i in 0..4u64 {
            assert!(space
                .translate(VirtAddress::from_raw(virt.as_raw() + i * PAGE))
                .is_some());
        }
        // Exactly one frame per page, nothing leaked along the way.
        assert_eq!(f.frames.frames_in_use(), after_alloc + 4);

        // Releasing the range rewinds everything, node churn included.
        space.free(virt, 4).unwrap();
        assert_eq!(f.frames.frames_in_use(), baseline);
    }

    #[test]
    fn repeated_faults_reuse_the_binding() {
        let f = fx(512);
        let space = AddressSpace::new(f.arch, f.frames, f.kernel);
        let virt = space.allocate(1, MapFlags::empty()).unwrap();

        assert_eq!(resolve_fault(&space, f.kernel, virt), FaultOutcome::Resolved);
        let phys = space.translate(virt).unwrap();

        // A second fault on the now-bound page is not a lazy fault.
        assert_eq!(resolve_fault(&space, f.kernel, virt), FaultOutcome::NotLazy);
        assert_eq!(space.translate(virt), Some(phys));
    }

    #[test]
    fn unrelated_faults_are_not_ours() {
        let f = fx(512);
        let space = AddressSpace::new(f.arch, f.frames, f.kernel);
        assert_eq!(
            resolve_fault(&space, f.kernel, VirtAddress::from_raw(0x6000_0000_0000)),
            FaultOutcome::NotLazy
        );
    }

    #[test]
    fn marker_without_descriptor_stays_unresolved() {
        let f = fx(512);
        let space = AddressSpace::new(f.arch, f.frames, f.kernel);

        // A stray marker with no descriptor behind it.
        let virt = VirtAddress::from_raw(0x6000_0000_0000);
        paging::map_fixed(
            f.arch,
            f.frames,
            space.root(),
            ON_DEMAND_FRAME,
            virt,
            1,
            MapFlags::INACTIVE | MapFlags::REPEAT,
        )
        .unwrap();

        assert_eq!(
            resolve_fault(&space, f.kernel, virt),
            FaultOutcome::Unresolved(MemError::NoSuchResource)
        );
    }

    #[test]
    fn shared_mapping_faults_agree_across_spaces() {
        let f = fx(512);
        let s1 = AddressSpace::new(f.arch, f.frames, f.kernel);
        let s2 = AddressSpace::new(f.arch, f.frames, f.kernel);
        let mapping = SharedMapping::create(f.arch, f.frames, 8, MapFlags::ZERO).unwrap();

        let v1 = s1
            .insert_mapping(&mapping, 0, 8, 0, MapFlags::empty())
            .unwrap();
        let v2 = s2
            .insert_mapping(&mapping, 0, 8, 0, MapFlags::empty())
            .unwrap();

        assert_eq!(resolve_fault(&s1, f.kernel, v1), FaultOutcome::Resolved);
        assert_eq!(resolve_fault(&s2, f.kernel, v2), FaultOutcome::Resolved);

        // Both spaces observe the same physical frame.
        assert_eq!(s1.translate(v1), s2.translate(v2));
        assert_eq!(mapping.resolve(0), s1.translate(v1));
    }

    #[test]
    fn kernel_faults_resolve_from_any_space() {
        let f = fx(512);
        let kvirt = f.kernel.allocate(2, MapFlags::ZERO).unwrap();

        // The process space sees the marker through the mirrored kernel
        // half but holds no descriptor for it; step seven hands the fault
        // to the kernel space.
        let space = AddressSpace::new(f.arch, f.frames, f.kernel);
        assert_eq!(
            resolve_fault(&space, f.kernel, kvirt),
            FaultOutcome::Resolved
        );
        assert!(f.kernel.translate(kvirt).is_some());
    }

    #[test]
    fn anonymous_oom_is_reported() {
        let f = fx(64);
        let space = AddressSpace::new(f.arch, f.frames, f.kernel);
        let virt = space.allocate(8, MapFlags::empty()).unwrap();

        // Exhaust physical memory, then fault.
        let mut hoard = Vec::new();
        while let Ok(a) = f.frames.allocate(1, 0, 0) {
            hoard.push(a);
        }
        assert_eq!(
            resolve_fault(&space, f.kernel, virt),
            FaultOutcome::Unresolved(MemError::TemporaryOutage)
        );

        for a in hoard {
            f.frames.free(a, 1);
        }
        assert_eq!(resolve_fault(&space, f.kernel, virt), FaultOutcome::Resolved);
    }

    fn hook_resolve(_addr: VirtAddress) -> HookDisposition {
        HookDisposition::Resolved
    }

    fn hook_pass(_addr: VirtAddress) -> HookDisposition {
        HookDisposition::Unresolved
    }

    fn hook_fatal(_addr: VirtAddress) -> HookDisposition {
        HookDisposition::Fatal
    }

    #[test]
    fn hooks_dispatch_in_order() {
        let hooks = FaultHooks::new();
        let addr = VirtAddress::from_raw(0x1000);

        assert_eq!(hooks.dispatch(addr), HookDisposition::Unresolved);

        hooks.register(hook_pass).unwrap();
        hooks.register(hook_resolve).unwrap();
        hooks.register(hook_fatal).unwrap();
        assert_eq!(hooks.dispatch(addr), HookDisposition::Resolved);

        hooks.unregister(hook_resolve).unwrap();
        assert_eq!(hooks.dispatch(addr), HookDisposition::Fatal);
    }

    #[test]
    fn hook_registration_is_keyed_by_identity() {
        let hooks = FaultHooks::new();
        hooks.register(hook_pass).unwrap();
        hooks.register(hook_pass).unwrap();
        hooks.unregister(hook_pass).unwrap();
        // The double registration collapsed into one slot.
        assert_eq!(hooks.unregister(hook_pass), Err(MemError::NoSuchResource));
    }

    #[test]
    fn hook_registry_is_bounded() {
        let hooks = FaultHooks::new();
        // Distinct fn items to fill the table.
        fn h0(_: VirtAddress) -> HookDisposition {
            HookDisposition::Unresolved
        }
        fn h1(_: VirtAddress) -> HookDisposition {
            HookDisposition::Unresolved
        }
        fn h2(_: VirtAddress) -> HookDisposition {
            HookDisposition::Unresolved
        }
        fn h3(_: VirtAddress) -> HookDisposition {
            HookDisposition::Unresolved
        }
        fn h4(_: VirtAddress) -> HookDisposition {
            HookDisposition::Unresolved
        }
        fn h5(_: VirtAddress) -> HookDisposition {
            HookDisposition::Unresolved
        }
        fn h6(_: VirtAddress) -> HookDisposition {
            HookDisposition::Unresolved
        }
        fn h7(_: VirtAddress) -> HookDisposition {
            HookDisposition::Unresolved
        }
        for h in [h0, h1, h2, h3, h4, h5, h6, h7] {
            hooks.register(h).unwrap();
        }
        assert_eq!(hooks.register(hook_pass), Err(MemError::TemporaryOutage));
    }

    #[test]
    fn mapping_stays_alive_through_resolution() {
        let f = fx(512);
        let space = AddressSpace::new(f.arch, f.frames, f.kernel);
        let mapping = SharedMapping::create(f.arch, f.frames, 4, MapFlags::ZERO).unwrap();
        let virt = space
            .insert_mapping(&mapping, 0, 4, 0, MapFlags::empty())
            .unwrap();

        // Drop our reference; the descriptor's keeps the mapping alive
        // for the fault.
        let weak = Arc::downgrade(&mapping);
        drop(mapping);
        assert!(weak.upgrade().is_some());

        assert_eq!(resolve_fault(&space, f.kernel, virt), FaultOutcome::Resolved);
        assert!(space.translate(virt).is_some());
    }
}
