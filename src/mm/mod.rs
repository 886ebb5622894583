//! Kernel memory management.
//!
//! The pieces, bottom up: [`buddy`] holds the block mechanics shared by
//! the two allocators; [`physmem`] hands out physical frames from
//! boot-donated regions; [`paging`] edits translation tables; [`virtmem`]
//! hands out virtual ranges inside one address space; [`space`] ties a
//! table tree, a virtual allocator, and mapping descriptors into an
//! address space; [`mapping`] is the shareable, demand-populated mapping
//! object; [`fault`] binds pending pages when they trap.
//!
//! `init` builds all of it from the boot memory map; nothing survives a
//! reboot.

pub mod buddy;
pub mod fault;
pub mod mapping;
pub mod paging;
pub mod physmem;
pub mod space;
pub mod virtmem;

use alloc::boxed::Box;

use log::{error, info, warn};
use once_cell::race::OnceBox;
use spin::Mutex;

use shared::memory::addr::{PhysAddress, PhysExtent};
use shared::memory::page::{PAGE_SHIFT, PAGE_SIZE};
use shared::memory::{remove_reserved, Map, MemoryType};

use crate::arch::{ArchMmu, DIRECT_MAP_BASE};

pub use fault::{FaultHooks, FaultOutcome, HookDisposition};
pub use mapping::SharedMapping;
pub use physmem::FrameAllocator;
pub use space::AddressSpace;

/// Virtual pages an address space may govern per physical page of the
/// machine; caps region-bitmap overhead.
pub(crate) const VIRT_PAGES_PER_PHYS_PAGE: u64 = 16;

/// The subsystem-wide error taxonomy. Callers get these; they are never
/// retried internally.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MemError {
    /// Null, zero, saturating, or mis-aligned argument.
    InvalidArgument,
    /// No suitable block or slot right now.
    TemporaryOutage,
    /// Binding over something already bound.
    AlreadyInProgress,
    /// Lookup miss.
    NoSuchResource,
    /// The object is being destroyed.
    PermanentOutage,
    /// The operation is not supported on this object.
    Unsupported,
}

bitflags::bitflags! {
    /// Allocation and mapping flags. Caching defaults to on and leaves
    /// default to kernel-only; flags state the exceptions.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct MapFlags: u32 {
        /// Disable caching for the range.
        const UNCACHEABLE = 1 << 0;
        /// Leaves are user-accessible.
        const UNPRIVILEGED = 1 << 1;
        /// Kernel-only leaves, spelled out; wins over a conflicting
        /// `UNPRIVILEGED`.
        const PRIVILEGED = 1 << 2;
        /// Zero freshly-allocated backing pages.
        const ZERO = 1 << 3;
        /// Allocate all backing eagerly instead of binding on fault.
        const PREBOUND = 1 << 4;
        /// Uncached, for callers distinguishing device ranges from merely
        /// cache-averse ones; installs the same leaf bits as
        /// `UNCACHEABLE`.
        const NO_CACHE = 1 << 5;

        // Installation-internal bits, stripped at the public entry
        // points.
        /// Install leaves with the present bit clear, frame field
        /// populated.
        const INACTIVE = 1 << 8;
        /// Install the same frame at every leaf instead of advancing.
        const REPEAT = 1 << 9;
        /// The leaf's frame is not owned by the installing table tree
        /// (mapping pages, device memory); teardown must not free it.
        const BORROWED = 1 << 10;
    }
}

/// Everything `init` builds, bundled.
pub struct MemorySystem {
    pub arch: &'static dyn ArchMmu,
    pub phys: &'static FrameAllocator,
    pub kernel_space: &'static AddressSpace,
    pub fault_hooks: FaultHooks,
}

/// First-ever construction of the memory subsystem.
///
/// `map` is the firmware view of physical memory; `holes` are ranges
/// inside it that must stay untouched (kernel image, boot structures,
/// `boot_root` itself). `boot_root` is the loader-built top-level table,
/// adopted as the kernel address space.
///
/// Builds, in order: the frame allocator over every usable region; the
/// kernel space; the fixed-offset window over all of physical memory
/// (large leaves where alignment allows); and the kernel's virtual
/// regions from the gaps left in its table.
pub fn init(
    arch: &'static dyn ArchMmu,
    map: &Map,
    holes: &[PhysExtent],
    boot_root: PhysAddress,
) -> Result<MemorySystem, MemError> {
    let phys: &'static FrameAllocator = Box::leak(Box::new(FrameAllocator::new(arch)));

    for extent in remove_reserved(map.iter_type(MemoryType::Available), holes.iter().copied()) {
        if let Err(e) = phys.add_region(extent) {
            warn!("skipping boot region {:x?}: {:?}", extent, e);
        }
    }
    if phys.total_pages() == 0 {
        return Err(MemError::TemporaryOutage);
    }

    let kernel_space = Box::leak(Box::new(AddressSpace::kernel_from_boot(
        arch,
        phys,
        boot_root,
        phys.total_pages().saturating_mul(VIRT_PAGES_PER_PHYS_PAGE),
    )));

    // The window's leaves name memory the table tree does not own.
    let window_pages = map.top().align_up(PAGE_SIZE.as_raw()).as_raw() >> PAGE_SHIFT;
    if window_pages > 0 {
        paging::map_fixed(
            arch,
            phys,
            boot_root,
            PhysAddress::zero(),
            DIRECT_MAP_BASE,
            window_pages,
            MapFlags::BORROWED,
        )?;
    }

    let kernel_virtual = kernel_space.add_kernel_gap_regions();
    info!(
        "memory subsystem up: {} physical pages, {} kernel virtual pages",
        phys.total_pages(),
        kernel_virtual
    );

    Ok(MemorySystem {
        arch,
        phys,
        kernel_space,
        fault_hooks: FaultHooks::new(),
    })
}

static SYSTEM: OnceBox<MemorySystem> = OnceBox::new();
static CURRENT_SPACE: Mutex<Option<&'static AddressSpace>> = Mutex::new(None);

/// Publish the booted system as the process-wide singleton.
///
/// # Panics
///
/// Panics when called twice.
pub fn install(sys: MemorySystem) -> &'static MemorySystem {
    assert!(
        SYSTEM.set(Box::new(sys)).is_ok(),
        "memory subsystem installed twice"
    );
    system()
}

/// The installed singleton.
///
/// # Panics
///
/// Panics before `install`.
pub fn system() -> &'static MemorySystem {
    SYSTEM.get().expect("memory subsystem not installed")
}

/// Frame-level allocation for kernel clients.
pub fn allocate_physical(
    count: u64,
    align_pow: u8,
    boundary_pow: u8,
) -> Result<PhysAddress, MemError> {
    system().phys.allocate(count, align_pow, boundary_pow)
}

/// Return frames taken through [`allocate_physical`].
pub fn free_physical(addr: PhysAddress, count: u64) {
    system().phys.free(addr, count);
}

/// Make `space` the active address space.
pub fn swap_space(space: &'static AddressSpace) {
    let sys = system();
    let mut current = CURRENT_SPACE.lock();
    let prev = (*current).unwrap_or(sys.kernel_space);
    space.activate(sys.kernel_space, Some(prev));
    *current = Some(space);
}

/// Trap-handler entry for page faults: resolve against the current and
/// kernel spaces, then offer what is left to the thread-level hooks.
pub fn handle_page_fault() -> FaultOutcome {
    let sys = system();
    let addr = sys.arch.fault_address();
    let space = (*CURRENT_SPACE.lock()).unwrap_or(sys.kernel_space);

    match fault::resolve_fault(space, sys.kernel_space, addr) {
        FaultOutcome::Resolved => FaultOutcome::Resolved,
        outcome => match sys.fault_hooks.dispatch(addr) {
            HookDisposition::Resolved => FaultOutcome::Resolved,
            _ => {
                error!(
                    "unresolved page fault at {:#x}: {:?}",
                    addr.as_raw(),
                    outcome
                );
                outcome
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use shared::memory::addr::VirtAddress;
    use shared::memory::page::PAGE_SIZE;

    use crate::mm::fault::resolve_fault;
    use crate::mm::paging::{Probe, PteFlags};
    use crate::testutil::{sim_boot, SIM_PHYS_BASE};

    const PAGE: u64 = PAGE_SIZE.as_raw();

    #[test_log::test]
    fn boot_builds_regions_from_the_map() {
        let sys = sim_boot(256);
        assert!(sys.phys.total_pages() > 0);

        // The boot root is a hole; the region starts one page above it
        // and spends its own first page on the header, so nothing below
        // that can ever be handed out.
        let a = sys.phys.allocate(1, 0, 0).unwrap();
        assert!(a.as_raw() >= SIM_PHYS_BASE + 2 * PAGE);
        assert!(a.as_raw() < SIM_PHYS_BASE + 256 * PAGE);
        sys.phys.free(a, 1);
    }

    #[test]
    fn boot_installs_the_physical_window() {
        let sys = sim_boot(256);

        let probe_at = VirtAddress::from_raw(DIRECT_MAP_BASE.as_raw() + SIM_PHYS_BASE);
        match paging::probe(sys.arch, sys.kernel_space.root(), probe_at) {
            Probe::Mapped { phys, flags } => {
                assert_eq!(phys.as_raw(), SIM_PHYS_BASE);
                // Window leaves are ownership-marked so teardown paths
                // leave the memory they name alone.
                assert!(flags.contains(PteFlags::BORROWED));
            }
            other => panic!("window not installed: {other:?}"),
        }
    }

    #[test]
    fn boot_gives_the_kernel_virtual_regions() {
        let sys = sim_boot(256);

        let virt = sys.kernel_space.allocate(2, MapFlags::PREBOUND).unwrap();
        assert!(virt.as_raw() >= crate::arch::KERNEL_SPACE_BASE.as_raw());
        assert!(sys.kernel_space.translate(virt).is_some());
        sys.kernel_space.free(virt, 2).unwrap();
    }

    #[test]
    fn booted_system_resolves_faults_end_to_end() {
        let sys = sim_boot(256);
        let space = Box::leak(Box::new(AddressSpace::new(
            sys.arch,
            sys.phys,
            sys.kernel_space,
        )));

        let virt = space.allocate(4, MapFlags::ZERO).unwrap();
        let addr = VirtAddress::from_raw(virt.as_raw() + PAGE + 0x40);
        assert_eq!(
            resolve_fault(space, sys.kernel_space, addr),
            FaultOutcome::Resolved
        );
        assert!(space
            .translate(VirtAddress::from_raw(virt.as_raw() + PAGE))
            .is_some());
    }

    #[test]
    fn bound_pages_are_reachable_through_the_window() {
        let sys = sim_boot(256);
        let space = Box::leak(Box::new(AddressSpace::new(
            sys.arch,
            sys.phys,
            sys.kernel_space,
        )));

        let virt = space.allocate(1, MapFlags::ZERO).unwrap();
        assert_eq!(
            resolve_fault(space, sys.kernel_space, virt),
            FaultOutcome::Resolved
        );

        let phys = space.translate(virt).unwrap();
        // The window address of the bound frame reads the same zeroed
        // memory the user mapping names.
        let window = VirtAddress::from_raw(DIRECT_MAP_BASE.as_raw() + phys.as_raw());
        let mapped = paging::translate(sys.arch, sys.kernel_space.root(), window).unwrap();
        assert_eq!(mapped, phys);
    }
}
