//! Test doubles for the architecture contract.
//!
//! Tests run on the host against a leaked page-aligned arena standing in
//! for physical memory. The window contract is the arena offset, and TLB /
//! root-table operations are recorded for assertions instead of reaching
//! hardware.

use std::alloc::Layout;

use shared::memory::addr::{PhysAddress, PhysExtent, VirtAddress};
use shared::memory::page::{PAGE_SHIFT, PAGE_SIZE};
use shared::memory::{Map, MapEntry, MemoryType};

use crate::arch::ArchMmu;
use crate::mm;

/// Physical address the simulated arena starts at. Low memory stays
/// unpopulated so address-zero bugs trap loudly.
pub const SIM_PHYS_BASE: u64 = 0x10_0000;

pub struct SimMmu {
    base: *mut u8,
    bytes: u64,
    pub invalidations: spin::Mutex<Vec<(u64, u64)>>,
    pub root_loads: spin::Mutex<Vec<u64>>,
    pub fault_addr: spin::Mutex<u64>,
}

// SAFETY: the arena is plain memory; all mutable state is behind locks.
unsafe impl Send for SimMmu {}
unsafe impl Sync for SimMmu {}

impl SimMmu {
    /// A fresh simulated machine with `pages` pages of physical memory,
    /// leaked so components demanding `'static` can borrow it.
    pub fn leak_arena(pages: u64) -> &'static SimMmu {
        let bytes = pages << PAGE_SHIFT;
        let layout = Layout::from_size_align(bytes as usize, PAGE_SIZE.as_raw() as usize).unwrap();
        // SAFETY: layout is non-zero and valid.
        let base = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!base.is_null());

        Box::leak(Box::new(SimMmu {
            base,
            bytes,
            invalidations: spin::Mutex::new(Vec::new()),
            root_loads: spin::Mutex::new(Vec::new()),
            fault_addr: spin::Mutex::new(0),
        }))
    }

    /// The whole arena as a physical extent.
    pub fn phys_extent(&self) -> PhysExtent {
        PhysExtent::from_raw(SIM_PHYS_BASE, self.bytes)
    }

    /// A one-entry boot memory map covering the arena.
    pub fn boot_map(&self) -> Map {
        Map::from_entries([MapEntry {
            extent: self.phys_extent(),
            mem_type: MemoryType::Available,
        }])
    }

    pub fn invalidation_count(&self) -> usize {
        self.invalidations.lock().len()
    }

    pub fn set_fault_address(&self, virt: VirtAddress) {
        *self.fault_addr.lock() = virt.as_raw();
    }
}

unsafe impl ArchMmu for SimMmu {
    fn phys_to_virt(&self, phys: PhysAddress) -> VirtAddress {
        let off = phys
            .as_raw()
            .checked_sub(SIM_PHYS_BASE)
            .unwrap_or_else(|| panic!("{:#x} is below the simulated arena", phys.as_raw()));
        assert!(
            off < self.bytes,
            "{:#x} is outside the simulated arena",
            phys.as_raw()
        );
        // SAFETY: in-bounds offset into the arena allocation.
        VirtAddress::from_ptr(unsafe { self.base.add(off as usize) })
    }

    fn invalidate_page(&self, virt: VirtAddress) {
        self.invalidations
            .lock()
            .push((virt.as_raw(), virt.as_raw() + PAGE_SIZE.as_raw()));
    }

    fn invalidate_range(&self, start: VirtAddress, end: VirtAddress) {
        self.invalidations.lock().push((start.as_raw(), end.as_raw()));
    }

    fn table_barrier(&self) {
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
    }

    fn load_root_table(&self, root: PhysAddress) {
        self.root_loads.lock().push(root.as_raw());
    }

    fn fault_address(&self) -> VirtAddress {
        VirtAddress::from_raw(*self.fault_addr.lock())
    }
}

/// Boot a complete memory system over a fresh arena: the first arena page
/// plays the loader-built root table, the rest is donated as general
/// memory.
pub fn sim_boot(pages: u64) -> &'static mm::MemorySystem {
    let arch = SimMmu::leak_arena(pages);
    let boot_root = PhysAddress::from_raw(SIM_PHYS_BASE);
    let holes = [PhysExtent::new(boot_root, PAGE_SIZE)];
    let sys = mm::init(arch, &arch.boot_map(), &holes, boot_root).unwrap();
    Box::leak(Box::new(sys))
}
