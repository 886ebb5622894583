//! The architecture services the memory subsystem is built on.
//!
//! Everything CPU-specific (TLB maintenance, the translation-root
//! register, how the kernel reaches physical memory to edit tables) sits
//! behind [`ArchMmu`] so the rest of the subsystem is ordinary portable
//! code. Tests substitute a simulated implementation.

use shared::memory::addr::{Length, PhysAddress, VirtAddress};
use shared::memory::page::PAGE_SIZE;

// Virtual memory layout:
//   0x0000_0000_0010_0000 - 0x0000_7fff_ffff_ffff: user allocations
//   0xffff_8000_0000_0000 -                      : kernel half
//   0xffff_8800_0000_0000 -                      : direct map of physical memory
//   0xffff_ffff_8000_0000 -                      : kernel image

/// Lowest virtual address of the kernel half of every address space.
pub const KERNEL_SPACE_BASE: VirtAddress = VirtAddress::from_raw(0xffff_8000_0000_0000);

/// One past the last kernel-half address that table walks may name.
pub const KERNEL_SPACE_END: VirtAddress = VirtAddress::from_raw(0xffff_ff80_0000_0000);

/// Base of the fixed-offset window through which all of physical memory is
/// reachable for table and frame editing.
pub const DIRECT_MAP_BASE: VirtAddress = VirtAddress::from_raw(0xffff_8800_0000_0000);

/// First virtual address handed out to user allocations.
pub const USER_SPACE_BASE: VirtAddress = VirtAddress::from_raw(0x0000_0000_0010_0000);

/// One past the highest user virtual address.
pub const USER_SPACE_END: VirtAddress = VirtAddress::from_raw(0x0000_8000_0000_0000);

/// CPU-side contract the memory subsystem requires.
///
/// # Safety
///
/// Implementations are trusted by every unsafe block in the subsystem:
/// `phys_to_virt` must return memory that is valid for reads and writes for
/// the full referenced frame, and the TLB operations must actually reach
/// the hardware (or the simulation standing in for it).
pub unsafe trait ArchMmu: Send + Sync {
    /// Virtual address through which physical address `phys` can be read
    /// and written by the kernel.
    fn phys_to_virt(&self, phys: PhysAddress) -> VirtAddress;

    /// Drop any cached translation for the page containing `virt`.
    fn invalidate_page(&self, virt: VirtAddress);

    /// Drop any cached translations in `[start, end)`.
    fn invalidate_range(&self, start: VirtAddress, end: VirtAddress);

    /// Order table writes before any walk that may observe them.
    fn table_barrier(&self);

    /// Make `root` the hardware-loaded top-level translation table.
    fn load_root_table(&self, root: PhysAddress);

    /// The faulting virtual address. Only meaningful while a page fault is
    /// being handled.
    fn fault_address(&self) -> VirtAddress;
}

/// The real x86-64 implementation.
#[cfg(target_arch = "x86_64")]
pub struct X86Mmu;

#[cfg(target_arch = "x86_64")]
unsafe impl ArchMmu for X86Mmu {
    fn phys_to_virt(&self, phys: PhysAddress) -> VirtAddress {
        DIRECT_MAP_BASE + Length::from_raw(phys.as_raw())
    }

    fn invalidate_page(&self, virt: VirtAddress) {
        x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(virt.as_raw()));
    }

    fn invalidate_range(&self, start: VirtAddress, end: VirtAddress) {
        // Past a handful of pages a full flush is cheaper than per-page
        // invalidations.
        const FLUSH_ALL_THRESHOLD: u64 = 32;

        let pages = (end - start).as_raw() / PAGE_SIZE.as_raw();
        if pages > FLUSH_ALL_THRESHOLD {
            x86_64::instructions::tlb::flush_all();
            return;
        }

        let mut virt = start;
        while virt < end {
            self.invalidate_page(virt);
            virt += PAGE_SIZE;
        }
    }

    fn table_barrier(&self) {
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
    }

    fn load_root_table(&self, root: PhysAddress) {
        use x86_64::registers::control::{Cr3, Cr3Flags};
        use x86_64::structures::paging::PhysFrame;

        let frame = PhysFrame::containing_address(x86_64::PhysAddr::new(root.as_raw()));
        unsafe {
            Cr3::write(frame, Cr3Flags::empty());
        }
    }

    fn fault_address(&self) -> VirtAddress {
        VirtAddress::from_raw(x86_64::registers::control::Cr2::read().as_u64())
    }
}
