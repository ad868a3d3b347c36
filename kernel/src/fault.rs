//! Top-level fault classification and the two bootstrap/shutdown entry points.
//!
//! Grounded on `vm_fault` in `pagevm.c` (a stub there; the state machine
//! below is transcribed from the design notes, not the original body) and
//! on `vm_bootstrap`/`vm_shutdown`'s call sequence. Construction of the
//! coremap and swap store happens before `vm_bootstrap` runs, not inside
//! it: `Coremap::init` borrows the swap store it's given, so the two can't
//! be built inside one function without the swap store already living
//! somewhere stable. The embedding binary's init routine is expected to
//! build `Ram`, `SwapStore`, `Coremap`, `Stats` and `TlbController` in that
//! order and then call `vm_bootstrap` to finish wiring them together.

use platform::ram::Ram;
use platform::tlb::PAGE_FRAME;

use crate::addrspace::AddressSpace;
use crate::coremap::Coremap;
use crate::error::{VmError, VmResult};
use crate::pagetable::Entry;
use crate::segment::Permissions;
use crate::stats::{self, Stats};
use crate::swapfile::SwapStore;
use crate::tlbctl::TlbController;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultType {
    ReadOnly,
    Read,
    Write,
}

/// Resets the TLB round-robin cursor and marks statistics active. Coremap
/// and swap store are already live by the time this runs (see module docs).
pub fn vm_bootstrap(tlbctl: &TlbController, stats: &Stats) {
    tlbctl.reset_victim();
    stats.init();
}

/// Shuts down the swap store and coremap and prints final statistics.
pub fn vm_shutdown(coremap: &Coremap, swap: SwapStore, stats: &Stats) {
    swap.shutdown();
    coremap.shutdown();
    stats.show();
}

/// Handles one TLB-miss trap: classifies the fault, brings the faulting
/// page resident if needed, and installs a TLB entry for it.
#[allow(clippy::too_many_arguments)]
pub fn vm_fault(
    fault_type: FaultType,
    fault_addr: u32,
    addrspace: Option<&mut AddressSpace>,
    ram: &Ram,
    coremap: &Coremap,
    swap: &SwapStore,
    tlbctl: &TlbController,
    stats: &Stats,
) -> VmResult<()> {
    if fault_type == FaultType::ReadOnly {
        return Err(VmError::AccessViolation);
    }
    let addrspace = addrspace.ok_or(VmError::BadAddress)?;

    let page_vaddr = fault_addr & PAGE_FRAME;
    let permissions = addrspace.segment_for(fault_addr)?.permissions;
    if fault_type == FaultType::Write && !permissions.is_writable() {
        return Err(VmError::AccessViolation);
    }
    let entry = addrspace.segment_for(fault_addr)?.page_table().get_entry(page_vaddr);

    let paddr = match entry {
        Entry::Resident(paddr) => {
            stats.increment(stats::TLB_RELOAD);
            paddr
        }
        Entry::Empty => {
            let owner: *mut AddressSpace = &mut *addrspace;
            let paddr = coremap.alloc_user_page(page_vaddr, owner);
            let segment = addrspace.segment_for_mut(fault_addr)?;
            segment.add_pt_entry(page_vaddr, paddr);

            if permissions == Permissions::Stack {
                ram.phys_zero(paddr, platform::tlb::PAGE_SIZE as usize);
                stats.increment(stats::PAGE_FAULT_ZERO);
            } else {
                let vnode = addrspace.elf_vnode().expect("non-stack segment requires an open ELF node");
                let segment = addrspace.segment_for(fault_addr)?;
                segment.load_page(page_vaddr, paddr, vnode, ram, stats)?;
            }
            paddr
        }
        Entry::Swapped(_) => {
            let owner: *mut AddressSpace = &mut *addrspace;
            let paddr = coremap.alloc_user_page(page_vaddr, owner);
            let segment = addrspace.segment_for_mut(fault_addr)?;
            segment.swap_in(page_vaddr, paddr, swap, stats);
            paddr
        }
    };

    let writable = permissions.is_writable();
    platform::irq::with_interrupts_masked(|| {
        stats.increment(stats::TLB_MISS);
        let victim = tlbctl.peek_victim();
        if victim & platform::tlb::TlbLo::VALID.bits() as u64 != 0 {
            stats.increment(stats::TLB_MISS_REPLACE);
        } else {
            stats.increment(stats::TLB_MISS_FREE);
        }
        tlbctl.write(page_vaddr, paddr, writable);
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pagetable::Entry;
    use core::cell::RefCell;
    use platform::vnode::VnodeError;

    struct MemFile(RefCell<alloc::vec::Vec<u8>>);
    impl MemFile {
        fn new(size: usize) -> Self {
            MemFile(RefCell::new(alloc::vec![0u8; size]))
        }
    }
    impl platform::vnode::Vnode for MemFile {
        fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, VnodeError> {
            let data = self.0.borrow();
            let start = offset as usize;
            buf.copy_from_slice(&data[start..start + buf.len()]);
            Ok(buf.len())
        }
    }
    impl platform::vnode::BackingFile for MemFile {
        fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize, VnodeError> {
            let mut data = self.0.borrow_mut();
            let start = offset as usize;
            data[start..start + buf.len()].copy_from_slice(buf);
            Ok(buf.len())
        }
    }

    #[test]
    fn zero_fill_stack_fault_installs_a_resident_zeroed_page() {
        let ram = Ram::bootstrap(16 * platform::tlb::PAGE_SIZE);
        let swap_file = MemFile::new(crate::swapfile::SWAP_SIZE as usize);
        let swap = SwapStore::init(&swap_file, &ram);
        let stats = Stats::new();
        let coremap = Coremap::init(&ram, &swap, &stats);
        let tlbctl = TlbController::new();
        vm_bootstrap(&tlbctl, &stats);

        let mut space = AddressSpace::create();
        space.define_region(0, 0, 0x0040_0000, 1, platform::tlb::PAGE_SIZE, true, false, true).unwrap();
        space.define_region(0, 0, 0x0050_0000, 1, platform::tlb::PAGE_SIZE, true, true, false).unwrap();
        space.define_stack().unwrap();

        let fault_addr = crate::addrspace::USERSTACK - 4;
        vm_fault(FaultType::Read, fault_addr, Some(&mut space), &ram, &coremap, &swap, &tlbctl, &stats).unwrap();

        let page_vaddr = fault_addr & platform::tlb::PAGE_FRAME;
        let paddr = match space.segment_for(fault_addr).unwrap().page_table().get_entry(page_vaddr) {
            Entry::Resident(p) => p,
            other => panic!("expected Resident, got {:?}", other),
        };
        let mut frame = [0u8; platform::tlb::PAGE_SIZE as usize];
        ram.phys_read(paddr, &mut frame);
        assert_eq!(frame, [0u8; platform::tlb::PAGE_SIZE as usize]);

        assert_eq!(stats.get(stats::PAGE_FAULT_ZERO), 1);
        assert_eq!(stats.get(stats::TLB_MISS), 1);
        assert_eq!(stats.get(stats::TLB_MISS_FREE), 1);
    }

    #[test]
    fn readonly_fault_type_is_an_access_violation() {
        let ram = Ram::bootstrap(4 * platform::tlb::PAGE_SIZE);
        let swap_file = MemFile::new(crate::swapfile::SWAP_SIZE as usize);
        let swap = SwapStore::init(&swap_file, &ram);
        let stats = Stats::new();
        stats.init();
        let coremap = Coremap::init(&ram, &swap, &stats);
        let tlbctl = TlbController::new();

        let mut space = AddressSpace::create();
        let result = vm_fault(FaultType::ReadOnly, 0x1000, Some(&mut space), &ram, &coremap, &swap, &tlbctl, &stats);
        assert_eq!(result, Err(VmError::AccessViolation));
    }

    #[test]
    fn no_address_space_is_a_bad_address() {
        let ram = Ram::bootstrap(4 * platform::tlb::PAGE_SIZE);
        let swap_file = MemFile::new(crate::swapfile::SWAP_SIZE as usize);
        let swap = SwapStore::init(&swap_file, &ram);
        let stats = Stats::new();
        stats.init();
        let coremap = Coremap::init(&ram, &swap, &stats);
        let tlbctl = TlbController::new();

        let result = vm_fault(FaultType::Read, 0x1000, None, &ram, &coremap, &swap, &tlbctl, &stats);
        assert_eq!(result, Err(VmError::BadAddress));
    }

    #[test]
    fn write_to_a_read_only_code_segment_is_an_access_violation() {
        let ram = Ram::bootstrap(16 * platform::tlb::PAGE_SIZE);
        let swap_file = MemFile::new(crate::swapfile::SWAP_SIZE as usize);
        let swap = SwapStore::init(&swap_file, &ram);
        let stats = Stats::new();
        stats.init();
        let coremap = Coremap::init(&ram, &swap, &stats);
        let tlbctl = TlbController::new();

        let mut space = AddressSpace::create();
        // R=1, W=0, X=1: a read-only executable region.
        space.define_region(0, 0, 0x0040_0000, 1, platform::tlb::PAGE_SIZE, true, false, true).unwrap();
        space.define_region(0, 0, 0x0050_0000, 1, platform::tlb::PAGE_SIZE, true, true, false).unwrap();
        space.define_stack().unwrap();

        let result = vm_fault(FaultType::Write, 0x0040_0000, Some(&mut space), &ram, &coremap, &swap, &tlbctl, &stats);
        assert_eq!(result, Err(VmError::AccessViolation));
        assert_eq!(
            space.segment_for(0x0040_0000).unwrap().page_table().get_entry(0x0040_0000),
            Entry::Empty,
            "a rejected write must not have allocated a frame"
        );
    }

    /// Drives scenarios 3 and 4: fill physical memory with distinct-page
    /// user faults until the coremap has no freed frame and no RAM left to
    /// steal, forcing the next allocation to evict the FIFO head; then fault
    /// on the evicted page in its original process and confirm it swaps back in.
    #[test]
    fn eviction_under_pressure_then_swap_in_restores_the_page() {
        let num_frames = 4u32;
        let ram = Ram::bootstrap(num_frames * platform::tlb::PAGE_SIZE);
        let swap_file = MemFile::new(crate::swapfile::SWAP_SIZE as usize);
        let swap = SwapStore::init(&swap_file, &ram);
        let stats = Stats::new();
        stats.init();
        let coremap = Coremap::init(&ram, &swap, &stats);
        let tlbctl = TlbController::new();

        let mut space = AddressSpace::create();
        space.define_region(0, 0, 0x0040_0000, 1, platform::tlb::PAGE_SIZE, true, false, true).unwrap();
        space.define_region(0, 0, 0x0050_0000, 1, platform::tlb::PAGE_SIZE, true, true, false).unwrap();
        space.define_stack().unwrap();

        // Fault on every stack page in turn to exhaust the 4-frame RAM: all
        // four frames start FREED, so these four faults consume them all,
        // leaving no freed frame and no RAM left to steal.
        let stack_base = crate::addrspace::USERSTACK - crate::addrspace::STACK_PAGES * platform::tlb::PAGE_SIZE;
        for i in 0..num_frames {
            let addr = stack_base + i * platform::tlb::PAGE_SIZE;
            vm_fault(FaultType::Read, addr, Some(&mut space), &ram, &coremap, &swap, &tlbctl, &stats).unwrap();
        }
        assert_eq!(swap.slots_in_use(), 0, "RAM isn't exhausted yet, nothing evicted");

        // One more distinct page forces eviction of the first stack page touched.
        let fifth_addr = stack_base + num_frames * platform::tlb::PAGE_SIZE;
        vm_fault(FaultType::Read, fifth_addr, Some(&mut space), &ram, &coremap, &swap, &tlbctl, &stats).unwrap();
        assert_eq!(swap.slots_in_use(), 1, "the FIFO head must have been evicted to swap");
        assert_eq!(stats.get(stats::SWAPFILE_WRITE), 1);

        assert!(
            matches!(space.segment_for(stack_base).unwrap().page_table().get_entry(stack_base), Entry::Swapped(_)),
            "the oldest stack page (FIFO head) must have been swapped out"
        );

        // Faulting on the evicted page again must bring it back resident via swap-in.
        let before_swapfile = stats.get(stats::PAGE_FAULT_SWAPFILE);
        vm_fault(FaultType::Read, stack_base, Some(&mut space), &ram, &coremap, &swap, &tlbctl, &stats).unwrap();
        assert!(matches!(
            space.segment_for(stack_base).unwrap().page_table().get_entry(stack_base),
            Entry::Resident(_)
        ));
        assert_eq!(stats.get(stats::PAGE_FAULT_SWAPFILE), before_swapfile + 1);
    }
}
