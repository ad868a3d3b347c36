//! A process's address space: three segments (code, data, stack) sharing
//! one ELF node, plus the activation/deactivation hooks the scheduler calls
//! on every context switch.
//!
//! Grounded on `addrspace.c`. `destroy` fixes the original's bug where the
//! code segment's ELF vnode is read before checking whether the code
//! segment exists at all; here the vnode isn't even reachable through the
//! segment; it is a separate, null-checked `Option` owned by the address
//! space, dropped (and so closed) exactly once regardless of which
//! segments were ever defined.

use platform::ram::Ram;
use platform::vnode::Vnode;

use crate::coremap::Coremap;
use crate::error::{VmError, VmResult};
use crate::segment::Segment;
use crate::stats::Stats;
use crate::swapfile::SwapStore;
use crate::tlbctl::TlbController;

/// 18 pages, matching the original's `VM_STACKPAGES`.
pub const STACK_PAGES: u32 = 18;
pub const USERSTACK: u32 = 0x8000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RegionSlot {
    Empty,
    Code,
    Data,
}

pub struct AddressSpace {
    code: Segment,
    data: Segment,
    stack: Segment,
    code_defined: RegionSlot,
    data_defined: bool,
    /// The open ELF executable, closed (via `Drop`) exactly once when the
    /// address space is destroyed. `None` until `prepare_load` runs, and for
    /// address spaces built by `copy` that never re-open it (the copy shares
    /// no node with the source; `copy` always supplies a fresh handle).
    elf_vnode: Option<alloc::boxed::Box<dyn Vnode>>,
}

impl AddressSpace {
    pub fn create() -> Self {
        AddressSpace {
            code: Segment::zeroed(),
            data: Segment::zeroed(),
            stack: Segment::zeroed(),
            code_defined: RegionSlot::Empty,
            data_defined: false,
            elf_vnode: None,
        }
    }

    /// Records the open ELF node this address space will load code/data
    /// from. Must be called before the first `define_region`.
    pub fn prepare_load(&mut self, vnode: alloc::boxed::Box<dyn Vnode>) {
        self.elf_vnode = Some(vnode);
    }

    /// Defines the next undefined region (code, then data) from one ELF
    /// program header. A third call returns `NotImplemented`, matching the
    /// two-region-only design.
    pub fn define_region(
        &mut self,
        seg_size_bytes: u32,
        file_offset: u32,
        base_vaddr: u32,
        num_pages: u32,
        seg_size_words: u32,
        readable: bool,
        writable: bool,
        executable: bool,
    ) -> VmResult<()> {
        if self.code_defined == RegionSlot::Empty {
            self.code.define(seg_size_bytes, file_offset, base_vaddr, num_pages, seg_size_words, readable, writable, executable)?;
            self.code_defined = RegionSlot::Code;
            Ok(())
        } else if !self.data_defined {
            self.data.define(seg_size_bytes, file_offset, base_vaddr, num_pages, seg_size_words, readable, writable, executable)?;
            self.data_defined = true;
            Ok(())
        } else {
            Err(VmError::NotImplemented)
        }
    }

    /// Creates the page tables for code and data, now that both are
    /// defined, and lays out the fixed-size stack below `USERSTACK`.
    pub fn define_stack(&mut self) -> VmResult<u32> {
        if self.code_defined != RegionSlot::Code || !self.data_defined {
            return Err(VmError::BadArgument);
        }
        self.code.prepare()?;
        self.data.prepare()?;
        self.stack.define_stack(USERSTACK - STACK_PAGES * platform::tlb::PAGE_SIZE, STACK_PAGES)?;
        Ok(USERSTACK)
    }

    /// Locates the segment (and, transitively, its page table) covering
    /// `vaddr`, or `None` if it falls in none of the three regions. The
    /// data segment's upper bound is `base_data + data_size`, not a copy of
    /// the code segment's bound.
    fn find_segment(&self, vaddr: u32) -> Option<&Segment> {
        if self.code.contains(vaddr) {
            Some(&self.code)
        } else if self.data.contains(vaddr) {
            Some(&self.data)
        } else if self.stack.contains(vaddr) {
            Some(&self.stack)
        } else {
            None
        }
    }

    fn find_segment_mut(&mut self, vaddr: u32) -> Option<&mut Segment> {
        if self.code.contains(vaddr) {
            Some(&mut self.code)
        } else if self.data.contains(vaddr) {
            Some(&mut self.data)
        } else if self.stack.contains(vaddr) {
            Some(&mut self.stack)
        } else {
            None
        }
    }

    pub fn segment_for(&self, vaddr: u32) -> VmResult<&Segment> {
        self.find_segment(vaddr).ok_or(VmError::BadAddress)
    }

    pub fn segment_for_mut(&mut self, vaddr: u32) -> VmResult<&mut Segment> {
        self.find_segment_mut(vaddr).ok_or(VmError::BadAddress)
    }

    pub fn elf_vnode(&self) -> Option<&dyn Vnode> {
        self.elf_vnode.as_deref()
    }

    /// Called by the coremap when this address space's resident page at
    /// `vaddr` is chosen for eviction: flips the page-table entry to
    /// `Swapped(offset)`. The frame itself has already been written to swap
    /// by the caller; this call only updates the mapping.
    ///
    /// # Safety
    /// Called through a raw pointer from the coremap while holding no lock
    /// on `self`; correct only because the coremap guarantees `self` is not
    /// concurrently being destroyed (frames are always freed, clearing the
    /// coremap's back-reference, before an address space's segments drop).
    pub fn evict_page(&mut self, vaddr: u32, offset: u32) {
        let segment = self.find_segment_mut(vaddr).expect("evicted vaddr must belong to one of this address space's segments");
        segment.swap_out(vaddr, offset);
    }

    /// Masks interrupts, invalidates every TLB entry, and unmasks: the
    /// mandatory bracket around switching the active address space.
    pub fn activate(&self, tlbctl: &TlbController, stats: &Stats) {
        let level = platform::irq::splhigh();
        tlbctl.invalidate_all(stats);
        platform::irq::splx(level);
    }

    /// No hardware state to save; kept for symmetry with `activate`.
    pub fn deactivate(&self) {}

    /// Deep-copies this address space: three independent segments sharing
    /// no frame or swap slot with the source, and a node reference to the
    /// same (shared, read-only) ELF file.
    pub fn copy(&self, coremap: &Coremap, swap: &SwapStore, ram: &Ram, stats: &Stats, dst: *mut AddressSpace) -> VmResult<()> {
        let mut code = self.code.copy(coremap, swap, ram, stats, dst)?;

        let mut data = match self.data.copy(coremap, swap, ram, stats, dst) {
            Ok(data) => data,
            Err(e) => {
                // unwind: the code copy already holds real frames/swap slots.
                code.clear_content(coremap, swap);
                return Err(e);
            }
        };

        let stack = match self.stack.copy(coremap, swap, ram, stats, dst) {
            Ok(stack) => stack,
            Err(e) => {
                code.clear_content(coremap, swap);
                data.clear_content(coremap, swap);
                return Err(e);
            }
        };

        // SAFETY: `dst` points at a freshly created, not-yet-shared
        // AddressSpace owned by the caller; no other reference is alive.
        unsafe {
            (*dst).code = code;
            (*dst).data = data;
            (*dst).stack = stack;
            (*dst).code_defined = self.code_defined;
            (*dst).data_defined = self.data_defined;
        }
        Ok(())
    }

    /// Releases every frame and swap slot held by this address space's
    /// segments, then closes the ELF node (if one was ever opened). Safe to
    /// call on a partially constructed address space: segments that were
    /// never `prepare`d simply have nothing to release.
    pub fn destroy(&mut self, coremap: &Coremap, swap: &SwapStore) {
        self.code.clear_content(coremap, swap);
        self.data.clear_content(coremap, swap);
        self.stack.clear_content(coremap, swap);
        self.elf_vnode = None;
    }
}
