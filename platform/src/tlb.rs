//! Simulated software TLB registers.
//!
//! Real hardware exposes `tlb_read`/`tlb_write` as privileged instructions
//! operating on a fixed number of per-CPU slots. [`Tlb`] models exactly
//! that fixed-size register file as an owned value rather than a global,
//! so each address space (and each test) can hold its own TLB instance.

use bitflags::bitflags;

pub const PAGE_SIZE: u32 = 4096;
/// Mask selecting the page-frame bits of an address (clears the page offset).
pub const PAGE_FRAME: u32 = !(PAGE_SIZE - 1);

/// Number of hardware TLB slots.
pub const NUM_TLB: usize = 64;

bitflags! {
    pub struct TlbLo: u32 {
        const VALID = 1 << 0;
        const DIRTY = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlbEntry {
    pub hi: u32,
    pub lo: u32,
}

impl TlbEntry {
    pub const fn blank() -> Self {
        TlbEntry { hi: 0, lo: 0 }
    }

    pub fn is_valid(&self) -> bool {
        self.lo & TlbLo::VALID.bits() != 0
    }

    /// Packs the pair into the single 64-bit value `peek_victim` hands back.
    pub fn pack(&self) -> u64 {
        ((self.hi as u64) << 32) | self.lo as u64
    }
}

/// High word written by an invalidation: tags the slot with a vaddr that can
/// never be faulted on, per the usual MIPS convention of using the slot index
/// as a disambiguating VPN so stale entries never collide.
pub fn tlbhi_invalid(index: usize) -> u32 {
    (index as u32) << 12
}

/// Low word written by an invalidation: VALID clear.
pub fn tlblo_invalid() -> u32 {
    0
}

/// The CPU-local TLB register file.
pub struct Tlb([TlbEntry; NUM_TLB]);

impl Tlb {
    pub const fn new() -> Self {
        Tlb([TlbEntry::blank(); NUM_TLB])
    }

    pub fn read(&self, index: usize) -> (u32, u32) {
        let e = self.0[index];
        (e.hi, e.lo)
    }

    pub fn write(&mut self, hi: u32, lo: u32, index: usize) {
        self.0[index] = TlbEntry { hi, lo };
    }
}

impl Default for Tlb {
    fn default() -> Self {
        Self::new()
    }
}
