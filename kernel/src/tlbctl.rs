//! Software TLB controller: invalidation and round-robin replacement.
//!
//! Grounded on `vm_tlb.c`: a single `current_victim` cursor, advanced
//! modulo `NUM_TLB` on every write. All mutation happens through
//! `platform::irq::with_interrupts_masked`, matching the concurrency
//! model's requirement that TLB writes run with interrupts off.

use platform::irq::with_interrupts_masked;
use platform::tlb::{self, NUM_TLB, PAGE_FRAME, Tlb, TlbLo};
use spin::Mutex;

use crate::stats::{self, Stats};

pub struct TlbController {
    tlb: Mutex<Tlb>,
    current_victim: Mutex<usize>,
}

impl TlbController {
    pub fn new() -> Self {
        TlbController { tlb: Mutex::new(Tlb::new()), current_victim: Mutex::new(0) }
    }

    /// Marks every slot invalid. Called on every address-space activation.
    pub fn invalidate_all(&self, stats: &Stats) {
        with_interrupts_masked(|| {
            let mut tlb = self.tlb.lock();
            for i in 0..NUM_TLB {
                tlb.write(tlb::tlbhi_invalid(i), tlb::tlblo_invalid(), i);
            }
        });
        stats.increment(stats::TLB_INVALIDATION);
    }

    /// Resets the round-robin cursor. Called once at boot.
    pub fn reset_victim(&self) {
        *self.current_victim.lock() = 0;
    }

    /// Reads the entry in the current victim slot without replacing it.
    pub fn peek_victim(&self) -> u64 {
        let index = *self.current_victim.lock();
        let (hi, lo) = self.tlb.lock().read(index);
        tlb::TlbEntry { hi, lo }.pack()
    }

    /// Writes `(vaddr, paddr, writable)` into the current victim slot and
    /// advances the round-robin cursor.
    pub fn write(&self, vaddr: u32, paddr: u32, writable: bool) {
        with_interrupts_masked(|| {
            let mut victim = self.current_victim.lock();
            let index = *victim;
            *victim = (index + 1) % NUM_TLB;

            let hi = vaddr & PAGE_FRAME;
            let mut lo = paddr | TlbLo::VALID.bits();
            if writable {
                lo |= TlbLo::DIRTY.bits();
            }
            self.tlb.lock().write(hi, lo, index);
        });
    }
}

impl Default for TlbController {
    fn default() -> Self {
        Self::new()
    }
}
