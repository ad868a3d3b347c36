//! RAM bootstrap allocator and the physical byte store backing it.
//!
//! Before the coremap exists, and whenever the coremap runs out of freed
//! frames, allocation falls back to a bump allocator over raw RAM. This
//! models `ram_getsize`/`ram_stealmem`: a monotonically increasing cursor
//! that hands out whole frames and never reclaims them directly (frames it
//! hands out become coremap-tracked and are freed through the coremap from
//! then on).
//!
//! `Ram` also owns the byte contents of physical memory. Real hardware
//! doesn't need this; it exists so swap-out/swap-in and ELF loads have
//! actual bytes to move on the host.

use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

use crate::tlb::PAGE_SIZE;

struct State {
    total_bytes: u32,
    next_free: u32,
    bytes: Vec<u8>,
}

pub struct Ram {
    inner: Mutex<State>,
}

impl Ram {
    /// Installs a simulated RAM region of `total_bytes`, all untouched.
    pub fn bootstrap(total_bytes: u32) -> Self {
        Ram { inner: Mutex::new(State { total_bytes, next_free: 0, bytes: vec![0u8; total_bytes as usize] }) }
    }

    /// Total RAM size in bytes, as reported by the bootstrap firmware.
    pub fn getsize(&self) -> u32 {
        self.inner.lock().total_bytes
    }

    /// Bytes already handed out by `stealmem` so far. Lets a frame
    /// registry initialized after some early allocations distinguish
    /// those frames from ones it's free to manage.
    pub fn bytes_claimed(&self) -> u32 {
        self.inner.lock().next_free
    }

    /// Claims `npages` contiguous frames from the untouched tail of RAM.
    /// Returns the physical base address, or 0 if RAM is exhausted.
    pub fn stealmem(&self, npages: u32) -> u32 {
        let mut state = self.inner.lock();
        let needed = npages as u64 * PAGE_SIZE as u64;
        let next = state.next_free as u64;
        if next + needed > state.total_bytes as u64 {
            return 0;
        }
        let base = state.next_free;
        state.next_free += needed as u32;
        base
    }

    /// Copies `buf.len()` bytes starting at physical address `paddr` into `buf`.
    pub fn phys_read(&self, paddr: u32, buf: &mut [u8]) {
        let state = self.inner.lock();
        let start = paddr as usize;
        buf.copy_from_slice(&state.bytes[start..start + buf.len()]);
    }

    /// Copies `buf` into RAM starting at physical address `paddr`.
    pub fn phys_write(&self, paddr: u32, buf: &[u8]) {
        let mut state = self.inner.lock();
        let start = paddr as usize;
        state.bytes[start..start + buf.len()].copy_from_slice(buf);
    }

    /// Zero-fills `len` bytes starting at physical address `paddr`.
    pub fn phys_zero(&self, paddr: u32, len: usize) {
        let mut state = self.inner.lock();
        let start = paddr as usize;
        state.bytes[start..start + len].fill(0);
    }
}
