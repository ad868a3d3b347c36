//! Fixed-size swap backing store: a bitmap-addressed file of page slots.
//!
//! Grounded on `swapfile.c`/`swapfile.h`. The swap file itself is a
//! `platform::vnode::BackingFile`; the bitmap tracking free slots is the
//! one piece of mutable state here, guarded by a single short lock as the
//! concurrency model requires.

use platform::bitmap::Bitmap;
use platform::ram::Ram;
use platform::tlb::PAGE_SIZE;
use platform::vnode::BackingFile;
use spin::Mutex;

use crate::stats::{self, Stats};

pub const SWAP_SIZE: u32 = 9 * 1024 * 1024;
pub const NUM_SWAP_SLOTS: usize = (SWAP_SIZE / PAGE_SIZE) as usize;

struct Inner {
    bitmap: Bitmap,
}

pub struct SwapStore<'a> {
    file: &'a dyn BackingFile,
    ram: &'a Ram,
    inner: Mutex<Inner>,
}

impl<'a> SwapStore<'a> {
    /// Opens `file` for read-write and allocates a clear bitmap of
    /// `NUM_SWAP_SLOTS` bits. The file is assumed already sized/creatable
    /// by the caller (the VFS layer is out of scope here).
    pub fn init(file: &'a dyn BackingFile, ram: &'a Ram) -> Self {
        SwapStore { file, ram, inner: Mutex::new(Inner { bitmap: Bitmap::new(NUM_SWAP_SLOTS) }) }
    }

    /// Writes the page at `paddr` to the first free slot, returning its
    /// byte offset. Swap exhaustion and short writes are fatal.
    pub fn swap_out(&self, paddr: u32, stats: &Stats) -> u32 {
        assert!(paddr != 0 && paddr & (PAGE_SIZE - 1) == 0, "swap_out requires a page-aligned physical address");

        let slot = {
            let mut inner = self.inner.lock();
            inner.bitmap.alloc().expect("swap file exhausted")
        };
        let offset = slot as u32 * PAGE_SIZE;

        let mut buf = [0u8; PAGE_SIZE as usize];
        self.ram.phys_read(paddr, &mut buf);

        let written = self.file.write_at(offset as u64, &buf).expect("swap file write failed");
        assert!(written == PAGE_SIZE as usize, "short write to swap file");

        stats.increment(stats::SWAPFILE_WRITE);
        offset
    }

    /// Reads the page at `offset` into `paddr`. The slot must currently be
    /// allocated; a short read is fatal.
    pub fn swap_in(&self, paddr: u32, offset: u32, stats: &Stats) {
        assert!(paddr & (PAGE_SIZE - 1) == 0, "swap_in requires a page-aligned physical address");
        assert!(offset < SWAP_SIZE, "swap offset out of range");
        let slot = (offset / PAGE_SIZE) as usize;

        let mut buf = [0u8; PAGE_SIZE as usize];
        let read = self.file.read_at(offset as u64, &mut buf).expect("swap file read failed");
        assert!(read == PAGE_SIZE as usize, "short read from swap file");
        self.ram.phys_write(paddr, &buf);

        let mut inner = self.inner.lock();
        inner.bitmap.clear(slot).expect("swap_in on an unallocated slot");
        drop(inner);

        stats.increment(stats::PAGE_FAULT_SWAPFILE);
        stats.increment(stats::PAGE_FAULT_DISK);
    }

    /// Duplicates the slot at `src_offset` into a freshly allocated slot and
    /// returns its offset. Used when deep-copying an address space: the copy
    /// gets its own swap slot rather than sharing the source's.
    pub fn copy_slot(&self, src_offset: u32, stats: &Stats) -> u32 {
        let mut buf = [0u8; PAGE_SIZE as usize];
        let read = self.file.read_at(src_offset as u64, &mut buf).expect("swap file read failed");
        assert!(read == PAGE_SIZE as usize, "short read from swap file");

        let slot = {
            let mut inner = self.inner.lock();
            inner.bitmap.alloc().expect("swap file exhausted")
        };
        let offset = slot as u32 * PAGE_SIZE;

        let written = self.file.write_at(offset as u64, &buf).expect("swap file write failed");
        assert!(written == PAGE_SIZE as usize, "short write to swap file");

        stats.increment(stats::SWAPFILE_WRITE);
        offset
    }

    /// Discards a swap slot without reading it back. No zeroing of content.
    pub fn swap_free(&self, offset: u32) {
        let slot = (offset / PAGE_SIZE) as usize;
        self.inner.lock().bitmap.clear(slot).expect("swap_free on an unallocated slot");
    }

    pub fn slots_in_use(&self) -> usize {
        self.inner.lock().bitmap.count_set()
    }

    pub fn shutdown(self) {}
}
