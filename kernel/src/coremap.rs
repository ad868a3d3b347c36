//! Physical-frame registry: kernel contiguous allocation, user single-page
//! allocation with FIFO eviction, and the bookkeeping invariants tying a
//! resident physical frame back to the page-table entry that references it.
//!
//! Grounded on `coremap.c`, the one file in the original source with real
//! logic rather than a stub. The FIFO is modeled per the design notes as
//! two sentinels plus two array indices per entry rather than a separate
//! linked-list allocation, and the two-phase `replacement_lock` /
//! `coremap_lock` acquisition order from the concurrency model is
//! preserved exactly: snapshot head/tail, release, mutate the array under
//! `coremap_lock`, release, publish the new head/tail.

use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use platform::irq::interrupts_masked;
use platform::ram::Ram;
use platform::tlb::PAGE_SIZE;
use spin::Mutex;

use crate::addrspace::AddressSpace;
use crate::stats::{self, Stats};
use crate::swapfile::SwapStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameState {
    Untracked,
    Freed,
    Kernel,
    User,
}

#[derive(Clone, Copy)]
struct CoremapEntry {
    state: FrameState,
    /// Frames in a contiguous block, meaningful only on the block's first frame.
    allocation_size: u32,
    /// Meaningful only for `User` frames.
    vaddr: u32,
    /// Meaningful only for `User` frames.
    ///
    /// # Safety
    /// Dereferenced only while holding `coremap_lock` (or when reassigning
    /// under eviction's coremap_lock critical section), and only for the
    /// lifetime during which this frame's state is `User`. The owning
    /// `AddressSpace` must not move or be dropped while a coremap entry
    /// references it; segment/address-space destruction always frees its
    /// resident frames first, which clears this field.
    owner: Option<*mut AddressSpace>,
    prev: u32,
    next: u32,
}

impl CoremapEntry {
    const fn untracked(invalid_ref: u32) -> Self {
        CoremapEntry { state: FrameState::Untracked, allocation_size: 0, vaddr: 0, owner: None, prev: invalid_ref, next: invalid_ref }
    }
}

struct Replacement {
    head: u32,
    tail: u32,
}

pub struct Coremap<'a> {
    ram: &'a Ram,
    swap: &'a SwapStore<'a>,
    stats: &'a Stats,
    num_frames: u32,
    invalid_ref: u32,
    entries: Mutex<Vec<CoremapEntry>>,
    replacement: Mutex<Replacement>,
    steal_lock: Mutex<()>,
    active: AtomicBool,
}

// SAFETY: coremap entries never alias a live `&mut AddressSpace`; every
// dereference happens transiently under `entries`' lock, matching the
// original's single-threaded-per-critical-section discipline.
unsafe impl<'a> Sync for Coremap<'a> {}

impl<'a> Coremap<'a> {
    /// Queries RAM size, allocates one entry per frame, and marks frames
    /// already claimed by `ram.stealmem` before this call `Untracked`
    /// (they were handed out for early boot allocations that predate the
    /// coremap and are never candidates for allocation or eviction).
    pub fn init(ram: &'a Ram, swap: &'a SwapStore<'a>, stats: &'a Stats) -> Self {
        let num_frames = ram.getsize() / PAGE_SIZE;
        let already_claimed = ram.bytes_claimed() / PAGE_SIZE;
        let invalid_ref = num_frames;

        let mut entries = vec![CoremapEntry::untracked(invalid_ref); num_frames as usize];
        for entry in entries.iter_mut().skip(already_claimed as usize) {
            entry.state = FrameState::Freed;
        }

        Coremap {
            ram,
            swap,
            stats,
            num_frames,
            invalid_ref,
            entries: Mutex::new(entries),
            replacement: Mutex::new(Replacement { head: invalid_ref, tail: invalid_ref }),
            steal_lock: Mutex::new(()),
            active: AtomicBool::new(true),
        }
    }

    pub fn shutdown(&self) {
        self.active.store(false, Ordering::Release);
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn scan_free_run(entries: &[CoremapEntry], n: u32) -> Option<u32> {
        let mut run_start: Option<u32> = None;
        for (i, e) in entries.iter().enumerate() {
            let i = i as u32;
            if e.state == FrameState::Freed {
                if run_start.is_none() {
                    run_start = Some(i);
                }
                if i - run_start.unwrap() + 1 >= n {
                    return run_start;
                }
            } else {
                run_start = None;
            }
        }
        None
    }

    /// Allocates `n` contiguous frames for kernel use, returning the
    /// physical base address, or `None` if both the freed-frame scan and
    /// `ram_stealmem` fail.
    pub fn alloc_kpages(&self, n: u32) -> Option<u32> {
        assert!(!interrupts_masked(), "alloc_kpages requires a context where sleeping is safe");
        if !self.is_active() || n == 0 {
            return None;
        }

        let mut entries = self.entries.lock();
        if let Some(start) = Self::scan_free_run(&entries, n) {
            for i in start..start + n {
                entries[i as usize].state = FrameState::Kernel;
            }
            entries[start as usize].allocation_size = n;
            return Some(start * PAGE_SIZE);
        }
        drop(entries);

        let base = {
            let _guard = self.steal_lock.lock();
            self.ram.stealmem(n)
        };
        if base == 0 {
            return None;
        }

        let first = base / PAGE_SIZE;
        let mut entries = self.entries.lock();
        for i in first..first + n {
            entries[i as usize].state = FrameState::Kernel;
        }
        entries[first as usize].allocation_size = n;
        Some(base)
    }

    /// Frees a contiguous kernel block previously returned by `alloc_kpages`.
    pub fn free_kpages(&self, paddr: u32) {
        if !self.is_active() {
            return;
        }
        let first = paddr / PAGE_SIZE;
        let mut entries = self.entries.lock();
        let n = entries[first as usize].allocation_size;
        for i in first..first + n {
            entries[i as usize].state = FrameState::Freed;
            entries[i as usize].vaddr = 0;
            entries[i as usize].owner = None;
        }
        entries[first as usize].allocation_size = 0;
    }

    fn unlink(entries: &mut [CoremapEntry], invalid_ref: u32, index: u32, head: &mut u32, tail: &mut u32) {
        let prev = entries[index as usize].prev;
        let next = entries[index as usize].next;
        if prev == invalid_ref {
            *head = next;
        } else {
            entries[prev as usize].next = next;
        }
        if next == invalid_ref {
            *tail = prev;
        } else {
            entries[next as usize].prev = prev;
        }
        entries[index as usize].prev = invalid_ref;
        entries[index as usize].next = invalid_ref;
    }

    fn append(entries: &mut [CoremapEntry], invalid_ref: u32, index: u32, head: &mut u32, tail: &mut u32) {
        entries[index as usize].prev = *tail;
        entries[index as usize].next = invalid_ref;
        if *tail != invalid_ref {
            entries[*tail as usize].next = index;
        } else {
            *head = index;
        }
        *tail = index;
    }

    /// Allocates exactly one user page for `vaddr`, owned by `owner`.
    /// Evicts the FIFO head if neither a freed frame nor fresh RAM is
    /// available. Returns the physical address of the frame.
    pub fn alloc_user_page(&self, vaddr: u32, owner: *mut AddressSpace) -> u32 {
        assert!(!interrupts_masked(), "alloc_user_page requires a context where sleeping is safe");
        assert!(vaddr & (PAGE_SIZE - 1) == 0, "alloc_user_page requires a page-aligned vaddr");

        // 1. freed-frame scan
        {
            let mut entries = self.entries.lock();
            if let Some(idx) = Self::scan_free_run(&entries, 1) {
                entries[idx as usize].state = FrameState::User;
                entries[idx as usize].allocation_size = 1;
                entries[idx as usize].vaddr = vaddr;
                entries[idx as usize].owner = Some(owner);
                drop(entries);

                // Re-attach to the FIFO tail: every USER frame must be
                // reachable from fifo_head (P3), including ones recycled
                // from the freed pool.
                let mut repl = self.replacement.lock();
                let (mut head, mut tail) = (repl.head, repl.tail);
                let mut entries = self.entries.lock();
                Self::append(&mut entries, self.invalid_ref, idx, &mut head, &mut tail);
                drop(entries);
                repl.head = head;
                repl.tail = tail;
                return idx * PAGE_SIZE;
            }
        }

        // 2. fresh RAM
        let stolen = {
            let _guard = self.steal_lock.lock();
            self.ram.stealmem(1)
        };
        if stolen != 0 {
            let idx = stolen / PAGE_SIZE;
            let mut entries = self.entries.lock();
            entries[idx as usize].state = FrameState::User;
            entries[idx as usize].allocation_size = 1;
            entries[idx as usize].vaddr = vaddr;
            entries[idx as usize].owner = Some(owner);
            drop(entries);

            let mut repl = self.replacement.lock();
            let (mut head, mut tail) = (repl.head, repl.tail);
            let mut entries = self.entries.lock();
            Self::append(&mut entries, self.invalid_ref, idx, &mut head, &mut tail);
            drop(entries);
            repl.head = head;
            repl.tail = tail;
            return stolen;
        }

        // 3. eviction
        self.evict_and_reassign(vaddr, owner)
    }

    fn evict_and_reassign(&self, vaddr: u32, owner: *mut AddressSpace) -> u32 {
        let (victim, tail) = {
            let repl = self.replacement.lock();
            (repl.head, repl.tail)
        };
        assert!(victim != self.invalid_ref, "eviction requested with an empty FIFO");

        let victim_paddr = victim * PAGE_SIZE;
        let (victim_vaddr, victim_owner) = {
            let entries = self.entries.lock();
            (entries[victim as usize].vaddr, entries[victim as usize].owner.expect("victim frame has no owner"))
        };

        // suspends on file I/O; must not hold any spinlock while this runs.
        let offset = self.swap.swap_out(victim_paddr, self.stats);

        // SAFETY: victim_owner was written under coremap_lock by whichever
        // call made this frame USER, and remains valid because segment
        // destruction always frees its frames (and thus clears `owner`)
        // before the owning AddressSpace can be dropped.
        unsafe {
            (*victim_owner).evict_page(victim_vaddr, offset);
        }

        // Reassign the frame in place, then move it from head to tail through
        // the same unlink/append helpers every other path uses, so a
        // singleton FIFO (head == tail == victim, evicting into itself) and
        // the general case both leave every prev/next pointer correct.
        let mut head = victim;
        let mut new_tail = tail;
        {
            let mut entries = self.entries.lock();
            entries[victim as usize].vaddr = vaddr;
            entries[victim as usize].owner = Some(owner);
            Self::unlink(&mut entries, self.invalid_ref, victim, &mut head, &mut new_tail);
            Self::append(&mut entries, self.invalid_ref, victim, &mut head, &mut new_tail);
        }

        let mut repl = self.replacement.lock();
        repl.head = head;
        repl.tail = new_tail;

        victim_paddr
    }

    /// Unlinks `paddr`'s frame from the FIFO and marks it freed.
    pub fn free_user_page(&self, paddr: u32) {
        if !self.is_active() {
            return;
        }
        let idx = paddr / PAGE_SIZE;

        let mut repl = self.replacement.lock();
        let (mut head, mut tail) = (repl.head, repl.tail);
        let mut entries = self.entries.lock();
        Self::unlink(&mut entries, self.invalid_ref, idx, &mut head, &mut tail);
        entries[idx as usize].state = FrameState::Freed;
        entries[idx as usize].vaddr = 0;
        entries[idx as usize].owner = None;
        entries[idx as usize].allocation_size = 0;
        drop(entries);
        repl.head = head;
        repl.tail = tail;
    }

    /// Walks the FIFO from `fifo_head`, returning the number of USER frames
    /// visited. Exposed for the P3 well-formedness property test.
    pub fn fifo_len(&self) -> usize {
        let repl = self.replacement.lock();
        let entries = self.entries.lock();
        let mut count = 0;
        let mut cur = repl.head;
        while cur != self.invalid_ref {
            count += 1;
            cur = entries[cur as usize].next;
            assert!(count as u32 <= self.num_frames, "FIFO cycle detected");
        }
        count
    }

    pub fn fifo_tail(&self) -> u32 {
        self.replacement.lock().tail
    }

    pub fn is_user(&self, paddr: u32) -> bool {
        self.entries.lock()[(paddr / PAGE_SIZE) as usize].state == FrameState::User
    }

    pub fn is_freed(&self, paddr: u32) -> bool {
        self.entries.lock()[(paddr / PAGE_SIZE) as usize].state == FrameState::Freed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swapfile::SwapStore;
    use core::cell::RefCell;
    use platform::vnode::{BackingFile, Vnode, VnodeError};

    struct MemFile(RefCell<alloc::vec::Vec<u8>>);
    impl MemFile {
        fn new(size: usize) -> Self {
            MemFile(RefCell::new(vec![0u8; size]))
        }
    }
    impl Vnode for MemFile {
        fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, VnodeError> {
            let data = self.0.borrow();
            let start = offset as usize;
            buf.copy_from_slice(&data[start..start + buf.len()]);
            Ok(buf.len())
        }
    }
    impl BackingFile for MemFile {
        fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize, VnodeError> {
            let mut data = self.0.borrow_mut();
            let start = offset as usize;
            data[start..start + buf.len()].copy_from_slice(buf);
            Ok(buf.len())
        }
    }

    fn one_frame_coremap<'a>(ram: &'a Ram, swap: &'a SwapStore<'a>, stats: &'a Stats) -> Coremap<'a> {
        Coremap::init(ram, swap, stats)
    }

    #[test]
    fn alloc_kpages_prefers_a_freed_run_over_stealing() {
        let ram = Ram::bootstrap(8 * PAGE_SIZE);
        let file = MemFile::new(crate::swapfile::SWAP_SIZE as usize);
        let swap = SwapStore::init(&file, &ram);
        let stats = Stats::new();
        stats.init();
        let coremap = one_frame_coremap(&ram, &swap, &stats);

        let a = coremap.alloc_kpages(2).unwrap();
        coremap.free_kpages(a);
        let b = coremap.alloc_kpages(2).unwrap();
        assert_eq!(a, b, "the freed run should be reused before stealing fresh RAM");
    }

    #[test]
    fn alloc_user_page_links_every_frame_into_the_fifo() {
        let ram = Ram::bootstrap(4 * PAGE_SIZE);
        let file = MemFile::new(crate::swapfile::SWAP_SIZE as usize);
        let swap = SwapStore::init(&file, &ram);
        let stats = Stats::new();
        stats.init();
        let coremap = one_frame_coremap(&ram, &swap, &stats);

        for i in 0..4 {
            coremap.alloc_user_page(i * PAGE_SIZE, core::ptr::null_mut());
        }
        assert_eq!(coremap.fifo_len(), 4);
    }

    #[test]
    fn free_user_page_removes_it_from_the_fifo() {
        let ram = Ram::bootstrap(4 * PAGE_SIZE);
        let file = MemFile::new(crate::swapfile::SWAP_SIZE as usize);
        let swap = SwapStore::init(&file, &ram);
        let stats = Stats::new();
        stats.init();
        let coremap = one_frame_coremap(&ram, &swap, &stats);

        let a = coremap.alloc_user_page(0, core::ptr::null_mut());
        let b = coremap.alloc_user_page(PAGE_SIZE, core::ptr::null_mut());
        coremap.free_user_page(a);
        assert_eq!(coremap.fifo_len(), 1);
        assert!(coremap.is_freed(a));
        assert!(coremap.is_user(b));
    }

    #[test]
    fn eviction_promotes_a_head_whose_prev_is_cleared_so_a_later_free_does_not_corrupt_the_list() {
        let ram = Ram::bootstrap(2 * PAGE_SIZE);
        let file = MemFile::new(crate::swapfile::SWAP_SIZE as usize);
        let swap = SwapStore::init(&file, &ram);
        let stats = Stats::new();
        stats.init();
        let coremap = one_frame_coremap(&ram, &swap, &stats);

        let mut space = crate::addrspace::AddressSpace::create();
        space.define_region(0, 0, 0x0040_0000, 1, PAGE_SIZE, true, false, true).unwrap();
        space.define_region(0, 0, 0x0050_0000, 1, PAGE_SIZE, true, true, false).unwrap();
        space.define_stack().unwrap();
        let owner: *mut crate::addrspace::AddressSpace = &mut space;

        let stack_base = crate::addrspace::USERSTACK - crate::addrspace::STACK_PAGES * PAGE_SIZE;
        let v0 = stack_base;
        let v1 = stack_base + PAGE_SIZE;
        let v2 = stack_base + 2 * PAGE_SIZE;

        let p0 = coremap.alloc_user_page(v0, owner);
        space.segment_for_mut(v0).unwrap().add_pt_entry(v0, p0);
        let p1 = coremap.alloc_user_page(v1, owner);
        space.segment_for_mut(v1).unwrap().add_pt_entry(v1, p1);

        // two frames resident; this third allocation must evict the FIFO head (p0).
        let p2 = coremap.alloc_user_page(v2, owner);
        space.segment_for_mut(v2).unwrap().add_pt_entry(v2, p2);
        assert_eq!(p2, p0, "the evicted frame is recycled for the new page");
        assert_eq!(coremap.fifo_len(), 2);

        // p1 was promoted to fifo_head by the eviction above. Freeing it must
        // not corrupt the list: a stale prev on the promoted head used to
        // make unlink() take the wrong branch here.
        coremap.free_user_page(p1);
        assert_eq!(coremap.fifo_len(), 1, "only the evicted-and-reassigned frame should remain");
        assert!(coremap.is_user(p2), "the reassigned frame must still be tracked as USER");
        assert!(coremap.is_freed(p1));
    }

    #[test]
    fn self_eviction_of_a_singleton_fifo_reassigns_the_same_frame() {
        let ram = Ram::bootstrap(1 * PAGE_SIZE);
        let file = MemFile::new(crate::swapfile::SWAP_SIZE as usize);
        let swap = SwapStore::init(&file, &ram);
        let stats = Stats::new();
        stats.init();
        let coremap = one_frame_coremap(&ram, &swap, &stats);

        let mut space = crate::addrspace::AddressSpace::create();
        space.define_region(0, 0, 0x0040_0000, 1, PAGE_SIZE, true, false, true).unwrap();
        space.define_region(0, 0, 0x0050_0000, 1, PAGE_SIZE, true, true, false).unwrap();
        space.define_stack().unwrap();
        let owner: *mut crate::addrspace::AddressSpace = &mut space;

        let stack_base = crate::addrspace::USERSTACK - crate::addrspace::STACK_PAGES * PAGE_SIZE;
        let v0 = stack_base;
        let v1 = stack_base + PAGE_SIZE;

        let p0 = coremap.alloc_user_page(v0, owner);
        space.segment_for_mut(v0).unwrap().add_pt_entry(v0, p0);

        // exactly one USER frame exists; this allocation must evict it into itself.
        let p1 = coremap.alloc_user_page(v1, owner);
        space.segment_for_mut(v1).unwrap().add_pt_entry(v1, p1);

        assert_eq!(p0, p1, "the lone frame is recycled for the new page");
        assert_eq!(coremap.fifo_len(), 1);
        assert!(coremap.is_user(p1));
        assert!(matches!(
            space.segment_for(v0).unwrap().page_table().get_entry(v0),
            crate::pagetable::Entry::Swapped(_)
        ));
    }

    #[test]
    #[should_panic(expected = "requires a context where sleeping is safe")]
    fn alloc_kpages_asserts_interrupts_are_unmasked() {
        let ram = Ram::bootstrap(4 * PAGE_SIZE);
        let file = MemFile::new(crate::swapfile::SWAP_SIZE as usize);
        let swap = SwapStore::init(&file, &ram);
        let stats = Stats::new();
        stats.init();
        let coremap = one_frame_coremap(&ram, &swap, &stats);

        platform::irq::with_interrupts_masked(|| {
            coremap.alloc_kpages(1);
        });
    }
}
