//! Process-wide statistics: ten named event counters plus the identity
//! checks that should hold over them at shutdown.
//!
//! Grounded on the original `vmstats` module: a flat counter array behind a
//! single short-held lock, an `active` flag so increments before `init` (or
//! after `shutdown`) are silently dropped rather than panicking.

use spin::Mutex;

pub const TLB_MISS: usize = 0;
pub const TLB_MISS_FREE: usize = 1;
pub const TLB_MISS_REPLACE: usize = 2;
pub const TLB_INVALIDATION: usize = 3;
pub const TLB_RELOAD: usize = 4;
pub const PAGE_FAULT_ZERO: usize = 5;
pub const PAGE_FAULT_DISK: usize = 6;
pub const PAGE_FAULT_ELF: usize = 7;
pub const PAGE_FAULT_SWAPFILE: usize = 8;
pub const SWAPFILE_WRITE: usize = 9;

pub const NUM_STATS: usize = 10;

const NAMES: [&str; NUM_STATS] = [
    "TLB faults",
    "TLB faults with free",
    "TLB faults with replace",
    "TLB invalidations",
    "TLB reloads",
    "Page faults (zeroed)",
    "Page faults (disk)",
    "Page faults from ELF",
    "Page faults from swapfile",
    "Swapfile writes",
];

struct StatsState {
    counts: [u64; NUM_STATS],
    active: bool,
}

pub struct Stats {
    inner: Mutex<StatsState>,
}

impl Stats {
    pub const fn new() -> Self {
        Stats {
            inner: Mutex::new(StatsState { counts: [0; NUM_STATS], active: false }),
        }
    }

    /// Zeroes all counters and marks statistics active. Called once at boot.
    pub fn init(&self) {
        let mut state = self.inner.lock();
        state.counts = [0; NUM_STATS];
        state.active = true;
    }

    /// Increments counter `index`, a no-op if statistics are not active.
    pub fn increment(&self, index: usize) {
        debug_assert!(index < NUM_STATS);
        let mut state = self.inner.lock();
        if state.active {
            state.counts[index] += 1;
        }
    }

    pub fn get(&self, index: usize) -> u64 {
        self.inner.lock().counts[index]
    }

    /// Prints each counter and a line for every broken identity.
    /// Returns the number of identities that failed, for tests.
    pub fn show(&self) -> usize {
        let state = self.inner.lock();
        let counts = state.counts;
        drop(state);

        for (i, name) in NAMES.iter().enumerate() {
            platform::println!("{}: {}", name, counts[i]);
        }

        let mut violations = 0;
        if counts[TLB_MISS] != counts[TLB_MISS_FREE] + counts[TLB_MISS_REPLACE] {
            platform::println!(
                "vmstats: TLB_MISS ({}) != TLB_MISS_FREE ({}) + TLB_MISS_REPLACE ({})",
                counts[TLB_MISS], counts[TLB_MISS_FREE], counts[TLB_MISS_REPLACE]
            );
            violations += 1;
        }
        if counts[TLB_MISS] != counts[TLB_RELOAD] + counts[PAGE_FAULT_ZERO] + counts[PAGE_FAULT_DISK] {
            platform::println!(
                "vmstats: TLB_MISS ({}) != TLB_RELOAD ({}) + PAGE_FAULT_ZERO ({}) + PAGE_FAULT_DISK ({})",
                counts[TLB_MISS], counts[TLB_RELOAD], counts[PAGE_FAULT_ZERO], counts[PAGE_FAULT_DISK]
            );
            violations += 1;
        }
        if counts[PAGE_FAULT_DISK] != counts[PAGE_FAULT_ELF] + counts[PAGE_FAULT_SWAPFILE] {
            platform::println!(
                "vmstats: PAGE_FAULT_DISK ({}) != PAGE_FAULT_ELF ({}) + PAGE_FAULT_SWAPFILE ({})",
                counts[PAGE_FAULT_DISK], counts[PAGE_FAULT_ELF], counts[PAGE_FAULT_SWAPFILE]
            );
            violations += 1;
        }
        violations
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}
