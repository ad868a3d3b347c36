//! Interrupt priority primitives.
//!
//! Stands in for the architecture's `splhigh`/`splx` pair: raising priority
//! masks interrupts on the current CPU, `restore` puts the previous level
//! back. The real machine does this with a single privileged register;
//! here an atomic depth counter is enough to let callers nest correctly and
//! to let tests assert a masked section was actually entered.

use core::sync::atomic::{AtomicUsize, Ordering};

static MASK_DEPTH: AtomicUsize = AtomicUsize::new(0);

/// Opaque previous priority level, returned by `splhigh` and consumed by `splx`.
#[derive(Debug, Clone, Copy)]
pub struct PriorityLevel(usize);

/// Raise to the highest interrupt priority, masking all interrupts.
pub fn splhigh() -> PriorityLevel {
    let prev = MASK_DEPTH.fetch_add(1, Ordering::AcqRel);
    PriorityLevel(prev)
}

/// Restore the priority level returned by a previous `splhigh`.
pub fn splx(_level: PriorityLevel) {
    MASK_DEPTH.fetch_sub(1, Ordering::AcqRel);
}

/// True if interrupts are currently masked on this CPU.
pub fn interrupts_masked() -> bool {
    MASK_DEPTH.load(Ordering::Acquire) > 0
}

/// Runs `f` with interrupts masked, restoring the previous level on every exit path.
pub fn with_interrupts_masked<R>(f: impl FnOnce() -> R) -> R {
    let level = splhigh();
    let result = f();
    splx(level);
    result
}
