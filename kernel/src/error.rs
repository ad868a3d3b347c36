//! Recoverable error taxonomy for the virtual memory subsystem.
//!
//! Every fallible public operation returns one of these. Conditions the
//! design deliberately does not recover from (swap exhaustion, short I/O,
//! a broken internal invariant) are not represented here: they panic at
//! the call site instead, per the fatal-error policy.

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// An allocator returned null; caller unwinds any partially built state.
    OutOfMemory,
    /// A fault type outside {READONLY, READ, WRITE}, or similar malformed input.
    BadArgument,
    /// A write to a non-writable mapping.
    AccessViolation,
    /// A fault address outside any segment, or no current address space.
    BadAddress,
    /// A request the design does not support, e.g. a third ELF region.
    NotImplemented,
    /// A truncated read where the ELF image promised more bytes.
    ExecFormat,
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            VmError::OutOfMemory => "out of memory",
            VmError::BadArgument => "invalid argument",
            VmError::AccessViolation => "access violation",
            VmError::BadAddress => "bad address",
            VmError::NotImplemented => "not implemented",
            VmError::ExecFormat => "executable format error",
        };
        f.write_str(msg)
    }
}

pub type VmResult<T> = Result<T, VmError>;
