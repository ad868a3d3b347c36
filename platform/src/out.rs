//! Diagnostic output: `print!`/`println!` macros over a UART-like sink.
//!
//! Real hardware has a serial port to write bytes to; this host build backs
//! the same macro surface with an in-memory buffer so callers and tests see
//! exactly what would have gone out the wire.

use alloc::string::String;
use spin::Mutex;

static SINK: Mutex<String> = Mutex::new(String::new());

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::out::__print(format_args!($($arg)*)));
}

#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("\n{}", format_args!($($arg)*)));
}

#[doc(hidden)]
pub fn __print(args: core::fmt::Arguments) {
    use core::fmt::Write;
    SINK.lock().write_fmt(args).unwrap_or_else(|_| ());
}

/// Returns everything written through `print!`/`println!` so far. Test-only;
/// real boot output has nowhere to read back from.
#[cfg(test)]
pub fn drain() -> String {
    core::mem::take(&mut *SINK.lock())
}
