//! Low-level platform primitives for a MIPS-like, software-TLB-managed machine.
//!
//! This crate houses the pieces the virtual memory subsystem treats as
//! external collaborators: the TLB read/write instructions, interrupt
//! priority levels, the RAM bootstrap allocator, a readable file node
//! abstraction standing in for the ELF/VFS layer, and a generic bitmap.
//! None of this is MIPS-specific in the sense of real assembly; it models
//! the interface the kernel crate is written against so the VM core can be
//! exercised on the host.

#![no_std]

extern crate alloc;

pub mod bitmap;
pub mod irq;
pub mod out;
pub mod ram;
pub mod tlb;
pub mod vnode;

pub use bitmap::Bitmap;
pub use tlb::{PAGE_FRAME, PAGE_SIZE};
