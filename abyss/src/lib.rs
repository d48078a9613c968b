//! The abyss of kernel that operates the machine.
//!
//! This crate contains the pieces a uniprocessor kernel needs from the CPU: an
//! interrupt enable flag, the primitive that transfers control from one thread
//! of execution to another, and a console. The machine is hosted: each kernel
//! thread is backed by a host thread and only one of them runs at any instant.
//! You can treat these codes as a some kind of "magic".

#![deny(missing_docs)]

extern crate alloc;

#[macro_use]
pub mod kprint;
pub mod interrupt;
pub mod switch;

pub use spin_lock;
