#![cfg_attr(not(test), no_std)]
#![deny(missing_docs)]
//! Busy-waiting mutual exclusion.
//!
//! The scheduler core never protects its own queues with this lock; those are
//! guarded by disabling interrupts. [`SpinLock`] is for the few pieces of state
//! that live beside the scheduler and may be touched by more than one host
//! thread, such as the console and the interrupt handler table.

mod spinlock;

pub use spinlock::*;
