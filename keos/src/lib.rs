//! KAIST educational Operating System, scheduling core.
//!
//! This crate is the part of the kernel that decides which thread runs on
//! the CPU: thread control blocks, a priority scheduler with priority
//! donation or an optional multi-level feedback queue, timer-driven sleep, and
//! the synchronization primitives built on top of them.
//!
//! Call [`boot`] once on a host thread to turn it into the initial kernel
//! thread. Every kernel started this way is independent of the others.

#![deny(missing_docs)]

extern crate alloc;

mod config;
mod error;
pub mod interrupt;
pub mod sync;
pub mod thread;
pub mod timer;

pub use config::Config;
pub use error::KernelError;
pub use thread::scheduler::{scheduler, Scheduler, Stats};

use alloc::boxed::Box;
use log::info;

/// Boot a kernel on the calling host thread.
///
/// The caller becomes the initial thread, `main`, running at
/// [`PRI_DEFAULT`] with interrupts on. The idle thread and the timer handler
/// are in place when this returns.
///
/// [`PRI_DEFAULT`]: thread::PRI_DEFAULT
pub fn boot(config: Config) -> Result<&'static Scheduler, KernelError> {
    abyss::kprint::init(config.log_level);
    info!("boot KeOS...");
    let machine = abyss::switch::Machine::new();
    let context = machine.adopt_current();
    let sched: &'static Scheduler = Box::leak(Box::new(Scheduler::new(config, machine, context)));
    thread::scheduler::bind(sched);
    sched.start_idle()?;
    interrupt::register(interrupt::TIMER_VECTOR, move || sched.tick());
    sched.gate.enable();
    let mlfqs = sched.config().mlfqs;
    info!("scheduler: {}", if mlfqs { "mlfqs" } else { "priority" });
    Ok(sched)
}
