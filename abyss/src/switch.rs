//! Transfer of control between threads of execution.
//!
//! The machine has a single CPU. Every kernel thread is backed by its own host
//! thread, and the right to execute is a baton: exactly one context holds it
//! and every other context is parked on a condition variable until the baton
//! is handed to it. [`Machine::switch`] is the register save/restore of a real
//! kernel, and a parked host thread is a saved register file.
//!
//! When a kernel thread finishes, its host thread hands the baton on with
//! [`Machine::exit_to`] and terminates. Joining the host thread reclaims its
//! stack, so whoever owns the [`JoinHandle`] returned by [`Machine::spawn`]
//! must not join it from the exiting thread itself.
use alloc::string::String;
use alloc::sync::Arc;
use std::io;
use std::panic;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

/// Unwind payload used to tear down the contexts of a halted machine.
///
/// Unwinding with this payload does not invoke the panic hook, so the host
/// threads of a halted machine disappear silently.
pub struct Halted;

/// A saved thread of execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Context {
    token: u64,
}

impl Context {
    /// Identifier of this context within its machine.
    pub fn token(&self) -> u64 {
        self.token
    }
}

struct Baton {
    running: u64,
    next_token: u64,
    boot: Option<u64>,
    halted: Option<String>,
}

/// The CPU.
pub struct Machine {
    baton: Mutex<Baton>,
    cvar: Condvar,
}

impl Machine {
    /// Power on a machine. Nothing runs on it until a context is adopted.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            baton: Mutex::new(Baton {
                running: 0,
                next_token: 1,
                boot: None,
                halted: None,
            }),
            cvar: Condvar::new(),
        })
    }

    fn baton(&self) -> MutexGuard<'_, Baton> {
        self.baton.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Turn the calling host thread into the boot context of this machine.
    ///
    /// The boot context holds the baton on return. A machine has at most one
    /// boot context.
    pub fn adopt_current(&self) -> Context {
        let mut baton = self.baton();
        assert!(baton.boot.is_none(), "machine already booted");
        let token = baton.next_token;
        baton.next_token += 1;
        baton.boot = Some(token);
        baton.running = token;
        Context { token }
    }

    /// Create a new context that runs `f` once the baton is first handed to it.
    ///
    /// # Errors
    ///
    /// Fails when the host refuses to create another thread.
    pub fn spawn<F>(self: &Arc<Self>, name: &str, f: F) -> io::Result<(Context, JoinHandle<()>)>
    where
        F: FnOnce() + Send + 'static,
    {
        let token = {
            let mut baton = self.baton();
            let token = baton.next_token;
            baton.next_token += 1;
            token
        };
        let machine = self.clone();
        let handle = thread::Builder::new()
            .name(String::from(name))
            .spawn(move || {
                let baton = machine.baton();
                machine.wait(baton, token);
                drop(machine);
                f()
            })?;
        Ok((Context { token }, handle))
    }

    /// Hand the baton from `from` to `to` and park `from` until it gets the
    /// baton back.
    pub fn switch(&self, from: &Context, to: &Context) {
        let mut baton = self.baton();
        assert_eq!(
            baton.running, from.token,
            "switch from a context that is not running"
        );
        baton.running = to.token;
        self.cvar.notify_all();
        self.wait(baton, from.token);
    }

    /// Hand the baton to `to` without parking. The caller must not execute
    /// kernel code afterwards.
    pub fn exit_to(&self, to: &Context) {
        let mut baton = self.baton();
        baton.running = to.token;
        self.cvar.notify_all();
    }

    /// Returns the reason the machine halted, if it did.
    pub fn halted(&self) -> Option<String> {
        self.baton().halted.clone()
    }

    /// Stop the machine after a fatal error detected on `from`.
    ///
    /// Every parked context wakes up. The boot context panics with
    /// `kernel halted: <reason>`, the others unwind with [`Halted`].
    pub fn halt(&self, from: &Context, reason: String) -> ! {
        let mut baton = self.baton();
        if baton.halted.is_none() {
            baton.halted = Some(reason);
        }
        self.cvar.notify_all();
        self.wait(baton, from.token);
        unreachable!()
    }

    fn wait(&self, mut baton: MutexGuard<'_, Baton>, token: u64) {
        loop {
            if let Some(reason) = baton.halted.clone() {
                let boot = baton.boot == Some(token);
                drop(baton);
                if boot {
                    panic!("kernel halted: {reason}");
                }
                panic::resume_unwind(alloc::boxed::Box::new(Halted));
            }
            if baton.running == token {
                return;
            }
            baton = self
                .cvar
                .wait(baton)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn ping_pong() {
        let machine = Machine::new();
        let main = machine.adopt_current();
        let hits = Arc::new(AtomicUsize::new(0));
        let (m, h) = (machine.clone(), hits.clone());
        let (child, handle) = machine
            .spawn("child", move || {
                for _ in 0..3 {
                    h.fetch_add(1, Ordering::SeqCst);
                    m.switch(&Context { token: 2 }, &main);
                }
                h.fetch_add(1, Ordering::SeqCst);
                m.exit_to(&main);
            })
            .unwrap();
        assert_eq!(child.token(), 2);
        for round in 1..=4 {
            machine.switch(&main, &child);
            assert_eq!(hits.load(Ordering::SeqCst), round);
        }
        handle.join().unwrap();
    }

    #[test]
    #[should_panic(expected = "kernel halted: boom")]
    fn halt_reaches_boot_context() {
        let machine = Machine::new();
        let main = machine.adopt_current();
        let m = machine.clone();
        let (child, _handle) = machine
            .spawn("child", move || {
                m.halt(&Context { token: 2 }, String::from("boom"));
            })
            .unwrap();
        machine.switch(&main, &child);
    }
}
