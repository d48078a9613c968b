//! Condition variable.
use super::{Lock, Semaphore};
use crate::thread::{self, scheduler::scheduler, Tid};
use abyss::interrupt::IntrCell;
use alloc::{collections::VecDeque, sync::Arc};

/// One waiting thread and the semaphore it sleeps on.
struct Waiter {
    tid: Tid,
    sema: Semaphore,
}

/// A condition variable.
///
/// Lets one piece of code signal a condition and cooperating code receive the
/// signal and act upon it. A condition variable is always used together with
/// a [`Lock`], and should be used with the same lock every time.
///
/// Signalling is "Mesa" style: sending and receiving a signal are not one
/// atomic operation, so a woken thread must recheck its condition after
/// [`wait`] returns. Waiters are woken highest priority first.
///
/// [`wait`]: Condvar::wait
pub struct Condvar {
    waiters: IntrCell<VecDeque<Arc<Waiter>>>,
}

impl Condvar {
    /// Create a new condition variable.
    pub const fn new() -> Self {
        Self {
            waiters: IntrCell::new(VecDeque::new()),
        }
    }

    /// Atomically release `lock` and wait for a signal, then reacquire `lock`
    /// before returning. The caller must hold `lock`.
    pub fn wait(&self, lock: &Lock) {
        let sched = scheduler();
        assert!(
            !sched.gate.in_interrupt(),
            "Condvar::wait inside an interrupt handler"
        );
        assert!(
            lock.held_by_current_thread(),
            "Condvar::wait without holding the lock"
        );
        let waiter = Arc::new(Waiter {
            tid: thread::current_tid(),
            sema: Semaphore::new(0),
        });
        self.waiters.with(&sched.gate, |waiters| {
            sched.with_state(|s| {
                let registry = &s.registry;
                registry.insert_ordered(waiters, waiter.clone(), |w| w.tid)
            })
        });
        lock.release();
        waiter.sema.down();
        lock.acquire();
    }

    /// Wake the highest priority waiter, if any. The caller must hold `lock`.
    pub fn signal(&self, lock: &Lock) {
        let sched = scheduler();
        assert!(
            !sched.gate.in_interrupt(),
            "Condvar::signal inside an interrupt handler"
        );
        assert!(
            lock.held_by_current_thread(),
            "Condvar::signal without holding the lock"
        );
        let waiter = self.waiters.with(&sched.gate, |waiters| {
            sched.with_state(|s| s.registry.sort(waiters, |w| w.tid));
            waiters.pop_front()
        });
        if let Some(waiter) = waiter {
            waiter.sema.up();
        }
    }

    /// Wake every waiter. The caller must hold `lock`.
    pub fn broadcast(&self, lock: &Lock) {
        let gate = &scheduler().gate;
        while !self.waiters.with(gate, |waiters| waiters.is_empty()) {
            self.signal(lock);
        }
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}
