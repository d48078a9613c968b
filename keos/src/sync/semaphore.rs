//! Counting semaphore.
use crate::thread::{scheduler::scheduler, Tid};
use abyss::interrupt::{InterruptGuard, IntrCell};
use alloc::collections::VecDeque;

struct Inner {
    value: usize,
    /// Blocked threads, highest priority first.
    waiters: VecDeque<Tid>,
}

/// A counting semaphore: a nonnegative integer with two atomic operations.
///
/// - [`down`]: wait for the value to become positive, then decrement it.
/// - [`up`]: increment the value and wake one waiting thread, if any.
///
/// Waiters are woken in priority order.
///
/// [`down`]: Semaphore::down
/// [`up`]: Semaphore::up
pub struct Semaphore {
    inner: IntrCell<Inner>,
}

impl Semaphore {
    /// Create a semaphore with initial value `value`.
    pub const fn new(value: usize) -> Self {
        Self {
            inner: IntrCell::new(Inner {
                value,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Wait for the value to become positive and decrement it.
    ///
    /// May block, so it must not be called from an interrupt handler.
    pub fn down(&self) {
        let sched = scheduler();
        assert!(
            !sched.gate.in_interrupt(),
            "Semaphore::down inside an interrupt handler"
        );
        let _guard = InterruptGuard::new(&sched.gate);
        loop {
            let acquired = self.inner.with(&sched.gate, |inner| {
                if inner.value > 0 {
                    inner.value -= 1;
                    true
                } else {
                    sched.with_state(|s| s.enqueue_current(&mut inner.waiters));
                    false
                }
            });
            if acquired {
                return;
            }
            sched.block_current();
        }
    }

    /// Decrement the value if it is positive, without blocking.
    ///
    /// Returns true if the value was decremented.
    pub fn try_down(&self) -> bool {
        self.inner.with(&scheduler().gate, |inner| {
            if inner.value > 0 {
                inner.value -= 1;
                true
            } else {
                false
            }
        })
    }

    /// Increment the value and wake the highest priority waiter.
    ///
    /// Yields if the woken thread outranks the caller. Inside an interrupt
    /// handler the yield happens when the handler returns.
    pub fn up(&self) {
        let sched = scheduler();
        self.inner.with(&sched.gate, |inner| {
            sched.with_state(|s| {
                if let Some(tid) = s.dequeue_waiter(&mut inner.waiters) {
                    s.unblock(tid);
                }
            });
            inner.value += 1;
        });
        sched.preempt();
    }

    /// Current value.
    pub fn value(&self) -> usize {
        self.inner.with(&scheduler().gate, |inner| inner.value)
    }

    /// Number of blocked waiters.
    pub fn waiters(&self) -> usize {
        self.inner
            .with(&scheduler().gate, |inner| inner.waiters.len())
    }
}
