//! Lock with priority donation.
//!
//! A lock is a semaphore with an initial value of one and an owner. Only the
//! thread that acquired it may release it, and it cannot be acquired twice by
//! the same thread.
//!
//! ## Priority donation
//!
//! When a high priority thread waits on a lock held by a low priority thread,
//! a medium priority thread could keep the holder off the CPU forever. To
//! prevent this priority inversion, the waiter donates its priority to the
//! holder: the holder's effective priority becomes at least the waiter's until
//! it releases the lock. Donation is transitive. If the holder itself waits on
//! another lock, the donation continues to that lock's holder, up to
//! [`MAX_DONATION_DEPTH`] links.
//!
//! Donation is disabled under the feedback queue scheduler.
use super::Semaphore;
use crate::thread::{scheduler::scheduler, scheduler::State, Tid};
use abyss::interrupt::InterruptGuard;
use core::sync::atomic::{AtomicU64, Ordering};

/// Maximum length of a donation chain.
pub const MAX_DONATION_DEPTH: usize = 8;

static NEXT_LOCK_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a [`Lock`] in the holder table of the scheduler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct LockId(u64);

/// A mutual exclusion lock with priority donation.
pub struct Lock {
    id: LockId,
    sema: Semaphore,
}

impl Lock {
    /// Create a new lock in an unlocked state ready for use.
    pub fn new() -> Self {
        Self {
            id: LockId(NEXT_LOCK_ID.fetch_add(1, Ordering::Relaxed)),
            sema: Semaphore::new(1),
        }
    }

    /// Acquire the lock, sleeping until it becomes available.
    ///
    /// The caller must not hold the lock already, and must not be an interrupt
    /// handler.
    pub fn acquire(&self) {
        let sched = scheduler();
        assert!(
            !sched.gate.in_interrupt(),
            "Lock::acquire inside an interrupt handler"
        );
        let donation = !sched.config().mlfqs;
        let _guard = InterruptGuard::new(&sched.gate);
        sched.with_state(|s| {
            assert!(
                s.holders.get(&self.id) != Some(&s.current),
                "Lock::acquire of a lock the thread already holds"
            );
            if donation && s.holders.contains_key(&self.id) {
                s.donate(self.id);
            }
        });
        self.sema.down();
        sched.with_state(|s| s.take_lock(self.id, donation));
    }

    /// Try to acquire the lock without sleeping. Never donates.
    ///
    /// Returns true on success.
    pub fn try_acquire(&self) -> bool {
        let sched = scheduler();
        let donation = !sched.config().mlfqs;
        let _guard = InterruptGuard::new(&sched.gate);
        assert!(
            !self.held_by_current_thread(),
            "Lock::try_acquire of a lock the thread already holds"
        );
        if !self.sema.try_down() {
            return false;
        }
        sched.with_state(|s| s.take_lock(self.id, donation));
        true
    }

    /// Release the lock, which the running thread must hold.
    ///
    /// Gives back every priority donated through this lock and yields if that
    /// leaves a ready thread with a higher priority.
    pub fn release(&self) {
        let sched = scheduler();
        let donation = !sched.config().mlfqs;
        let _guard = InterruptGuard::new(&sched.gate);
        sched.with_state(|s| s.release_lock(self.id, donation));
        self.sema.up();
    }

    /// Returns true if the running thread holds this lock.
    pub fn held_by_current_thread(&self) -> bool {
        scheduler().with_state(|s| s.holders.get(&self.id) == Some(&s.current))
    }
}

impl Default for Lock {
    fn default() -> Self {
        Self::new()
    }
}

impl State {
    /// Record that the running thread waits on `lock` and push its priority
    /// down the chain of holders.
    fn donate(&mut self, lock: LockId) {
        let donor = self.current;
        let Some(&holder) = self.holders.get(&lock) else {
            return;
        };
        self.current_mut().waiting_on = Some(lock);
        let priority = self.registry.priority(donor);
        let donors = &self.registry.get(holder).donors;
        let pos = donors
            .iter()
            .position(|d| self.registry.priority(*d) < priority)
            .unwrap_or(donors.len());
        self.registry.get_mut(holder).donors.insert(pos, donor);

        let mut waiter = donor;
        for _ in 0..MAX_DONATION_DEPTH {
            let Some(lock) = self.registry.get(waiter).waiting_on else {
                break;
            };
            let Some(&holder) = self.holders.get(&lock) else {
                break;
            };
            let priority = self.registry.priority(waiter);
            if self.registry.priority(holder) < priority {
                log::trace!("thread {} donates {} to {}", waiter, priority, holder);
                self.set_effective(holder, priority);
            }
            waiter = holder;
        }
    }

    /// Make the running thread the holder of `lock`. Threads still waiting on
    /// the lock now donate to the new holder.
    fn take_lock(&mut self, lock: LockId, donation: bool) {
        let holder = self.current;
        self.current_mut().waiting_on = None;
        let prev = self.holders.insert(lock, holder);
        assert!(
            prev.is_none(),
            "lock acquired while held by thread {:?}",
            prev
        );
        if !donation {
            return;
        }
        let mut waiters: alloc::vec::Vec<Tid> = self
            .registry
            .threads()
            .filter(|th| th.waiting_on == Some(lock))
            .map(|th| th.tid)
            .collect();
        if waiters.is_empty() {
            return;
        }
        waiters.sort_by_key(|tid| core::cmp::Reverse(self.registry.priority(*tid)));
        self.current_mut().donors.extend(waiters);
        self.refresh_priority(holder);
    }

    fn release_lock(&mut self, lock: LockId, donation: bool) {
        let holder = self.current;
        assert_eq!(
            self.holders.get(&lock),
            Some(&holder),
            "Lock::release by thread {} that does not hold the lock",
            holder
        );
        self.holders.remove(&lock);
        if !donation {
            return;
        }
        let mut donors = core::mem::take(&mut self.registry.get_mut(holder).donors);
        donors.retain(|d| self.registry.get(*d).waiting_on != Some(lock));
        self.registry.get_mut(holder).donors = donors;
        self.refresh_priority(holder);
    }
}
