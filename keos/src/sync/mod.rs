//! Synchronization primitives.
//!
//! Everything here blocks by handing the CPU to another thread, so none of
//! it may be used from an interrupt handler, except [`Semaphore::up`] and
//! [`Semaphore::try_down`]. [`SpinLock`] never blocks and is only suitable for
//! data shared outside the scheduler.
mod condvar;
mod lock;
mod semaphore;

pub use condvar::Condvar;
pub(crate) use lock::LockId;
pub use lock::{Lock, MAX_DONATION_DEPTH};
pub use semaphore::Semaphore;
pub use spin_lock::{SpinLock, SpinLockGuard, TryLockError};
