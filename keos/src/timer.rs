//! The periodic timer.
//!
//! The timer interrupts the CPU [`Config::timer_freq`] times a second. Each
//! interrupt advances the tick counter, charges the running thread's time
//! slice, and wakes the sleepers that are due.
//!
//! On the hosted machine there is no timer chip: a tick is delivered whenever
//! the idle thread halts, or when running code calls [`interrupt`].
//!
//! [`Config::timer_freq`]: crate::Config::timer_freq
use crate::thread::{self, scheduler::scheduler};
use abyss::interrupt::InterruptState;
use crossbeam_utils::Backoff;

/// Number of timer ticks since boot.
pub fn ticks() -> i64 {
    scheduler().ticks()
}

/// Number of timer ticks elapsed since `then`, a value once returned by
/// [`ticks`].
pub fn elapsed(then: i64) -> i64 {
    ticks() - then
}

/// Deliver one timer interrupt to the running thread.
pub fn interrupt() {
    crate::interrupt::raise(crate::interrupt::TIMER_VECTOR);
}

/// Sleep for approximately `ticks` timer ticks. Interrupts must be on.
pub fn sleep(ticks: i64) {
    if ticks <= 0 {
        return;
    }
    let start = self::ticks();
    assert_eq!(
        scheduler().gate.current(),
        InterruptState::On,
        "timer::sleep with interrupts off"
    );
    thread::sleep_until(start + ticks);
}

/// Sleep for approximately `ms` milliseconds.
pub fn msleep(ms: i64) {
    real_time_sleep(ms, 1000);
}

/// Sleep for approximately `us` microseconds.
pub fn usleep(us: i64) {
    real_time_sleep(us, 1000 * 1000);
}

/// Sleep for approximately `ns` nanoseconds.
pub fn nsleep(ns: i64) {
    real_time_sleep(ns, 1000 * 1000 * 1000);
}

/// Sleep for `num / denom` seconds.
fn real_time_sleep(num: i64, denom: i64) {
    let freq = scheduler().config().timer_freq as i64;
    // num / denom s * freq ticks/s, rounded down.
    let ticks = num * freq / denom;
    if ticks > 0 {
        sleep(ticks);
    } else {
        // Less than a tick: busy-wait for a bounded number of spins.
        let backoff = Backoff::new();
        let rounds = (num * 1000 / denom).clamp(0, 64);
        for _ in 0..rounds {
            backoff.spin();
        }
    }
}
