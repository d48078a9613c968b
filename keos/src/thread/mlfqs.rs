//! Multi-level feedback queue scheduling.
//!
//! Priorities are not set by threads but derived from how much CPU time each
//! thread received recently and how nice it is to others:
//!
//! ```text
//! priority   = PRI_MAX - recent_cpu / 4 - 2 * nice
//! recent_cpu = (2 * load_avg) / (2 * load_avg + 1) * recent_cpu + nice
//! load_avg   = 59/60 * load_avg + 1/60 * ready_threads
//! ```
//!
//! `recent_cpu` grows by one every tick for the running thread, decays once a
//! second together with the update of `load_avg`, and priorities are
//! recomputed every fourth tick. All of it runs in 17.14 fixed point.
use super::{PRI_MAX, PRI_MIN};
use core::ops::{Add, Div, Mul, Sub};

/// Lowest niceness.
pub const NICE_MIN: i32 = -20;
/// Default niceness.
pub const NICE_DEFAULT: i32 = 0;
/// Highest niceness.
pub const NICE_MAX: i32 = 20;

/// Priorities are recomputed every this many ticks.
pub(crate) const PRIORITY_INTERVAL: i64 = 4;

const SHIFT: u32 = 14;
const ONE: i64 = 1 << SHIFT;

/// A 17.14 fixed-point number.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Fixed(i64);

impl Fixed {
    /// Zero.
    pub const ZERO: Self = Self(0);

    /// Convert an integer.
    pub const fn from_int(n: i64) -> Self {
        Self(n * ONE)
    }

    /// Convert to an integer, rounding toward zero.
    pub const fn trunc(self) -> i64 {
        self.0 / ONE
    }

    /// Convert to an integer, rounding to nearest.
    pub const fn round(self) -> i64 {
        if self.0 >= 0 {
            (self.0 + ONE / 2) / ONE
        } else {
            (self.0 - ONE / 2) / ONE
        }
    }
}

impl Add for Fixed {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self(self.0 + rhs.0)
    }
}

impl Sub for Fixed {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self(self.0 - rhs.0)
    }
}

impl Mul for Fixed {
    type Output = Self;
    fn mul(self, rhs: Self) -> Self {
        Self(self.0 * rhs.0 / ONE)
    }
}

impl Div for Fixed {
    type Output = Self;
    fn div(self, rhs: Self) -> Self {
        Self(self.0 * ONE / rhs.0)
    }
}

impl Mul<i64> for Fixed {
    type Output = Self;
    fn mul(self, rhs: i64) -> Self {
        Self(self.0 * rhs)
    }
}

impl Div<i64> for Fixed {
    type Output = Self;
    fn div(self, rhs: i64) -> Self {
        Self(self.0 / rhs)
    }
}

/// Priority of a thread with the given history and niceness.
pub(crate) fn priority(recent_cpu: Fixed, nice: i32) -> i32 {
    let p = (Fixed::from_int(PRI_MAX as i64) - recent_cpu / 4 - Fixed::from_int(2 * nice as i64))
        .trunc();
    p.clamp(PRI_MIN as i64, PRI_MAX as i64) as i32
}

/// Decay `recent_cpu` by the current load.
pub(crate) fn decay(recent_cpu: Fixed, load_avg: Fixed, nice: i32) -> Fixed {
    let twice = load_avg * 2;
    twice / (twice + Fixed::from_int(1)) * recent_cpu + Fixed::from_int(nice as i64)
}

/// Fold the number of threads that want the CPU into the load average.
pub(crate) fn load_avg(load_avg: Fixed, ready_threads: usize) -> Fixed {
    (load_avg * 59 + Fixed::from_int(ready_threads as i64)) / 60
}
