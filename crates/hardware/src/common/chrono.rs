//! Virtual time for the simulation clock.
//!
//! Every component declares its own period; the global clock advances in
//! picoseconds and each component is operated when its period has elapsed.
//! This module provides the duration, instant, and clock types that carry
//! those contracts:
//! 1. **`Picos`:** A picosecond duration with the arithmetic the schedulers
//!    need (scaling, ratio, ceiling division).
//! 2. **`TimePoint`:** An instant on the virtual clock. `TimePoint::MAX`
//!    serves as the "never" / "in scheduler" sentinel.
//! 3. **`Clock`:** The global tick source owned by the simulator.

use std::ops::{Add, AddAssign, Div, Mul, Sub};

/// A span of virtual time, measured in picoseconds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Picos(pub u64);

impl Picos {
    /// Zero-length duration.
    pub const ZERO: Self = Self(0);

    /// Duration of one nanosecond.
    pub const fn from_nanos(ns: u64) -> Self {
        Self(ns * 1_000)
    }

    /// Duration of one microsecond.
    pub const fn from_micros(us: u64) -> Self {
        Self(us * 1_000_000)
    }

    /// The raw picosecond count.
    pub const fn as_picos(self) -> u64 {
        self.0
    }

    /// Scales the duration by `n / d`, rounding the result up.
    ///
    /// Used to derive the data-bus return time from the block size and
    /// channel width.
    pub const fn scale_ceil(self, n: u64, d: u64) -> Self {
        Self((self.0 * n).div_ceil(d))
    }
}

impl Add for Picos {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self(self.0 + rhs.0)
    }
}

impl Sub for Picos {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self(self.0 - rhs.0)
    }
}

impl Mul<u64> for Picos {
    type Output = Self;
    fn mul(self, rhs: u64) -> Self {
        Self(self.0 * rhs)
    }
}

impl Div<u64> for Picos {
    type Output = Self;
    fn div(self, rhs: u64) -> Self {
        Self(self.0 / rhs)
    }
}

impl Div for Picos {
    type Output = u64;
    /// Ratio of two durations, e.g. congested picoseconds per clock period.
    fn div(self, rhs: Self) -> u64 {
        self.0 / rhs.0
    }
}

/// An instant on the virtual clock.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimePoint(pub u64);

impl TimePoint {
    /// The beginning of simulated time.
    pub const ZERO: Self = Self(0);

    /// A time greater than all reachable times.
    ///
    /// Bank requests parked in the scheduler and MSHR entries awaiting a
    /// response use this as their ready time.
    pub const MAX: Self = Self(u64::MAX);

    /// Duration elapsed since an earlier instant.
    ///
    /// Saturates at zero if `earlier` is in the future.
    pub fn since(self, earlier: Self) -> Picos {
        Picos(self.0.saturating_sub(earlier.0))
    }
}

impl Add<Picos> for TimePoint {
    type Output = Self;
    fn add(self, rhs: Picos) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign<Picos> for TimePoint {
    fn add_assign(&mut self, rhs: Picos) {
        *self = *self + rhs;
    }
}

impl Sub<Picos> for TimePoint {
    type Output = Self;
    fn sub(self, rhs: Picos) -> Self {
        Self(self.0 - rhs.0)
    }
}

/// The global virtual clock.
///
/// Owned by the simulator; components never tick it themselves.
#[derive(Clone, Copy, Debug, Default)]
pub struct Clock {
    now: TimePoint,
}

impl Clock {
    /// Current virtual time.
    pub const fn now(self) -> TimePoint {
        self.now
    }

    /// Advances the clock by the given amount.
    pub fn tick(&mut self, amount: Picos) {
        self.now += amount;
    }

    /// Advances the clock to the given instant.
    ///
    /// The clock never moves backward; an earlier target is ignored.
    pub fn advance_to(&mut self, target: TimePoint) {
        if target > self.now {
            self.now = target;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_ticks_forward() {
        let mut clock = Clock::default();
        clock.tick(Picos(250));
        clock.tick(Picos(250));
        assert_eq!(clock.now(), TimePoint(500));
    }

    #[test]
    fn advance_never_rewinds() {
        let mut clock = Clock::default();
        clock.advance_to(TimePoint(1000));
        clock.advance_to(TimePoint(400));
        assert_eq!(clock.now(), TimePoint(1000));
    }

    #[test]
    fn scale_ceil_rounds_up() {
        // 64-byte block over an 8-byte bus: exactly 8 periods
        assert_eq!(Picos(1250).scale_ceil(64, 8), Picos(10_000));
        // Non-divisible ratio rounds up
        assert_eq!(Picos(1000).scale_ceil(3, 7), Picos(429));
    }

    #[test]
    fn saturating_add_stays_at_max() {
        assert_eq!(TimePoint::MAX + Picos(100), TimePoint::MAX);
    }
}
