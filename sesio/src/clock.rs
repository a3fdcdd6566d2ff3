//! Millisecond-resolution time utilities
//!
//! The backend expresses token lifetimes (`expiresIn`) and the persisted
//! `tokenExpiry` value in epoch milliseconds, so the whole session layer
//! works at that resolution. The [`Clock`] trait allows expiry logic to be
//! exercised in tests without touching the system clock.

use std::{ops, time::SystemTime};

use serde::{Deserialize, Serialize};

/// Unix time in milliseconds
///
/// The number of milliseconds elapsed since the beginning of the Unix epoch
/// on 1970/01/01 at 00:00:00 UTC.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Ord, PartialOrd, Serialize, Deserialize,
)]
#[serde(transparent)]
#[repr(transparent)]
pub struct UnixMillis(pub u64);

impl From<SystemTime> for UnixMillis {
    #[inline]
    fn from(t: SystemTime) -> Self {
        let time = t
            .duration_since(SystemTime::UNIX_EPOCH)
            .expect("times before Unix epoch are not expected")
            .as_millis() as u64;

        UnixMillis(time)
    }
}

/// A span of time in milliseconds
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Ord, PartialOrd, Serialize, Deserialize,
)]
#[serde(transparent)]
#[repr(transparent)]
pub struct DurationMillis(pub u64);

impl ops::Add<DurationMillis> for UnixMillis {
    type Output = UnixMillis;

    #[inline]
    fn add(self, rhs: DurationMillis) -> Self::Output {
        UnixMillis(self.0.saturating_add(rhs.0))
    }
}

impl ops::Sub<UnixMillis> for UnixMillis {
    type Output = DurationMillis;

    #[inline]
    fn sub(self, rhs: UnixMillis) -> Self::Output {
        DurationMillis(self.0.saturating_sub(rhs.0))
    }
}

impl From<DurationMillis> for std::time::Duration {
    #[inline]
    fn from(d: DurationMillis) -> Self {
        std::time::Duration::from_millis(d.0)
    }
}

/// Represents a clock, which can tell the current time
pub trait Clock {
    /// Gets the current time according to this clock
    fn now(&self) -> UnixMillis;
}

/// The system clock as provided by `std::time::SystemTime`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct System;

impl Clock for System {
    #[inline]
    fn now(&self) -> UnixMillis {
        UnixMillis::from(SystemTime::now())
    }
}

/// A test clock which maintains the current time as internal state
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TestClock(UnixMillis);

impl Clock for TestClock {
    #[inline]
    fn now(&self) -> UnixMillis {
        self.0
    }
}

impl TestClock {
    /// Creates a new test clock with the specified time
    #[inline]
    pub const fn new(time: UnixMillis) -> Self {
        Self(time)
    }

    /// Updates the clock's current time to `val`
    pub fn set(&mut self, val: UnixMillis) {
        self.0 = val;
    }

    /// Increments the clock's current time by `inc` milliseconds
    pub fn inc(&mut self, inc: u64) {
        (self.0).0 += inc;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instant_arithmetic_saturates() {
        let t = UnixMillis(1_000) + DurationMillis(500);
        assert_eq!(t, UnixMillis(1_500));
        assert_eq!(UnixMillis(1_000) - UnixMillis(1_500), DurationMillis(0));
        assert_eq!(UnixMillis(1_500) - UnixMillis(1_000), DurationMillis(500));
    }

    #[test]
    fn test_clock_advances() {
        let mut clock = TestClock::new(UnixMillis(10));
        assert_eq!(clock.now(), UnixMillis(10));
        clock.inc(5);
        assert_eq!(clock.now(), UnixMillis(15));
        clock.set(UnixMillis(0));
        assert_eq!(clock.now(), UnixMillis(0));
    }
}
