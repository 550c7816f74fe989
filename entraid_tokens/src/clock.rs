//! Millisecond wall-clock time
//!
//! Token lifetimes issued by the identity platform are often short enough that
//! refresh decisions need sub-second resolution, so everything here is tracked
//! in milliseconds since the Unix epoch.

use std::{
    ops,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime},
};

/// Unix time in milliseconds
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct UnixMillis(pub u64);

impl UnixMillis {
    /// Constructs a time from whole seconds since the Unix epoch
    #[inline]
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs.saturating_mul(1000))
    }

    /// The duration from `earlier` until `self`, or zero if `earlier` is later
    #[inline]
    pub fn saturating_duration_since(self, earlier: UnixMillis) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }
}

impl From<SystemTime> for UnixMillis {
    #[inline]
    fn from(t: SystemTime) -> Self {
        let millis = t
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();

        UnixMillis(millis)
    }
}

impl ops::Add<Duration> for UnixMillis {
    type Output = UnixMillis;

    #[inline]
    fn add(self, rhs: Duration) -> Self::Output {
        UnixMillis(self.0.saturating_add(rhs.as_millis() as u64))
    }
}

impl ops::Sub<Duration> for UnixMillis {
    type Output = UnixMillis;

    #[inline]
    fn sub(self, rhs: Duration) -> Self::Output {
        UnixMillis(self.0.saturating_sub(rhs.as_millis() as u64))
    }
}

/// Represents a clock, which can tell the current time
pub trait Clock: Send + Sync {
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

/// A test clock which maintains the current time as shared internal state
///
/// Clones share the same underlying time, so a clock handed to a background
/// task can be advanced from a test.
#[derive(Clone, Debug, Default)]
pub struct TestClock(Arc<AtomicU64>);

impl Clock for TestClock {
    #[inline]
    fn now(&self) -> UnixMillis {
        UnixMillis(self.0.load(Ordering::SeqCst))
    }
}

impl TestClock {
    /// Creates a new test clock with the specified time
    pub fn new(time: UnixMillis) -> Self {
        Self(Arc::new(AtomicU64::new(time.0)))
    }

    /// Updates the clock's current time to `val`
    pub fn set(&self, val: UnixMillis) {
        self.0.store(val.0, Ordering::SeqCst);
    }

    /// Advances the clock's current time by `inc`
    pub fn advance(&self, inc: Duration) {
        self.0.fetch_add(inc.as_millis() as u64, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_clones_share_time() {
        let clock = TestClock::new(UnixMillis(1_000));
        let other = clock.clone();
        clock.advance(Duration::from_millis(250));
        assert_eq!(other.now(), UnixMillis(1_250));
        other.set(UnixMillis(5));
        assert_eq!(clock.now(), UnixMillis(5));
    }

    #[test]
    fn duration_since_saturates() {
        let early = UnixMillis(100);
        let late = UnixMillis(350);
        assert_eq!(late.saturating_duration_since(early), Duration::from_millis(250));
        assert_eq!(early.saturating_duration_since(late), Duration::ZERO);
    }
}
