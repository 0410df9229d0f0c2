//! Monotonic + wall clock source, injectable for tests.
//!
//! Per the design notes, the scheduler never reaches for `Utc::now()`
//! directly — every time-dependent computation takes a `Clock` so tests
//! can drive it deterministically instead of racing the wall clock.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;

/// Source of wall-clock and monotonic time.
pub trait Clock: Send + Sync {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;

    /// Current monotonic instant, used for measuring durations.
    fn monotonic_now(&self) -> Instant;
}

/// Real clock backed by the system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic_now(&self) -> Instant {
        Instant::now()
    }
}

/// Deterministic clock for tests: starts at a fixed instant and only moves
/// forward when explicitly advanced.
pub struct TestClock {
    wall_millis: AtomicI64,
    start: Instant,
}

impl TestClock {
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            wall_millis: AtomicI64::new(start.timestamp_millis()),
            start: Instant::now(),
        }
    }

    /// Move the clock forward by `millis` and return the new wall time.
    pub fn advance(&self, millis: i64) -> DateTime<Utc> {
        let new = self.wall_millis.fetch_add(millis, Ordering::SeqCst) + millis;
        DateTime::from_timestamp_millis(new).unwrap_or_default()
    }
}

impl Clock for TestClock {
    fn now(&self) -> DateTime<Utc> {
        let millis = self.wall_millis.load(Ordering::SeqCst);
        DateTime::from_timestamp_millis(millis).unwrap_or_default()
    }

    fn monotonic_now(&self) -> Instant {
        self.start
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_only_moves_on_advance() {
        let clock = TestClock::new(DateTime::from_timestamp(1_700_000_000, 0).unwrap());
        let t0 = clock.now();
        assert_eq!(clock.now(), t0);
        let t1 = clock.advance(1_000);
        assert_eq!(t1, t0 + chrono::Duration::seconds(1));
        assert_eq!(clock.now(), t1);
    }
}
