//! Time sources for the host scheduler.
//!
//! Sockets never read the clock themselves; the host samples a [`Clock`]
//! once per pass and threads that instant through every timer, so tests can
//! swap in a fixed clock and drive time by hand.

use std::time::{Duration, Instant};

/// Source of the current instant for a scheduler pass.
pub trait Clock: Send + Sync + 'static {
    /// Samples the current time.
    fn now(&self) -> Instant;
}

/// The default clock, backed by [`Instant::now`].
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A recurring deadline.
///
/// The host polls much faster than its housekeeping cadence; an `Interval`
/// fires at most once per period no matter how often it is polled, and
/// re-arms from the instant it fires.
#[derive(Debug)]
pub struct Interval {
    period: Duration,
    last_fired: Instant,
}

impl Interval {
    /// Creates an interval that first fires `period` after `now`.
    pub fn new(period: Duration, now: Instant) -> Self {
        Self { period, last_fired: now }
    }

    /// Returns true and re-arms if the period has elapsed since the last
    /// firing.
    pub fn poll(&mut self, now: Instant) -> bool {
        if now.duration_since(self.last_fired) >= self.period {
            self.last_fired = now;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_fires_once_per_period() {
        let start = Instant::now();
        let mut interval = Interval::new(Duration::from_secs(1), start);

        assert!(!interval.poll(start));
        assert!(!interval.poll(start + Duration::from_millis(999)));
        assert!(interval.poll(start + Duration::from_secs(1)));
        // Re-armed from the firing instant.
        assert!(!interval.poll(start + Duration::from_secs(1)));
        assert!(interval.poll(start + Duration::from_secs(2)));
    }

    #[test]
    fn test_interval_sparse_polling_fires_once() {
        let start = Instant::now();
        let mut interval = Interval::new(Duration::from_secs(1), start);

        // A long gap between polls still counts as a single elapsed period.
        assert!(interval.poll(start + Duration::from_secs(5)));
        assert!(!interval.poll(start + Duration::from_secs(5)));
    }

    #[test]
    fn test_system_clock_advances() {
        let clock = SystemClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
