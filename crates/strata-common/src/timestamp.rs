//! Logical timestamps
//!
//! A timestamp counts ticks: wall-clock milliseconds multiplied by a fixed
//! number of subdivisions, plus a counter that separates operations issued
//! within the same millisecond. Timestamps double as queue keys, so they are
//! kept integral to survive transport without rounding.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Default number of ticks per millisecond
pub const DEFAULT_SUBDIVISIONS: u64 = 1000;

/// Logical timestamp in ticks
#[derive(
    Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub const ZERO: Self = Self(0);

    /// Timestamp at the start of a wall-clock millisecond
    #[must_use]
    pub const fn from_millis(millis: u64, subdivisions: u64) -> Self {
        Self(millis.saturating_mul(subdivisions))
    }

    /// Current wall-clock time with no subdivision
    #[must_use]
    pub fn now(subdivisions: u64) -> Self {
        Self::from_millis(wall_millis(), subdivisions)
    }

    /// Wall-clock millisecond this timestamp falls in
    #[must_use]
    pub const fn millis(self, subdivisions: u64) -> u64 {
        if subdivisions == 0 {
            return self.0;
        }
        self.0 / subdivisions
    }

    /// Raw tick count
    #[must_use]
    pub const fn ticks(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Timestamp {
    fn from(ticks: u64) -> Self {
        Self(ticks)
    }
}

/// Milliseconds since the Unix epoch
#[must_use]
pub fn wall_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Issues strictly increasing timestamps
#[derive(Debug)]
pub struct TimestampGenerator {
    subdivisions: u64,
    last: AtomicU64,
}

impl TimestampGenerator {
    /// Create a generator with the given number of ticks per millisecond
    #[must_use]
    pub fn new(subdivisions: u64) -> Self {
        Self {
            subdivisions: subdivisions.max(1),
            last: AtomicU64::new(0),
        }
    }

    /// Ticks per millisecond
    #[must_use]
    pub const fn subdivisions(&self) -> u64 {
        self.subdivisions
    }

    /// Next timestamp, strictly greater than every one issued before
    pub fn next(&self) -> Timestamp {
        self.next_at(wall_millis())
    }

    /// Next timestamp for an explicit wall-clock reading
    pub fn next_at(&self, millis: u64) -> Timestamp {
        let base = millis.saturating_mul(self.subdivisions);
        let mut issued = base;

        // Within the same millisecond the counter keeps climbing; once it runs
        // past the cycle it borrows from the next millisecond rather than repeat.
        let _ = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                issued = if base > last { base } else { last + 1 };
                Some(issued)
            });

        Timestamp(issued)
    }

    /// Make sure future timestamps sort after `ts` (used after loading a snapshot)
    pub fn observe(&self, ts: Timestamp) {
        self.last.fetch_max(ts.0, Ordering::SeqCst);
    }

    /// Current wall-clock time expressed in this generator's ticks
    #[must_use]
    pub fn now(&self) -> Timestamp {
        Timestamp::now(self.subdivisions)
    }
}

impl Default for TimestampGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_SUBDIVISIONS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strictly_increasing_within_millisecond() {
        let clock = TimestampGenerator::new(1000);
        let a = clock.next_at(5);
        let b = clock.next_at(5);
        let c = clock.next_at(5);

        assert_eq!(a, Timestamp(5000));
        assert_eq!(b, Timestamp(5001));
        assert_eq!(c, Timestamp(5002));
        assert_eq!(c.millis(1000), 5);
    }

    #[test]
    fn test_new_millisecond_resets_counter() {
        let clock = TimestampGenerator::new(1000);
        clock.next_at(5);
        clock.next_at(5);
        assert_eq!(clock.next_at(6), Timestamp(6000));
    }

    #[test]
    fn test_counter_overflow_borrows_next_millisecond() {
        let clock = TimestampGenerator::new(2);
        assert_eq!(clock.next_at(1), Timestamp(2));
        assert_eq!(clock.next_at(1), Timestamp(3));
        assert_eq!(clock.next_at(1), Timestamp(4));
        // Wall clock catches up, but must not repeat the borrowed tick
        assert_eq!(clock.next_at(2), Timestamp(5));
    }

    #[test]
    fn test_clock_going_backwards_stays_monotonic() {
        let clock = TimestampGenerator::new(1000);
        let later = clock.next_at(10);
        let earlier = clock.next_at(3);
        assert!(earlier > later);
    }

    #[test]
    fn test_observe_restored_timestamp() {
        let clock = TimestampGenerator::new(1000);
        clock.observe(Timestamp(u64::MAX / 2));
        assert!(clock.next() > Timestamp(u64::MAX / 2));
    }

    #[test]
    fn test_real_clock_unique() {
        let clock = TimestampGenerator::default();
        let mut previous = clock.next();
        for _ in 0..10_000 {
            let ts = clock.next();
            assert!(ts > previous);
            previous = ts;
        }
    }
}
