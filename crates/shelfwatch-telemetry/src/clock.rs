//! Wall-clock sources

use chrono::{DateTime, Duration, Utc};
use std::fmt;
use std::sync::Mutex;

/// Milliseconds in one metric bucket
pub const HOUR_MS: i64 = 3_600_000;

/// Source of wall-clock time for hour keys, trace timing and retention
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;

    /// Hours elapsed since the Unix epoch
    fn current_hour(&self) -> i64 {
        hour_key(self.now())
    }
}

/// Hour-since-epoch key for a timestamp
pub fn hour_key(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis().div_euclid(HOUR_MS)
}

/// Start of the hour identified by `hour`
pub fn hour_start(hour: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(hour.saturating_mul(HOUR_MS)).unwrap_or_default()
}

/// The real system clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move the clock forward by `by`
    pub fn advance(&self, by: Duration) {
        let mut now = crate::lock(&self.now);
        *now += by;
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *crate::lock(&self.now) = at;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *crate::lock(&self.now)
    }
}
