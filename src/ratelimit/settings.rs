//! Bucket settings and time units.
//!
//! A bucket is configured with a capacity and a period expressed as a count
//! of some [`TimeUnit`]. The same plain settings value is used by the
//! builder, the limiter defaults and configuration files.

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};

use super::bucket::TokenBucket;
use super::clock::SharedClock;
use crate::error::{BucketGateError, Result};

/// Time unit for a bucket period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Millisecond,
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    /// Length of one unit in milliseconds.
    pub fn as_millis(&self) -> i64 {
        match self {
            TimeUnit::Millisecond => 1,
            TimeUnit::Second => 1_000,
            TimeUnit::Minute => 60_000,
            TimeUnit::Hour => 3_600_000,
            TimeUnit::Day => 86_400_000,
        }
    }

    /// Get the duration of one unit.
    pub fn duration(&self) -> Duration {
        Duration::milliseconds(self.as_millis())
    }
}

/// Capacity and period for a token bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketSettings {
    /// Maximum number of tokens the bucket holds
    pub capacity: u64,
    /// Number of `unit`s in one refill period
    pub period: u64,
    /// Unit the period is measured in
    pub unit: TimeUnit,
}

impl BucketSettings {
    /// Create settings without validating them.
    pub fn new(capacity: u64, period: u64, unit: TimeUnit) -> Self {
        Self {
            capacity,
            period,
            unit,
        }
    }

    /// Check that capacity and period are positive and the period is representable.
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(BucketGateError::Config(
                "token bucket capacity must be greater than 0".to_string(),
            ));
        }
        self.period_duration().map(|_| ())
    }

    /// The refill period as a duration.
    ///
    /// Periods that would push the next refill time past the largest
    /// representable instant are rejected.
    pub fn period_duration(&self) -> Result<Duration> {
        if self.period == 0 {
            return Err(BucketGateError::Config(
                "period must be greater than 0".to_string(),
            ));
        }

        i64::try_from(self.period)
            .ok()
            .and_then(|period| period.checked_mul(self.unit.as_millis()))
            .and_then(Duration::try_milliseconds)
            .filter(|period| Utc::now().checked_add_signed(*period).is_some())
            .ok_or_else(|| {
                BucketGateError::Config(format!(
                    "period of {} {:?} is out of range",
                    self.period, self.unit
                ))
            })
    }

    /// Build a fresh bucket from these settings.
    pub fn build_bucket(&self, clock: SharedClock) -> Result<TokenBucket> {
        TokenBucket::new(self.capacity, self.period, self.unit, clock)
    }
}
