//! Token bucket implementation.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::clock::{SharedClock, SystemClock};
use super::settings::{BucketSettings, TimeUnit};
use crate::error::{BucketGateError, Result};

/// Capability interface for a rate-limited bucket.
///
/// The limiter only talks to buckets through this trait.
pub trait Bucket: Send + Sync {
    /// Maximum number of tokens the bucket can hold.
    fn capacity(&self) -> u64;

    /// Tokens currently available, without triggering a refill.
    fn available_tokens(&self) -> u64;

    /// Refill if due, then spend one token if one is available.
    ///
    /// Returns `true` if a token was consumed.
    fn try_consume(&self) -> bool;

    /// Reset to capacity if the current period has ended.
    fn refill(&self);

    /// Instant after which the next refill becomes due.
    fn next_refill_time(&self) -> DateTime<Utc>;
}

/// Mutable part of a bucket, guarded by a single lock.
struct BucketState {
    available_tokens: u64,
    period_start: DateTime<Utc>,
}

/// A token bucket refilled once per fixed period.
///
/// Refills are lazy: every call to [`Bucket::try_consume`] or
/// [`Bucket::refill`] compares the clock against the end of the current
/// period. Period boundaries stay aligned to whole multiples of the period
/// from the bucket's creation time, however late the refill is observed.
pub struct TokenBucket {
    /// Maximum number of tokens
    capacity: u64,
    /// Length of one refill period
    period: Duration,
    /// Time source for refill decisions
    clock: SharedClock,
    /// Token count and start of the current period
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a full bucket whose first period starts now.
    pub fn new(capacity: u64, period: u64, unit: TimeUnit, clock: SharedClock) -> Result<Self> {
        let settings = BucketSettings::new(capacity, period, unit);
        settings.validate()?;
        let period = settings.period_duration()?;

        Ok(Self::from_validated(capacity, period, clock))
    }

    /// Create a bucket from settings that have already been validated.
    pub(crate) fn from_validated(capacity: u64, period: Duration, clock: SharedClock) -> Self {
        let period_start = clock.now();
        Self {
            capacity,
            period,
            clock,
            state: Mutex::new(BucketState {
                available_tokens: capacity,
                period_start,
            }),
        }
    }

    /// Start configuring a bucket.
    pub fn builder() -> TokenBucketBuilder {
        TokenBucketBuilder::default()
    }

    /// Length of one refill period.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Start of the current accounting period.
    pub fn period_start(&self) -> DateTime<Utc> {
        self.state.lock().period_start
    }

    /// Refill `state` if the current period has ended.
    ///
    /// The new period start is advanced by whole periods only, so it lands
    /// on the boundary of the period containing `now`.
    fn refill_locked(&self, state: &mut BucketState) -> bool {
        let now = self.clock.now();
        match state.period_start.checked_add_signed(self.period) {
            Some(next_refill) if now > next_refill => {}
            _ => return false,
        }

        let period_ms = self.period.num_milliseconds();
        let elapsed_ms = (now - state.period_start).num_milliseconds().max(0);
        let elapsed_periods = elapsed_ms / period_ms;

        let advance = Duration::milliseconds(elapsed_periods * period_ms);
        state.available_tokens = self.capacity;
        state.period_start = state
            .period_start
            .checked_add_signed(advance)
            .unwrap_or(state.period_start);

        debug!(
            capacity = self.capacity,
            elapsed_periods = elapsed_periods,
            period_start = %state.period_start,
            "Refilled token bucket"
        );
        true
    }
}

impl Bucket for TokenBucket {
    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn available_tokens(&self) -> u64 {
        self.state.lock().available_tokens
    }

    fn try_consume(&self) -> bool {
        let mut state = self.state.lock();
        self.refill_locked(&mut state);

        if state.available_tokens == 0 {
            trace!("Token bucket exhausted");
            return false;
        }

        state.available_tokens -= 1;
        trace!(remaining = state.available_tokens, "Consumed token");
        true
    }

    fn refill(&self) {
        let mut state = self.state.lock();
        self.refill_locked(&mut state);
    }

    fn next_refill_time(&self) -> DateTime<Utc> {
        self.state
            .lock()
            .period_start
            .checked_add_signed(self.period)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

impl fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TokenBucket")
            .field("capacity", &self.capacity)
            .field("period", &self.period)
            .field("available_tokens", &state.available_tokens)
            .field("period_start", &state.period_start)
            .finish_non_exhaustive()
    }
}

/// Builder for [`TokenBucket`].
///
/// Capacity, period and time unit are required; the clock defaults to
/// [`SystemClock`]. Nothing is validated until [`TokenBucketBuilder::build`].
#[derive(Default)]
pub struct TokenBucketBuilder {
    capacity: Option<u64>,
    period: Option<u64>,
    unit: Option<TimeUnit>,
    clock: Option<SharedClock>,
}

impl TokenBucketBuilder {
    /// Maximum number of tokens; must be positive.
    pub fn capacity(mut self, capacity: u64) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Number of time units in one refill period; must be positive.
    pub fn period(mut self, period: u64) -> Self {
        self.period = Some(period);
        self
    }

    /// Unit the period is measured in.
    pub fn time_unit(mut self, unit: TimeUnit) -> Self {
        self.unit = Some(unit);
        self
    }

    /// Time source for the bucket; defaults to [`SystemClock`].
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Validate the options and create the bucket.
    pub fn build(self) -> Result<TokenBucket> {
        let capacity = self.capacity.ok_or_else(|| {
            BucketGateError::Config("token bucket capacity must be specified".to_string())
        })?;
        let period = self
            .period
            .ok_or_else(|| BucketGateError::Config("period must be specified".to_string()))?;
        let unit = self
            .unit
            .ok_or_else(|| BucketGateError::Config("time unit must be specified".to_string()))?;
        let clock = self.clock.unwrap_or_else(SystemClock::shared);

        TokenBucket::new(capacity, period, unit, clock)
    }
}
