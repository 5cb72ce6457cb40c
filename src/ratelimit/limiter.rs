//! Per-client rate limiter.

use std::sync::Arc;

use chrono::Duration;
use dashmap::DashMap;
use tracing::{debug, trace};

use super::bucket::{Bucket, TokenBucket};
use super::clock::{SharedClock, SystemClock};
use super::settings::{BucketSettings, TimeUnit};
use crate::error::Result;

/// The core rate limiter that maps caller identities to token buckets.
///
/// A bucket is created with the limiter's default settings the first time a
/// caller is seen. This struct is thread-safe and can be shared across
/// threads; requests for different callers only contend on the map shard,
/// never on each other's buckets.
pub struct RateLimiter {
    /// Buckets indexed by caller id
    clients: DashMap<String, Arc<dyn Bucket>>,
    /// Settings for lazily created buckets
    defaults: BucketSettings,
    /// Period of lazily created buckets, derived from `defaults`
    period: Duration,
    /// Clock handed to lazily created buckets
    clock: SharedClock,
}

impl RateLimiter {
    /// Create a rate limiter using the system clock.
    pub fn new(capacity: u64, period: u64, unit: TimeUnit) -> Result<Self> {
        Self::with_clock(capacity, period, unit, SystemClock::shared())
    }

    /// Create a rate limiter whose default buckets read time from `clock`.
    pub fn with_clock(capacity: u64, period: u64, unit: TimeUnit, clock: SharedClock) -> Result<Self> {
        Self::from_settings(BucketSettings::new(capacity, period, unit), clock)
    }

    /// Create a rate limiter from validated default settings.
    pub fn from_settings(defaults: BucketSettings, clock: SharedClock) -> Result<Self> {
        defaults.validate()?;
        let period = defaults.period_duration()?;
        debug!(
            capacity = defaults.capacity,
            period = defaults.period,
            unit = ?defaults.unit,
            "Rate limiter initialized"
        );

        Ok(Self {
            clients: DashMap::new(),
            defaults,
            period,
            clock,
        })
    }

    /// Decide whether `caller_id` may make a request now.
    ///
    /// Consumes one token from the caller's bucket, creating the bucket
    /// first if the caller has not been seen before.
    pub fn allow_request(&self, caller_id: &str) -> bool {
        let bucket = self.get_or_create(caller_id);
        let allowed = bucket.try_consume();

        trace!(caller = %caller_id, allowed = allowed, "Checked rate limit");
        if !allowed {
            debug!(caller = %caller_id, "Rate limit exceeded");
        }
        allowed
    }

    /// Install `bucket` for `caller_id`, replacing any existing bucket.
    ///
    /// The previous bucket's token count and period are discarded.
    pub fn add_client<B: Bucket + 'static>(&self, caller_id: impl Into<String>, bucket: B) {
        let caller_id = caller_id.into();
        debug!(
            caller = %caller_id,
            capacity = bucket.capacity(),
            "Installing client bucket"
        );

        if self.clients.insert(caller_id, Arc::new(bucket)).is_some() {
            trace!("Replaced existing client bucket");
        }
    }

    /// Remove the bucket for `caller_id`.
    ///
    /// Returns `true` if a bucket was present. The next request from this
    /// caller starts with a fresh default bucket.
    pub fn remove_client(&self, caller_id: &str) -> bool {
        self.clients.remove(caller_id).is_some()
    }

    /// Get the bucket for `caller_id`, if one exists.
    pub fn bucket(&self, caller_id: &str) -> Option<Arc<dyn Bucket>> {
        self.clients.get(caller_id).map(|entry| Arc::clone(entry.value()))
    }

    /// Get the tokens left for `caller_id` without consuming or refilling.
    ///
    /// Returns `None` if no bucket exists for the caller.
    pub fn available_tokens(&self, caller_id: &str) -> Option<u64> {
        self.clients
            .get(caller_id)
            .map(|entry| entry.value().available_tokens())
    }

    /// Check whether `caller_id` has a bucket.
    pub fn contains_client(&self, caller_id: &str) -> bool {
        self.clients.contains_key(caller_id)
    }

    /// Get the number of tracked clients.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Settings used for lazily created buckets.
    pub fn defaults(&self) -> BucketSettings {
        self.defaults
    }

    /// Clear all client buckets.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.clients.clear();
    }

    /// Look up the bucket for `caller_id`, creating it at most once.
    ///
    /// The entry API holds the shard write lock while the bucket is built,
    /// so racing first-time lookups observe a single bucket. The guard is
    /// dropped before the caller touches the bucket.
    fn get_or_create(&self, caller_id: &str) -> Arc<dyn Bucket> {
        if let Some(entry) = self.clients.get(caller_id) {
            return Arc::clone(entry.value());
        }

        let entry = self
            .clients
            .entry(caller_id.to_string())
            .or_insert_with(|| {
                debug!(
                    caller = %caller_id,
                    capacity = self.defaults.capacity,
                    "Creating new client bucket"
                );
                Arc::new(TokenBucket::from_validated(
                    self.defaults.capacity,
                    self.period,
                    Arc::clone(&self.clock),
                ))
            });
        Arc::clone(entry.value())
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("defaults", &self.defaults)
            .field("clients", &self.clients.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BucketGateError;
    use crate::ratelimit::clock::{Clock, ManualClock};
    use std::sync::Barrier;

    const CAPACITY: u64 = 3;
    const CLIENT_1: &str = "127.0.0.1";
    const CLIENT_2: &str = "192.168.0.1";

    fn manual_limiter(capacity: u64) -> (Arc<ManualClock>, RateLimiter) {
        let clock = Arc::new(ManualClock::starting_now());
        let limiter = RateLimiter::with_clock(capacity, 1, TimeUnit::Hour, clock.clone()).unwrap();
        (clock, limiter)
    }

    fn hourly_bucket(capacity: u64, clock: &Arc<ManualClock>) -> TokenBucket {
        TokenBucket::new(capacity, 1, TimeUnit::Hour, clock.clone()).unwrap()
    }

    #[test]
    fn test_rate_limiter_creation() {
        let limiter = RateLimiter::new(CAPACITY, 1, TimeUnit::Hour).unwrap();
        assert_eq!(limiter.client_count(), 0);
        assert_eq!(limiter.defaults(), BucketSettings::new(CAPACITY, 1, TimeUnit::Hour));
    }

    #[test]
    fn test_invalid_defaults_rejected() {
        assert!(matches!(
            RateLimiter::new(0, 1, TimeUnit::Hour),
            Err(BucketGateError::Config(_))
        ));
        assert!(matches!(
            RateLimiter::new(1, 0, TimeUnit::Hour),
            Err(BucketGateError::Config(_))
        ));
    }

    #[test]
    fn test_overflowing_default_period_rejected() {
        let result = RateLimiter::new(1, 100_000_000, TimeUnit::Day);
        assert!(matches!(result, Err(BucketGateError::Config(_))));
    }

    #[test]
    fn test_allow_request_creates_bucket() {
        let (_, limiter) = manual_limiter(CAPACITY);

        assert!(limiter.allow_request(CLIENT_1));
        assert_eq!(limiter.client_count(), 1);
        assert!(limiter.contains_client(CLIENT_1));
        assert_eq!(limiter.available_tokens(CLIENT_1), Some(CAPACITY - 1));
        assert_eq!(limiter.available_tokens(CLIENT_2), None);
    }

    #[test]
    fn test_allow_requests_until_exhausted() {
        let (_, limiter) = manual_limiter(CAPACITY);

        assert!(limiter.allow_request(CLIENT_1));
        assert!(limiter.allow_request(CLIENT_1));
        assert!(limiter.allow_request(CLIENT_1));
        assert!(!limiter.allow_request(CLIENT_1));
    }

    #[test]
    fn test_clients_have_separate_budgets() {
        let (_, limiter) = manual_limiter(1);

        assert!(limiter.allow_request(CLIENT_1));
        assert!(!limiter.allow_request(CLIENT_1));

        assert!(limiter.allow_request(CLIENT_2));
        assert!(!limiter.allow_request(CLIENT_2));
    }

    #[test]
    fn test_allow_request_after_depletion_and_refill() {
        let (clock, limiter) = manual_limiter(CAPACITY);

        for _ in 0..CAPACITY {
            assert!(limiter.allow_request(CLIENT_1));
        }
        assert!(!limiter.allow_request(CLIENT_1));

        clock.advance(Duration::minutes(61));

        assert!(limiter.allow_request(CLIENT_1));
        assert_eq!(limiter.available_tokens(CLIENT_1), Some(CAPACITY - 1));
    }

    #[test]
    fn test_add_client_used_for_requests() {
        let (clock, limiter) = manual_limiter(CAPACITY);
        limiter.add_client(CLIENT_1, hourly_bucket(1, &clock));

        assert!(limiter.allow_request(CLIENT_1));
        assert!(!limiter.allow_request(CLIENT_1));
    }

    #[test]
    fn test_add_client_replaces_auto_created_bucket() {
        let (clock, limiter) = manual_limiter(CAPACITY);

        for _ in 0..CAPACITY {
            assert!(limiter.allow_request(CLIENT_1));
        }
        assert_eq!(limiter.available_tokens(CLIENT_1), Some(0));

        limiter.add_client(CLIENT_1, hourly_bucket(CAPACITY, &clock));

        assert_eq!(limiter.client_count(), 1);
        assert!(limiter.allow_request(CLIENT_1));
        assert_eq!(limiter.available_tokens(CLIENT_1), Some(CAPACITY - 1));
    }

    #[test]
    fn test_clients_with_offset_clocks_refill_independently() {
        let (_, limiter) = manual_limiter(CAPACITY);
        let clock_1 = Arc::new(ManualClock::starting_now());
        let clock_2 = Arc::new(ManualClock::new(clock_1.now() + Duration::minutes(5)));
        limiter.add_client(CLIENT_1, hourly_bucket(CAPACITY, &clock_1));
        limiter.add_client(CLIENT_2, hourly_bucket(CAPACITY, &clock_2));

        for _ in 0..CAPACITY {
            assert!(limiter.allow_request(CLIENT_1));
            assert!(limiter.allow_request(CLIENT_2));
        }
        assert!(!limiter.allow_request(CLIENT_1));
        assert!(!limiter.allow_request(CLIENT_2));

        clock_1.advance(Duration::minutes(61));
        clock_2.advance(Duration::minutes(56));

        assert!(limiter.allow_request(CLIENT_1));
        assert!(!limiter.allow_request(CLIENT_2));

        clock_2.advance(Duration::minutes(5));
        assert!(limiter.allow_request(CLIENT_2));
    }

    #[test]
    fn test_remove_client_resets_budget() {
        let (_, limiter) = manual_limiter(1);

        assert!(limiter.allow_request(CLIENT_1));
        assert!(!limiter.allow_request(CLIENT_1));

        assert!(limiter.remove_client(CLIENT_1));
        assert!(!limiter.remove_client(CLIENT_1));
        assert!(limiter.allow_request(CLIENT_1));
    }

    #[test]
    fn test_clear_clients() {
        let (_, limiter) = manual_limiter(CAPACITY);

        limiter.allow_request(CLIENT_1);
        limiter.allow_request(CLIENT_2);
        assert_eq!(limiter.client_count(), 2);

        limiter.clear();
        assert_eq!(limiter.client_count(), 0);
    }

    #[test]
    fn test_concurrent_first_requests_create_one_bucket() {
        const THREADS: usize = 16;
        let (_, limiter) = manual_limiter(CAPACITY);
        let barrier = Barrier::new(THREADS);
        let (limiter, barrier) = (&limiter, &barrier);

        let allowed: usize = std::thread::scope(|s| {
            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    s.spawn(move || {
                        barrier.wait();
                        limiter.allow_request(CLIENT_1)
                    })
                })
                .collect();

            handles
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .filter(|allowed| *allowed)
                .count()
        });

        assert_eq!(allowed, CAPACITY as usize);
        assert_eq!(limiter.client_count(), 1);
        assert_eq!(limiter.available_tokens(CLIENT_1), Some(0));
    }

    #[test]
    fn test_bucket_lookup_returns_shared_instance() {
        let (_, limiter) = manual_limiter(CAPACITY);
        limiter.allow_request(CLIENT_1);

        let first = limiter.bucket(CLIENT_1).unwrap();
        let second = limiter.bucket(CLIENT_1).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(limiter.bucket(CLIENT_2).is_none());
    }
}
