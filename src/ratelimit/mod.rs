//! Token buckets and the per-client limiter.

mod bucket;
mod clock;
mod limiter;
mod settings;

pub use bucket::{Bucket, TokenBucket, TokenBucketBuilder};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use limiter::RateLimiter;
pub use settings::{BucketSettings, TimeUnit};
