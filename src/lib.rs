//! Bucketgate - Per-client Token Bucket Admission Control
//!
//! This crate decides, for an identified caller, whether a request may
//! proceed. Every caller gets its own token bucket, created lazily on first
//! contact and refilled on period boundaries aligned to the bucket's creation
//! time. No timers or background threads are involved: refills happen when a
//! bucket is next touched.

pub mod config;
pub mod error;
pub mod ratelimit;
