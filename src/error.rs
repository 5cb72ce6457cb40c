//! Error types for Bucketgate.

use thiserror::Error;

/// Main error type for Bucketgate operations.
///
/// Only construction can fail. Once a bucket or limiter exists, admission
/// decisions are reported as plain booleans.
#[derive(Error, Debug)]
pub enum BucketGateError {
    /// Invalid bucket or limiter configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors while reading configuration
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Bucketgate operations.
pub type Result<T> = std::result::Result<T, BucketGateError>;
