//! Configuration management for Bucketgate.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{BucketGateError, Result};
use crate::ratelimit::{BucketSettings, RateLimiter, SharedClock, TimeUnit};

/// Main configuration for a Bucketgate limiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketGateConfig {
    /// Settings for buckets created on first contact
    #[serde(default = "default_limiter_settings")]
    pub limiter: BucketSettings,

    /// Buckets installed up front for specific clients
    #[serde(default)]
    pub clients: Vec<ClientOverride>,
}

impl Default for BucketGateConfig {
    fn default() -> Self {
        Self {
            limiter: default_limiter_settings(),
            clients: Vec::new(),
        }
    }
}

/// A non-default bucket for one client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientOverride {
    /// Caller identity, e.g. an IP address or session id
    pub id: String,

    /// Bucket settings for this caller
    #[serde(flatten)]
    pub settings: BucketSettings,
}

fn default_limiter_settings() -> BucketSettings {
    BucketSettings::new(default_capacity(), default_period(), default_unit())
}

fn default_capacity() -> u64 {
    60
}

fn default_period() -> u64 {
    1
}

fn default_unit() -> TimeUnit {
    TimeUnit::Hour
}

impl BucketGateConfig {
    /// Load configuration from a file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading limiter configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| BucketGateError::Config(format!("Failed to parse limiter config: {}", e)))
    }

    /// Build a limiter with these defaults and install every client override.
    ///
    /// Fails without returning a partially configured limiter if the defaults
    /// or any override are invalid.
    pub fn build_limiter(&self, clock: SharedClock) -> Result<RateLimiter> {
        let limiter = RateLimiter::from_settings(self.limiter, Arc::clone(&clock))?;

        for client in &self.clients {
            let bucket = client.settings.build_bucket(Arc::clone(&clock)).map_err(|e| {
                BucketGateError::Config(format!("client {}: {}", client.id, e))
            })?;
            limiter.add_client(client.id.clone(), bucket);
        }

        Ok(limiter)
    }
}
