//! Per-node tuning knobs.
//!
//! All fields have defaults; a JSON file only needs the fields it wants
//! to override.
//!
//! ```json
//! { "retry": { "max_attempts": 6 }, "placement": { "enabled": false } }
//! ```

use serde::{Deserialize, Serialize};
use snafu::Snafu;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("I/O error"), context(false))]
    Io { source: std::io::Error },

    #[snafu(display("JSON error"), context(false))]
    Json { source: serde_json::Error },

    #[snafu(display("invalid config: {reason}"))]
    Invalid { reason: String },
}

/// Retry and deadline policy for every outbound protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts before the peer is declared dead.
    pub max_attempts: u32,
    pub base_backoff_us: u64,
    pub max_backoff_us: u64,
    /// Per-attempt deadline.
    pub timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_backoff_us: 50,
            max_backoff_us: 2_000,
            timeout_ms: 50,
        }
    }
}

impl RetryPolicy {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Fetch-versus-migrate tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlacementConfig {
    pub enabled: bool,
    /// Distinct pages homed at one remote node (K) that trigger a move.
    pub hot_page_threshold: usize,
    /// Faults remembered per vCPU.
    pub window: usize,
    /// Faults a vCPU must take at a node before it may leave again.
    pub min_dwell: u64,
    /// Dwell multiplier when the candidate is the node just left.
    pub bounce_dwell_multiplier: u64,
    /// Placement decisions for which a refusing target is skipped.
    pub saturation_backoff: u32,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            hot_page_threshold: 4,
            window: 32,
            min_dwell: 64,
            bounce_dwell_multiplier: 4,
            saturation_backoff: 64,
        }
    }
}

/// Page-number to home-node partition function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HomeStrategy {
    /// SplitMix64 hash of the page number.
    Hashed,
    /// `page % nodes`.
    Interleaved,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub retry: RetryPolicy,
    pub placement: PlacementConfig,
    pub home: HomeStrategy,
    /// Lock shards in the page directory and the local page cache.
    pub directory_shards: usize,
    /// How long a request may wait behind other transitions on a page.
    pub queue_wait_ms: u64,
    /// Refaults before a persistently stale page is reported.
    pub max_stale_refaults: u32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            placement: PlacementConfig::default(),
            home: HomeStrategy::Hashed,
            directory_shards: 64,
            queue_wait_ms: 2_000,
            max_stale_refaults: 8,
        }
    }
}

impl NodeConfig {
    /// Load and validate a JSON config file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let json = fs::read_to_string(path)?;
        let config: NodeConfig = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let reason = if self.directory_shards == 0 {
            "directory_shards must be non-zero"
        } else if self.retry.max_attempts == 0 {
            "retry.max_attempts must be non-zero"
        } else if self.retry.base_backoff_us > self.retry.max_backoff_us {
            "retry.base_backoff_us exceeds retry.max_backoff_us"
        } else if self.placement.hot_page_threshold == 0 {
            "placement.hot_page_threshold must be non-zero"
        } else if self.placement.window < self.placement.hot_page_threshold {
            "placement.window is smaller than placement.hot_page_threshold"
        } else if self.placement.bounce_dwell_multiplier == 0 {
            "placement.bounce_dwell_multiplier must be non-zero"
        } else {
            return Ok(());
        };
        InvalidSnafu { reason }.fail()
    }

    pub fn queue_wait(&self) -> Duration {
        Duration::from_millis(self.queue_wait_ms)
    }
}
