//! Configuration for geochat.
//!
//! Stored as camelCase JSON. Every field has a default, so a partial file (or
//! no file at all) yields a usable configuration.

use crate::merge::MergeLimits;
use geochat_client::{BackoffConfig, DEFAULT_RELAYS, RelayConfig};
use geochat_core::MAX_PRECISION;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Reconnection backoff settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffSettings {
    /// Delay before the first retry
    #[serde(default = "default_backoff_initial_ms")]
    pub initial_ms: u64,

    /// Ceiling for any retry delay
    #[serde(default = "default_backoff_max_ms")]
    pub max_ms: u64,

    /// Growth factor per failed attempt
    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            initial_ms: default_backoff_initial_ms(),
            max_ms: default_backoff_max_ms(),
            multiplier: default_backoff_multiplier(),
        }
    }
}

/// Geochat configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeoChatConfig {
    /// Relay endpoint addresses
    #[serde(default = "default_relays")]
    pub relays: Vec<String>,

    /// Channel precision in geohash characters
    #[serde(default = "default_precision")]
    pub default_precision: usize,

    /// Also listen on every coarser cell of the joined one
    #[serde(default)]
    pub include_ancestor_cells: bool,

    /// How far back the durable subscription reaches
    #[serde(default = "default_history_window_secs")]
    pub history_window_secs: u64,

    /// Result cap for the live subscription's initial snapshot
    #[serde(default = "default_live_snapshot_limit")]
    pub live_snapshot_limit: u64,

    /// Result cap for the durable subscription
    #[serde(default = "default_history_limit")]
    pub history_limit: u64,

    /// Ephemeral events kept per channel
    #[serde(default = "default_ephemeral_retention")]
    pub ephemeral_retention: usize,

    /// Ephemeral events older than this are aged out
    #[serde(default = "default_ephemeral_max_age_secs")]
    pub ephemeral_max_age_secs: u64,

    /// Durable events kept per channel
    #[serde(default = "default_durable_retention")]
    pub durable_retention: usize,

    /// Identifiers remembered per channel for deduplication
    #[serde(default = "default_seen_capacity")]
    pub seen_capacity: usize,

    #[serde(default = "default_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_timeout_ms")]
    pub publish_timeout_ms: u64,

    #[serde(default)]
    pub backoff: BackoffSettings,
}

impl Default for GeoChatConfig {
    fn default() -> Self {
        Self {
            relays: default_relays(),
            default_precision: default_precision(),
            include_ancestor_cells: false,
            history_window_secs: default_history_window_secs(),
            live_snapshot_limit: default_live_snapshot_limit(),
            history_limit: default_history_limit(),
            ephemeral_retention: default_ephemeral_retention(),
            ephemeral_max_age_secs: default_ephemeral_max_age_secs(),
            durable_retention: default_durable_retention(),
            seen_capacity: default_seen_capacity(),
            connect_timeout_ms: default_timeout_ms(),
            publish_timeout_ms: default_timeout_ms(),
            backoff: BackoffSettings::default(),
        }
    }
}

impl GeoChatConfig {
    /// Defaults with a custom relay list.
    pub fn with_relays(relays: Vec<String>) -> Self {
        Self {
            relays,
            ..Self::default()
        }
    }

    /// Reject settings the rest of the system cannot honor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.relays.is_empty() {
            return Err(ConfigError::Invalid("at least one relay is required".into()));
        }
        if let Some(relay) = self
            .relays
            .iter()
            .find(|r| !(r.starts_with("ws://") || r.starts_with("wss://")))
        {
            return Err(ConfigError::Invalid(format!(
                "relay must use ws:// or wss://: {relay}"
            )));
        }
        if !(1..=MAX_PRECISION).contains(&self.default_precision) {
            return Err(ConfigError::Invalid(format!(
                "defaultPrecision must be between 1 and {MAX_PRECISION}, got {}",
                self.default_precision
            )));
        }
        for (name, value) in [
            ("liveSnapshotLimit", self.live_snapshot_limit as usize),
            ("historyLimit", self.history_limit as usize),
            ("ephemeralRetention", self.ephemeral_retention),
            ("durableRetention", self.durable_retention),
            ("seenCapacity", self.seen_capacity),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be greater than 0")));
            }
        }
        if self.backoff.multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "backoff.multiplier must be at least 1".into(),
            ));
        }
        if self.backoff.initial_ms > self.backoff.max_ms {
            return Err(ConfigError::Invalid(
                "backoff.initialMs must not exceed backoff.maxMs".into(),
            ));
        }
        Ok(())
    }

    /// Connection settings for the relay pool.
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            publish_timeout: Duration::from_millis(self.publish_timeout_ms),
            backoff: BackoffConfig {
                initial: Duration::from_millis(self.backoff.initial_ms),
                max: Duration::from_millis(self.backoff.max_ms),
                multiplier: self.backoff.multiplier,
            },
        }
    }

    /// Retention ceilings for each channel's merger.
    pub fn merge_limits(&self) -> MergeLimits {
        MergeLimits {
            seen_capacity: self.seen_capacity,
            ephemeral_retention: self.ephemeral_retention,
            ephemeral_max_age_secs: self.ephemeral_max_age_secs,
            durable_retention: self.durable_retention,
        }
    }
}

/// Load configuration from `path`, falling back to defaults when the file is absent.
pub fn load_config(path: impl AsRef<Path>) -> Result<GeoChatConfig, ConfigError> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(GeoChatConfig::default());
    }
    let contents = fs::read_to_string(path)?;
    let config: GeoChatConfig = serde_json::from_str(&contents)?;
    config.validate()?;
    Ok(config)
}

/// Write configuration to `path` as pretty JSON, creating parent directories.
pub fn save_config(path: impl AsRef<Path>, config: &GeoChatConfig) -> Result<(), ConfigError> {
    let path = path.as_ref();
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(config)?;
    fs::write(path, json)?;
    Ok(())
}

fn default_relays() -> Vec<String> {
    DEFAULT_RELAYS.iter().map(|s| s.to_string()).collect()
}

fn default_precision() -> usize {
    geochat_core::DEFAULT_PRECISION
}

fn default_history_window_secs() -> u64 {
    24 * 60 * 60
}

fn default_live_snapshot_limit() -> u64 {
    200
}

fn default_history_limit() -> u64 {
    200
}

fn default_ephemeral_retention() -> usize {
    400
}

fn default_ephemeral_max_age_secs() -> u64 {
    60 * 60
}

fn default_durable_retention() -> usize {
    200
}

fn default_seen_capacity() -> usize {
    5000
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_backoff_initial_ms() -> u64 {
    1000
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}
