//! # Runtime Settings
//!
//! Typed, fully-resolved settings for every pipeline component. The gateway
//! binary merges its CLI, environment and JSON config file into these structs;
//! library users and tests build them directly or start from `Default`.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while resolving configuration into settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A key without a usable default was not provided anywhere.
    #[error("Missing required configuration key: {0}")]
    MissingKey(&'static str),

    /// A key was provided but its value is unusable.
    #[error("Invalid value for {key}: {reason}")]
    InvalidValue {
        /// The offending configuration key.
        key: &'static str,
        /// Why the value was rejected.
        reason: String,
    },

    /// The config file could not be read.
    #[error("I/O error occurred: {0}")]
    IoError(#[from] std::io::Error),

    /// The config file is not valid JSON for the expected shape.
    #[error("Config file parse error: {0}")]
    ParseError(#[from] serde_json::Error),
}

/// # Overflow Policy
///
/// What the producer does when the delivery queue is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// The producer waits until the uploader frees a slot.
    #[default]
    Block,
    /// The oldest queued payload is evicted to make room.
    DropOldest,
}

impl FromStr for OverflowPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "block" => Ok(OverflowPolicy::Block),
            "drop_oldest" => Ok(OverflowPolicy::DropOldest),
            other => Err(ConfigError::InvalidValue {
                key: "overflow_policy",
                reason: format!("expected `block` or `drop_oldest`, got `{}`", other),
            }),
        }
    }
}

impl fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverflowPolicy::Block => f.write_str("block"),
            OverflowPolicy::DropOldest => f.write_str("drop_oldest"),
        }
    }
}

/// Upstream connection and login handshake.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Server host name or IP address.
    pub addr: String,
    /// Server port.
    pub port: u16,
    /// Callsign sent in the login line; read-only feeds accept any valid one.
    pub callsign: String,
    /// Software name advertised in the login line.
    pub client_name: String,
    /// Software version advertised in the login line.
    pub client_version: String,
    /// Pause after connecting and after sending the login, before reading.
    pub settle_delay: Duration,
    /// How long to wait for the greeting and the ack.
    pub handshake_timeout: Duration,
    /// Per-read timeout while streaming; a timed out read yields no bytes.
    pub read_timeout: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            addr: "rotate.aprs2.net".to_string(),
            port: 10152,
            callsign: "N0CALL".to_string(),
            client_name: "aprs2gpaero".to_string(),
            client_version: "0.2".to_string(),
            settle_delay: Duration::from_millis(500),
            handshake_timeout: Duration::from_secs(2),
            read_timeout: Duration::from_secs(2),
        }
    }
}

/// Identity filter and deduplication.
#[derive(Debug, Clone)]
pub struct FilterSettings {
    /// Minimum seconds between two accepted fixes of one identity.
    pub min_interval_secs: f64,
    /// Number of recent fingerprints remembered per identity.
    pub window_depth: usize,
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self {
            min_interval_secs: 10.0,
            window_depth: 5,
        }
    }
}

/// Delivery queue sizing.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// Maximum number of payloads held at once (queued plus in flight).
    pub capacity: usize,
    /// Behaviour when `capacity` is reached.
    pub overflow: OverflowPolicy,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            capacity: 5000,
            overflow: OverflowPolicy::Block,
        }
    }
}

/// Background uploader.
///
/// Timeout retries are deliberately unlimited and the retry delay has no
/// ceiling; a persistently growing delay in the logs is the operator signal.
#[derive(Debug, Clone)]
pub struct UploaderSettings {
    /// Timeout for one push call.
    pub push_timeout: Duration,
    /// Delay used after the first timeout, and again after every success.
    pub base_retry_delay: Duration,
    /// How often upload statistics are logged.
    pub stats_interval: Duration,
}

impl Default for UploaderSettings {
    fn default() -> Self {
        Self {
            push_timeout: Duration::from_secs(5),
            base_retry_delay: Duration::from_millis(50),
            stats_interval: Duration::from_secs(600),
        }
    }
}

/// Supervisor loop pacing, liveness and reporting.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Wait after a successful cycle.
    pub base_wait: Duration,
    /// Ceiling for the doubled wait after failing cycles.
    pub max_wait: Duration,
    /// Consecutive near-empty reads tolerated before forcing a reconnect.
    pub max_consecutive_data_loss: u32,
    /// A read producing fewer lines than this counts as near-empty.
    pub min_lines_per_read: usize,
    /// Pause between closing and reopening on a forced reconnect.
    pub reconnect_pause: Duration,
    /// How often ingest statistics are logged.
    pub stats_interval: Duration,
    /// How often the throughput line is logged.
    pub info_interval: Duration,
    /// Heartbeat period; `None` disables it.
    pub monitor_interval: Option<Duration>,
    /// Window for the recent packet-rate figure.
    pub mean_window: Duration,
    /// How long to wait for the uploader to drain on shutdown.
    pub shutdown_timeout: Duration,
    /// Maximum bytes requested from the source per cycle.
    pub read_block_len: usize,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            base_wait: Duration::from_secs(1),
            max_wait: Duration::from_secs(1800),
            max_consecutive_data_loss: 3,
            min_lines_per_read: 2,
            reconnect_pause: Duration::from_secs(1),
            stats_interval: Duration::from_secs(600),
            info_interval: Duration::from_secs(1),
            monitor_interval: None,
            mean_window: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(10),
            read_block_len: 1 << 14,
        }
    }
}

/// Converts a seconds value from a config file into a `Duration`.
pub fn duration_from_secs(key: &'static str, secs: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(secs).map_err(|e| ConfigError::InvalidValue {
        key,
        reason: e.to_string(),
    })
}
