//! # Sync Configuration
//!
//! Tunables for the four sync components. Every field has a default so a
//! config file only needs to mention what it changes. Durations are stored as
//! milliseconds (`...Ms` in JSON) and exposed as `Duration` through accessors.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("I/O error occurred: {0}")]
    IoError(#[from] std::io::Error),

    /// The config file is not valid JSON5 for this schema.
    #[error("Failed to parse config: {0}")]
    ParseError(String),

    /// A value is out of its allowed range.
    #[error("Invalid value for {field}: {reason}")]
    Invalid {
        /// Dotted path of the offending field.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },
}

/// Push channel settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct TransportConfig {
    /// WebSocket endpoint (`ws://` or `wss://`).
    pub url: String,
    /// Bearer token sent in the upgrade request and in the `auth` frame.
    pub auth_token: Option<String>,
    /// Wait for a `connected` frame before treating the socket as open.
    pub require_handshake: bool,
    pub connect_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// How long a heartbeat may stay unanswered before the socket is declared dead.
    pub heartbeat_timeout_ms: u64,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    /// Consecutive failed reconnects before the client gives up and reports `Failed`.
    pub max_reconnect_attempts: u32,
    /// Random extra delay added to each reconnect, as a fraction of the delay.
    pub reconnect_jitter_ratio: f64,
    /// Inbound frames larger than this are dropped unparsed.
    pub max_frame_bytes: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9003/ws".to_string(),
            auth_token: None,
            require_handshake: false,
            connect_timeout_ms: 10_000,
            handshake_timeout_ms: 10_000,
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: 10_000,
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 30_000,
            max_reconnect_attempts: 5,
            reconnect_jitter_ratio: 0.1,
            max_frame_bytes: 1024 * 1024,
        }
    }
}

impl TransportConfig {
    /// Connect timeout as a `Duration`.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Handshake timeout as a `Duration`.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Heartbeat send interval as a `Duration`.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Heartbeat acknowledgement timeout as a `Duration`.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }
}

/// Polling scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct PollingConfig {
    /// Interval used when a task does not specify its own.
    pub default_interval_ms: u64,
    /// Lower clamp for any computed interval.
    pub min_interval_ms: u64,
    /// Upper clamp for any computed interval; also the pin value after `max_retries`.
    pub max_interval_ms: u64,
    pub backoff_multiplier: f64,
    pub max_retries: u32,
    /// No user activity for this long counts as inactive.
    pub inactivity_threshold_ms: u64,
    pub inactivity_multiplier: f64,
    pub high_priority_factor: f64,
    pub low_priority_factor: f64,
    /// Upper bound of the random jitter, as a fraction of the interval.
    pub jitter_ratio: f64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            default_interval_ms: 30_000,
            min_interval_ms: 1_000,
            max_interval_ms: 300_000,
            backoff_multiplier: 1.5,
            max_retries: 5,
            inactivity_threshold_ms: 300_000,
            inactivity_multiplier: 2.0,
            high_priority_factor: 0.5,
            low_priority_factor: 2.0,
            jitter_ratio: 0.1,
        }
    }
}

impl PollingConfig {
    /// Default task interval as a `Duration`.
    pub fn default_interval(&self) -> Duration {
        Duration::from_millis(self.default_interval_ms)
    }

    /// Minimum interval as a `Duration`.
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    /// Maximum interval as a `Duration`.
    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }

    /// Inactivity threshold as a `Duration`.
    pub fn inactivity_threshold(&self) -> Duration {
        Duration::from_millis(self.inactivity_threshold_ms)
    }
}

/// Which storage engine backs the cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum CacheBackendKind {
    /// Process-local map. Not durable across restarts.
    #[default]
    Memory,
    /// Redis server; entries survive agent restarts.
    Redis {
        /// Connection URL, e.g. `redis://127.0.0.1/`.
        url: String,
        /// Prefix for every key the cache writes.
        #[serde(default = "default_redis_prefix")]
        prefix: String,
    },
}

fn default_redis_prefix() -> String {
    "sync:".to_string()
}

/// Local cache store settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct CacheConfig {
    pub backend: CacheBackendKind,
    pub default_ttl_ms: u64,
    /// Size budget in serialized bytes; the sweep evicts LRU entries above it.
    pub max_size_bytes: usize,
    pub cleanup_interval_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackendKind::Memory,
            default_ttl_ms: 300_000,
            max_size_bytes: 50 * 1024 * 1024,
            cleanup_interval_ms: 60_000,
        }
    }
}

impl CacheConfig {
    /// Default entry TTL as a `Duration`.
    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }

    /// Sweep interval as a `Duration`.
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }
}

/// Reconciliation coordinator settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct CoordinatorConfig {
    /// Window for coalescing routine invalidations.
    pub throttle_window_ms: u64,
    /// Full-refresh period while the push channel is `Failed`.
    pub fallback_interval_ms: u64,
    /// Mirror push-applied values into the cache.
    pub write_through_push: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            throttle_window_ms: 500,
            fallback_interval_ms: 60_000,
            write_through_push: true,
        }
    }
}

impl CoordinatorConfig {
    /// Throttle window as a `Duration`.
    pub fn throttle_window(&self) -> Duration {
        Duration::from_millis(self.throttle_window_ms)
    }

    /// Fallback refresh period as a `Duration`.
    pub fn fallback_interval(&self) -> Duration {
        Duration::from_millis(self.fallback_interval_ms)
    }
}

/// Top-level configuration for the sync layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncConfig {
    pub transport: TransportConfig,
    pub polling: PollingConfig,
    pub cache: CacheConfig,
    pub coordinator: CoordinatorConfig,
}

impl SyncConfig {
    /// Parses a JSON5 document and validates it.
    pub fn from_json5_str(text: &str) -> Result<Self, ConfigError> {
        let config: SyncConfig =
            json5::from_str(text).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a JSON5 config file.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_json5_str(&text)
    }

    /// Rejects values the components cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.transport;
        if t.heartbeat_interval_ms == 0 {
            return Err(invalid("transport.heartbeatIntervalMs", "must be > 0"));
        }
        if t.heartbeat_timeout_ms == 0 {
            return Err(invalid("transport.heartbeatTimeoutMs", "must be > 0"));
        }
        if t.reconnect_base_delay_ms == 0 {
            return Err(invalid("transport.reconnectBaseDelayMs", "must be > 0"));
        }
        if t.reconnect_max_delay_ms < t.reconnect_base_delay_ms {
            return Err(invalid(
                "transport.reconnectMaxDelayMs",
                "must be >= reconnectBaseDelayMs",
            ));
        }
        if !(0.0..=1.0).contains(&t.reconnect_jitter_ratio) {
            return Err(invalid("transport.reconnectJitterRatio", "must be within [0, 1]"));
        }

        let p = &self.polling;
        if p.min_interval_ms == 0 {
            return Err(invalid("polling.minIntervalMs", "must be > 0"));
        }
        if p.max_interval_ms < p.min_interval_ms {
            return Err(invalid("polling.maxIntervalMs", "must be >= minIntervalMs"));
        }
        if p.backoff_multiplier < 1.0 {
            return Err(invalid("polling.backoffMultiplier", "must be >= 1"));
        }
        if p.inactivity_multiplier < 1.0 {
            return Err(invalid("polling.inactivityMultiplier", "must be >= 1"));
        }
        if p.high_priority_factor <= 0.0 || p.low_priority_factor <= 0.0 {
            return Err(invalid("polling.priorityFactor", "must be > 0"));
        }
        if !(0.0..=1.0).contains(&p.jitter_ratio) {
            return Err(invalid("polling.jitterRatio", "must be within [0, 1]"));
        }

        if self.cache.cleanup_interval_ms == 0 {
            return Err(invalid("cache.cleanupIntervalMs", "must be > 0"));
        }
        if self.coordinator.fallback_interval_ms == 0 {
            return Err(invalid("coordinator.fallbackIntervalMs", "must be > 0"));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}
