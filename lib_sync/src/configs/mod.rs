//! # Configuration Modules
//!
//! Tunables for the sync layer, loadable from JSON5 files.

/// Transport, polling, cache and coordinator settings.
pub mod sync_config;

pub use sync_config::{
    CacheBackendKind, CacheConfig, ConfigError, CoordinatorConfig, PollingConfig, SyncConfig,
    TransportConfig,
};
