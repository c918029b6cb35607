//! # lib_sync
//!
//! Real-time synchronization layer. Keeps a consumer's view of server-side
//! resources fresh by reconciling three update sources into one value per
//! resource:
//!
//! - a persistent push channel ([`ingestors::push_wss::TransportClient`]),
//! - an adaptive pull scheduler ([`ingestors::polling::PollingScheduler`]),
//! - a local TTL/LRU cache ([`connections::cache_store::LocalCacheStore`]),
//!
//! composed by the [`coordinator::SyncCoordinator`].

// Declare the modules to re-export
pub mod configs;
pub mod connections;
pub mod coordinator;
pub mod core;
pub mod error;
pub mod ingestors;
#[cfg(feature = "http-fetch")]
pub mod retrieve;

// Re-export the main entry points
pub use configs::{ConfigError, SyncConfig};
pub use connections::{CacheEntry, LocalCacheStore, SetOptions};
pub use coordinator::{
    OperationMode, ResourceDescriptor, ResourceHandle, ResourceSnapshot, SyncCoordinator,
    SyncStats, UpdateSource,
};
pub use crate::core::{Clock, ManualClock, SharedEnvironment, Subscription, SystemClock};
pub use error::SyncError;
pub use ingestors::{
    ConnectionStatus, PollTask, PollingScheduler, Priority, TransportClient,
};
