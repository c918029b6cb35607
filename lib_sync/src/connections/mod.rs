//! # Connections Module
//!
//! The local cache store and the storage engines behind it.

/// TTL and LRU cache store, entry types and the backend trait.
pub mod cache_store;

/// In-process backend.
pub mod cache_memory;

/// Module for Redis cache operations and connection handling.
#[cfg(feature = "redis-cache")]
pub mod cache_redis;

pub use cache_memory::MemoryBackend;
pub use cache_store::{
    CacheBackend, CacheEntry, CacheStats, CleanupReport, LocalCacheStore, SetOptions,
};
