//! # Local Cache Store
//!
//! TTL-aware, size-bounded key/value cache in front of a pluggable storage
//! engine. The cache is an optimisation only: every storage failure is logged
//! and reported to the caller as a miss (or a no-op for writes).
//!
//! ## Expiry and eviction
//!
//! An entry is expired once `now - timestamp > ttl`. Reads delete expired
//! entries on sight. The periodic [`cleanup`](LocalCacheStore::cleanup) sweep
//! deletes every expired entry and then, only while the total size is still
//! above the budget, evicts entries in oldest-`last_access`-first order.
//!
//! ## Conditional requests
//!
//! Entries remember the `ETag` and `Last-Modified` validators of the response
//! they came from, so callers can issue conditional fetches and keep the
//! cached value on `304 Not Modified`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::cache_memory::MemoryBackend;
use crate::configs::{CacheBackendKind, CacheConfig};
use crate::core::clock::{Clock, SystemClock};
use crate::error::SyncError;

/// Eviction pulls LRU candidates from the backend in batches of this size.
const EVICTION_BATCH: usize = 32;

/// One cached value with its bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub key: String,
    pub data: Value,
    /// Write time, Unix milliseconds.
    pub timestamp: u64,
    /// Lifetime in milliseconds.
    pub ttl: u64,
    #[serde(default)]
    pub etag: Option<String>,
    #[serde(default)]
    pub last_modified: Option<String>,
    /// Serialized size of `data` in bytes.
    pub size: usize,
    pub access_count: u64,
    /// Last read time, Unix milliseconds.
    pub last_access: u64,
}

impl CacheEntry {
    /// Instant after which the entry is expired.
    pub fn expires_at(&self) -> u64 {
        self.timestamp.saturating_add(self.ttl)
    }

    /// `now - timestamp > ttl`.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.timestamp) > self.ttl
    }
}

/// Storage engine behind the cache. Implementations keep secondary indices on
/// expiry and last access so sweeps never scan every entry.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Inserts or replaces an entry.
    async fn put(&self, entry: CacheEntry) -> Result<(), SyncError>;
    /// Reads an entry without touching its access bookkeeping.
    async fn fetch(&self, key: &str) -> Result<Option<CacheEntry>, SyncError>;
    /// Bumps `access_count`, sets `last_access` and returns the updated entry.
    async fn touch(&self, key: &str, now_ms: u64) -> Result<Option<CacheEntry>, SyncError>;
    /// Deletes an entry, returning its size if it existed.
    async fn remove(&self, key: &str) -> Result<Option<usize>, SyncError>;
    /// All stored keys.
    async fn keys(&self) -> Result<Vec<String>, SyncError>;
    /// Keys whose expiry instant is strictly before `now_ms`.
    async fn expired_keys(&self, now_ms: u64) -> Result<Vec<String>, SyncError>;
    /// Up to `limit` keys, least recently accessed first.
    async fn least_recently_used(&self, limit: usize) -> Result<Vec<String>, SyncError>;
    /// Sum of entry sizes.
    async fn total_size(&self) -> Result<usize, SyncError>;
    /// Number of entries.
    async fn len(&self) -> Result<usize, SyncError>;
    /// Deletes everything.
    async fn clear(&self) -> Result<(), SyncError>;
}

/// Per-write options.
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    /// Overrides the configured default TTL.
    pub ttl: Option<Duration>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl SetOptions {
    /// Options with only a TTL.
    pub fn ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            ..Self::default()
        }
    }
}

/// Result of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub expired: usize,
    pub evicted: usize,
    pub bytes_after: usize,
}

/// Size and traffic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: usize,
    pub max_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub expirations: u64,
    pub evictions: u64,
}

/// TTL and LRU cache over a [`CacheBackend`].
pub struct LocalCacheStore {
    backend: Arc<dyn CacheBackend>,
    clock: Arc<dyn Clock>,
    config: CacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
    expirations: AtomicU64,
    evictions: AtomicU64,
}

impl LocalCacheStore {
    /// Cache over `backend`, timestamped by `clock`.
    pub fn new(backend: Arc<dyn CacheBackend>, clock: Arc<dyn Clock>, config: CacheConfig) -> Self {
        Self {
            backend,
            clock,
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// In-memory cache on the system clock.
    pub fn in_memory(config: CacheConfig) -> Self {
        Self::new(Arc::new(MemoryBackend::new()), Arc::new(SystemClock), config)
    }

    /// Builds the backend named by `config.backend`.
    pub async fn from_config(config: CacheConfig) -> Result<Self, SyncError> {
        match &config.backend {
            CacheBackendKind::Memory => Ok(Self::in_memory(config)),
            #[cfg(feature = "redis-cache")]
            CacheBackendKind::Redis { url, prefix } => {
                let backend = super::cache_redis::RedisBackend::connect(url, prefix).await?;
                Ok(Self::new(Arc::new(backend), Arc::new(SystemClock), config))
            }
            #[cfg(not(feature = "redis-cache"))]
            CacheBackendKind::Redis { .. } => Err(SyncError::Config(
                "redis cache backend requires the `redis-cache` feature".to_string(),
            )),
        }
    }

    /// Stores `data` under `key`, replacing any previous entry. Returns false
    /// if the backend failed.
    pub async fn set(&self, key: &str, data: Value, options: SetOptions) -> bool {
        let now = self.clock.now_ms();
        let ttl = options.ttl.unwrap_or_else(|| self.config.default_ttl());
        let entry = CacheEntry {
            key: key.to_string(),
            size: data.to_string().len(),
            data,
            timestamp: now,
            ttl: ttl.as_millis() as u64,
            etag: options.etag,
            last_modified: options.last_modified,
            access_count: 0,
            last_access: now,
        };

        match self.backend.put(entry).await {
            Ok(()) => true,
            Err(err) => {
                log::warn!("[cache] set '{}' failed: {}", key, err);
                false
            }
        }
    }

    /// Value under `key`, or `None` when absent, expired or unreadable.
    pub async fn get(&self, key: &str) -> Option<Value> {
        self.get_with_metadata(key).await.map(|entry| entry.data)
    }

    /// Like [`get`](Self::get) but returns the whole entry.
    pub async fn get_with_metadata(&self, key: &str) -> Option<CacheEntry> {
        let now = self.clock.now_ms();
        let entry = match self.backend.fetch(key).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return self.miss(),
            Err(err) => {
                log::warn!("[cache] read '{}' failed: {}", key, err);
                return self.miss();
            }
        };

        if entry.is_expired(now) {
            log::debug!("[cache] '{}' expired, purging", key);
            self.expirations.fetch_add(1, Ordering::Relaxed);
            if let Err(err) = self.backend.remove(key).await {
                log::warn!("[cache] purge '{}' failed: {}", key, err);
            }
            return self.miss();
        }

        match self.backend.touch(key, now).await {
            Ok(Some(touched)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(touched)
            }
            Ok(None) => self.miss(),
            Err(err) => {
                // The value is still good; only the LRU bookkeeping was lost.
                log::warn!("[cache] touch '{}' failed: {}", key, err);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry)
            }
        }
    }

    /// Deletes `key`. Returns true if an entry was removed.
    pub async fn delete(&self, key: &str) -> bool {
        match self.backend.remove(key).await {
            Ok(removed) => removed.is_some(),
            Err(err) => {
                log::warn!("[cache] delete '{}' failed: {}", key, err);
                false
            }
        }
    }

    /// Deletes every key matching `pattern`. Returns how many were removed.
    pub async fn delete_by_pattern(&self, pattern: &Regex) -> usize {
        let keys = match self.backend.keys().await {
            Ok(keys) => keys,
            Err(err) => {
                log::warn!("[cache] listing keys failed: {}", err);
                return 0;
            }
        };

        let mut removed = 0;
        for key in keys.iter().filter(|k| pattern.is_match(k)) {
            if self.delete(key).await {
                removed += 1;
            }
        }
        log::debug!("[cache] pattern {} removed {} entries", pattern, removed);
        removed
    }

    /// True if the live entry under `key` carries exactly `etag`.
    pub async fn validate_etag(&self, key: &str, etag: &str) -> bool {
        self.peek(key)
            .await
            .is_some_and(|e| e.etag.as_deref() == Some(etag))
    }

    /// True if the live entry under `key` carries exactly `last_modified`.
    pub async fn validate_last_modified(&self, key: &str, last_modified: &str) -> bool {
        self.peek(key)
            .await
            .is_some_and(|e| e.last_modified.as_deref() == Some(last_modified))
    }

    /// Deletes expired entries, then evicts least-recently-used entries while
    /// the total size exceeds the budget.
    pub async fn cleanup(&self) -> CleanupReport {
        let now = self.clock.now_ms();
        let mut report = CleanupReport::default();

        match self.backend.expired_keys(now).await {
            Ok(keys) => {
                for key in keys {
                    if matches!(self.backend.remove(&key).await, Ok(Some(_))) {
                        report.expired += 1;
                    }
                }
            }
            Err(err) => log::warn!("[cache] expiry sweep failed: {}", err),
        }
        self.expirations
            .fetch_add(report.expired as u64, Ordering::Relaxed);

        let mut total = match self.backend.total_size().await {
            Ok(total) => total,
            Err(err) => {
                log::warn!("[cache] size query failed: {}", err);
                return report;
            }
        };

        let budget = self.config.max_size_bytes;
        while total > budget {
            let batch = match self.backend.least_recently_used(EVICTION_BATCH).await {
                Ok(batch) if !batch.is_empty() => batch,
                Ok(_) => break,
                Err(err) => {
                    log::warn!("[cache] LRU query failed: {}", err);
                    break;
                }
            };
            for key in batch {
                if total <= budget {
                    break;
                }
                match self.backend.remove(&key).await {
                    Ok(Some(size)) => {
                        total = total.saturating_sub(size);
                        report.evicted += 1;
                    }
                    Ok(None) => {}
                    Err(err) => {
                        log::warn!("[cache] evicting '{}' failed: {}", key, err);
                        report.bytes_after = total;
                        return report;
                    }
                }
            }
        }
        self.evictions
            .fetch_add(report.evicted as u64, Ordering::Relaxed);
        report.bytes_after = total;

        if report.expired + report.evicted > 0 {
            log::info!(
                "[cache] sweep: {} expired, {} evicted, {} bytes left",
                report.expired,
                report.evicted,
                total
            );
        }
        report
    }

    /// Deletes every entry.
    pub async fn clear(&self) -> bool {
        match self.backend.clear().await {
            Ok(()) => true,
            Err(err) => {
                log::warn!("[cache] clear failed: {}", err);
                false
            }
        }
    }

    /// Current counters. Size figures fall back to zero when the backend fails.
    pub async fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.backend.len().await.unwrap_or(0),
            total_bytes: self.backend.total_size().await.unwrap_or(0),
            max_bytes: self.config.max_size_bytes,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// Runs [`cleanup`](Self::cleanup) every `cleanup_interval` until `cancel` fires.
    pub fn spawn_cleanup(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let store = Arc::clone(self);
        let period = self.config.cleanup_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        store.cleanup().await;
                    }
                }
            }
            log::debug!("[cache] sweep task stopped");
        })
    }

    async fn peek(&self, key: &str) -> Option<CacheEntry> {
        match self.backend.fetch(key).await {
            Ok(Some(entry)) if !entry.is_expired(self.clock.now_ms()) => Some(entry),
            Ok(_) => None,
            Err(err) => {
                log::warn!("[cache] read '{}' failed: {}", key, err);
                None
            }
        }
    }

    fn miss<T>(&self) -> Option<T> {
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }
}
