//! # Redis Cache Backend
//!
//! Durable [`CacheBackend`] on Redis, so cached resources survive restarts of
//! the process.
//!
//! ## Layout
//! With the configured prefix `p`:
//! - `p entry:<key>`: JSON-serialized [`CacheEntry`].
//! - `p idx:expiry`: sorted set, member `<key>`, score `expires_at`.
//! - `p idx:access`: sorted set, member `<key>`, score `last_access`.
//! - `p idx:size`: hash `<key>` to entry size.
//!
//! Writes and removals update the entry and all three indices in one
//! `MULTI/EXEC` pipeline. Equal access scores are ordered lexicographically by
//! Redis.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, RedisError};

use super::cache_store::{CacheBackend, CacheEntry};
use crate::error::SyncError;

fn cache_err(err: RedisError) -> SyncError {
    SyncError::Cache(format!("redis: {}", err))
}

/// Redis-backed cache storage.
pub struct RedisBackend {
    manager: ConnectionManager,
    prefix: String,
}

impl RedisBackend {
    /// Opens a managed, auto-reconnecting connection to `url`.
    ///
    /// # Arguments
    /// * `url` - The redis URL (e.g., "redis://127.0.0.1/").
    /// * `prefix` - Namespace for every key this backend writes.
    pub async fn connect(url: &str, prefix: &str) -> Result<Self, SyncError> {
        let client = Client::open(url).map_err(cache_err)?;
        let manager = ConnectionManager::new(client).await.map_err(cache_err)?;
        log::info!("[cache] redis backend connected, prefix '{}'", prefix);
        Ok(Self {
            manager,
            prefix: prefix.to_string(),
        })
    }

    fn entry_key(&self, key: &str) -> String {
        format!("{}entry:{}", self.prefix, key)
    }

    fn expiry_index(&self) -> String {
        format!("{}idx:expiry", self.prefix)
    }

    fn access_index(&self) -> String {
        format!("{}idx:access", self.prefix)
    }

    fn size_index(&self) -> String {
        format!("{}idx:size", self.prefix)
    }

    async fn write(&self, entry: &CacheEntry) -> Result<(), SyncError> {
        let body = serde_json::to_string(entry).map_err(|e| SyncError::Cache(e.to_string()))?;
        let mut conn = self.manager.clone();
        redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(self.entry_key(&entry.key))
            .arg(body)
            .ignore()
            .cmd("ZADD")
            .arg(self.expiry_index())
            .arg(entry.expires_at())
            .arg(&entry.key)
            .ignore()
            .cmd("ZADD")
            .arg(self.access_index())
            .arg(entry.last_access)
            .arg(&entry.key)
            .ignore()
            .cmd("HSET")
            .arg(self.size_index())
            .arg(&entry.key)
            .arg(entry.size)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(cache_err)
    }
}

#[async_trait]
impl CacheBackend for RedisBackend {
    async fn put(&self, entry: CacheEntry) -> Result<(), SyncError> {
        self.write(&entry).await
    }

    async fn fetch(&self, key: &str) -> Result<Option<CacheEntry>, SyncError> {
        let mut conn = self.manager.clone();
        let body: Option<String> = redis::cmd("GET")
            .arg(self.entry_key(key))
            .query_async(&mut conn)
            .await
            .map_err(cache_err)?;

        match body {
            Some(body) => serde_json::from_str(&body)
                .map(Some)
                .map_err(|e| SyncError::Cache(format!("corrupt entry '{}': {}", key, e))),
            None => Ok(None),
        }
    }

    async fn touch(&self, key: &str, now_ms: u64) -> Result<Option<CacheEntry>, SyncError> {
        let Some(mut entry) = self.fetch(key).await? else {
            return Ok(None);
        };
        entry.access_count += 1;
        entry.last_access = now_ms;
        self.write(&entry).await?;
        Ok(Some(entry))
    }

    async fn remove(&self, key: &str) -> Result<Option<usize>, SyncError> {
        let mut conn = self.manager.clone();
        let size: Option<usize> = redis::cmd("HGET")
            .arg(self.size_index())
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(cache_err)?;

        redis::pipe()
            .atomic()
            .cmd("DEL")
            .arg(self.entry_key(key))
            .ignore()
            .cmd("ZREM")
            .arg(self.expiry_index())
            .arg(key)
            .ignore()
            .cmd("ZREM")
            .arg(self.access_index())
            .arg(key)
            .ignore()
            .cmd("HDEL")
            .arg(self.size_index())
            .arg(key)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(cache_err)?;

        Ok(size)
    }

    async fn keys(&self) -> Result<Vec<String>, SyncError> {
        let mut conn = self.manager.clone();
        let mut keys: Vec<String> = redis::cmd("HKEYS")
            .arg(self.size_index())
            .query_async(&mut conn)
            .await
            .map_err(cache_err)?;
        keys.sort();
        Ok(keys)
    }

    async fn expired_keys(&self, now_ms: u64) -> Result<Vec<String>, SyncError> {
        let mut conn = self.manager.clone();
        redis::cmd("ZRANGEBYSCORE")
            .arg(self.expiry_index())
            .arg("-inf")
            .arg(format!("({}", now_ms))
            .query_async(&mut conn)
            .await
            .map_err(cache_err)
    }

    async fn least_recently_used(&self, limit: usize) -> Result<Vec<String>, SyncError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.manager.clone();
        redis::cmd("ZRANGE")
            .arg(self.access_index())
            .arg(0)
            .arg(limit as isize - 1)
            .query_async(&mut conn)
            .await
            .map_err(cache_err)
    }

    async fn total_size(&self) -> Result<usize, SyncError> {
        let mut conn = self.manager.clone();
        let sizes: Vec<usize> = redis::cmd("HVALS")
            .arg(self.size_index())
            .query_async(&mut conn)
            .await
            .map_err(cache_err)?;
        Ok(sizes.into_iter().sum())
    }

    async fn len(&self) -> Result<usize, SyncError> {
        let mut conn = self.manager.clone();
        redis::cmd("HLEN")
            .arg(self.size_index())
            .query_async(&mut conn)
            .await
            .map_err(cache_err)
    }

    async fn clear(&self) -> Result<(), SyncError> {
        let keys = self.keys().await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        for key in &keys {
            pipe.cmd("DEL").arg(self.entry_key(key)).ignore();
        }
        pipe.cmd("DEL")
            .arg(self.expiry_index())
            .arg(self.access_index())
            .arg(self.size_index())
            .ignore();

        let mut conn = self.manager.clone();
        pipe.query_async::<()>(&mut conn).await.map_err(cache_err)?;
        log::info!("[cache] redis backend cleared {} entries", keys.len());
        Ok(())
    }
}
