//! In-process cache backend.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;

use super::cache_store::{CacheBackend, CacheEntry};
use crate::core::lock_or_recover;
use crate::error::SyncError;

#[derive(Default)]
struct State {
    entries: HashMap<String, (CacheEntry, u64)>,
    // (expires_at, key)
    by_expiry: BTreeSet<(u64, String)>,
    // (last_access, write sequence, key); the sequence breaks ties in insertion order
    by_access: BTreeSet<(u64, u64, String)>,
    total: usize,
    seq: u64,
}

impl State {
    fn unlink(&mut self, key: &str) -> Option<CacheEntry> {
        let (entry, seq) = self.entries.remove(key)?;
        self.by_expiry.remove(&(entry.expires_at(), key.to_string()));
        self.by_access.remove(&(entry.last_access, seq, key.to_string()));
        self.total = self.total.saturating_sub(entry.size);
        Some(entry)
    }

    fn link(&mut self, entry: CacheEntry, seq: u64) {
        self.by_expiry.insert((entry.expires_at(), entry.key.clone()));
        self.by_access
            .insert((entry.last_access, seq, entry.key.clone()));
        self.total += entry.size;
        self.entries.insert(entry.key.clone(), (entry, seq));
    }
}

/// `HashMap` storage with ordered expiry and access indices.
#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<State>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn put(&self, entry: CacheEntry) -> Result<(), SyncError> {
        let mut state = lock_or_recover(&self.state);
        state.unlink(&entry.key);
        state.seq += 1;
        let seq = state.seq;
        state.link(entry, seq);
        Ok(())
    }

    async fn fetch(&self, key: &str) -> Result<Option<CacheEntry>, SyncError> {
        let state = lock_or_recover(&self.state);
        Ok(state.entries.get(key).map(|(entry, _)| entry.clone()))
    }

    async fn touch(&self, key: &str, now_ms: u64) -> Result<Option<CacheEntry>, SyncError> {
        let mut state = lock_or_recover(&self.state);
        let Some((old_access, seq)) = state
            .entries
            .get(key)
            .map(|(entry, seq)| (entry.last_access, *seq))
        else {
            return Ok(None);
        };

        state.by_access.remove(&(old_access, seq, key.to_string()));
        state.by_access.insert((now_ms, seq, key.to_string()));
        let entry = match state.entries.get_mut(key) {
            Some((entry, _)) => entry,
            None => return Ok(None),
        };
        entry.access_count += 1;
        entry.last_access = now_ms;
        Ok(Some(entry.clone()))
    }

    async fn remove(&self, key: &str) -> Result<Option<usize>, SyncError> {
        let mut state = lock_or_recover(&self.state);
        Ok(state.unlink(key).map(|entry| entry.size))
    }

    async fn keys(&self) -> Result<Vec<String>, SyncError> {
        let state = lock_or_recover(&self.state);
        let mut keys: Vec<String> = state.entries.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    async fn expired_keys(&self, now_ms: u64) -> Result<Vec<String>, SyncError> {
        let state = lock_or_recover(&self.state);
        Ok(state
            .by_expiry
            .iter()
            .take_while(|(expires_at, _)| *expires_at < now_ms)
            .map(|(_, key)| key.clone())
            .collect())
    }

    async fn least_recently_used(&self, limit: usize) -> Result<Vec<String>, SyncError> {
        let state = lock_or_recover(&self.state);
        Ok(state
            .by_access
            .iter()
            .take(limit)
            .map(|(_, _, key)| key.clone())
            .collect())
    }

    async fn total_size(&self) -> Result<usize, SyncError> {
        Ok(lock_or_recover(&self.state).total)
    }

    async fn len(&self) -> Result<usize, SyncError> {
        Ok(lock_or_recover(&self.state).entries.len())
    }

    async fn clear(&self) -> Result<(), SyncError> {
        *lock_or_recover(&self.state) = State::default();
        Ok(())
    }
}
