//! Consumer-visible reconciled state and counters.

use std::ops::AddAssign;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

/// Which source produced the current value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateSource {
    /// Local cache read.
    Cache,
    /// Push notification.
    Push,
    /// Any fetch: scheduled poll, manual refetch, invalidation or fallback refresh.
    Poll,
}

/// Running counters for one resource, or summed over all of them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStats {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub push_updates: u64,
    pub poll_executions: u64,
    pub poll_failures: u64,
    /// Updates dropped because a later-requested update was already applied.
    pub stale_discarded: u64,
    pub invalidations: u64,
    pub fallback_refreshes: u64,
}

impl SyncStats {
    /// Hits over lookups, `0.0` before the first lookup.
    pub fn cache_hit_rate(&self) -> f64 {
        let lookups = self.cache_hits + self.cache_misses;
        if lookups == 0 {
            0.0
        } else {
            self.cache_hits as f64 / lookups as f64
        }
    }
}

impl AddAssign for SyncStats {
    fn add_assign(&mut self, other: Self) {
        self.cache_hits += other.cache_hits;
        self.cache_misses += other.cache_misses;
        self.push_updates += other.push_updates;
        self.poll_executions += other.poll_executions;
        self.poll_failures += other.poll_failures;
        self.stale_discarded += other.stale_discarded;
        self.invalidations += other.invalidations;
        self.fallback_refreshes += other.fallback_refreshes;
    }
}

/// The reconciled view of one resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSnapshot {
    pub key: String,
    /// `None` until any source has produced a value.
    pub data: Option<Value>,
    /// No value yet and one is being produced.
    pub is_loading: bool,
    /// A fetch is in flight.
    pub is_validating: bool,
    pub last_update_source: Option<UpdateSource>,
    pub last_update_time: Option<DateTime<Utc>>,
    /// Sequence number of the applied update.
    pub seq: u64,
    /// Set while the push transport has given up and fallback refreshes run.
    pub degraded: bool,
    /// Message of the most recent failed fetch, cleared by the next applied update.
    pub error: Option<String>,
    pub cache_hit_rate: f64,
    pub stats: SyncStats,
}

impl ResourceSnapshot {
    pub(crate) fn initial(key: &str) -> Self {
        Self {
            key: key.to_string(),
            data: None,
            is_loading: true,
            is_validating: false,
            last_update_source: None,
            last_update_time: None,
            seq: 0,
            degraded: false,
            error: None,
            cache_hit_rate: 0.0,
            stats: SyncStats::default(),
        }
    }
}
