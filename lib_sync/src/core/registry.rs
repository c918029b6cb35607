//! # Subscription Registry
//!
//! Reference-counted record of the channels the push client is subscribed to.
//! Many listeners may share one channel; the server only hears about the
//! first `subscribe` and the last `unsubscribe`.
use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A channel on the push transport: a resource type, optionally narrowed to one
/// record and/or by filters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    /// Resource type, e.g. `orders`.
    pub resource_type: String,
    /// Single record id, if narrowed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    /// Server-side filters, kept sorted.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub filters: BTreeMap<String, Value>,
}

impl Subscription {
    /// Subscription to every change of `resource_type`.
    pub fn new(resource_type: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            resource_id: None,
            filters: BTreeMap::new(),
        }
    }

    /// Narrows the subscription to one record.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.resource_id = Some(id.into());
        self
    }

    /// Adds a server-side filter.
    pub fn with_filter(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.insert(name.into(), value.into());
        self
    }

    /// Deterministic composite key: `type[:id][?k=v&k=v]`, filters sorted by name.
    pub fn key(&self) -> String {
        let mut key = self.resource_type.clone();
        if let Some(id) = &self.resource_id {
            key.push(':');
            key.push_str(id);
        }
        if !self.filters.is_empty() {
            let query: Vec<String> = self
                .filters
                .iter()
                .map(|(name, value)| format!("{}={}", name, render_filter(value)))
                .collect();
            key.push('?');
            key.push_str(&query.join("&"));
        }
        key
    }
}

fn render_filter(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

struct RegistryEntry {
    subscription: Subscription,
    listeners: u32,
}

/// Outcome of releasing one listener.
#[derive(Debug, Clone, PartialEq)]
pub enum Release {
    /// Other listeners still hold the channel.
    Retained(u32),
    /// The last listener left; the entry is gone.
    Removed(Subscription),
    /// The key was never registered.
    Unknown,
}

/// Channel registry keyed by [`Subscription::key`].
#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: HashMap<String, RegistryEntry>,
}

impl SubscriptionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a listener. Returns the key and whether this created the entry.
    pub fn subscribe(&mut self, subscription: Subscription) -> (String, bool) {
        let key = subscription.key();

        let entry = self
            .entries
            .entry(key.clone())
            .or_insert_with(|| RegistryEntry {
                subscription,
                listeners: 0,
            });

        entry.listeners += 1;
        let created = entry.listeners == 1;
        if created {
            log::debug!("[registry] new channel {}", key);
        }
        (key, created)
    }

    /// Drops one listener from `key`, removing the entry at zero.
    pub fn release(&mut self, key: &str) -> Release {
        let Some(entry) = self.entries.get_mut(key) else {
            return Release::Unknown;
        };

        entry.listeners = entry.listeners.saturating_sub(1);
        if entry.listeners > 0 {
            return Release::Retained(entry.listeners);
        }

        match self.entries.remove(key) {
            Some(removed) => {
                log::debug!("[registry] channel {} released", key);
                Release::Removed(removed.subscription)
            }
            None => Release::Unknown,
        }
    }

    /// Looks up the subscription behind `key`.
    pub fn get(&self, key: &str) -> Option<&Subscription> {
        self.entries.get(key).map(|e| &e.subscription)
    }

    /// Current listener count for `key` (0 if absent).
    pub fn listener_count(&self, key: &str) -> u32 {
        self.entries.get(key).map_or(0, |e| e.listeners)
    }

    /// Number of distinct channels.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no channel is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All channels, sorted by key so resubscription order is stable.
    pub fn snapshot(&self) -> Vec<(String, Subscription)> {
        let mut all: Vec<(String, Subscription)> = self
            .entries
            .iter()
            .map(|(k, e)| (k.clone(), e.subscription.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }
}
