//! Resource registrations and the per-resource control handle.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use super::state::ResourceSnapshot;
use crate::core::registry::Subscription;
use crate::ingestors::frames::NotificationMessage;
use crate::ingestors::polling::{PollingScheduler, Priority};
use crate::ingestors::push_wss::TransportClient;

/// Validators of the value currently held, for conditional fetches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchContext {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

/// Result of one fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched {
    pub data: Value,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    /// The server confirmed the held value is current; `data` is meaningless.
    pub not_modified: bool,
}

impl Fetched {
    /// A full response without validators.
    pub fn data(data: Value) -> Self {
        Self {
            data,
            etag: None,
            last_modified: None,
            not_modified: false,
        }
    }

    /// A `304 Not Modified`.
    pub fn not_modified() -> Self {
        Self {
            data: Value::Null,
            etag: None,
            last_modified: None,
            not_modified: true,
        }
    }
}

/// Async fetch of a resource. Failure is an `Err`, never a sentinel value.
pub type ResourceFetcher =
    Arc<dyn Fn(FetchContext) -> BoxFuture<'static, anyhow::Result<Fetched>> + Send + Sync>;

/// How a push notification that cannot be merged is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateClass {
    /// Invalidate and refetch immediately.
    Urgent,
    /// Invalidate at the end of the throttle window, coalesced.
    Routine,
}

/// Classifies notifications for one resource.
pub type Classifier = Arc<dyn Fn(&NotificationMessage) -> UpdateClass + Send + Sync>;

/// Everything the coordinator needs to track one resource.
#[derive(Clone)]
pub struct ResourceDescriptor {
    pub(crate) key: String,
    pub(crate) fetcher: ResourceFetcher,
    pub(crate) subscription: Option<Subscription>,
    pub(crate) polling: bool,
    pub(crate) interval: Option<Duration>,
    pub(crate) priority: Priority,
    pub(crate) ttl: Option<Duration>,
    pub(crate) urgent_events: HashSet<String>,
    pub(crate) classifier: Option<Classifier>,
    pub(crate) merge_push: bool,
}

impl ResourceDescriptor {
    /// Resource `key` fetched with a conditional-request-aware `fetch`.
    pub fn new<F, Fut>(key: impl Into<String>, fetch: F) -> Self
    where
        F: Fn(FetchContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Fetched>> + Send + 'static,
    {
        let fetcher: ResourceFetcher = Arc::new(
            move |ctx: FetchContext| -> BoxFuture<'static, anyhow::Result<Fetched>> {
                Box::pin(fetch(ctx))
            },
        );
        Self::with_fetcher(key, fetcher)
    }

    /// Resource `key` fetched with a plain zero-argument `fetch`.
    pub fn plain<F, Fut>(key: impl Into<String>, fetch: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self::new(key, move |_ctx: FetchContext| {
            let pending = fetch();
            async move { pending.await.map(Fetched::data) }
        })
    }

    /// Resource `key` with an already boxed fetcher.
    pub fn with_fetcher(key: impl Into<String>, fetcher: ResourceFetcher) -> Self {
        Self {
            key: key.into(),
            fetcher,
            subscription: None,
            polling: true,
            interval: None,
            priority: Priority::Normal,
            ttl: None,
            urgent_events: HashSet::new(),
            classifier: None,
            merge_push: true,
        }
    }

    /// Push channel carrying updates for this resource.
    pub fn subscribe(mut self, subscription: Subscription) -> Self {
        self.subscription = Some(subscription);
        self
    }

    /// Polling interval; the scheduler default otherwise.
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// No poll task; updates come from push, manual refetches and fallback refreshes.
    pub fn without_polling(mut self) -> Self {
        self.polling = false;
        self
    }

    /// Cache TTL for this resource; the cache default otherwise.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Event names (case-insensitive) treated as urgent.
    pub fn urgent_events<I, S>(mut self, events: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.urgent_events
            .extend(events.into_iter().map(|e| e.as_ref().to_ascii_lowercase()));
        self
    }

    /// Custom classification; replaces [`urgent_events`](Self::urgent_events).
    pub fn classify(
        mut self,
        classifier: impl Fn(&NotificationMessage) -> UpdateClass + Send + Sync + 'static,
    ) -> Self {
        self.classifier = Some(Arc::new(classifier));
        self
    }

    /// When false, every notification only invalidates instead of patching the value.
    pub fn merge_push(mut self, merge: bool) -> Self {
        self.merge_push = merge;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub(crate) fn class_of(&self, message: &NotificationMessage) -> UpdateClass {
        match &self.classifier {
            Some(classify) => classify(message),
            None if self
                .urgent_events
                .contains(&message.event.to_ascii_lowercase()) =>
            {
                UpdateClass::Urgent
            }
            None => UpdateClass::Routine,
        }
    }
}

/// Requests handled by the resource task.
#[derive(Debug)]
pub(crate) enum ResourceCommand {
    Refetch,
    Invalidate,
    ClearCache,
}

/// Consumer handle for one tracked resource.
#[derive(Clone)]
pub struct ResourceHandle {
    pub(crate) key: String,
    pub(crate) commands: mpsc::UnboundedSender<ResourceCommand>,
    pub(crate) snapshots: watch::Receiver<ResourceSnapshot>,
    pub(crate) scheduler: Arc<PollingScheduler>,
    pub(crate) transport: Arc<TransportClient>,
}

impl ResourceHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current reconciled state.
    pub fn snapshot(&self) -> ResourceSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Receiver that sees every state change.
    pub fn changes(&self) -> watch::Receiver<ResourceSnapshot> {
        self.snapshots.clone()
    }

    /// Current value, if any.
    pub fn data(&self) -> Option<serde_json::Value> {
        self.snapshots.borrow().data.clone()
    }

    pub fn cache_hit_rate(&self) -> f64 {
        self.snapshots.borrow().cache_hit_rate
    }

    /// Fetches now, keeping the cached value.
    pub fn refetch(&self) {
        self.send(ResourceCommand::Refetch);
    }

    /// Drops the cached value and fetches now.
    pub fn invalidate(&self) {
        self.send(ResourceCommand::Invalidate);
    }

    /// Drops the cached value only.
    pub fn clear_cache(&self) {
        self.send(ResourceCommand::ClearCache);
    }

    pub fn pause_polling(&self) -> bool {
        self.scheduler.pause_task(&self.key)
    }

    pub fn resume_polling(&self) -> bool {
        self.scheduler.resume_task(&self.key)
    }

    /// Reopens the shared push connection.
    pub fn reconnect(&self) {
        self.transport.reconnect();
    }

    fn send(&self, command: ResourceCommand) {
        if self.commands.send(command).is_err() {
            log::debug!("[sync] '{}' is no longer tracked", self.key);
        }
    }
}
