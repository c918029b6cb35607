//! # Reconciliation Coordinator
//!
//! Owns one task per tracked resource. The task is the only writer of that
//! resource's [`ResourceSnapshot`]; cache reads, fetch results (poll, manual,
//! invalidation, fallback) and push notifications all reach it as messages and
//! are applied one at a time.
//!
//! ## Precedence
//! Every update is stamped with a per-resource sequence number when it is
//! requested: the registration-time cache read, the start of each fetch, the
//! arrival of each push notification. An update is applied only if its number
//! is higher than the last applied one, otherwise it is counted in
//! `stale_discarded` and dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use super::fallback::{spawn_mode_monitor, OperationMode};
use super::merge::{merge, MergeOutcome};
use super::resource::{
    FetchContext, Fetched, ResourceCommand, ResourceDescriptor, ResourceFetcher, ResourceHandle,
    UpdateClass,
};
use super::state::{ResourceSnapshot, SyncStats, UpdateSource};
use super::throttle::Throttle;
use crate::configs::CoordinatorConfig;
use crate::connections::cache_store::{CacheEntry, LocalCacheStore, SetOptions};
use crate::core::dispatcher::{ListenerTopic, NotificationListener};
use crate::core::lock_or_recover;
use crate::error::SyncError;
use crate::ingestors::frames::NotificationMessage;
use crate::ingestors::polling::{PollTask, PollingScheduler};
use crate::ingestors::push_wss::TransportClient;

const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365);

/// Why a fetch was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchOrigin {
    Initial,
    Poll,
    Manual,
    Invalidation,
    Fallback,
}

enum ResourceEvent {
    CacheRead {
        seq: u64,
        entry: Option<CacheEntry>,
    },
    FetchStarted,
    FetchFinished {
        seq: u64,
        origin: FetchOrigin,
        result: Result<Fetched, String>,
    },
}

/// Runs the resource fetcher on behalf of the poll task and the resource task.
struct FetchRunner {
    key: String,
    fetcher: ResourceFetcher,
    seq: Arc<AtomicU64>,
    validators: Mutex<FetchContext>,
    events: mpsc::UnboundedSender<ResourceEvent>,
}

impl FetchRunner {
    async fn run(self: Arc<Self>, origin: FetchOrigin) -> anyhow::Result<Value> {
        let seq = next_seq(&self.seq);
        let _ = self.events.send(ResourceEvent::FetchStarted);
        let ctx = lock_or_recover(&self.validators).clone();

        log::debug!("[sync] '{}' fetch #{} ({:?})", self.key, seq, origin);
        let result = (self.fetcher)(ctx).await;

        let _ = self.events.send(ResourceEvent::FetchFinished {
            seq,
            origin,
            result: match &result {
                Ok(fetched) => Ok(fetched.clone()),
                Err(e) => Err(format!("{:#}", e)),
            },
        });
        result.map(|fetched| fetched.data)
    }

    fn remember(&self, etag: Option<String>, last_modified: Option<String>) {
        *lock_or_recover(&self.validators) = FetchContext {
            etag,
            last_modified,
        };
    }
}

fn next_seq(counter: &AtomicU64) -> u64 {
    counter.fetch_add(1, Ordering::SeqCst) + 1
}

struct Tracked {
    handle: ResourceHandle,
    cancel: CancellationToken,
    subscription_key: Option<String>,
    listener_id: Option<u64>,
}

/// Merges cache, push and poll into one reconciled value per resource.
pub struct SyncCoordinator {
    config: CoordinatorConfig,
    transport: Arc<TransportClient>,
    scheduler: Arc<PollingScheduler>,
    cache: Arc<LocalCacheStore>,
    resources: Mutex<HashMap<String, Tracked>>,
    mode_rx: watch::Receiver<OperationMode>,
    cancel: CancellationToken,
}

impl SyncCoordinator {
    /// Wires the coordinator to its three sources and starts following the
    /// transport state.
    pub fn new(
        config: CoordinatorConfig,
        transport: Arc<TransportClient>,
        scheduler: Arc<PollingScheduler>,
        cache: Arc<LocalCacheStore>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let (mode_tx, mode_rx) = watch::channel(OperationMode::Idle);
        spawn_mode_monitor(transport.state_changes(), mode_tx, cancel.child_token());

        Self {
            config,
            transport,
            scheduler,
            cache,
            resources: Mutex::new(HashMap::new()),
            mode_rx,
            cancel,
        }
    }

    /// Starts tracking a resource, replacing any registration with the same key.
    ///
    /// The cache is read first, then the push channel is subscribed and the
    /// poll task registered. A cache miss triggers an immediate fetch.
    pub fn register(&self, descriptor: ResourceDescriptor) -> ResourceHandle {
        let key = descriptor.key.clone();
        self.unregister(&key);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(ResourceSnapshot::initial(&key));
        let seq = Arc::new(AtomicU64::new(0));
        let cancel = self.cancel.child_token();

        let runner = Arc::new(FetchRunner {
            key: key.clone(),
            fetcher: descriptor.fetcher.clone(),
            seq: Arc::clone(&seq),
            validators: Mutex::new(FetchContext::default()),
            events: event_tx.clone(),
        });

        // Stamped before anything else so a late cache read loses to every other source.
        let read_seq = next_seq(&seq);
        let cache = Arc::clone(&self.cache);
        let read_key = key.clone();
        let read_tx = event_tx;
        tokio::spawn(async move {
            let entry = cache.get_with_metadata(&read_key).await;
            let _ = read_tx.send(ResourceEvent::CacheRead {
                seq: read_seq,
                entry,
            });
        });

        let (listener, subscription_key) = match &descriptor.subscription {
            Some(subscription) => {
                let topic = match &subscription.resource_id {
                    Some(id) => ListenerTopic::Record(subscription.resource_type.clone(), id.clone()),
                    None => ListenerTopic::Resource(subscription.resource_type.clone()),
                };
                let listener = self.transport.listen(topic);
                let sub_key = self.transport.subscribe(subscription.clone());
                (Some(listener), Some(sub_key))
            }
            None => (None, None),
        };
        let listener_id = listener.as_ref().map(|l| l.id);

        if descriptor.polling {
            let poll_runner = Arc::clone(&runner);
            let mut task = PollTask::new(key.clone(), move || {
                Arc::clone(&poll_runner).run(FetchOrigin::Poll)
            })
            .priority(descriptor.priority);
            if let Some(interval) = descriptor.interval {
                task = task.interval(interval);
            }
            self.scheduler.add_task(task);
        }

        let resource = ResourceTask {
            snapshot: ResourceSnapshot::initial(&key),
            key: key.clone(),
            descriptor,
            config: self.config.clone(),
            cache: Arc::clone(&self.cache),
            runner,
            seq,
            snapshot_tx,
            events: event_rx,
            commands: command_rx,
            listener,
            mode_rx: self.mode_rx.clone(),
            mode_open: true,
            throttle: Throttle::new(self.config.throttle_window()),
            fallback_at: None,
            last_applied: 0,
            in_flight: 0,
            cache_read: false,
            cancel: cancel.clone(),
        };
        tokio::spawn(resource.run());

        let handle = ResourceHandle {
            key: key.clone(),
            commands: command_tx,
            snapshots: snapshot_rx,
            scheduler: Arc::clone(&self.scheduler),
            transport: Arc::clone(&self.transport),
        };
        lock_or_recover(&self.resources).insert(
            key.clone(),
            Tracked {
                handle: handle.clone(),
                cancel,
                subscription_key,
                listener_id,
            },
        );
        log::info!("[sync] tracking '{}'", key);
        handle
    }

    /// Stops tracking `key`: its task, poll task, listener and subscription.
    /// The cached value is kept.
    pub fn unregister(&self, key: &str) -> bool {
        let removed = lock_or_recover(&self.resources).remove(key);
        let Some(tracked) = removed else {
            return false;
        };

        tracked.cancel.cancel();
        self.scheduler.remove_task(key);
        if let Some(id) = tracked.listener_id {
            self.transport.remove_listener(id);
        }
        if let Some(sub_key) = tracked.subscription_key {
            self.transport.unsubscribe(&sub_key);
        }
        log::info!("[sync] stopped tracking '{}'", key);
        true
    }

    /// Handle of a tracked resource.
    pub fn handle(&self, key: &str) -> Option<ResourceHandle> {
        lock_or_recover(&self.resources)
            .get(key)
            .map(|t| t.handle.clone())
    }

    /// Tracked keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = lock_or_recover(&self.resources).keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Reconciled state of `key`.
    pub fn snapshot(&self, key: &str) -> Result<ResourceSnapshot, SyncError> {
        self.handle(key)
            .map(|h| h.snapshot())
            .ok_or_else(|| SyncError::UnknownResource(key.to_string()))
    }

    /// Reconciled state of every resource, sorted by key.
    pub fn snapshots(&self) -> Vec<ResourceSnapshot> {
        let mut all: Vec<ResourceSnapshot> = lock_or_recover(&self.resources)
            .values()
            .map(|t| t.handle.snapshot())
            .collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        all
    }

    pub fn refetch(&self, key: &str) -> Result<(), SyncError> {
        self.with_handle(key, ResourceHandle::refetch)
    }

    pub fn invalidate(&self, key: &str) -> Result<(), SyncError> {
        self.with_handle(key, ResourceHandle::invalidate)
    }

    /// Counters summed over every tracked resource.
    pub fn stats(&self) -> SyncStats {
        let mut total = SyncStats::default();
        for snapshot in self.snapshots() {
            total += snapshot.stats;
        }
        total
    }

    /// Current operation mode.
    pub fn mode(&self) -> OperationMode {
        *self.mode_rx.borrow()
    }

    pub fn mode_changes(&self) -> watch::Receiver<OperationMode> {
        self.mode_rx.clone()
    }

    /// Empties the whole cache.
    pub async fn clear_cache(&self) -> bool {
        self.cache.clear().await
    }

    pub fn pause_polling(&self) {
        self.scheduler.pause_all();
    }

    pub fn resume_polling(&self) {
        self.scheduler.resume_all();
    }

    pub fn reconnect(&self) {
        self.transport.reconnect();
    }

    /// Stops every resource task and the mode monitor.
    pub fn shutdown(&self) {
        for key in self.keys() {
            self.unregister(&key);
        }
        self.cancel.cancel();
    }

    fn with_handle(&self, key: &str, f: impl FnOnce(&ResourceHandle)) -> Result<(), SyncError> {
        let handle = self
            .handle(key)
            .ok_or_else(|| SyncError::UnknownResource(key.to_string()))?;
        f(&handle);
        Ok(())
    }
}

impl Drop for SyncCoordinator {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Single writer of one resource's state.
struct ResourceTask {
    key: String,
    descriptor: ResourceDescriptor,
    config: CoordinatorConfig,
    cache: Arc<LocalCacheStore>,
    runner: Arc<FetchRunner>,
    seq: Arc<AtomicU64>,
    snapshot: ResourceSnapshot,
    snapshot_tx: watch::Sender<ResourceSnapshot>,
    events: mpsc::UnboundedReceiver<ResourceEvent>,
    commands: mpsc::UnboundedReceiver<ResourceCommand>,
    listener: Option<NotificationListener>,
    mode_rx: watch::Receiver<OperationMode>,
    mode_open: bool,
    throttle: Throttle,
    fallback_at: Option<Instant>,
    last_applied: u64,
    in_flight: u32,
    cache_read: bool,
    cancel: CancellationToken,
}

async fn next_push(listener: &mut Option<NotificationListener>) -> Option<Arc<NotificationMessage>> {
    match listener {
        Some(listener) => listener.recv().await,
        None => std::future::pending().await,
    }
}

impl ResourceTask {
    async fn run(mut self) {
        self.on_mode();

        loop {
            let throttle_at = self.throttle.deadline();
            let fallback_at = self.fallback_at;
            let far = Instant::now() + FAR_FUTURE;

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(event) = self.events.recv() => self.on_event(event).await,
                Some(command) = self.commands.recv() => self.on_command(command).await,
                message = next_push(&mut self.listener) => match message {
                    Some(message) => self.on_push(&message).await,
                    None => self.listener = None,
                },
                changed = self.mode_rx.changed(), if self.mode_open => match changed {
                    Ok(()) => self.on_mode(),
                    Err(_) => self.mode_open = false,
                },
                _ = sleep_until(throttle_at.unwrap_or(far)), if throttle_at.is_some() => {
                    let coalesced = self.throttle.fire();
                    log::debug!("[sync] '{}' trailing invalidation for {} routine events", self.key, coalesced);
                    self.invalidate("routine events").await;
                }
                _ = sleep_until(fallback_at.unwrap_or(far)), if fallback_at.is_some() => {
                    self.snapshot.stats.fallback_refreshes += 1;
                    self.fallback_at = Some(Instant::now() + self.config.fallback_interval());
                    self.spawn_fetch(FetchOrigin::Fallback);
                    self.publish();
                }
            }
        }
        log::debug!("[sync] '{}' task stopped", self.key);
    }

    async fn on_event(&mut self, event: ResourceEvent) {
        match event {
            ResourceEvent::CacheRead { seq, entry } => {
                self.cache_read = true;
                match entry {
                    Some(entry) => {
                        self.snapshot.stats.cache_hits += 1;
                        if self.apply(seq, UpdateSource::Cache, entry.data) {
                            self.runner.remember(entry.etag, entry.last_modified);
                        }
                    }
                    None => {
                        self.snapshot.stats.cache_misses += 1;
                        if self.snapshot.data.is_none() && self.in_flight == 0 {
                            self.spawn_fetch(FetchOrigin::Initial);
                        }
                    }
                }
            }
            ResourceEvent::FetchStarted => self.in_flight += 1,
            ResourceEvent::FetchFinished {
                seq,
                origin,
                result,
            } => {
                self.in_flight = self.in_flight.saturating_sub(1);
                self.snapshot.stats.poll_executions += 1;
                match result {
                    Ok(fetched) => self.on_fetched(seq, fetched).await,
                    Err(message) => {
                        self.snapshot.stats.poll_failures += 1;
                        log::warn!("[sync] '{}' {:?} fetch failed: {}", self.key, origin, message);
                        self.snapshot.error = Some(message);
                    }
                }
            }
        }
        self.publish();
    }

    async fn on_fetched(&mut self, seq: u64, fetched: Fetched) {
        if fetched.not_modified {
            if !self.accept(seq) {
                return;
            }
            self.stamp(UpdateSource::Poll);
            // Restart the TTL of the value that was just confirmed.
            if let Some(data) = self.snapshot.data.clone() {
                let ctx = lock_or_recover(&self.runner.validators).clone();
                self.write_cache(data, ctx.etag, ctx.last_modified).await;
            }
            return;
        }

        let Fetched {
            data,
            etag,
            last_modified,
            ..
        } = fetched;
        if self.apply(seq, UpdateSource::Poll, data.clone()) {
            self.runner.remember(etag.clone(), last_modified.clone());
            self.write_cache(data, etag, last_modified).await;
        }
    }

    async fn on_command(&mut self, command: ResourceCommand) {
        match command {
            ResourceCommand::Refetch => self.spawn_fetch(FetchOrigin::Manual),
            ResourceCommand::Invalidate => self.invalidate("requested").await,
            ResourceCommand::ClearCache => {
                self.cache.delete(&self.key).await;
                self.runner.remember(None, None);
            }
        }
        self.publish();
    }

    async fn on_push(&mut self, message: &NotificationMessage) {
        log::debug!(
            "[sync] '{}' push {} ({:?})",
            self.key,
            message.event,
            message.resource_id
        );

        let class = self.descriptor.class_of(message);

        if self.descriptor.merge_push {
            let seq = next_seq(&self.seq);
            match merge(self.snapshot.data.as_ref(), message) {
                MergeOutcome::Applied(value) => {
                    if self.apply(seq, UpdateSource::Push, value.clone()) {
                        self.snapshot.stats.push_updates += 1;
                        if self.config.write_through_push {
                            self.write_cache(value, None, None).await;
                        }
                    }
                    // Urgent events are confirmed against the server even when merged.
                    if class == UpdateClass::Urgent {
                        self.invalidate("urgent event").await;
                    }
                    self.publish();
                    return;
                }
                MergeOutcome::Invalidate(reason) => {
                    log::debug!("[sync] '{}' cannot merge push: {}", self.key, reason);
                }
            }
        }

        match class {
            UpdateClass::Urgent => self.invalidate("urgent event").await,
            UpdateClass::Routine => {
                if self.throttle.signal(Instant::now()) {
                    log::debug!("[sync] '{}' routine invalidation window opened", self.key);
                }
            }
        }
        self.publish();
    }

    fn on_mode(&mut self) {
        let mode = *self.mode_rx.borrow_and_update();
        let degraded = mode == OperationMode::FailoverPolling;
        if degraded && self.fallback_at.is_none() {
            self.fallback_at = Some(Instant::now() + self.config.fallback_interval());
        } else if !degraded {
            self.fallback_at = None;
        }
        if self.snapshot.degraded != degraded {
            self.snapshot.degraded = degraded;
            self.publish();
        }
    }

    /// Drops the cached value and fetches now. The displayed value stays until
    /// the fetch lands.
    async fn invalidate(&mut self, reason: &str) {
        log::debug!("[sync] '{}' invalidated: {}", self.key, reason);
        self.snapshot.stats.invalidations += 1;
        self.cache.delete(&self.key).await;
        self.runner.remember(None, None);
        self.spawn_fetch(FetchOrigin::Invalidation);
    }

    fn spawn_fetch(&self, origin: FetchOrigin) {
        tokio::spawn(Arc::clone(&self.runner).run(origin));
    }

    fn accept(&mut self, seq: u64) -> bool {
        if seq <= self.last_applied {
            self.snapshot.stats.stale_discarded += 1;
            log::debug!(
                "[sync] '{}' discarded update #{} (applied #{})",
                self.key,
                seq,
                self.last_applied
            );
            return false;
        }
        self.last_applied = seq;
        self.snapshot.seq = seq;
        true
    }

    fn apply(&mut self, seq: u64, source: UpdateSource, data: Value) -> bool {
        if !self.accept(seq) {
            return false;
        }
        self.snapshot.data = Some(data);
        self.stamp(source);
        true
    }

    fn stamp(&mut self, source: UpdateSource) {
        self.snapshot.last_update_source = Some(source);
        self.snapshot.last_update_time = Some(Utc::now());
        self.snapshot.error = None;
    }

    async fn write_cache(&self, data: Value, etag: Option<String>, last_modified: Option<String>) {
        let options = SetOptions {
            ttl: self.descriptor.ttl,
            etag,
            last_modified,
        };
        self.cache.set(&self.key, data, options).await;
    }

    fn publish(&mut self) {
        let has_data = self.snapshot.data.is_some();
        self.snapshot.is_validating = self.in_flight > 0;
        self.snapshot.is_loading = !has_data && (self.in_flight > 0 || !self.cache_read);
        self.snapshot.cache_hit_rate = self.snapshot.stats.cache_hit_rate();
        self.snapshot_tx.send_replace(self.snapshot.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs::{CacheConfig, PollingConfig, TransportConfig};
    use crate::core::environment::SharedEnvironment;
    use crate::core::registry::Subscription;
    use crate::ingestors::connector::{ChannelConnector, ServerAcceptor, ServerEnd};
    use crate::ingestors::frames::Frame;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;
    use tokio::sync::Semaphore;

    struct Rig {
        coordinator: SyncCoordinator,
        transport: Arc<TransportClient>,
        cache: Arc<LocalCacheStore>,
        acceptor: ServerAcceptor,
    }

    fn rig() -> Rig {
        let (connector, acceptor) = ChannelConnector::new();
        let transport = Arc::new(TransportClient::new(
            TransportConfig {
                heartbeat_interval_ms: 3_600_000,
                ..TransportConfig::default()
            },
            connector,
        ));
        let scheduler = Arc::new(PollingScheduler::new(
            PollingConfig::default(),
            Arc::new(SharedEnvironment::default()),
        ));
        let cache = Arc::new(LocalCacheStore::in_memory(CacheConfig::default()));
        let coordinator = SyncCoordinator::new(
            CoordinatorConfig::default(),
            Arc::clone(&transport),
            scheduler,
            Arc::clone(&cache),
        );
        Rig {
            coordinator,
            transport,
            cache,
            acceptor,
        }
    }

    async fn connected(rig: &mut Rig) -> ServerEnd {
        rig.transport.connect().await.unwrap();
        rig.acceptor.accept().await.unwrap()
    }

    async fn settle() {
        for _ in 0..64 {
            tokio::task::yield_now().await;
        }
    }

    fn notification(resource: &str, event: &str, data: Value) -> Frame {
        Frame::Notification {
            resource: Some(resource.to_string()),
            channel: None,
            event: Some(event.to_string()),
            data,
            timestamp: None,
            id: None,
        }
    }

    /// Fetcher that returns `{"n": <call number>}` and counts calls.
    fn counting() -> (Arc<AtomicU32>, ResourceDescriptor) {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&calls);
        let descriptor = ResourceDescriptor::plain("orders", move || {
            let n = seen.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Ok::<_, anyhow::Error>(json!({ "n": n })) }
        })
        .without_polling()
        .subscribe(Subscription::new("orders"));
        (calls, descriptor)
    }

    #[tokio::test(start_paused = true)]
    async fn warm_cache_fills_state_without_fetching() {
        let rig = rig();
        rig.cache
            .set("orders", json!([{"id": 1}]), SetOptions::default())
            .await;
        let (calls, descriptor) = counting();

        let handle = rig.coordinator.register(descriptor);
        settle().await;

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.data, Some(json!([{"id": 1}])));
        assert_eq!(snapshot.last_update_source, Some(UpdateSource::Cache));
        assert!(!snapshot.is_loading);
        assert_eq!(snapshot.stats.cache_hits, 1);
        assert_eq!(handle.cache_hit_rate(), 1.0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cache_miss_fetches_and_writes_through() {
        let rig = rig();
        let (calls, descriptor) = counting();
        let handle = rig.coordinator.register(descriptor);
        settle().await;

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.data, Some(json!({"n": 1})));
        assert_eq!(snapshot.last_update_source, Some(UpdateSource::Poll));
        assert_eq!(snapshot.stats.cache_misses, 1);
        assert_eq!(snapshot.stats.poll_executions, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(rig.cache.get("orders").await, Some(json!({"n": 1})));
    }

    #[tokio::test(start_paused = true)]
    async fn push_patches_value_in_place() {
        let mut rig = rig();
        let server = connected(&mut rig).await;
        rig.cache
            .set("orders", json!([{"id": 5, "status": "open"}]), SetOptions::default())
            .await;
        let (calls, descriptor) = counting();
        let handle = rig.coordinator.register(descriptor);
        settle().await;

        server.send_frame(&notification("orders", "updated", json!({"id": 5, "status": "paid"})));
        server.send_frame(&notification("orders", "created", json!({"id": 6, "status": "open"})));
        settle().await;

        let snapshot = handle.snapshot();
        assert_eq!(
            snapshot.data,
            Some(json!([{"id": 5, "status": "paid"}, {"id": 6, "status": "open"}]))
        );
        assert_eq!(snapshot.last_update_source, Some(UpdateSource::Push));
        assert_eq!(snapshot.stats.push_updates, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(rig.cache.get("orders").await, snapshot.data);
    }

    #[tokio::test(start_paused = true)]
    async fn routine_events_coalesce_into_one_trailing_invalidation() {
        let mut rig = rig();
        let server = connected(&mut rig).await;
        let (calls, descriptor) = counting();
        let handle = rig.coordinator.register(descriptor.merge_push(false));
        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        for i in 0..5 {
            server.send_frame(&notification("orders", "updated", json!({"id": i})));
        }
        settle().await;
        tokio::time::sleep(Duration::from_millis(499)).await;
        settle().await;
        assert_eq!(handle.snapshot().stats.invalidations, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(2)).await;
        settle().await;
        assert_eq!(handle.snapshot().stats.invalidations, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        tokio::time::sleep(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(handle.snapshot().stats.invalidations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn urgent_event_invalidates_immediately() {
        let mut rig = rig();
        let server = connected(&mut rig).await;
        let (calls, descriptor) = counting();
        let handle = rig
            .coordinator
            .register(descriptor.merge_push(false).urgent_events(["Cancelled"]));
        settle().await;

        server.send_frame(&notification("orders", "updated", json!({"id": 1})));
        server.send_frame(&notification("orders", "cancelled", json!({"id": 2})));
        settle().await;

        assert_eq!(handle.snapshot().stats.invalidations, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(rig.cache.get("orders").await, Some(json!({"n": 2})));
    }

    #[tokio::test(start_paused = true)]
    async fn merged_urgent_event_still_refetches() {
        let mut rig = rig();
        let server = connected(&mut rig).await;
        rig.cache
            .set("orders", json!([{"id": 1, "status": "open"}]), SetOptions::default())
            .await;
        let (calls, descriptor) = counting();
        let handle = rig.coordinator.register(descriptor.urgent_events(["updated"]));
        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        server.send_frame(&notification("orders", "updated", json!({"id": 1, "status": "void"})));
        settle().await;

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.stats.push_updates, 1);
        assert_eq!(snapshot.stats.invalidations, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(snapshot.data, Some(json!({"n": 1})));
        assert_eq!(snapshot.last_update_source, Some(UpdateSource::Poll));

        // Routine merges stay local.
        server.send_frame(&notification("orders", "created", json!({"id": 2})));
        settle().await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(handle.snapshot().stats.invalidations, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_started_before_push_never_overwrites_it() {
        let mut rig = rig();
        let server = connected(&mut rig).await;
        rig.cache.set("orders", json!([]), SetOptions::default()).await;

        let gate = Arc::new(Semaphore::new(0));
        let fetch_gate = Arc::clone(&gate);
        let descriptor = ResourceDescriptor::plain("orders", move || {
            let gate = Arc::clone(&fetch_gate);
            async move {
                gate.acquire().await?.forget();
                Ok::<_, anyhow::Error>(json!(["from poll"]))
            }
        })
        .without_polling()
        .subscribe(Subscription::new("orders"));
        let handle = rig.coordinator.register(descriptor);
        settle().await;

        handle.refetch();
        settle().await;
        assert!(handle.snapshot().is_validating);

        server.send_frame(&notification("orders", "snapshot", json!(["from push"])));
        settle().await;
        gate.add_permits(1);
        settle().await;

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.data, Some(json!(["from push"])));
        assert_eq!(snapshot.last_update_source, Some(UpdateSource::Push));
        assert_eq!(snapshot.stats.stale_discarded, 1);
        assert!(!snapshot.is_validating);

        // A fetch started after the push wins.
        handle.refetch();
        settle().await;
        gate.add_permits(1);
        settle().await;
        assert_eq!(handle.data(), Some(json!(["from poll"])));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_fetch_keeps_value_and_records_error() {
        let rig = rig();
        rig.cache.set("stats", json!({"total": 3}), SetOptions::default()).await;
        let handle = rig.coordinator.register(
            ResourceDescriptor::plain("stats", || async {
                Err::<Value, _>(anyhow::anyhow!("upstream 503"))
            })
            .without_polling(),
        );
        settle().await;

        handle.refetch();
        settle().await;
        let snapshot = handle.snapshot();
        assert_eq!(snapshot.data, Some(json!({"total": 3})));
        assert_eq!(snapshot.stats.poll_failures, 1);
        assert_eq!(snapshot.error.as_deref(), Some("upstream 503"));
    }

    #[tokio::test(start_paused = true)]
    async fn unregister_releases_sources() {
        let mut rig = rig();
        let mut server = connected(&mut rig).await;
        let (_calls, descriptor) = counting();
        rig.coordinator.register(descriptor);
        settle().await;
        assert!(matches!(server.recv_frame().await, Some(Frame::Subscribe { .. })));
        assert_eq!(rig.coordinator.keys(), vec!["orders".to_string()]);

        assert!(rig.coordinator.unregister("orders"));
        assert!(!rig.coordinator.unregister("orders"));
        assert!(matches!(server.recv_frame().await, Some(Frame::Unsubscribe { .. })));
        assert!(matches!(
            rig.coordinator.snapshot("orders"),
            Err(SyncError::UnknownResource(_))
        ));
        assert!(rig.transport.subscriptions().is_empty());
    }
}
