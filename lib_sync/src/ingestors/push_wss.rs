//! # Push Transport Client
//!
//! Keeps one logical push connection alive and fans inbound notifications out
//! to in-process listeners.
//!
//! ## Connection task
//!
//! All socket work happens on a single spawned task driven by a command
//! channel, so the public handle is cheap to share and never blocks. The task
//! owns the session and publishes a [`ConnectionState`] snapshot on a `watch`
//! channel after every transition:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> (Reconnecting <-> Connecting) -> Failed
//! ```
//!
//! - **Heartbeat**: while connected a `heartbeat` frame goes out on a fixed
//!   interval and arms an acknowledgement deadline. A `heartbeat` or `pong`
//!   from the server clears it. A missed deadline closes the session as dead.
//! - **Reconnect**: after an abnormal close the task waits
//!   `min(base * 2^(n-1), cap)` plus jitter before attempt `n`. A successful
//!   open resets the counter. Once the budget is spent the state becomes
//!   `Failed` and only a manual `connect()` or `reconnect()` tries again.
//! - **Authentication**: a rejected handshake goes straight to `Failed`;
//!   retrying the same credentials is pointless.
//! - **Resubscription**: every channel in the registry is re-announced on each
//!   new session.
//!
//! Malformed or oversized frames are logged and dropped; they never end the
//! session.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use super::backoff::ReconnectPolicy;
use super::connector::{Connector, FrameSink, FrameStream, WssConnector};
use super::frames::{Frame, NotificationMessage};
use crate::configs::TransportConfig;
use crate::core::dispatcher::{ListenerTopic, NotificationDispatcher, NotificationListener};
use crate::core::lock_or_recover;
use crate::core::registry::{Release, Subscription, SubscriptionRegistry};
use crate::error::SyncError;

/// Far enough ahead to never fire during a session.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365);

/// Lifecycle of the push connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionStatus {
    /// Not connected and not trying.
    Disconnected,
    /// Opening a session.
    Connecting,
    /// Session open and handshake done.
    Connected,
    /// Waiting out a reconnect delay.
    Reconnecting,
    /// Gave up; needs a manual `connect()` or `reconnect()`.
    Failed,
}

/// Snapshot of the connection published after every transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionState {
    /// Current lifecycle state.
    pub status: ConnectionStatus,
    /// Reconnects attempted since the last successful open.
    pub reconnect_attempts: u32,
    /// Last heartbeat acknowledgement from the server.
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    /// Id from the server's `connected` frame.
    pub connection_id: Option<String>,
    /// Error that caused the latest close or failure.
    pub last_error: Option<SyncError>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            reconnect_attempts: 0,
            last_heartbeat_at: None,
            connection_id: None,
            last_error: None,
        }
    }
}

enum Command {
    Connect(oneshot::Sender<Result<(), SyncError>>),
    Subscribe(String),
    Unsubscribe(String),
    Reconnect,
    Disconnect,
}

/// Handle to the push connection. Dropping it stops the connection task.
pub struct TransportClient {
    cmd_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
    registry: Arc<Mutex<SubscriptionRegistry>>,
    dispatcher: Arc<NotificationDispatcher>,
    cancel: CancellationToken,
}

impl TransportClient {
    /// Spawns the connection task. Nothing is opened until [`connect`](Self::connect).
    pub fn new(config: TransportConfig, connector: Arc<dyn Connector>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::default());
        let registry = Arc::new(Mutex::new(SubscriptionRegistry::new()));
        let dispatcher = Arc::new(NotificationDispatcher::new());
        let cancel = CancellationToken::new();

        let task = ConnectionTask {
            policy: ReconnectPolicy::from_config(&config),
            config,
            connector,
            registry: Arc::clone(&registry),
            dispatcher: Arc::clone(&dispatcher),
            state_tx,
            cmd_rx,
            cancel: cancel.clone(),
            waiters: Vec::new(),
            announced: HashSet::new(),
            attempts: 0,
        };
        tokio::spawn(task.run());

        Self {
            cmd_tx,
            state_rx,
            registry,
            dispatcher,
            cancel,
        }
    }

    /// Client for the configured WebSocket URL.
    pub fn websocket(config: TransportConfig) -> Self {
        let connector = WssConnector::new(
            config.url.clone(),
            config.auth_token.clone(),
            config.connect_timeout(),
        );
        Self::new(config, Arc::new(connector))
    }

    /// Opens the connection. Resolves immediately when already connected and
    /// joins the pending attempt when one is in flight.
    pub async fn connect(&self) -> Result<(), SyncError> {
        if self.state_rx.borrow().status == ConnectionStatus::Connected {
            return Ok(());
        }
        let (tx, rx) = oneshot::channel();
        self.command(Command::Connect(tx))?;
        rx.await
            .map_err(|_| SyncError::Transport("connection task stopped".to_string()))?
    }

    /// Registers a channel and returns its key. Only the first listener of a
    /// channel causes a `subscribe` frame.
    pub fn subscribe(&self, subscription: Subscription) -> String {
        let (key, created) = lock_or_recover(&self.registry).subscribe(subscription);
        if created {
            let _ = self.command(Command::Subscribe(key.clone()));
        }
        key
    }

    /// Drops one listener from `key`. The last one causes an `unsubscribe` frame.
    pub fn unsubscribe(&self, key: &str) {
        let released = lock_or_recover(&self.registry).release(key);
        match released {
            Release::Removed(_) => {
                let _ = self.command(Command::Unsubscribe(key.to_string()));
            }
            Release::Retained(_) => {}
            Release::Unknown => log::debug!("[transport] unsubscribe of unknown key {}", key),
        }
    }

    /// Starts receiving notifications on `topic`.
    pub fn listen(&self, topic: ListenerTopic) -> NotificationListener {
        self.dispatcher.listen(topic)
    }

    /// Stops a listener returned by [`listen`](Self::listen).
    pub fn remove_listener(&self, id: u64) -> bool {
        self.dispatcher.remove_listener(id)
    }

    /// Current connection snapshot.
    pub fn state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    /// Receiver that observes every state transition.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Registered channels, sorted by key.
    pub fn subscriptions(&self) -> Vec<(String, Subscription)> {
        lock_or_recover(&self.registry).snapshot()
    }

    /// Drops the current session (if any) and opens a new one right away,
    /// resetting the retry budget.
    pub fn reconnect(&self) {
        let _ = self.command(Command::Reconnect);
    }

    /// Closes the session and stops retrying. Subscriptions are kept for the
    /// next `connect()`.
    pub fn disconnect(&self) {
        let _ = self.command(Command::Disconnect);
    }

    fn command(&self, command: Command) -> Result<(), SyncError> {
        self.cmd_tx
            .send(command)
            .map_err(|_| SyncError::Transport("connection task stopped".to_string()))
    }
}

impl Drop for TransportClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Session {
    sink: FrameSink,
    stream: FrameStream,
    connection_id: Option<String>,
}

/// Why a session or an attempt ended.
enum Exit {
    Abnormal(SyncError),
    Rejected(SyncError),
    Disconnect,
    Reconnect,
    Shutdown,
}

struct ConnectionTask {
    config: TransportConfig,
    policy: ReconnectPolicy,
    connector: Arc<dyn Connector>,
    registry: Arc<Mutex<SubscriptionRegistry>>,
    dispatcher: Arc<NotificationDispatcher>,
    state_tx: watch::Sender<ConnectionState>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    cancel: CancellationToken,
    waiters: Vec<oneshot::Sender<Result<(), SyncError>>>,
    /// Keys announced on the current session.
    announced: HashSet<String>,
    attempts: u32,
}

impl ConnectionTask {
    async fn run(mut self) {
        let mut retry_at: Option<Instant> = None;
        let mut open_now = false;

        loop {
            if !open_now {
                let deadline = retry_at.unwrap_or_else(|| Instant::now() + FAR_FUTURE);
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    _ = sleep_until(deadline), if retry_at.is_some() => {
                        retry_at = None;
                        open_now = true;
                    }
                    cmd = self.cmd_rx.recv() => match cmd {
                        None => return,
                        Some(Command::Connect(reply)) => {
                            self.waiters.push(reply);
                            if self.status() == ConnectionStatus::Failed {
                                self.attempts = 0;
                            }
                            retry_at = None;
                            open_now = true;
                        }
                        Some(Command::Reconnect) => {
                            self.attempts = 0;
                            retry_at = None;
                            open_now = true;
                        }
                        Some(Command::Disconnect) => {
                            retry_at = None;
                            self.attempts = 0;
                            self.fail_waiters(SyncError::Transport("disconnected".to_string()));
                            self.publish(ConnectionState::default());
                        }
                        // Nothing to announce without a session; the registry
                        // is replayed on the next open.
                        Some(Command::Subscribe(_)) | Some(Command::Unsubscribe(_)) => {}
                    }
                }
                continue;
            }
            open_now = false;

            let exit = match self.open().await {
                Ok(session) => self.serve(session).await,
                Err(exit) => exit,
            };

            match exit {
                Exit::Shutdown => return,
                Exit::Disconnect => {
                    log::info!("[transport] disconnected on request");
                    self.attempts = 0;
                    self.fail_waiters(SyncError::Transport("disconnected".to_string()));
                    self.publish(ConnectionState::default());
                }
                Exit::Reconnect => {
                    log::info!("[transport] manual reconnect");
                    self.attempts = 0;
                    open_now = true;
                }
                Exit::Rejected(err) => {
                    log::error!("[transport] handshake rejected: {}", err);
                    let attempts = self.attempts;
                    self.state_tx.send_modify(|s| {
                        s.status = ConnectionStatus::Failed;
                        s.reconnect_attempts = attempts;
                        s.connection_id = None;
                        s.last_error = Some(err.clone());
                    });
                    self.fail_waiters(err);
                }
                Exit::Abnormal(err) => {
                    self.fail_waiters(err.clone());
                    retry_at = self.schedule_retry(err);
                }
            }
        }
    }

    /// Opens a session and completes the handshake. Connect requests arriving
    /// meanwhile join the same attempt.
    async fn open(&mut self) -> Result<Session, Exit> {
        let attempts = self.attempts;
        self.state_tx.send_modify(|s| {
            s.status = ConnectionStatus::Connecting;
            s.reconnect_attempts = attempts;
        });
        log::info!(
            "[transport] connecting to {} (attempt {})",
            self.config.url,
            attempts
        );

        let establish = establish(Arc::clone(&self.connector), self.config.clone());
        tokio::pin!(establish);

        let mut disconnect_requested = false;
        let outcome = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(Exit::Shutdown),
                result = &mut establish => break result,
                cmd = self.cmd_rx.recv() => match cmd {
                    None => return Err(Exit::Shutdown),
                    Some(Command::Connect(reply)) => self.waiters.push(reply),
                    Some(Command::Disconnect) => disconnect_requested = true,
                    Some(Command::Reconnect) => disconnect_requested = false,
                    Some(Command::Subscribe(_)) | Some(Command::Unsubscribe(_)) => {}
                }
            }
        };

        match outcome {
            Ok(_) if disconnect_requested => Err(Exit::Disconnect),
            Ok(session) => Ok(session),
            Err(SyncError::Auth(reason)) => Err(Exit::Rejected(SyncError::Auth(reason))),
            Err(err) => {
                log::warn!("[transport] connect failed: {}", err);
                Err(Exit::Abnormal(err))
            }
        }
    }

    /// Runs an open session until it closes.
    async fn serve(&mut self, mut session: Session) -> Exit {
        self.attempts = 0;
        let connection_id = session.connection_id.clone();
        self.state_tx.send_modify(|s| {
            s.status = ConnectionStatus::Connected;
            s.reconnect_attempts = 0;
            s.connection_id = connection_id;
            s.last_error = None;
        });
        log::info!("[transport] connected to {}", self.config.url);
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }

        self.announced.clear();
        if let Err(err) = self.resubscribe_all(&mut session.sink).await {
            return Exit::Abnormal(err);
        }

        let heartbeat_interval = self.config.heartbeat_interval();
        let heartbeat_timeout = self.config.heartbeat_timeout();
        let mut next_beat = Instant::now() + heartbeat_interval;
        let mut ack_deadline: Option<Instant> = None;

        loop {
            let ack_sleep = sleep_until(ack_deadline.unwrap_or_else(|| Instant::now() + FAR_FUTURE));
            tokio::pin!(ack_sleep);

            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => return Exit::Shutdown,

                _ = &mut ack_sleep, if ack_deadline.is_some() => {
                    log::warn!(
                        "[transport] heartbeat not acknowledged within {:?}, closing",
                        heartbeat_timeout
                    );
                    return Exit::Abnormal(SyncError::Transport("heartbeat timeout".to_string()));
                }

                _ = sleep_until(next_beat) => {
                    let beat = Frame::heartbeat(Utc::now().timestamp_millis().max(0) as u64);
                    if let Err(err) = send_frame(&mut session.sink, &beat).await {
                        return Exit::Abnormal(err);
                    }
                    if ack_deadline.is_none() {
                        ack_deadline = Some(Instant::now() + heartbeat_timeout);
                    }
                    next_beat = Instant::now() + heartbeat_interval;
                }

                cmd = self.cmd_rx.recv() => match cmd {
                    None => return Exit::Shutdown,
                    Some(Command::Connect(reply)) => {
                        let _ = reply.send(Ok(()));
                    }
                    Some(Command::Subscribe(key)) => {
                        if let Err(err) = self.announce(&mut session.sink, &key).await {
                            return Exit::Abnormal(err);
                        }
                    }
                    Some(Command::Unsubscribe(key)) => {
                        if self.announced.remove(&key) {
                            if let Err(err) = send_frame(&mut session.sink, &Frame::unsubscribe(&key)).await {
                                return Exit::Abnormal(err);
                            }
                        }
                    }
                    Some(Command::Reconnect) => return Exit::Reconnect,
                    Some(Command::Disconnect) => {
                        let _ = session.sink.close().await;
                        return Exit::Disconnect;
                    }
                },

                inbound = session.stream.next() => match inbound {
                    None => {
                        log::warn!("[transport] session closed by server");
                        return Exit::Abnormal(SyncError::Transport("closed by server".to_string()));
                    }
                    Some(Err(SyncError::Parse(reason))) => {
                        log::warn!("[transport] dropping undecodable frame: {}", reason);
                    }
                    Some(Err(err)) => {
                        log::warn!("[transport] receive failed: {}", err);
                        return Exit::Abnormal(err);
                    }
                    Some(Ok(text)) => {
                        if text.len() > self.config.max_frame_bytes {
                            log::warn!(
                                "[transport] dropping frame of {} bytes (limit {})",
                                text.len(),
                                self.config.max_frame_bytes
                            );
                            continue;
                        }
                        let frame = match Frame::decode(&text) {
                            Ok(frame) => frame,
                            Err(err) => {
                                log::warn!("[transport] {}", err);
                                continue;
                            }
                        };
                        match frame {
                            Frame::Heartbeat { .. } | Frame::Pong { .. } => {
                                ack_deadline = None;
                                self.state_tx.send_modify(|s| s.last_heartbeat_at = Some(Utc::now()));
                            }
                            Frame::Ping { timestamp } => {
                                if let Err(err) = send_frame(&mut session.sink, &Frame::Pong { timestamp }).await {
                                    return Exit::Abnormal(err);
                                }
                            }
                            Frame::Connected { connection_id } => {
                                self.state_tx.send_modify(|s| s.connection_id = connection_id);
                            }
                            Frame::Error { message, .. } => {
                                log::warn!(
                                    "[transport] server error: {}",
                                    message.as_deref().unwrap_or("(no message)")
                                );
                            }
                            frame @ Frame::Notification { .. } => self.dispatch(&frame),
                            other => log::debug!("[transport] ignoring {:?}", other),
                        }
                    }
                },
            }
        }
    }

    fn dispatch(&self, frame: &Frame) {
        match NotificationMessage::from_frame(frame) {
            Ok(Some(message)) => {
                let delivered = self.dispatcher.dispatch(message);
                log::debug!("[transport] notification delivered to {} listener(s)", delivered);
            }
            Ok(None) => {}
            Err(err) => log::warn!("[transport] {}", err),
        }
    }

    async fn resubscribe_all(&mut self, sink: &mut FrameSink) -> Result<(), SyncError> {
        let channels = lock_or_recover(&self.registry).snapshot();
        if !channels.is_empty() {
            log::info!("[transport] re-subscribing {} channel(s)", channels.len());
        }
        for (key, subscription) in channels {
            send_frame(sink, &Frame::subscribe(&key, &subscription)).await?;
            self.announced.insert(key);
        }
        Ok(())
    }

    async fn announce(&mut self, sink: &mut FrameSink, key: &str) -> Result<(), SyncError> {
        if self.announced.contains(key) {
            return Ok(());
        }
        let subscription = lock_or_recover(&self.registry).get(key).cloned();
        if let Some(subscription) = subscription {
            send_frame(sink, &Frame::subscribe(key, &subscription)).await?;
            self.announced.insert(key.to_string());
        }
        Ok(())
    }

    /// Counts the failure and returns when to try next, or `None` once `Failed`.
    fn schedule_retry(&mut self, err: SyncError) -> Option<Instant> {
        self.attempts += 1;

        if self.policy.exhausted(self.attempts) {
            let attempts = self.policy.max_attempts;
            log::warn!(
                "[transport] giving up after {} reconnect attempts: {}",
                attempts,
                err
            );
            self.state_tx.send_modify(|s| {
                s.status = ConnectionStatus::Failed;
                s.reconnect_attempts = attempts;
                s.connection_id = None;
                s.last_error = Some(err);
            });
            return None;
        }

        let delay = self.policy.delay(self.attempts);
        let attempts = self.attempts;
        log::info!(
            "[transport] reconnect attempt {} in {:?} ({})",
            attempts,
            delay,
            err
        );
        self.state_tx.send_modify(|s| {
            s.status = ConnectionStatus::Reconnecting;
            s.reconnect_attempts = attempts;
            s.connection_id = None;
            s.last_error = Some(err);
        });
        Some(Instant::now() + delay)
    }

    fn fail_waiters(&mut self, err: SyncError) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(err.clone()));
        }
    }

    fn status(&self) -> ConnectionStatus {
        self.state_tx.borrow().status
    }

    fn publish(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }
}

async fn send_frame(sink: &mut FrameSink, frame: &Frame) -> Result<(), SyncError> {
    sink.send(frame.encode()?).await
}

/// Opens a session, sends credentials and waits for `connected` if required.
async fn establish(
    connector: Arc<dyn Connector>,
    config: TransportConfig,
) -> Result<Session, SyncError> {
    let (mut sink, mut stream) = connector.connect().await?;

    if let Some(token) = &config.auth_token {
        send_frame(&mut sink, &Frame::auth(token)).await?;
    }

    if !config.require_handshake {
        return Ok(Session {
            sink,
            stream,
            connection_id: None,
        });
    }

    let deadline = Instant::now() + config.handshake_timeout();
    loop {
        let inbound = tokio::time::timeout_at(deadline, stream.next())
            .await
            .map_err(|_| SyncError::Transport("handshake timed out".to_string()))?;

        let text = match inbound {
            None => return Err(SyncError::Transport("closed during handshake".to_string())),
            Some(Err(SyncError::Parse(_))) => continue,
            Some(Err(err)) => return Err(err),
            Some(Ok(text)) => text,
        };

        match Frame::decode(&text) {
            Ok(Frame::Connected { connection_id }) => {
                return Ok(Session {
                    sink,
                    stream,
                    connection_id,
                })
            }
            Ok(Frame::Error { message, .. }) => {
                let reason = message.unwrap_or_else(|| "handshake rejected".to_string());
                return Err(if config.auth_token.is_some() {
                    SyncError::Auth(reason)
                } else {
                    SyncError::Transport(reason)
                });
            }
            Ok(Frame::Ping { timestamp }) => {
                send_frame(&mut sink, &Frame::Pong { timestamp }).await?;
            }
            Ok(other) => log::debug!("[transport] before handshake, ignoring {:?}", other),
            Err(err) => log::warn!("[transport] {}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingestors::connector::{ChannelConnector, ServerAcceptor};
    use serde_json::json;

    fn config() -> TransportConfig {
        TransportConfig {
            heartbeat_interval_ms: 60_000,
            heartbeat_timeout_ms: 5_000,
            reconnect_base_delay_ms: 100,
            reconnect_max_delay_ms: 1_000,
            max_reconnect_attempts: 3,
            ..TransportConfig::default()
        }
    }

    fn client(config: TransportConfig) -> (TransportClient, Arc<ChannelConnector>, ServerAcceptor) {
        let (connector, acceptor) = ChannelConnector::new();
        let client = TransportClient::new(config, connector.clone());
        (client, connector, acceptor)
    }

    async fn wait_for(client: &TransportClient, status: ConnectionStatus) -> ConnectionState {
        let mut changes = client.state_changes();
        let state = changes
            .wait_for(|s| s.status == status)
            .await
            .unwrap()
            .clone();
        state
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_subscribe_sends_one_frame() {
        let (client, _connector, mut acceptor) = client(config());
        client.connect().await.unwrap();
        let mut server = acceptor.accept().await.unwrap();

        let k1 = client.subscribe(Subscription::new("orders"));
        let k2 = client.subscribe(Subscription::new("orders"));
        assert_eq!(k1, k2);

        assert_eq!(
            server.recv_frame().await,
            Some(Frame::Subscribe {
                resource: "orders".into(),
                data: None
            })
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(server.try_recv_frame().is_none());
        assert_eq!(client.subscriptions().len(), 1);

        client.unsubscribe(&k1);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(server.try_recv_frame().is_none());

        client.unsubscribe(&k2);
        assert_eq!(
            server.recv_frame().await,
            Some(Frame::Unsubscribe {
                resource: "orders".into()
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn connect_is_idempotent() {
        let (client, connector, mut acceptor) = client(config());
        let (a, b) = tokio::join!(client.connect(), client.connect());
        a.unwrap();
        b.unwrap();
        client.connect().await.unwrap();

        assert_eq!(connector.attempts(), 1);
        assert!(acceptor.accept().await.is_some());
        assert_eq!(client.state().status, ConnectionStatus::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn notification_reaches_all_scoped_listeners() {
        let (client, _connector, mut acceptor) = client(config());
        let mut all = client.listen(ListenerTopic::All);
        let mut by_type = client.listen(ListenerTopic::Resource("orders".into()));
        let mut by_event = client.listen(ListenerTopic::Action("orders".into(), "updated".into()));
        let mut by_id = client.listen(ListenerTopic::Record("orders".into(), "5".into()));

        client.connect().await.unwrap();
        let server = acceptor.accept().await.unwrap();
        server.send_text(r#"{"type":"notification","resource":"orders","event":"updated","data":{"id":5}}"#);

        for listener in [&mut all, &mut by_type, &mut by_event, &mut by_id] {
            let msg = listener.recv().await.unwrap();
            assert_eq!(msg.data, json!({"id": 5}));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_frames_do_not_end_the_session() {
        let (client, _connector, mut acceptor) = client(config());
        let mut all = client.listen(ListenerTopic::All);
        client.connect().await.unwrap();
        let server = acceptor.accept().await.unwrap();

        server.send_text("{{{ not json");
        server.send_text(r#"{"type":"warp-drive"}"#);
        server.send_text(r#"{"type":"notification","resource":"users","event":"created","data":{"id":"u1"}}"#);

        let msg = all.recv().await.unwrap();
        assert_eq!(msg.resource_id.as_deref(), Some("u1"));
        assert_eq!(client.state().status, ConnectionStatus::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn server_ping_is_answered() {
        let (client, _connector, mut acceptor) = client(config());
        client.connect().await.unwrap();
        let mut server = acceptor.accept().await.unwrap();

        server.send_frame(&Frame::Ping { timestamp: Some(9) });
        assert_eq!(
            server.recv_frame().await,
            Some(Frame::Pong { timestamp: Some(9) })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn missed_heartbeat_ack_forces_reconnect_and_resubscribe() {
        let cfg = TransportConfig {
            heartbeat_interval_ms: 1_000,
            heartbeat_timeout_ms: 500,
            ..config()
        };
        let (client, connector, mut acceptor) = client(cfg);
        client.subscribe(Subscription::new("stats"));
        client.connect().await.unwrap();

        let mut first = acceptor.accept().await.unwrap();
        assert!(matches!(first.recv_frame().await, Some(Frame::Subscribe { .. })));
        assert!(matches!(first.recv_frame().await, Some(Frame::Heartbeat { .. })));
        // Never acknowledged: the client gives up on this session.
        assert_eq!(first.recv_frame().await, None);

        let mut second = acceptor.accept().await.unwrap();
        assert_eq!(
            second.recv_frame().await,
            Some(Frame::Subscribe {
                resource: "stats".into(),
                data: None
            })
        );
        wait_for(&client, ConnectionStatus::Connected).await;
        assert_eq!(client.state().reconnect_attempts, 0);
        assert_eq!(connector.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn acknowledged_heartbeats_keep_the_session() {
        let cfg = TransportConfig {
            heartbeat_interval_ms: 1_000,
            heartbeat_timeout_ms: 500,
            ..config()
        };
        let (client, connector, mut acceptor) = client(cfg);
        client.connect().await.unwrap();
        let mut server = acceptor.accept().await.unwrap();

        for _ in 0..5 {
            match server.recv_frame().await {
                Some(Frame::Heartbeat { timestamp }) => {
                    server.send_frame(&Frame::Heartbeat { timestamp });
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(connector.attempts(), 1);
        assert!(client.state().last_heartbeat_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_delays_follow_the_policy_then_fail() {
        let (client, connector, _acceptor) = client(config());
        connector.set_refusing(true);

        assert!(matches!(client.connect().await, Err(SyncError::Transport(_))));
        let failed = wait_for(&client, ConnectionStatus::Failed).await;
        assert_eq!(failed.reconnect_attempts, 3);

        // initial attempt + 3 reconnects
        let times = connector.attempt_times();
        assert_eq!(times.len(), 4);
        for (n, pair) in times.windows(2).enumerate() {
            let gap = pair[1] - pair[0];
            let expected = Duration::from_millis((100u64 << n).min(1_000));
            assert!(gap >= expected, "gap {:?} < {:?}", gap, expected);
            assert!(gap <= expected.mul_f64(1.1) + Duration::from_millis(5));
        }

        // Failed stays failed until asked.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.attempts(), 4);

        connector.set_refusing(false);
        client.connect().await.unwrap();
        assert_eq!(client.state().reconnect_attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_handshake_is_not_retried() {
        let cfg = TransportConfig {
            auth_token: Some("expired".into()),
            require_handshake: true,
            ..config()
        };
        let (client, connector, mut acceptor) = client(cfg);

        let server = tokio::spawn(async move {
            let mut end = acceptor.accept().await.unwrap();
            let auth = end.recv_frame().await;
            end.send_frame(&Frame::Error {
                message: Some("invalid token".into()),
                data: None,
            });
            (auth, end)
        });

        let err = client.connect().await.unwrap_err();
        assert_eq!(err, SyncError::Auth("invalid token".into()));
        let (auth, _end) = server.await.unwrap();
        assert_eq!(auth, Some(Frame::auth("expired")));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(client.state().status, ConnectionStatus::Failed);
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_records_connection_id() {
        let cfg = TransportConfig {
            require_handshake: true,
            ..config()
        };
        let (client, _connector, mut acceptor) = client(cfg);
        let server = tokio::spawn(async move {
            let end = acceptor.accept().await.unwrap();
            end.send_frame(&Frame::Connected {
                connection_id: Some("c-42".into()),
            });
            end
        });

        client.connect().await.unwrap();
        let _end = server.await.unwrap();
        assert_eq!(client.state().connection_id.as_deref(), Some("c-42"));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_resets_state_and_keeps_subscriptions() {
        let (client, _connector, mut acceptor) = client(config());
        client.subscribe(Subscription::new("orders"));
        client.connect().await.unwrap();
        let mut first = acceptor.accept().await.unwrap();
        assert!(first.recv_frame().await.is_some());

        client.disconnect();
        assert_eq!(first.recv_frame().await, None);
        let state = wait_for(&client, ConnectionStatus::Disconnected).await;
        assert_eq!(state, ConnectionState::default());

        client.connect().await.unwrap();
        let mut second = acceptor.accept().await.unwrap();
        assert!(matches!(second.recv_frame().await, Some(Frame::Subscribe { .. })));
    }
}
