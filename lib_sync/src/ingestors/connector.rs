//! # Socket Connectors
//!
//! The transport client talks to a [`Connector`] rather than to a socket
//! library. A connector opens one session and hands back a sink of outbound
//! text frames and a stream of inbound ones.
//!
//! - [`WssConnector`]: real WebSocket via `tokio-tungstenite`, with a bearer
//!   token in the upgrade request and a connect timeout.
//! - [`ChannelConnector`]: in-process pair of channels. Each successful
//!   `connect` yields a [`ServerEnd`] through a [`ServerAcceptor`], so a test or
//!   an embedded producer can play the server.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_channel::mpsc as fmpsc;
use futures_util::{future, Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{self, Message};

use super::frames::Frame;
use crate::core::lock_or_recover;
use crate::error::SyncError;

/// Outbound half of a session.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = SyncError> + Send>>;
/// Inbound half of a session. `Err(Parse)` items are dropped by the client, any
/// other error ends the session.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, SyncError>> + Send>>;

/// Opens push sessions.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens one session.
    async fn connect(&self) -> Result<(FrameSink, FrameStream), SyncError>;
}

/// WebSocket connector.
pub struct WssConnector {
    url: String,
    auth_token: Option<String>,
    connect_timeout: Duration,
}

impl WssConnector {
    /// Connector for `url`, optionally sending `Authorization: Bearer <token>`.
    pub fn new(url: impl Into<String>, auth_token: Option<String>, connect_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            auth_token,
            connect_timeout,
        }
    }
}

#[async_trait]
impl Connector for WssConnector {
    async fn connect(&self) -> Result<(FrameSink, FrameStream), SyncError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| SyncError::Transport(format!("bad url {}: {}", self.url, e)))?;

        if let Some(token) = &self.auth_token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| SyncError::Auth(format!("unusable token: {}", e)))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (ws, _response) =
            tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(request))
                .await
                .map_err(|_| {
                    SyncError::Transport(format!(
                        "connect to {} timed out after {:?}",
                        self.url, self.connect_timeout
                    ))
                })?
                .map_err(upgrade_error)?;

        let (write, read) = ws.split();

        let sink = write
            .sink_map_err(|e| SyncError::Transport(e.to_string()))
            .with(|text: String| future::ready(Ok::<_, SyncError>(Message::Text(text.into()))));

        let stream = read.filter_map(|message| {
            future::ready(match message {
                Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
                Ok(Message::Binary(bytes)) => Some(
                    String::from_utf8(bytes.to_vec()).map_err(|e| SyncError::Parse(e.to_string())),
                ),
                // Control frames are handled by tungstenite itself.
                Ok(_) => None,
                Err(e) => Some(Err(SyncError::Transport(e.to_string()))),
            })
        });

        Ok((Box::pin(sink), Box::pin(stream)))
    }
}

/// A 401/403 answer to the upgrade is a credential problem, not a network one.
fn upgrade_error(err: tungstenite::Error) -> SyncError {
    match &err {
        tungstenite::Error::Http(response)
            if matches!(
                response.status(),
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
            ) =>
        {
            SyncError::Auth(format!("upgrade rejected: {}", response.status()))
        }
        _ => SyncError::Transport(err.to_string()),
    }
}

/// Server side of one in-process session.
pub struct ServerEnd {
    from_client: fmpsc::UnboundedReceiver<String>,
    to_client: fmpsc::UnboundedSender<Result<String, SyncError>>,
}

impl ServerEnd {
    /// Next frame sent by the client, or `None` once the client closed the session.
    pub async fn recv_frame(&mut self) -> Option<Frame> {
        loop {
            let text = self.from_client.next().await?;
            match Frame::decode(&text) {
                Ok(frame) => return Some(frame),
                Err(e) => log::warn!("[server-end] undecodable client frame: {}", e),
            }
        }
    }

    /// A frame the client already sent, without waiting.
    pub fn try_recv_frame(&mut self) -> Option<Frame> {
        match self.from_client.try_recv() {
            Ok(text) => Frame::decode(&text).ok(),
            Err(_) => None,
        }
    }

    /// Sends a frame to the client. Returns false if the client is gone.
    pub fn send_frame(&self, frame: &Frame) -> bool {
        match frame.encode() {
            Ok(text) => self.send_text(text),
            Err(_) => false,
        }
    }

    /// Sends raw text, e.g. a deliberately malformed frame.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.to_client.unbounded_send(Ok(text.into())).is_ok()
    }

    /// Injects a transport failure into the client's receive loop.
    pub fn fail(&self, reason: &str) {
        let _ = self
            .to_client
            .unbounded_send(Err(SyncError::Transport(reason.to_string())));
    }
}

/// Hands out the server side of each new in-process session.
pub struct ServerAcceptor {
    rx: mpsc::UnboundedReceiver<ServerEnd>,
}

impl ServerAcceptor {
    /// Waits for the client's next session.
    pub async fn accept(&mut self) -> Option<ServerEnd> {
        self.rx.recv().await
    }

    /// A session opened since the last call, without waiting.
    pub fn try_accept(&mut self) -> Option<ServerEnd> {
        self.rx.try_recv().ok()
    }
}

/// In-process connector backed by futures channels.
pub struct ChannelConnector {
    sessions: mpsc::UnboundedSender<ServerEnd>,
    refusing: AtomicBool,
    attempts: AtomicU32,
    attempt_times: Mutex<Vec<Instant>>,
}

impl ChannelConnector {
    /// Creates the connector and the acceptor that sees its sessions.
    pub fn new() -> (Arc<Self>, ServerAcceptor) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            sessions: tx,
            refusing: AtomicBool::new(false),
            attempts: AtomicU32::new(0),
            attempt_times: Mutex::new(Vec::new()),
        });
        (connector, ServerAcceptor { rx })
    }

    /// While set, every `connect` fails with a transport error.
    pub fn set_refusing(&self, refusing: bool) {
        self.refusing.store(refusing, Ordering::SeqCst);
    }

    /// Number of `connect` calls so far, successful or not.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// When each `connect` call happened.
    pub fn attempt_times(&self) -> Vec<Instant> {
        lock_or_recover(&self.attempt_times).clone()
    }
}

#[async_trait]
impl Connector for ChannelConnector {
    async fn connect(&self) -> Result<(FrameSink, FrameStream), SyncError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        lock_or_recover(&self.attempt_times).push(Instant::now());

        if self.refusing.load(Ordering::SeqCst) {
            return Err(SyncError::Transport("connection refused".to_string()));
        }

        let (client_tx, from_client) = fmpsc::unbounded::<String>();
        let (to_client, client_rx) = fmpsc::unbounded::<Result<String, SyncError>>();

        self.sessions
            .send(ServerEnd {
                from_client,
                to_client,
            })
            .map_err(|_| SyncError::Transport("no server accepting sessions".to_string()))?;

        let sink = client_tx.sink_map_err(|e| SyncError::Transport(e.to_string()));
        Ok((Box::pin(sink), Box::pin(client_rx)))
    }
}
