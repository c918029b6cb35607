//! # Scenario Rigs
//!
//! Shared fixtures for the cross-component tests under `tests/`: a full sync
//! stack wired to an in-process push server, counting fetchers and a tiny
//! HTTP stub speaking conditional `GET`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use lib_sync::configs::{SyncConfig, TransportConfig};
use lib_sync::connections::LocalCacheStore;
use lib_sync::coordinator::{ResourceDescriptor, SyncCoordinator};
use lib_sync::core::SharedEnvironment;
use lib_sync::ingestors::{ChannelConnector, Frame, PollingScheduler, ServerAcceptor, TransportClient};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Every component of the sync layer, plus the server side of the push channel.
pub struct Stack {
    pub coordinator: SyncCoordinator,
    pub transport: Arc<TransportClient>,
    pub scheduler: Arc<PollingScheduler>,
    pub cache: Arc<LocalCacheStore>,
    pub environment: Arc<SharedEnvironment>,
    pub connector: Arc<ChannelConnector>,
    pub acceptor: ServerAcceptor,
}

/// Builds the stack on an in-memory cache and a channel connector.
pub fn stack(config: SyncConfig) -> Stack {
    let (connector, acceptor) = ChannelConnector::new();
    let transport = Arc::new(TransportClient::new(config.transport.clone(), connector.clone()));
    let environment = Arc::new(SharedEnvironment::for_polling(&config.polling));
    let scheduler = Arc::new(PollingScheduler::new(
        config.polling.clone(),
        environment.clone(),
    ));
    let cache = Arc::new(LocalCacheStore::in_memory(config.cache.clone()));
    let coordinator = SyncCoordinator::new(
        config.coordinator.clone(),
        Arc::clone(&transport),
        Arc::clone(&scheduler),
        Arc::clone(&cache),
    );
    Stack {
        coordinator,
        transport,
        scheduler,
        cache,
        environment,
        connector,
        acceptor,
    }
}

/// Transport settings whose heartbeat never fires within a test.
pub fn quiet_transport() -> TransportConfig {
    TransportConfig {
        heartbeat_interval_ms: 3_600_000,
        reconnect_base_delay_ms: 100,
        reconnect_max_delay_ms: 400,
        ..TransportConfig::default()
    }
}

/// Lets every ready task run without moving the paused clock.
pub async fn settle() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// `notification` frame as a server would send it.
pub fn notification(resource: &str, event: &str, data: Value) -> Frame {
    Frame::Notification {
        resource: Some(resource.to_string()),
        channel: None,
        event: Some(event.to_string()),
        data,
        timestamp: None,
        id: None,
    }
}

/// Resource whose fetcher returns `{"n": <call number>}`, without polling.
pub fn counting(key: &str) -> (Arc<AtomicU32>, ResourceDescriptor) {
    let calls = Arc::new(AtomicU32::new(0));
    let seen = Arc::clone(&calls);
    let descriptor = ResourceDescriptor::plain(key, move || {
        let n = seen.fetch_add(1, Ordering::SeqCst) + 1;
        async move { Ok::<_, anyhow::Error>(json!({ "n": n })) }
    })
    .without_polling();
    (calls, descriptor)
}

/// Resource whose fetcher returns whatever `state` holds at call time.
pub fn mirroring(key: &str, state: Arc<Mutex<Value>>) -> (Arc<AtomicU32>, ResourceDescriptor) {
    let calls = Arc::new(AtomicU32::new(0));
    let seen = Arc::clone(&calls);
    let descriptor = ResourceDescriptor::plain(key, move || {
        seen.fetch_add(1, Ordering::SeqCst);
        let value = state.lock().map(|v| v.clone()).unwrap_or(Value::Null);
        async move { Ok::<_, anyhow::Error>(value) }
    });
    (calls, descriptor)
}

/// Request counters of an [`http_stub`].
#[derive(Default)]
pub struct StubHits {
    pub full: AtomicU32,
    pub not_modified: AtomicU32,
}

/// One-connection-per-request HTTP stub serving `body` under `etag`. A request
/// carrying `If-None-Match: <etag>` gets `304 Not Modified`.
pub async fn http_stub(body: Value, etag: &'static str) -> (String, Arc<StubHits>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(StubHits::default());
    let counters = Arc::clone(&hits);
    let body = body.to_string();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let mut buf = vec![0u8; 4096];
            let n = socket.read(&mut buf).await.unwrap_or(0);
            let request = String::from_utf8_lossy(&buf[..n]).to_ascii_lowercase();

            let response = if request.contains(&format!("if-none-match: {}", etag.to_ascii_lowercase())) {
                counters.not_modified.fetch_add(1, Ordering::SeqCst);
                "HTTP/1.1 304 Not Modified\r\nConnection: close\r\n\r\n".to_string()
            } else {
                counters.full.fetch_add(1, Ordering::SeqCst);
                format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nETag: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    etag,
                    body.len(),
                    body
                )
            };
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        }
    });

    (format!("http://{}/", addr), hits)
}
