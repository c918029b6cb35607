use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use lib_sync::connections::LocalCacheStore;
use lib_sync::coordinator::SyncCoordinator;
use lib_sync::error::SyncError;
use lib_sync::ingestors::{PollingScheduler, TransportClient};
use serde_json::json;
use tokio::sync::broadcast;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<SyncCoordinator>,
    pub transport: Arc<TransportClient>,
    pub scheduler: Arc<PollingScheduler>,
    pub cache: Arc<LocalCacheStore>,
}

struct ApiError(SyncError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            SyncError::UnknownResource(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0 }))).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/polling", get(polling_handler))
        .route("/resources", get(list_handler))
        .route("/resources/{key}", get(resource_handler))
        .route("/resources/{key}/refetch", post(refetch_handler))
        .route("/resources/{key}/invalidate", post(invalidate_handler))
        .with_state(state)
}

pub async fn run(port: u16, state: AppState, mut shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!("Downstream server listening on {}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            shutdown.recv().await.ok();
            log::info!("Downstream server shutting down.");
        })
        .await?;
    Ok(())
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let connection = state.transport.state();
    Json(json!({
        "status": "ok",
        "mode": state.coordinator.mode(),
        "connection": connection,
        "stats": state.coordinator.stats(),
        "cacheHitRate": state.coordinator.stats().cache_hit_rate(),
        "cache": state.cache.stats().await,
    }))
}

async fn polling_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.scheduler.statuses())
}

async fn list_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.coordinator.snapshots())
}

async fn resource_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.coordinator.snapshot(&key).map(Json).map_err(ApiError)
}

async fn refetch_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.coordinator.refetch(&key).map_err(ApiError)?;
    Ok(StatusCode::ACCEPTED)
}

async fn invalidate_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.coordinator.invalidate(&key).map_err(ApiError)?;
    Ok(StatusCode::ACCEPTED)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_sync::configs::{CacheConfig, CoordinatorConfig, PollingConfig, TransportConfig};
    use lib_sync::coordinator::ResourceDescriptor;
    use lib_sync::core::SharedEnvironment;
    use lib_sync::ingestors::ChannelConnector;

    fn state() -> AppState {
        let (connector, _acceptor) = ChannelConnector::new();
        let transport = Arc::new(TransportClient::new(TransportConfig::default(), connector));
        let scheduler = Arc::new(PollingScheduler::new(
            PollingConfig::default(),
            Arc::new(SharedEnvironment::default()),
        ));
        let cache = Arc::new(LocalCacheStore::in_memory(CacheConfig::default()));
        let coordinator = Arc::new(SyncCoordinator::new(
            CoordinatorConfig::default(),
            Arc::clone(&transport),
            Arc::clone(&scheduler),
            Arc::clone(&cache),
        ));
        AppState {
            coordinator,
            transport,
            scheduler,
            cache,
        }
    }

    #[tokio::test]
    async fn unknown_resource_is_404() {
        let state = state();
        let response = resource_handler(State(state.clone()), Path("nope".to_string()))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = refetch_handler(State(state), Path("nope".to_string()))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn tracked_resource_accepts_controls() {
        let state = state();
        state.coordinator.register(
            ResourceDescriptor::plain("stats", || async { Ok::<_, anyhow::Error>(serde_json::json!({"total": 1})) })
                .without_polling(),
        );

        let response = resource_handler(State(state.clone()), Path("stats".to_string()))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let response = invalidate_handler(State(state.clone()), Path("stats".to_string()))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let response = health_handler(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
