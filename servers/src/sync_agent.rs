use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use lib_sync::connections::LocalCacheStore;
use lib_sync::coordinator::SyncCoordinator;
use lib_sync::core::environment::spawn_network_watch;
use lib_sync::core::SharedEnvironment;
use lib_sync::ingestors::{PollingScheduler, TransportClient};
use lib_sync::retrieve::ApiClient;
use tokio::signal;
use tokio_util::sync::CancellationToken;

mod sync_logic;
use sync_logic::{config, downstream, logger};

const REACHABILITY_INTERVAL: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> Result<()> {
    // Explicitly install the default crypto provider for rustls
    let _ = rustls::crypto::ring::default_provider().install_default();
    dotenvy::dotenv().ok();

    let config = config::load_config()?;
    let log_dir = config.log_dir.clone().unwrap_or_else(|| "./logs".into());
    let log_level = config.log_level.clone().unwrap_or_else(|| "info".to_string());
    logger::setup_logging(&log_dir, &log_level)?;

    let sync = config.sync_config()?;
    let background = CancellationToken::new();

    let cache = Arc::new(LocalCacheStore::from_config(sync.cache.clone()).await?);
    cache.spawn_cleanup(background.child_token());

    let environment = Arc::new(SharedEnvironment::for_polling(&sync.polling));
    if let Some(address) = config.reachability_address.clone() {
        spawn_network_watch(
            Arc::clone(&environment),
            address,
            REACHABILITY_INTERVAL,
            background.child_token(),
        );
    }

    let transport = Arc::new(TransportClient::websocket(sync.transport.clone()));
    let scheduler = Arc::new(PollingScheduler::new(sync.polling.clone(), environment));
    let coordinator = Arc::new(SyncCoordinator::new(
        sync.coordinator.clone(),
        Arc::clone(&transport),
        Arc::clone(&scheduler),
        Arc::clone(&cache),
    ));

    let base_url = config
        .api_base_url
        .clone()
        .context("apiBaseUrl is required")?;
    let client = Arc::new(ApiClient::new(&base_url, config.api_token.clone(), 3)?);
    for spec in config.resources.clone().unwrap_or_default() {
        log::info!("Registering resource '{}' -> {}{}", spec.key, base_url, spec.path);
        coordinator.register(spec.descriptor(Arc::clone(&client)));
    }

    // A failed first connect keeps retrying inside the transport.
    let connecting = Arc::clone(&transport);
    tokio::spawn(async move {
        if let Err(e) = connecting.connect().await {
            log::warn!("Push channel not connected: {}", e);
        }
    });

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let downstream_handle = tokio::spawn(downstream::run(
        config.port.unwrap_or(9004),
        downstream::AppState {
            coordinator: Arc::clone(&coordinator),
            transport: Arc::clone(&transport),
            scheduler: Arc::clone(&scheduler),
            cache,
        },
        shutdown_tx.subscribe(),
    ));

    // Wait for shutdown signal
    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = async {
            #[cfg(unix)]
            {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut term_signal) => {
                        term_signal.recv().await;
                        log::info!("SIGTERM received, initiating shutdown.");
                    }
                    Err(e) => {
                        log::warn!("Cannot listen for SIGTERM: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                // On non-unix platforms, just wait forever.
                std::future::pending::<()>().await;
            }
        } => {}
    }

    // Send shutdown signal to all components
    let _ = shutdown_tx.send(());
    coordinator.shutdown();
    scheduler.shutdown();
    transport.disconnect();
    background.cancel();

    match downstream_handle.await {
        Ok(Err(e)) => log::error!("Downstream server failed: {:#}", e),
        Err(e) => log::error!("Downstream task panicked: {}", e),
        Ok(Ok(())) => {}
    }

    log::info!("Shutdown complete.");
    Ok(())
}
