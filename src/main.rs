use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tokio::signal;
use tokio::sync::{broadcast, mpsc};

use canaria::backup::BackupUploader;
use canaria::feeds::{standard_feeds, FeedManager};
use canaria::http::{self, AppState};
use canaria::hub::{self, ConnectionHub};
use canaria::ingest::Ingest;
use canaria::metrics::Metrics;
use canaria::ratelimit::RateLimiter;
use canaria::settings::SettingsManager;
use canaria::signer::Signer;
use canaria::store::Store;
use canaria::{config, logger};

#[tokio::main]
async fn main() -> Result<()> {
    // Explicitly install the default crypto provider for rustls
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = Arc::new(config::load_config());
    logger::setup_logging(&config.log_dir, &config.log_level)?;
    log::info!("canaria starting (db: {})", config.db_path.display());

    let store = Arc::new(Store::open(&config.db_path)?);
    let settings = Arc::new(SettingsManager::new(store.clone())?);
    let signer = Arc::new(Signer::from_env()?);
    let ratelimit = Arc::new(RateLimiter::new(store.clone(), settings.clone()));
    let metrics = Arc::new(Metrics::new(store.clone(), settings.clone()));
    let hub = Arc::new(ConnectionHub::new());
    let backup = Arc::new(BackupUploader::new(config.backup_url.clone()));
    let ingest = Arc::new(Ingest::new(
        store.clone(),
        signer,
        hub.clone(),
        backup.clone(),
    ));
    if backup.enabled() {
        log::info!("backup projection uploads enabled");
    }

    let (shutdown_tx, _) = broadcast::channel(1);
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let feeds = if config.disable_feeds {
        log::warn!("upstream feed connectors disabled by configuration");
        Arc::new(FeedManager::empty())
    } else {
        Arc::new(FeedManager::spawn(
            standard_feeds(&config),
            events_tx,
            metrics.clone(),
            &shutdown_tx,
        ))
    };

    let ingest_handle = ingest.clone().run(events_rx, shutdown_tx.subscribe());
    let ping_handle = hub::start_pings(hub.clone(), shutdown_tx.subscribe());

    let state = AppState {
        config: config.clone(),
        store,
        settings,
        ratelimit,
        metrics,
        hub,
        feeds,
        ingest,
        started_at: Utc::now(),
    };

    let maintenance_handle = http::spawn_maintenance(state.clone(), shutdown_tx.subscribe());
    let server_handle = tokio::spawn(http::serve(state, shutdown_tx.subscribe()));

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
                        log::error!("failed to install SIGTERM handler: {e}");
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

    let _ = tokio::try_join!(ingest_handle, ping_handle, maintenance_handle);
    match server_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::error!("http server error: {e}"),
        Err(e) => log::error!("http server task panicked: {e}"),
    }

    log::info!("Shutdown complete.");
    Ok(())
}
