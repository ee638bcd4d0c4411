//! Headless practice agent.
//!
//! Opens the local store, then runs the periodic feedback flush and, when a
//! backend is configured, periodic sync until interrupted.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use repertoire_desktop::sync::HttpRemote;
use repertoire_desktop::workers::{FlushJob, FlushWorker, SyncJob, SyncWorker};
use repertoire_desktop::{AppConfig, AppState, SqliteRepository, SyncConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    info!(path = %config.db_path.display(), "opening local store");
    let mut repository = SqliteRepository::open(&config.db_path)?;
    if let Some(device_id) = &config.device_id {
        repository = repository.with_device_id(device_id.clone())?;
    }
    info!(device_id = repository.device_id(), "local store ready");

    let mut state = AppState::new(repository);
    if let Some(url) = &config.backend_url {
        let remote = HttpRemote::new(url, config.sync_timeout)?;
        let sync_config = SyncConfig::new().with_timeout(config.sync_timeout);
        state = state.with_remote(Arc::new(remote), sync_config);
        info!(backend = %url, "sync enabled");
    } else {
        info!("no backend configured, running offline");
    }

    let flush = FlushWorker::new(
        FlushJob::new(state.feedback.clone(), state.repository.clone()),
        config.flush_interval,
    );
    flush.start();

    let sync = state
        .engine
        .clone()
        .map(|engine| SyncWorker::new(SyncJob::new(engine), config.sync_interval));
    if let Some(worker) = &sync {
        worker.start();
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutting down");

    flush.stop().await;
    if let Some(worker) = &sync {
        worker.stop().await;
    }
    Ok(())
}
