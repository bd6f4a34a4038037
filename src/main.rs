//! Workflow Gateway - Main Application Entry Point
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment variables
//! 2. Open the store: PostgreSQL (with migrations) or in-memory
//! 3. Build the engine client
//! 4. Spawn the reaper and, if configured, the schedule ticker
//! 5. Serve until Ctrl-C, then stop the background tasks

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use workflow_gateway::config::Config;
use workflow_gateway::engine::HttpEngine;
use workflow_gateway::services::{scheduler, tracker};
use workflow_gateway::state::AppState;
use workflow_gateway::store::Store;
use workflow_gateway::store::memory::MemoryStore;
use workflow_gateway::store::postgres::PgStore;
use workflow_gateway::{build_router, db};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Reads RUST_LOG, defaults to "info"
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env()?;
    tracing::info!("Configuration loaded");
    warn_about_open_routes(&config);

    let store: Arc<dyn Store> = match &config.database_url {
        Some(url) => {
            let pool = db::create_pool(url).await?;
            tracing::info!("Database pool created");
            db::run_migrations(&pool).await?;
            tracing::info!("Database migrations complete");
            Arc::new(PgStore::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using the in-memory store");
            Arc::new(MemoryStore::new())
        }
    };

    let engine = Arc::new(HttpEngine::from_config(&config)?);
    let port = config.server_port;
    let reaper_interval = Duration::from_secs(config.reaper_interval_secs.max(1));
    let scheduler_interval = config.scheduler_interval_secs;

    let state = AppState::new(store, engine, config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = vec![tokio::spawn(tracker::run_reaper(
        state.clone(),
        reaper_interval,
        shutdown_rx.clone(),
    ))];
    if scheduler_interval > 0 {
        tasks.push(tokio::spawn(scheduler::run_scheduler(
            state.clone(),
            Duration::from_secs(scheduler_interval),
            shutdown_rx,
        )));
    }

    let app = build_router(state);

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    for task in tasks {
        if let Err(e) = task.await {
            tracing::error!(error = %e, "background task panicked");
        }
    }
    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

fn warn_about_open_routes(config: &Config) {
    if config.cron_secret.is_none() {
        tracing::warn!("CRON_SECRET not set, /api/cron/execute is unauthenticated");
    }
    if config.engine_secret.is_none() {
        tracing::warn!("ENGINE_SECRET not set, engine callbacks are unauthenticated and webhooks unsigned");
    }
    if config.dashboard_secret.is_none() {
        tracing::warn!("DASHBOARD_SECRET not set, every /internal request will be refused");
    }
}
