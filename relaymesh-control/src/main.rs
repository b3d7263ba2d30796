/**
 * RELAYMESH CONTROL - control plane entry point
 *
 * ROLE: wires config, node store, scoring scheduler, retention sweeper and
 * the HTTP API, then serves until SIGINT/SIGTERM.
 */

mod config;
mod error;
mod health;
mod http;
mod ingest;
mod models;
mod retention;
mod scheduler;
mod scoring;
mod selection;
mod state;
mod store;

use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use crate::config::load_config;
use crate::health::HealthTracker;
use crate::retention::spawn_retention_sweeper;
use crate::scheduler::ScoringScheduler;
use crate::state::AppState;
use crate::store::NodeStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = load_config().await.context("failed to load control configuration")?;
    let store = Arc::new(NodeStore::open(&cfg.db_path).context("failed to open node store")?);

    for (id, node) in &cfg.nodes {
        store
            .upsert_node(id, node)
            .with_context(|| format!("failed to seed node {id}"))?;
    }
    tracing::info!(seeded = cfg.nodes.len(), "node registry ready");

    let health_tracker = HealthTracker::new();

    let scheduler = ScoringScheduler::new(store.clone(), &cfg);
    let scheduler = if cfg.scheduler.enabled {
        scheduler.start()
    } else {
        tracing::warn!("scoring scheduler disabled, scores only change on manual runs");
        scheduler.manual()
    };

    let sweeper = spawn_retention_sweeper(
        store.clone(),
        time::Duration::hours(cfg.retention.keep_hours as i64),
        Duration::from_secs(cfg.retention.sweep_interval_secs),
        health_tracker.clone(),
    );

    let addr: SocketAddr = cfg
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", cfg.bind))?;

    let app_state = AppState {
        store,
        cfg: Arc::new(cfg),
        health_tracker,
        scheduler: scheduler.clone(),
    };
    let app = http::build_router(app_state);

    let listener = TcpListener::bind(addr).await.with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, "relaymesh control plane listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server error")?;

    scheduler.stop();
    sweeper.abort();
    tracing::info!("relaymesh control plane stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received SIGINT"),
        _ = terminate => tracing::info!("received SIGTERM"),
    }
}
