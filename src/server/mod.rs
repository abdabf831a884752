//! HTTP surface: the job API, the websocket progress channel and the serve loop.

pub mod api;
pub mod ws;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::channel::ProgressChannel;
use crate::config::GenforgeConfig;
use crate::jobs::JobStore;
use crate::orchestrator::Orchestrator;
use crate::orchestrator::reaper::spawn_reaper;

pub use api::{AppState, SharedState};

/// Build the full application router: API routes plus `/ws/{topic}`.
pub fn build_router(state: SharedState) -> Router {
    api::api_router()
        .route("/ws/{topic}", get(ws::ws_handler))
        .with_state(state)
}

/// Open the store, wire the orchestrator from config and serve until Ctrl+C.
pub async fn start_server(config: &GenforgeConfig) -> Result<()> {
    config.ensure_directories()?;
    let db_path = config.db_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }

    let store = JobStore::open(&db_path)
        .with_context(|| format!("Failed to open job store at {}", db_path.display()))?;
    let channel = Arc::new(ProgressChannel::new(config.toml.server.channel_capacity));
    let orchestrator = Orchestrator::from_config(config, store, channel)?;

    let reaper = config.stale_after().map(|stale_after| {
        spawn_reaper(
            Arc::clone(&orchestrator),
            stale_after,
            orchestrator.shutdown_token(),
        )
    });

    let state = Arc::new(AppState {
        orchestrator: Arc::clone(&orchestrator),
    });
    let app = build_router(state).layer(CorsLayer::permissive());

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr = listener.local_addr()?;
    info!(%local_addr, db = %db_path.display(), "genforge server listening");
    println!("genforge running at http://{}", local_addr);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error");

    orchestrator.shutdown().await;
    if let Some(reaper) = reaper {
        let _ = reaper.await;
    }
    served?;

    println!("Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for Ctrl+C; shutting down");
    }
    info!("shutdown requested");
}
