//! Levial voice agent server.
//!
//! Loads settings, wires the orchestrator to its collaborators and serves the
//! websocket control gateway on `/ws` plus a `GET /status` snapshot.

mod services;
mod settings;
mod state;
mod ws;

use std::sync::Arc;

use anyhow::Context;
use axum::{routing::get, Router};
use levial_core::{ObserverHub, Orchestrator};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::settings::{default_settings_path, load_settings, save_settings};
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "levial=info,levial_core=info".into()),
        )
        .init();

    let settings_path = default_settings_path();
    let mut settings = load_settings(&settings_path);
    if !settings_path.exists() {
        match save_settings(&settings_path, &settings) {
            Ok(()) => info!(path = ?settings_path, "wrote default settings"),
            Err(e) => warn!(path = ?settings_path, "could not write default settings: {e}"),
        }
    }
    settings.apply_env_overrides();
    info!(path = ?settings_path, stub = settings.stub_services, "settings loaded");

    let hub = Arc::new(ObserverHub::new());
    let collaborators = services::build_collaborators(&settings, &hub)?;
    let orchestrator = Orchestrator::with_hub(settings.orchestrator.clone(), collaborators, hub);
    let state = AppState::new(orchestrator.commands(), orchestrator.hub());

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/status", get(ws::status_handler))
        .layer(cors)
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&settings.bind_address)
        .await
        .with_context(|| format!("binding {}", settings.bind_address))?;
    info!("levial listening on ws://{}/ws", settings.bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    orchestrator.shutdown().await;
    info!("levial stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("ctrl-c handler unavailable: {e}");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
