//! HTTP + WebSocket surface.
//!
//! - `POST /generate-meme` runs the pipeline for a connected client
//! - `GET /ws/{client_id}` opens the client's review channel
//! - `GET /runs/{run_id}` returns a stored run record
//! - `GET /health`

pub mod api;
pub mod ws;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, http::HeaderValue, routing::get};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::collaborators;
use crate::config::AppConfig;
use crate::pipeline::{IterationController, StageRunner};
use crate::store;

pub use api::{AppState, SharedState};

/// Build the full application router.
pub fn build_router(state: SharedState, cors_origins: &[String]) -> Router {
    api::api_router()
        .route("/ws/{client_id}", get(ws::ws_handler))
        .with_state(state)
        .layer(cors_layer(cors_origins))
        .layer(TraceLayer::new_for_http())
}

/// Any origin when the list is empty; otherwise only the listed ones.
fn cors_layer(origins: &[String]) -> CorsLayer {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(origin = %o, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if allowed.is_empty() {
        layer.allow_origin(Any)
    } else {
        layer.allow_origin(AllowOrigin::list(allowed))
    }
}

/// Assemble shared state from configuration and a stage runner.
pub fn build_state(config: &AppConfig, stages: StageRunner) -> SharedState {
    let controller = IterationController::new(
        stages,
        config.pipeline.max_iterations,
        store::from_config(&config.history),
    );
    Arc::new(AppState::new(controller, config.approval_timeout()))
}

/// Start the server and block until Ctrl-C.
pub async fn start_server(config: &AppConfig) -> Result<()> {
    let stages = collaborators::build_stage_runner(config)?;
    let state = build_state(config, stages);
    let app = build_router(state, &config.server.cors_origins);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(
        %local_addr,
        max_iterations = config.pipeline.max_iterations,
        approval_timeout_secs = config.pipeline.approval_timeout_secs,
        "server listening"
    );
    println!("memeloop running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    println!("Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    println!("\nShutting down...");
}
