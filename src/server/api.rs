use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{RunError, SessionError};
use crate::pipeline::{ChannelReviewer, FinalResult, FinalStatus, IterationController, RunFailure};
use crate::session::{ApprovalGateway, ChannelRegistry, Correlator};
use crate::store::RunRecord;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub registry: Arc<ChannelRegistry>,
    pub correlator: Arc<Correlator>,
    pub gateway: Arc<ApprovalGateway>,
    pub controller: Arc<IterationController>,
    pub approval_timeout: Duration,
}

impl AppState {
    pub fn new(controller: IterationController, approval_timeout: Duration) -> Self {
        let correlator = Arc::new(Correlator::new());
        let registry = Arc::new(ChannelRegistry::new(Arc::clone(&correlator)));
        let gateway = Arc::new(ApprovalGateway::new(
            Arc::clone(&registry),
            Arc::clone(&correlator),
        ));
        Self {
            registry,
            correlator,
            gateway,
            controller: Arc::new(controller),
            approval_timeout,
        }
    }
}

pub type SharedState = Arc<AppState>;

// ── Request / response payloads ───────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    pub prompt: String,
    #[serde(default)]
    pub client_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub meme_url: String,
    pub result: String,
    pub iterations: usize,
    pub approved: bool,
    pub status: FinalStatus,
    pub run_id: Uuid,
}

impl From<FinalResult> for GenerateResponse {
    fn from(result: FinalResult) -> Self {
        let iterations = result.context.len();
        let summary = match result.status {
            FinalStatus::Approved => format!(
                "Meme approved after {} iteration{}",
                iterations,
                if iterations == 1 { "" } else { "s" }
            ),
            FinalStatus::MaxIterationsExceeded => format!(
                "No approval after {} iterations; returning the last attempt",
                iterations
            ),
        };
        Self {
            meme_url: result.artifact.url,
            result: summary,
            iterations,
            approved: result.status == FinalStatus::Approved,
            status: result.status,
            run_id: result.run_id,
        }
    }
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    /// The run ended because its channel went away.
    Gone {
        message: String,
        run_id: Uuid,
        iterations: usize,
    },
    /// A content stage failed.
    BadGateway {
        message: String,
        run_id: Uuid,
        iterations: usize,
    },
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, serde_json::json!({"error": msg})),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, serde_json::json!({"error": msg})),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, serde_json::json!({"error": msg})),
            ApiError::Gone {
                message,
                run_id,
                iterations,
            } => (
                StatusCode::GONE,
                serde_json::json!({"error": message, "run_id": run_id, "iterations": iterations}),
            ),
            ApiError::BadGateway {
                message,
                run_id,
                iterations,
            } => (
                StatusCode::BAD_GATEWAY,
                serde_json::json!({"error": message, "run_id": run_id, "iterations": iterations}),
            ),
            ApiError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({"error": msg}),
            ),
        };
        (status, Json(body)).into_response()
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NoSuchSession { .. } => ApiError::BadRequest(
                "Client must be connected via WebSocket first.".to_string(),
            ),
            SessionError::RunInProgress { .. } => ApiError::Conflict(err.to_string()),
            SessionError::DuplicateSession { .. } => ApiError::Conflict(err.to_string()),
        }
    }
}

impl From<RunFailure> for ApiError {
    fn from(failure: RunFailure) -> Self {
        let iterations = failure.context.len();
        match failure.error {
            RunError::Aborted(e) => ApiError::Gone {
                message: e.to_string(),
                run_id: failure.run_id,
                iterations,
            },
            RunError::Stage(e) => ApiError::BadGateway {
                message: e.to_string(),
                run_id: failure.run_id,
                iterations,
            },
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/generate-meme", post(generate_meme))
        .route("/runs/{run_id}", get(get_run))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn generate_meme(
    State(state): State<SharedState>,
    Json(req): Json<GenerateRequest>,
) -> Result<Json<GenerateResponse>, ApiError> {
    let client_id = req
        .client_id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| {
            ApiError::BadRequest("Client must be connected via WebSocket first.".to_string())
        })?;
    if req.prompt.trim().is_empty() {
        return Err(ApiError::BadRequest("prompt must not be empty".to_string()));
    }

    let guard = state.registry.claim_run(&client_id)?;
    tracing::info!(client_id = %client_id, prompt = %req.prompt, "generation requested");

    let reviewer = ChannelReviewer::new(
        &guard,
        Arc::clone(&state.gateway),
        Arc::clone(&state.registry),
        state.approval_timeout,
    );
    let outcome = state.controller.run(&req.prompt, &reviewer).await;

    // The channel's job ends with the pipeline.
    state
        .registry
        .deregister_session(guard.client_id(), guard.session_id());
    drop(guard);

    match outcome {
        Ok(result) => Ok(Json(result.into())),
        Err(failure) => {
            tracing::warn!(client_id = %client_id, run_id = %failure.run_id, error = %failure.error, "run failed");
            Err(failure.into())
        }
    }
}

async fn get_run(
    State(state): State<SharedState>,
    Path(run_id): Path<String>,
) -> Result<Json<RunRecord>, ApiError> {
    let run_id = Uuid::parse_str(&run_id)
        .map_err(|_| ApiError::BadRequest(format!("Invalid run id: {}", run_id)))?;
    match state.controller.store().load(run_id).await {
        Ok(Some(record)) => Ok(Json(record)),
        Ok(None) => Err(ApiError::NotFound(format!("Run {} not found", run_id))),
        Err(e) => {
            tracing::error!(%run_id, error = %e, "failed to load run record");
            Err(ApiError::Internal(format!("Failed to load run {}", run_id)))
        }
    }
}
