//! HTTP control plane for simd.
//!
//! Local-only REST API over the run orchestrator, with optional bearer-token auth.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sim_core::aggregate::{ActionFilter, ActorStats, RoundRange, RoundSummary};
use sim_core::{ActionRecord, Id, PlatformSelector, RunSnapshot};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::orchestrator::{OrchestratorError, RunOrchestrator, DEFAULT_ACTIONS_LIMIT};

/// Shared state for HTTP handlers.
#[derive(Debug)]
pub struct AppState {
    pub orchestrator: Arc<RunOrchestrator>,
    pub auth_token: Option<String>,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Create the HTTP router with all endpoints.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/runs", get(list_runs))
        .route("/runs/{id}", get(get_run))
        .route("/runs/{id}/start", post(start_run))
        .route("/runs/{id}/stop", post(stop_run))
        .route("/runs/{id}/actions", get(get_actions))
        .route("/runs/{id}/timeline", get(get_timeline))
        .route("/runs/{id}/agents", get(get_agents))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the API on 127.0.0.1 until `shutdown` resolves.
pub async fn start_server(
    orchestrator: Arc<RunOrchestrator>,
    port: u16,
    auth_token: Option<String>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let state = Arc::new(AppState {
        orchestrator,
        auth_token,
    });

    let router = create_router(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    info!("HTTP server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}

/// Validate auth token if configured.
fn check_auth(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = &state.auth_token else {
        return Ok(());
    };
    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.strip_prefix("Bearer ").unwrap_or(s));

    match provided {
        Some(token) if token == expected => Ok(()),
        Some(_) => Err(api_error(StatusCode::UNAUTHORIZED, "invalid auth token")),
        None => Err(api_error(StatusCode::UNAUTHORIZED, "missing auth token")),
    }
}

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

/// Status code for each orchestrator failure.
pub fn error_status(err: &OrchestratorError) -> StatusCode {
    match err {
        OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
        OrchestratorError::AlreadyRunning(_) | OrchestratorError::NotRunning { .. } => {
            StatusCode::CONFLICT
        }
        OrchestratorError::MissingLaunchSpec(_)
        | OrchestratorError::InvalidPlatform(_)
        | OrchestratorError::InvalidRunId(_) => StatusCode::UNPROCESSABLE_ENTITY,
        OrchestratorError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        OrchestratorError::LaunchFailed(_) | OrchestratorError::Store(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Run id from the URL path. Percent-decoded by axum, so `..%2F` arrives as `../`.
fn parse_run_id(id: &str) -> Result<Id, ApiError> {
    Id::parse(id).ok_or_else(|| {
        warn!(run_id = %id, "rejected invalid run id");
        api_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            OrchestratorError::InvalidRunId(id.to_string()).to_string(),
        )
    })
}

fn map_error(run_id: &Id, err: OrchestratorError) -> ApiError {
    let status = error_status(&err);
    if status.is_server_error() {
        error!(run_id = %run_id, error = %err, "request failed");
    } else {
        warn!(run_id = %run_id, error = %err, "request rejected");
    }
    api_error(status, err.to_string())
}

// --- Request/Response types ---

/// Error response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Request payload for POST /runs/{id}/start.
#[derive(Debug, Default, Deserialize)]
pub struct StartRunRequest {
    #[serde(default)]
    pub platform: PlatformSelector,
}

/// Response for run-returning endpoints.
#[derive(Debug, Serialize)]
pub struct RunResponse {
    pub run: RunSnapshot,
}

/// Response for GET /runs.
#[derive(Debug, Serialize)]
pub struct ListRunsResponse {
    pub run_ids: Vec<Id>,
}

/// Query params for GET /runs/{id}/actions.
#[derive(Debug, Default, Deserialize)]
pub struct ActionsQuery {
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub actor_id: Option<u64>,
    #[serde(default)]
    pub round: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct ActionsResponse {
    pub count: usize,
    pub actions: Vec<ActionRecord>,
}

#[derive(Debug, Serialize)]
pub struct TimelineResponse {
    pub rounds_count: usize,
    pub timeline: Vec<RoundSummary>,
}

#[derive(Debug, Serialize)]
pub struct AgentsResponse {
    pub agents_count: usize,
    pub stats: Vec<ActorStats>,
}

// --- Handlers ---

/// Health check endpoint.
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// GET /runs - Ids of runs with a live worker.
async fn list_runs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    let run_ids = state.orchestrator.list_active_runs().await;
    Ok(Json(ListRunsResponse { run_ids }))
}

/// GET /runs/{id} - Current state of a run.
async fn get_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let run_id = parse_run_id(&id)?;
    let run = state
        .orchestrator
        .get_state(&run_id)
        .await
        .map_err(|e| map_error(&run_id, e))?;

    Ok(Json(RunResponse { run: run.into() }))
}

/// POST /runs/{id}/start - Launch a worker for a staged run.
async fn start_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<StartRunRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let run_id = parse_run_id(&id)?;
    let run = state
        .orchestrator
        .start(&run_id, req.platform)
        .await
        .map_err(|e| map_error(&run_id, e))?;

    info!(run_id = %run_id, "started run via API");
    Ok((StatusCode::CREATED, Json(RunResponse { run: run.into() })))
}

/// POST /runs/{id}/stop - Stop a running run.
async fn stop_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let run_id = parse_run_id(&id)?;
    let run = state
        .orchestrator
        .stop(&run_id)
        .await
        .map_err(|e| map_error(&run_id, e))?;

    info!(run_id = %run_id, status = %run.status, "stopped run via API");
    Ok(Json(RunResponse { run: run.into() }))
}

/// GET /runs/{id}/actions - Newest-first action history.
async fn get_actions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<ActionsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let run_id = parse_run_id(&id)?;
    let filter = ActionFilter {
        channel: query.channel,
        actor_id: query.actor_id,
        round: query.round,
    };
    let actions = state
        .orchestrator
        .get_actions(
            &run_id,
            &filter,
            query.offset.unwrap_or(0),
            query.limit.unwrap_or(DEFAULT_ACTIONS_LIMIT),
        )
        .await
        .map_err(|e| map_error(&run_id, e))?;

    Ok(Json(ActionsResponse {
        count: actions.len(),
        actions,
    }))
}

/// GET /runs/{id}/timeline - Per-round summaries.
async fn get_timeline(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(range): Query<RoundRange>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let run_id = parse_run_id(&id)?;
    let timeline = state
        .orchestrator
        .get_timeline(&run_id, range)
        .await
        .map_err(|e| map_error(&run_id, e))?;

    Ok(Json(TimelineResponse {
        rounds_count: timeline.len(),
        timeline,
    }))
}

/// GET /runs/{id}/agents - Per-actor statistics.
async fn get_agents(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let run_id = parse_run_id(&id)?;
    let stats = state
        .orchestrator
        .get_actor_stats(&run_id)
        .await
        .map_err(|e| map_error(&run_id, e))?;

    Ok(Json(AgentsResponse {
        agents_count: stats.len(),
        stats,
    }))
}
