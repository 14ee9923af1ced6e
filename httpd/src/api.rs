//! REST API implementation for the control plane (C8).
//!
//! Each public function corresponds to one endpoint in the wire contract.
//! Handlers validate, queue, and return immediately; execution happens on a
//! spawned background task so the HTTP event loop never blocks on a child
//! process.

use std::sync::{Arc, Mutex};

use axum::extract::{DefaultBodyLimit, Multipart, Path as AxumPath, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use core_engine::eventlog::EventRing;
use core_engine::executor::ExecutionController;
use core_engine::model::{RunRecord, RunRequest, RunStatus};
use core_engine::registry::ActiveRunHandle;
use core_engine::retry::RetryDriver;

use crate::state::AppState;

const MAX_ARGV_LEN: usize = 50;
const EVENT_RING_CAPACITY: usize = 256;
// Uploaded scripts are source files, not payloads; 10MB keeps memory bounded
// without rejecting anything a reasonable script bundle would need.
const MAX_UPLOAD_SIZE: usize = 10 * 1024 * 1024;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/run", post(create_run))
        .route("/api/run/upload", post(upload_run))
        .route("/api/runs", get(list_runs))
        .route("/api/runs/{id}", get(get_run))
        .route("/api/runs/{id}/cancel", post(cancel_run))
        .route("/api/runs/{id}/stop", post(stop_run))
        .route("/api/runs/{id}/kill", post(kill_run))
        .route("/api/runs/{id}/restart", post(restart_run))
        .route("/api/runs/{id}/logs", get(run_logs))
        .route("/api/runs/{id}/events", get(run_events))
        .route("/api/stats", get(stats))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_SIZE))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("not found")]
    NotFound,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "run not found".to_string()),
            ApiError::Conflict(m) => (StatusCode::CONFLICT, m.clone()),
            ApiError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m.clone()),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

async fn health() -> impl IntoResponse {
    StatusCode::OK
}

fn validate_request(state: &AppState, request: &RunRequest) -> Result<(), ApiError> {
    state
        .path_policy
        .validate(&request.script_path)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    if let Some(timeout) = request.timeout_seconds {
        if timeout <= 0.0 {
            return Err(ApiError::BadRequest("timeout must be > 0".to_string()));
        }
    }
    if request.argv.len() > MAX_ARGV_LEN {
        return Err(ApiError::BadRequest(format!(
            "argv length {} exceeds the limit of {MAX_ARGV_LEN}",
            request.argv.len()
        )));
    }
    if let Some(dir) = &request.working_dir {
        let path = std::path::Path::new(dir);
        if !path.is_dir() {
            return Err(ApiError::BadRequest(format!(
                "working_dir {dir} does not exist or is not a directory"
            )));
        }
    }
    Ok(())
}

#[derive(Debug, serde::Serialize)]
struct EnqueueResponse {
    run_id: Uuid,
    status: &'static str,
}

async fn create_run(
    State(state): State<AppState>,
    Json(request): Json<RunRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validate_request(&state, &request)?;
    let run_id = submit_run(state, request).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(EnqueueResponse {
            run_id,
            status: "queued",
        }),
    ))
}

async fn upload_run(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let mut script_path: Option<std::path::PathBuf> = None;
    let mut argv: Vec<String> = Vec::new();
    let mut timeout_seconds: Option<f64> = None;

    std::fs::create_dir_all(&state.uploads_dir)
        .map_err(|e| ApiError::Internal(format!("failed to create uploads dir: {e}")))?;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("invalid multipart payload: {e}")))?
    {
        match field.name().unwrap_or_default() {
            "script" => {
                let original_name = field.file_name().unwrap_or("script.py").to_string();
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("failed to read upload: {e}")))?;
                let stored_name = format!("{}-{original_name}", Uuid::new_v4());
                let dest = state.uploads_dir.join(&stored_name);
                std::fs::write(&dest, &data)
                    .map_err(|e| ApiError::Internal(format!("failed to store upload: {e}")))?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    let _ = std::fs::set_permissions(&dest, std::fs::Permissions::from_mode(0o755));
                }
                script_path = Some(dest);
            }
            "argv" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("invalid argv field: {e}")))?;
                argv = text.split_whitespace().map(str::to_string).collect();
            }
            "timeout_seconds" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("invalid timeout field: {e}")))?;
                timeout_seconds = text.parse().ok();
            }
            _ => {}
        }
    }

    let script_path = script_path.ok_or_else(|| ApiError::BadRequest("missing script field".to_string()))?;
    let request = RunRequest {
        script_path: script_path.to_string_lossy().into_owned(),
        argv,
        timeout_seconds,
        ..Default::default()
    };
    validate_request(&state, &request)?;
    let run_id = submit_run(state, request).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(EnqueueResponse {
            run_id,
            status: "queued",
        }),
    ))
}

/// Queues a run: writes the initial `Queued` record, then spawns a
/// background task that executes it and updates the registry/history/alerts
/// on completion. Returns immediately with the assigned run id.
pub async fn submit_run(state: AppState, request: RunRequest) -> Result<Uuid, ApiError> {
    let run_id = Uuid::new_v4();
    let correlation_id = Uuid::new_v4();
    let now = chrono::Utc::now();

    let record = RunRecord {
        run_id,
        status: RunStatus::Queued,
        started_at: now,
        finished_at: None,
        request: request.clone(),
        result: None,
        error: None,
        correlation_id,
        run_status: RunStatus::Queued.as_str().to_string(),
        error_summary: None,
    };
    state
        .registry
        .insert(record)
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    let event_ring = state.events.create_ring(run_id, EVENT_RING_CAPACITY);
    let controller = ExecutionController::new(state.path_policy.clone());
    let driver = RetryDriver::new(controller);
    let retry_config = request.retry.clone().unwrap_or_default();

    let handle_slot: core_engine::registry::HandleSlot = Arc::new(Mutex::new(None));
    state.registry.register_active(
        run_id,
        ActiveRunHandle {
            cancel_handle: handle_slot.clone(),
            event_ring: event_ring.clone(),
        },
    );

    tokio::spawn(async move {
        let mut running_record = match state.registry.get(run_id) {
            Some(r) => r,
            None => return,
        };
        running_record.status = RunStatus::Running;
        if let Err(e) = state.registry.update(running_record.clone()) {
            warn!(run_id = %run_id, error = %e, "failed to mark run as running");
        }

        let result = driver
            .run_tracked(request.clone(), retry_config, event_ring.clone(), handle_slot)
            .await;

        if let Err(e) = state.history.save_execution(&result) {
            warn!(run_id = %run_id, error = %e, "failed to persist execution history");
        }
        state.alert_evaluator.evaluate(&state.config.alerts, &result.metrics);

        let final_status = if result.cancelled {
            RunStatus::Cancelled
        } else if result.success {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        };

        running_record.status = final_status;
        running_record.finished_at = Some(chrono::Utc::now());
        running_record.error = result.error.clone();
        running_record.run_status = final_status.as_str().to_string();
        running_record.error_summary = result.error.clone();
        running_record.result = Some(result);

        if let Err(e) = state.registry.update(running_record) {
            error!(run_id = %run_id, error = %e, "failed to persist final run state");
        }
        state.registry.unregister_active(run_id);
        info!(run_id = %run_id, status = %final_status.as_str(), "run finished");
    });

    Ok(run_id)
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default)]
    offset: usize,
    status: Option<String>,
}

fn default_limit() -> usize {
    50
}

fn parse_status_query(raw: &str) -> Option<RunStatus> {
    match raw {
        "queued" => Some(RunStatus::Queued),
        "running" => Some(RunStatus::Running),
        "completed" => Some(RunStatus::Completed),
        "failed" => Some(RunStatus::Failed),
        "cancelled" => Some(RunStatus::Cancelled),
        _ => None,
    }
}

async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = query.limit.clamp(1, 200);
    let status = query.status.as_deref().and_then(parse_status_query);
    let runs = state.registry.list(limit, query.offset, status);
    Ok(Json(runs))
}

async fn get_run(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    state.registry.get(id).map(Json).ok_or(ApiError::NotFound)
}

fn active_or_conflict(state: &AppState, id: Uuid) -> Result<ActiveRunHandle, ApiError> {
    let record = state.registry.get(id).ok_or(ApiError::NotFound)?;
    if record.status.is_terminal() {
        return Err(ApiError::Conflict("run has already finished".to_string()));
    }
    state.registry.active_handle(id).ok_or(ApiError::NotFound)
}

async fn cancel_run(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let handle = active_or_conflict(&state, id)?;
    handle.cancel();
    Ok(StatusCode::OK)
}

async fn stop_run(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let handle = active_or_conflict(&state, id)?;
    handle.stop();
    Ok(StatusCode::OK)
}

async fn kill_run(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let handle = active_or_conflict(&state, id)?;
    handle.kill();
    Ok(StatusCode::OK)
}

async fn restart_run(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state.registry.get(id).ok_or(ApiError::NotFound)?;
    let request = record.request.clone();
    validate_request(&state, &request)?;
    let new_id = submit_run(state, request).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(EnqueueResponse {
            run_id: new_id,
            status: "queued",
        }),
    ))
}

async fn run_logs(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state.registry.get(id).ok_or(ApiError::NotFound)?;
    let body = match record.result {
        Some(result) => format!("{}{}", result.stdout_text, result.stderr_text),
        None => String::new(),
    };
    Ok(body)
}

async fn run_events(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    match state.events.get(id) {
        Some(ring) => Ok(Json(dump_ring(&ring))),
        None => Ok(Json(Vec::new())),
    }
}

fn dump_ring(ring: &Arc<EventRing>) -> Vec<core_engine::eventlog::Event> {
    ring.dump()
}

async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.registry.stats())
}
