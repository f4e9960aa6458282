//! Runner HTTP surface: worker protocol + admin endpoints.

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use base64::Engine;

use super::protocol::{AssignRequest, WorkerResult};
use super::{SharedRunner, assign, ingest, queue, watchdog};
use crate::errors::RunnerError;
use crate::metrics::METRICS;
use crate::state::models::Worker;
use crate::state::views;

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    Conflict(String),
    BadRequest(String),
    Unauthorized(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<RunnerError> for ApiError {
    fn from(err: RunnerError) -> Self {
        match &err {
            RunnerError::UnknownRun(_) | RunnerError::UnknownCodebase(_) => {
                ApiError::NotFound(err.to_string())
            }
            RunnerError::AlreadyFinished(_)
            | RunnerError::DuplicateSchedule { .. }
            | RunnerError::AssignmentFailed => ApiError::Conflict(err.to_string()),
            RunnerError::InvalidResult(_) | RunnerError::InvalidLogName(_) => {
                ApiError::BadRequest(err.to_string())
            }
            RunnerError::EmptyQueue => ApiError::NotFound(err.to_string()),
            RunnerError::UploadFailed(_) | RunnerError::Other(_) => {
                ApiError::Internal(err.to_string())
            }
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn router(state: SharedRunner) -> Router {
    Router::new()
        .route("/runner/assign", post(assign_handler))
        .route("/runner/peek", get(peek_handler))
        .route("/runner/queue", get(queue_handler))
        .route("/runner/schedule", post(schedule_handler))
        .route("/runner/schedule-control", post(schedule_control_handler))
        .route("/runner/active-runs", get(active_runs_handler))
        .route("/runner/active-runs/{log_id}", get(active_run_handler))
        .route("/runner/active-runs/{log_id}/finish", post(finish_handler))
        .route("/runner/active-runs/{log_id}/ping", post(ping_handler))
        .route(
            "/runner/active-runs/{log_id}/logs/{name}",
            put(upload_log_handler),
        )
        .route("/runner/runs/{run_id}", get(run_handler))
        .route("/runner/runs/{run_id}/kill", post(kill_handler))
        .route("/runner/runs/{run_id}/logs", get(log_index_handler))
        .route("/runner/runs/{run_id}/logs/{name}", get(log_file_handler))
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

// ── Worker authentication ─────────────────────────────────────────────

async fn authenticate_worker(
    state: &SharedRunner,
    headers: &HeaderMap,
) -> Result<Worker, ApiError> {
    let raw = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::Unauthorized("Missing Authorization header".into()))?;
    let encoded = raw
        .strip_prefix("Basic ")
        .ok_or_else(|| ApiError::Unauthorized("Expected Basic authentication".into()))?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|_| ApiError::Unauthorized("Invalid Basic credentials".into()))?;
    let decoded = String::from_utf8(decoded)
        .map_err(|_| ApiError::Unauthorized("Invalid Basic credentials".into()))?;
    let (name, password) = decoded
        .split_once(':')
        .ok_or_else(|| ApiError::Unauthorized("Invalid Basic credentials".into()))?;

    let name_owned = name.to_string();
    let worker = state
        .db
        .call(move |db| db.get_worker(&name_owned))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .ok_or_else(|| ApiError::Unauthorized("Unknown worker".into()))?;
    if worker.password != password {
        return Err(ApiError::Unauthorized("Bad credentials".into()));
    }
    Ok(worker)
}

// ── Worker-facing handlers ────────────────────────────────────────────

async fn assign_handler(
    State(state): State<SharedRunner>,
    headers: HeaderMap,
    Json(req): Json<AssignRequest>,
) -> Result<Response, ApiError> {
    let worker = authenticate_worker(&state, &headers).await?;
    match assign::assign(&state, worker.name, req).await {
        Ok(assignment) => Ok(Json(assignment).into_response()),
        // An empty queue is a normal outcome: the worker backs off and
        // retries, it did nothing wrong.
        Err(RunnerError::EmptyQueue) => {
            Ok(Json(serde_json::json!({"reason": "empty-queue"})).into_response())
        }
        Err(err) => Err(err.into()),
    }
}

async fn peek_handler(
    State(state): State<SharedRunner>,
    headers: HeaderMap,
    Query(req): Query<AssignRequest>,
) -> Result<Response, ApiError> {
    authenticate_worker(&state, &headers).await?;
    match assign::peek(&state, req).await {
        Ok(assignment) => Ok(Json(assignment).into_response()),
        Err(RunnerError::EmptyQueue) => {
            Ok(Json(serde_json::json!({"reason": "empty-queue"})).into_response())
        }
        Err(err) => Err(err.into()),
    }
}

async fn finish_handler(
    State(state): State<SharedRunner>,
    headers: HeaderMap,
    Path(log_id): Path<String>,
    Json(result): Json<WorkerResult>,
) -> Result<Response, ApiError> {
    authenticate_worker(&state, &headers).await?;
    let run = ingest::finish(&state, &log_id, result).await?;
    Ok((StatusCode::CREATED, Json(run)).into_response())
}

async fn upload_log_handler(
    State(state): State<SharedRunner>,
    headers: HeaderMap,
    Path((log_id, name)): Path<(String, String)>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    authenticate_worker(&state, &headers).await?;
    ingest::stage_upload(&state, &log_id, &name, &body).await?;
    Ok(StatusCode::CREATED)
}

async fn ping_handler(
    State(state): State<SharedRunner>,
    headers: HeaderMap,
    Path(log_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    authenticate_worker(&state, &headers).await?;
    let id = log_id.clone();
    let known = state
        .db
        .call(move |db| db.record_heartbeat(&id, chrono::Utc::now()))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    if known {
        Ok(StatusCode::OK)
    } else {
        Err(ApiError::NotFound(format!("no active run {log_id}")))
    }
}

// ── Admin handlers ────────────────────────────────────────────────────

async fn schedule_handler(
    State(state): State<SharedRunner>,
    Json(req): Json<queue::ScheduleRequest>,
) -> Result<Response, ApiError> {
    let resp = state
        .db
        .call(move |db| Ok(queue::schedule(db, &req)))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))??;
    Ok((StatusCode::CREATED, Json(resp)).into_response())
}

async fn schedule_control_handler(
    State(state): State<SharedRunner>,
    Json(req): Json<queue::ScheduleRequest>,
) -> Result<Response, ApiError> {
    let resp = state
        .db
        .call(move |db| Ok(queue::schedule_control(db, &req)))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))??;
    Ok((StatusCode::CREATED, Json(resp)).into_response())
}

async fn queue_handler(State(state): State<SharedRunner>) -> Result<Response, ApiError> {
    let items = state
        .db
        .call(|db| db.list_queue())
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    let view: Vec<serde_json::Value> = items
        .iter()
        .enumerate()
        .map(|(idx, item)| {
            serde_json::json!({
                "position": idx + 1,
                "queue_id": item.id,
                "codebase": item.codebase,
                "campaign": item.campaign,
                "command": item.command,
                "bucket": item.bucket.as_str(),
                "priority": item.priority,
                "estimated_duration_secs": item.estimated_duration_secs,
                "requester": item.requester,
                "refresh": item.refresh,
            })
        })
        .collect();
    Ok(Json(view).into_response())
}

async fn active_runs_handler(State(state): State<SharedRunner>) -> Result<Response, ApiError> {
    let runs = state
        .db
        .call(|db| db.list_active_runs())
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(runs).into_response())
}

async fn active_run_handler(
    State(state): State<SharedRunner>,
    Path(log_id): Path<String>,
) -> Result<Response, ApiError> {
    let id = log_id.clone();
    let run = state
        .db
        .call(move |db| db.get_active_run(&id))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .ok_or_else(|| ApiError::NotFound(format!("no active run {log_id}")))?;
    Ok(Json(run).into_response())
}

async fn run_handler(
    State(state): State<SharedRunner>,
    Path(run_id): Path<String>,
) -> Result<Response, ApiError> {
    let id = run_id.clone();
    let run = state
        .db
        .call(move |db| db.get_run(&id))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .ok_or_else(|| ApiError::NotFound(format!("no run {run_id}")))?;
    Ok(Json(run).into_response())
}

async fn kill_handler(
    State(state): State<SharedRunner>,
    Path(run_id): Path<String>,
) -> Result<Response, ApiError> {
    let run = watchdog::kill(&state, &run_id).await?;
    Ok(Json(run).into_response())
}

async fn log_index_handler(
    State(state): State<SharedRunner>,
    Path(run_id): Path<String>,
) -> Result<Response, ApiError> {
    let id = run_id.clone();
    let known = state
        .db
        .call(move |db| db.get_run(&id))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .is_some();
    if !known {
        return Err(ApiError::NotFound(format!("no run {run_id}")));
    }
    let names = state
        .artifacts
        .list_logs(&run_id)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(names).into_response())
}

async fn log_file_handler(
    State(state): State<SharedRunner>,
    Path((run_id, name)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let bytes = state
        .artifacts
        .retrieve_log(&run_id, &name)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .ok_or_else(|| ApiError::NotFound(format!("no log {name} for run {run_id}")))?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        bytes,
    )
        .into_response())
}

// ── Probes ────────────────────────────────────────────────────────────

async fn health_handler() -> StatusCode {
    StatusCode::OK
}

async fn ready_handler(State(state): State<SharedRunner>) -> StatusCode {
    let probe = state
        .db
        .call(|db| {
            views::queue_position(db.connection(), -1)?;
            Ok(())
        })
        .await;
    match probe {
        Ok(()) => StatusCode::OK,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn metrics_handler() -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        METRICS.render(),
    )
        .into_response()
}
