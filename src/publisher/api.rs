//! Publisher HTTP surface: manual triggers + admin endpoints.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use serde::Deserialize;

use super::{SharedPublisher, decision, proposals, ratelimit, sweep};
use crate::errors::PublishError;
use crate::metrics::METRICS;
use crate::state::models::{MergeProposalStatus, PolicyRule, PublishMode};
use crate::state::views;

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    RateLimited(String),
    Upstream(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::RateLimited(msg) => (StatusCode::TOO_MANY_REQUESTS, msg),
            ApiError::Upstream(msg) => (StatusCode::BAD_GATEWAY, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<PublishError> for ApiError {
    fn from(err: PublishError) -> Self {
        match &err {
            PublishError::UnknownRun(_)
            | PublishError::NoRunForMp(_)
            | PublishError::UnknownPolicy(_) => ApiError::NotFound(err.to_string()),
            PublishError::BranchRateLimited { .. } => ApiError::RateLimited(err.to_string()),
            PublishError::AuthenticationFailed(_)
            | PublishError::ForgeLoginRequired
            | PublishError::BranchBusy(_)
            | PublishError::BranchUnavailable(_)
            | PublishError::UnexpectedHttpStatus(_)
            | PublishError::NetworkError(_)
            | PublishError::InvalidResponse(_) => ApiError::Upstream(err.to_string()),
            PublishError::Other(_) => ApiError::Internal(err.to_string()),
        }
    }
}

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct PublishRequestBody {
    pub codebase: String,
    pub campaign: String,
    #[serde(default)]
    pub mode: Option<PublishMode>,
    #[serde(default)]
    pub requester: Option<String>,
}

#[derive(Deserialize)]
pub struct MpUpdateBody {
    pub url: String,
    pub status: MergeProposalStatus,
}

#[derive(Deserialize)]
pub struct MpAbandonBody {
    pub url: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Deserialize)]
pub struct MpQuery {
    #[serde(default)]
    pub campaign: Option<String>,
    #[serde(default)]
    pub status: Option<MergeProposalStatus>,
}

#[derive(Deserialize)]
pub struct BucketQuery {
    #[serde(default)]
    pub bucket: Option<String>,
}

#[derive(Deserialize)]
pub struct PolicyRuleBody {
    pub role: String,
    pub mode: PublishMode,
    #[serde(default)]
    pub frequency_days: Option<i64>,
    #[serde(default)]
    pub rate_limit_bucket: Option<String>,
    #[serde(default)]
    pub max_open_mps: Option<i64>,
}

// ── Router ────────────────────────────────────────────────────────────

pub fn router(state: SharedPublisher) -> Router {
    Router::new()
        .route("/publisher/consider/{run_id}", post(consider_handler))
        .route("/publisher/publish", post(publish_handler))
        .route("/publisher/scan", post(scan_handler))
        .route("/publisher/autopublish", post(autopublish_handler))
        .route("/publisher/check-stragglers", post(stragglers_handler))
        .route("/publisher/merge-proposals", get(list_mps_handler))
        .route("/publisher/merge-proposals/update", post(update_mp_handler))
        .route(
            "/publisher/merge-proposals/abandon",
            post(abandon_mp_handler),
        )
        .route(
            "/publisher/merge-proposals/close-applied",
            post(close_applied_handler),
        )
        .route(
            "/publisher/policy/{name}",
            get(get_policy_handler).put(put_policy_handler),
        )
        .route("/publisher/rate-limits", get(rate_limits_handler))
        .route("/publisher/blockers/{run_id}", get(blockers_handler))
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn consider_handler(
    State(state): State<SharedPublisher>,
    Path(run_id): Path<String>,
) -> Result<Response, ApiError> {
    let consideration = decision::consider_run(&state, &run_id, None).await?;
    let mut executed = Vec::new();
    for plan in consideration.accepted_plans() {
        match sweep::execute_plan(&state, &plan, Some("consider")).await {
            Ok(outcome) => executed.push(serde_json::to_value(outcome).unwrap_or_default()),
            Err(err) => executed.push(serde_json::json!({
                "role": plan.role,
                "result_code": err.code(),
            })),
        }
    }
    Ok(Json(serde_json::json!({
        "run_id": consideration.run_id,
        "accepted": consideration.is_accepted(),
        "blockers": consideration.blockers(),
        "executed": executed,
    }))
    .into_response())
}

async fn publish_handler(
    State(state): State<SharedPublisher>,
    Json(body): Json<PublishRequestBody>,
) -> Result<Response, ApiError> {
    let codebase = body.codebase.clone();
    let campaign = body.campaign.clone();
    let run_id = state
        .db
        .call(move |db| {
            let view = views::last_run(db.connection(), &codebase, &campaign)?;
            Ok(view.last_unabsorbed_run_id)
        })
        .await
        .map_err(|e: anyhow::Error| ApiError::Internal(e.to_string()))?
        .ok_or_else(|| {
            ApiError::NotFound(format!(
                "no publishable run for {}/{}",
                body.codebase, body.campaign
            ))
        })?;

    let consideration = decision::consider_run(&state, &run_id, body.mode).await?;
    let mut executed = Vec::new();
    for plan in consideration.accepted_plans() {
        match sweep::execute_plan(&state, &plan, body.requester.as_deref()).await {
            Ok(outcome) => executed.push(serde_json::to_value(outcome).unwrap_or_default()),
            Err(err) => executed.push(serde_json::json!({
                "role": plan.role,
                "result_code": err.code(),
            })),
        }
    }
    let status = if consideration.is_accepted() {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(serde_json::json!({
            "run_id": run_id,
            "accepted": consideration.is_accepted(),
            "blockers": consideration.blockers(),
            "executed": executed,
        })),
    )
        .into_response())
}

async fn scan_handler(State(state): State<SharedPublisher>) -> Result<Response, ApiError> {
    let report = proposals::scan(&state).await?;
    Ok(Json(report).into_response())
}

async fn autopublish_handler(State(state): State<SharedPublisher>) -> Result<Response, ApiError> {
    let published = sweep::process_queue_tick(&state).await?;
    Ok(Json(serde_json::json!({"published": published})).into_response())
}

async fn stragglers_handler(State(state): State<SharedPublisher>) -> Result<Response, ApiError> {
    let checked = proposals::check_stragglers(&state).await?;
    Ok(Json(serde_json::json!({"checked": checked})).into_response())
}

async fn list_mps_handler(
    State(state): State<SharedPublisher>,
    Query(query): Query<MpQuery>,
) -> Result<Response, ApiError> {
    let mps = state
        .db
        .call(move |db| db.list_merge_proposals(query.campaign.as_deref(), query.status))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(mps).into_response())
}

async fn update_mp_handler(
    State(state): State<SharedPublisher>,
    Json(body): Json<MpUpdateBody>,
) -> Result<Response, ApiError> {
    let changed = proposals::override_status(&state, &body.url, body.status).await?;
    Ok(Json(serde_json::json!({"url": body.url, "changed": changed})).into_response())
}

async fn abandon_mp_handler(
    State(state): State<SharedPublisher>,
    Json(body): Json<MpAbandonBody>,
) -> Result<Response, ApiError> {
    let reason = body
        .reason
        .unwrap_or_else(|| "This proposal has been abandoned.".to_string());
    proposals::abandon_mp(&state, &body.url, &reason).await?;
    Ok(Json(serde_json::json!({"url": body.url, "status": "abandoned"})).into_response())
}

async fn close_applied_handler(
    State(state): State<SharedPublisher>,
    Json(body): Json<MpAbandonBody>,
) -> Result<Response, ApiError> {
    proposals::close_applied_mp(&state, &body.url).await?;
    Ok(Json(serde_json::json!({"url": body.url, "status": "applied"})).into_response())
}

async fn get_policy_handler(
    State(state): State<SharedPublisher>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    let lookup = name.clone();
    let rules = state
        .db
        .call(move |db| db.get_policy(&lookup))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    if rules.is_empty() {
        return Err(ApiError::NotFound(format!("no policy named {name}")));
    }
    Ok(Json(rules).into_response())
}

async fn put_policy_handler(
    State(state): State<SharedPublisher>,
    Path(name): Path<String>,
    Json(rules): Json<Vec<PolicyRuleBody>>,
) -> Result<Response, ApiError> {
    if rules.is_empty() {
        return Err(ApiError::BadRequest("policy needs at least one role".into()));
    }
    let stored: Vec<PolicyRule> = rules
        .into_iter()
        .map(|rule| PolicyRule {
            name: name.clone(),
            role: rule.role,
            mode: rule.mode,
            frequency_days: rule.frequency_days,
            rate_limit_bucket: rule.rate_limit_bucket,
            max_open_mps: rule.max_open_mps,
        })
        .collect();
    let store_name = name.clone();
    state
        .db
        .call(move |db| db.put_policy(&store_name, &stored))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok((StatusCode::CREATED, Json(serde_json::json!({"name": name}))).into_response())
}

async fn rate_limits_handler(
    State(state): State<SharedPublisher>,
    Query(query): Query<BucketQuery>,
) -> Result<Response, ApiError> {
    let cfg = state.config.clone();
    let stats = state
        .db
        .call(move |db| ratelimit::stats(db, &cfg, query.bucket.as_deref()))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(stats).into_response())
}

async fn blockers_handler(
    State(state): State<SharedPublisher>,
    Path(run_id): Path<String>,
) -> Result<Response, ApiError> {
    let consideration = decision::consider_run(&state, &run_id, None).await?;
    Ok(Json(consideration.blockers()).into_response())
}

// ── Probes ────────────────────────────────────────────────────────────

async fn health_handler() -> StatusCode {
    StatusCode::OK
}

async fn ready_handler(State(state): State<SharedPublisher>) -> StatusCode {
    match state.db.call(|db| db.get_policy("default")).await {
        Ok(_) => StatusCode::OK,
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
