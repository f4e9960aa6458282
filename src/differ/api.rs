//! Differ HTTP surface with Accept-header content negotiation.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;

use super::compute::{self, DiffKind};
use super::{SharedDiffer, precache};
use crate::errors::DifferError;
use crate::metrics::METRICS;

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    NotAcceptable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::NotAcceptable(msg) => (StatusCode::NOT_ACCEPTABLE, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<DifferError> for ApiError {
    fn from(err: DifferError) -> Self {
        match &err {
            DifferError::UnknownRun(_) | DifferError::ArtifactsMissing(_) => {
                ApiError::NotFound(err.to_string())
            }
            DifferError::UnsupportedMediaType(_) => ApiError::NotAcceptable(err.to_string()),
            DifferError::ToolFailed { .. }
            | DifferError::Timeout { .. }
            | DifferError::Other(_) => ApiError::Internal(err.to_string()),
        }
    }
}

// ── Content negotiation ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DiffFormat {
    Plain,
    Markdown,
    Html,
    Json,
}

impl DiffFormat {
    fn content_type(&self) -> &'static str {
        match self {
            Self::Plain => "text/plain; charset=utf-8",
            Self::Markdown => "text/markdown; charset=utf-8",
            Self::Html => "text/html; charset=utf-8",
            Self::Json => "application/json",
        }
    }
}

/// Pick the response format from the Accept header. The format is part of
/// the request, not the URL; anything unsupported is a 406.
fn negotiate(headers: &HeaderMap) -> Result<DiffFormat, DifferError> {
    let Some(raw) = headers.get(header::ACCEPT).and_then(|v| v.to_str().ok()) else {
        return Ok(DiffFormat::Plain);
    };
    for entry in raw.split(',') {
        let media = entry.split(';').next().unwrap_or("").trim();
        match media {
            "" => continue,
            "text/plain" | "text/*" | "*/*" => return Ok(DiffFormat::Plain),
            "text/markdown" => return Ok(DiffFormat::Markdown),
            "text/html" => return Ok(DiffFormat::Html),
            "application/json" => return Ok(DiffFormat::Json),
            _ => continue,
        }
    }
    Err(DifferError::UnsupportedMediaType(raw.to_string()))
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn render(
    format: DiffFormat,
    kind: DiffKind,
    old_id: &str,
    new_id: &str,
    bytes: Vec<u8>,
) -> Response {
    let text = String::from_utf8_lossy(&bytes).into_owned();
    let body = match format {
        DiffFormat::Plain => text,
        DiffFormat::Markdown => format!("```diff\n{text}\n```\n"),
        DiffFormat::Html => format!(
            "<html><body><pre>{}</pre></body></html>\n",
            escape_html(&text)
        ),
        DiffFormat::Json => serde_json::json!({
            "old_id": old_id,
            "new_id": new_id,
            "kind": kind.tool(),
            "diff": text,
        })
        .to_string(),
    };
    (
        [(header::CONTENT_TYPE, format.content_type())],
        body,
    )
        .into_response()
}

// ── Router ────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct DiffQuery {
    #[serde(default)]
    pub filter_boring: Option<String>,
}

impl DiffQuery {
    fn filter_boring(&self) -> bool {
        matches!(
            self.filter_boring.as_deref(),
            Some("1") | Some("true") | Some("yes")
        )
    }
}

pub fn router(state: SharedDiffer) -> Router {
    Router::new()
        .route("/debdiff/{old_id}/{new_id}", get(debdiff_handler))
        .route("/diffoscope/{old_id}/{new_id}", get(diffoscope_handler))
        .route("/precache/{old_id}/{new_id}", post(precache_handler))
        .route("/precache-all", post(precache_all_handler))
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

async fn diff_response(
    state: SharedDiffer,
    kind: DiffKind,
    old_id: String,
    new_id: String,
    query: DiffQuery,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let format = negotiate(&headers)?;
    let bytes =
        compute::get_diff(&state, kind, &old_id, &new_id, query.filter_boring()).await?;
    Ok(render(format, kind, &old_id, &new_id, bytes))
}

async fn debdiff_handler(
    State(state): State<SharedDiffer>,
    Path((old_id, new_id)): Path<(String, String)>,
    Query(query): Query<DiffQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    diff_response(state, DiffKind::Debdiff, old_id, new_id, query, headers).await
}

async fn diffoscope_handler(
    State(state): State<SharedDiffer>,
    Path((old_id, new_id)): Path<(String, String)>,
    Query(query): Query<DiffQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    diff_response(state, DiffKind::Diffoscope, old_id, new_id, query, headers).await
}

async fn precache_handler(
    State(state): State<SharedDiffer>,
    Path((old_id, new_id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let cached = precache::precache_pair(&state, &old_id, &new_id).await?;
    Ok(Json(serde_json::json!({"cached": cached})).into_response())
}

async fn precache_all_handler(State(state): State<SharedDiffer>) -> Result<Response, ApiError> {
    let scheduled = precache::precache_all(&state).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"scheduled": scheduled})),
    )
        .into_response())
}

// ── Probes ────────────────────────────────────────────────────────────

async fn health_handler() -> StatusCode {
    StatusCode::OK
}

async fn ready_handler(State(state): State<SharedDiffer>) -> StatusCode {
    match state.db.call(|db| db.get_run("")).await {
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

#[cfg(test)]
mod tests {
    use super::super::DifferState;
    use super::super::cache::{DiffCache, cache_key};
    use super::*;
    use crate::artifacts::LocalArtifactStore;
    use crate::bus::EventBus;
    use crate::config::DifferConfig;
    use crate::state::db::test_support::*;
    use crate::state::{Db, StateDb};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tower::ServiceExt;

    async fn fixture_with_cached_diff() -> (Router, TempDir) {
        let tmp = TempDir::new().unwrap();
        let db = Db::new(StateDb::new_in_memory().unwrap());
        {
            let mut guard = db.lock_sync().unwrap();
            seed_codebase(&guard, "foo").unwrap();
            guard
                .record_run(&successful_run("old", "foo", "control"), &[])
                .unwrap();
            guard
                .record_run(&successful_run("new", "foo", "lintian-fixes"), &[])
                .unwrap();
        }
        let state = Arc::new(DifferState::new(
            db.clone(),
            EventBus::new(db),
            Arc::new(LocalArtifactStore::new(
                tmp.path().join("artifacts"),
                tmp.path().join("logs"),
            )),
            DiffCache::new(tmp.path().join("cache")),
            DifferConfig::default(),
        ));
        let key = cache_key(
            DiffKind::Diffoscope.tool(),
            DiffKind::Diffoscope.epoch(),
            "old",
            "new",
            false,
        );
        state.cache.put(&key, b"--- a\n+++ b\n").await.unwrap();
        (router(state), tmp)
    }

    #[tokio::test]
    async fn test_plain_text_response() {
        let (router, _tmp) = fixture_with_cached_diff().await;
        let req = Request::builder()
            .uri("/diffoscope/old/new")
            .header("accept", "text/plain")
            .body(Body::empty())
            .unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(
            resp.headers()[header::CONTENT_TYPE]
                .to_str()
                .unwrap()
                .starts_with("text/plain")
        );
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"--- a\n+++ b\n");
    }

    #[tokio::test]
    async fn test_json_negotiation() {
        let (router, _tmp) = fixture_with_cached_diff().await;
        let req = Request::builder()
            .uri("/diffoscope/old/new")
            .header("accept", "application/json")
            .body(Body::empty())
            .unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["kind"], "diffoscope");
        assert_eq!(json["old_id"], "old");
        assert!(json["diff"].as_str().unwrap().contains("+++ b"));
    }

    #[tokio::test]
    async fn test_unsupported_media_type_is_406() {
        let (router, _tmp) = fixture_with_cached_diff().await;
        let req = Request::builder()
            .uri("/diffoscope/old/new")
            .header("accept", "application/pdf")
            .body(Body::empty())
            .unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_ACCEPTABLE);
    }

    #[tokio::test]
    async fn test_unknown_run_is_404() {
        let (router, _tmp) = fixture_with_cached_diff().await;
        let req = Request::builder()
            .uri("/diffoscope/ghost/new")
            .body(Body::empty())
            .unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_html_response_wraps_and_escapes() {
        let (router, _tmp) = fixture_with_cached_diff().await;
        let req = Request::builder()
            .uri("/diffoscope/old/new")
            .header("accept", "text/html")
            .body(Body::empty())
            .unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("<pre>"));
        assert!(text.contains("+++ b"));
        assert_eq!(escape_html("<a & b>"), "&lt;a &amp; b&gt;");
    }
}
