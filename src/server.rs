//! Axum router construction.
//!
//! The [`app`] function wires the HTTP endpoints to their handlers and
//! returns a ready-to-serve [`axum::Router`]:
//!
//! - `POST /upload/:bucket/*key` streams the request body into a multipart
//!   upload, optionally with `?chunkSize=<bytes>`.  A `Content-Length`
//!   header is required.
//! - `GET /health` reports liveness.
//! - `GET /metrics` renders Prometheus metrics.

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header::CONTENT_LENGTH, HeaderMap, HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::errors::{generate_request_id, UploadError};
use crate::metrics::{metrics_handler, metrics_middleware};
use crate::source::BodySource;
use crate::store::backend::UploadTarget;
use crate::upload::UploadOptions;
use crate::AppState;

/// Build the axum [`Router`] with all routes.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route("/upload/:bucket/*key", post(handle_upload))
        .with_state(state)
        // common_headers_middleware is inner (adds standard headers).
        .layer(middleware::from_fn(common_headers_middleware))
        // metrics_middleware is outer (captures full request lifecycle).
        .layer(middleware::from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http())
}

// -- Common headers middleware -----------------------------------------------

/// Middleware that adds common response headers to every response:
/// - `x-request-id`: 16-character uppercase hex string
/// - `Date`: RFC 7231 formatted timestamp
/// - `Server`: `chunklift`
async fn common_headers_middleware(req: Request<axum::body::Body>, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();

    // Error responses already carry their own request ID.
    if !headers.contains_key("x-request-id") {
        if let Ok(value) = HeaderValue::from_str(&generate_request_id()) {
            headers.insert("x-request-id", value);
        }
    }

    let date = httpdate::fmt_http_date(std::time::SystemTime::now());
    if let Ok(value) = HeaderValue::from_str(&date) {
        headers.insert("date", value);
    }
    headers.insert("server", HeaderValue::from_static("chunklift"));

    response
}

// -- Health check ------------------------------------------------------------

/// `GET /health` -- Returns `{"status": "ok"}` with 200 OK.
async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "application/json")],
        r#"{"status":"ok"}"#,
    )
}

// -- Upload ------------------------------------------------------------------

/// Query parameters of `POST /upload/:bucket/*key`.
#[derive(Debug, Deserialize)]
struct UploadQuery {
    /// Part size override in bytes.
    #[serde(rename = "chunkSize")]
    chunk_size: Option<u64>,
}

/// Declared body length, required so the parts can be planned before the
/// body is read.
fn content_length(headers: &HeaderMap, max_object_size: u64) -> Result<u64, UploadError> {
    let len = headers
        .get(CONTENT_LENGTH)
        .ok_or_else(|| UploadError::invalid("Content-Length header is required"))?
        .to_str()
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .ok_or_else(|| UploadError::invalid("Content-Length header is not a valid length"))?;
    if len > max_object_size {
        return Err(UploadError::invalid(format!(
            "body of {len} bytes exceeds the limit of {max_object_size} bytes"
        )));
    }
    Ok(len)
}

/// `POST /upload/:bucket/*key` -- stream the body to `bucket`/`key`.
///
/// The upload runs on its own task, so a client that goes away mid-body
/// still gets its session aborted rather than left on the store.
async fn handle_upload(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
    Query(query): Query<UploadQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, UploadError> {
    let target = UploadTarget::new(bucket, key);
    let chunk_size = query.chunk_size.unwrap_or(state.config.upload.chunk_size);
    let total_len = content_length(&headers, state.config.server.max_object_size)?;
    debug!(
        "Upload request for {}: {} bytes, chunk size {}",
        target, total_len, chunk_size
    );

    let uploader = state.uploader.clone();
    let task = tokio::spawn(async move {
        let mut source = BodySource::new(body, total_len);
        let options = UploadOptions::default();
        uploader
            .upload(&mut source, &target, chunk_size, &options)
            .await
    });
    let summary = task
        .await
        .map_err(|source| UploadError::TaskFailed { source })??;

    Ok((StatusCode::OK, Json(summary)).into_response())
}

// -- Tests -------------------------------------------------------------------
