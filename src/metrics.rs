//! Prometheus metrics for chunklift.
//!
//! Installs a global Prometheus recorder using `metrics-exporter-prometheus`,
//! defines metric name constants, provides a Tower-compatible middleware for
//! HTTP RED metrics, and exposes the `/metrics` endpoint handler.
//!
//! Without an installed recorder the `metrics` macros are no-ops, so the
//! library records unconditionally.

use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

// -- Metric name constants ----------------------------------------------------

/// Total HTTP requests (counter). Labels: method, path, status.
pub const HTTP_REQUESTS_TOTAL: &str = "chunklift_http_requests_total";

/// HTTP request duration in seconds (histogram). Labels: method, path.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "chunklift_http_request_duration_seconds";

/// Upload attempts by outcome (counter), rejected requests included.
/// Labels: outcome (`Completed` or error kind).
pub const UPLOADS_TOTAL: &str = "chunklift_uploads_total";

/// Parts acknowledged by the store (counter).
pub const PARTS_UPLOADED_TOTAL: &str = "chunklift_parts_uploaded_total";

/// Bytes acknowledged by the store (counter).
pub const BYTES_UPLOADED_TOTAL: &str = "chunklift_bytes_uploaded_total";

/// Session aborts (counter). Labels: result (`ok` or `failed`).
pub const UPLOAD_ABORTS_TOTAL: &str = "chunklift_upload_aborts_total";

/// Duration of completed uploads in seconds (histogram).
pub const UPLOAD_DURATION_SECONDS: &str = "chunklift_upload_duration_seconds";

// -- Global recorder installation ---------------------------------------------

/// Singleton handle to the Prometheus recorder.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus metrics recorder. Idempotent -- safe to call
/// multiple times. Returns a reference to the global handle.
pub fn init_metrics() -> anyhow::Result<&'static PrometheusHandle> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle);
    }
    let handle = PrometheusBuilder::new().install_recorder()?;
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle))
}

/// Register metric descriptions with the global recorder. Call once after
/// `init_metrics()`.
pub fn describe_metrics() {
    describe_counter!(HTTP_REQUESTS_TOTAL, "Total HTTP requests");
    describe_histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );
    describe_counter!(UPLOADS_TOTAL, "Multipart upload attempts by outcome");
    describe_counter!(PARTS_UPLOADED_TOTAL, "Parts acknowledged by the store");
    describe_counter!(BYTES_UPLOADED_TOTAL, "Bytes acknowledged by the store");
    describe_counter!(UPLOAD_ABORTS_TOTAL, "Multipart upload aborts by result");
    describe_histogram!(
        UPLOAD_DURATION_SECONDS,
        "Duration of completed multipart uploads in seconds"
    );
}

// -- Metrics middleware -------------------------------------------------------

/// Axum middleware that records HTTP RED metrics for every request.
///
/// Excludes `/metrics` from self-instrumentation to avoid feedback loops.
pub async fn metrics_middleware(
    req: Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Response {
    if req.uri().path() == "/metrics" {
        return next.run(req).await;
    }

    let method = req.method().to_string();
    let path = normalize_path(req.uri().path());

    let start = Instant::now();
    let response = next.run(req).await;
    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    counter!(HTTP_REQUESTS_TOTAL, "method" => method.clone(), "path" => path.clone(), "status" => status).increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method, "path" => path).record(duration);

    response
}

// -- Path normalization -------------------------------------------------------

/// Normalize an actual request path to a route template for metric labels.
///
/// Examples:
/// - `/health` -> `/health`
/// - `/upload/my-bucket/path/to/key` -> `/upload/{bucket}/{key}`
/// - anything else -> `/other`
fn normalize_path(path: &str) -> String {
    match path {
        "/" | "/health" | "/metrics" => path.to_string(),
        _ if path.starts_with("/upload/") => "/upload/{bucket}/{key}".to_string(),
        _ => "/other".to_string(),
    }
}

// -- Metrics endpoint handler -------------------------------------------------

/// `GET /metrics` -- Render Prometheus exposition format text.
pub async fn metrics_handler() -> Response {
    match PROMETHEUS_HANDLE.get() {
        Some(handle) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics disabled").into_response(),
    }
}

// -- Tests --------------------------------------------------------------------
