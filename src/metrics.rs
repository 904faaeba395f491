//! Prometheus metrics for FileVault.
//!
//! Installs a global Prometheus recorder using `metrics-exporter-prometheus`,
//! defines metric name constants, provides a middleware for HTTP RED metrics,
//! and exposes the `/metrics` endpoint handler.

use axum::extract::MatchedPath;
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

// -- Metric name constants ----------------------------------------------------

/// Total HTTP requests (counter). Labels: method, path, status.
pub const HTTP_REQUESTS_TOTAL: &str = "filevault_http_requests_total";

/// HTTP request duration in seconds (histogram). Labels: method, path.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "filevault_http_request_duration_seconds";

/// Upload attempts (counter). Labels: outcome.
pub const UPLOADS_TOTAL: &str = "filevault_uploads_total";

/// Bytes accepted into storage (counter).
pub const BYTES_RECEIVED_TOTAL: &str = "filevault_bytes_received_total";

/// Completed downloads (counter). Labels: kind (content or metadata).
pub const DOWNLOADS_TOTAL: &str = "filevault_downloads_total";

/// Requests refused by the rate limiter (counter).
pub const RATE_LIMITED_TOTAL: &str = "filevault_rate_limited_total";

// -- Global recorder installation ---------------------------------------------

/// Singleton handle to the Prometheus recorder.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus metrics recorder.  Idempotent.
///
/// Fails only if a different global recorder was installed first.
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
    describe_counter!(UPLOADS_TOTAL, "Upload attempts by outcome");
    describe_counter!(BYTES_RECEIVED_TOTAL, "Total bytes persisted from uploads");
    describe_counter!(DOWNLOADS_TOTAL, "Completed downloads by kind");
    describe_counter!(RATE_LIMITED_TOTAL, "Requests rejected by the rate limiter");
}

// -- Metrics middleware -------------------------------------------------------

/// Axum middleware that records HTTP RED metrics for every request.
///
/// Requests are labelled with the route template they matched, so every
/// download shares one series.  Excludes `/metrics` from self-instrumentation.
pub async fn metrics_middleware(
    req: Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Response {
    if req.uri().path() == "/metrics" {
        return next.run(req).await;
    }

    let method = req.method().to_string();
    let path = route_label(&req);

    let start = Instant::now();
    let response = next.run(req).await;
    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    counter!(HTTP_REQUESTS_TOTAL, "method" => method.clone(), "path" => path.clone(), "status" => status).increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method, "path" => path).record(duration);

    response
}

// -- Path normalization -------------------------------------------------------

/// Label for `req`: the matched route template, or a normalized path for
/// requests no route matched.
fn route_label<B>(req: &Request<B>) -> String {
    match req.extensions().get::<MatchedPath>() {
        Some(matched) => matched.as_str().to_string(),
        None => normalize_path(req.uri().path()),
    }
}

/// Normalize an actual request path to a route template for metric labels.
///
/// File ids are collapsed so every download shares one label value.
///
/// Examples:
/// - `/health` -> `/health`
/// - `/api/v1/upload` -> `/api/v1/upload`
/// - `/api/v1/files/3f0c...` -> `/api/v1/files/:id`
/// - `/files/3f0c...` -> `/files/:id`
/// - anything else -> `/other`
fn normalize_path(path: &str) -> String {
    match path {
        "/" | "/health" | "/ready" | "/openapi.json" | "/metrics" | "/api/v1/upload" => {
            path.to_string()
        }
        _ if path.starts_with("/api/v1/files/") => "/api/v1/files/:id".to_string(),
        _ if path.starts_with("/files/") => "/files/:id".to_string(),
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
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

// -- Tests --------------------------------------------------------------------
