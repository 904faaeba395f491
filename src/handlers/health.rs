//! Liveness and readiness probes.

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::AppState;

/// Body of `GET /health`.
#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    /// RFC 3339 server time.
    pub timestamp: String,
}

/// Body of `GET /ready`.
///
/// A 503 also carries the `error`/`code`/`message` fields shared by every
/// error response.
#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ReadinessResponse {
    pub status: String,
    pub checks: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// `GET /health` -- the process is up.
#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    operation_id = "HealthCheck",
    responses(
        (status = 200, description = "Service is alive", body = HealthResponse)
    )
)]
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "filevault".to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

/// `GET /ready` -- storage can accept writes.
#[utoipa::path(
    get,
    path = "/ready",
    tag = "Health",
    operation_id = "ReadinessCheck",
    responses(
        (status = 200, description = "Ready to serve traffic", body = ReadinessResponse),
        (status = 503, description = "A dependency is unavailable", body = ReadinessResponse)
    )
)]
pub async fn readiness(State(state): State<Arc<AppState>>) -> (StatusCode, Json<ReadinessResponse>) {
    let mut checks = BTreeMap::new();
    match state.service.store().probe().await {
        Ok(()) => {
            checks.insert("storage".to_string(), "ok".to_string());
            (
                StatusCode::OK,
                Json(ReadinessResponse {
                    status: "ready".to_string(),
                    checks,
                    error: None,
                    code: None,
                    message: None,
                }),
            )
        }
        Err(e) => {
            tracing::error!("Readiness probe failed: {}", e);
            checks.insert("storage".to_string(), "unavailable".to_string());
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ReadinessResponse {
                    status: "not ready".to_string(),
                    checks,
                    error: Some("Service Unavailable".to_string()),
                    code: Some(StatusCode::SERVICE_UNAVAILABLE.as_u16()),
                    message: Some("Storage is unavailable".to_string()),
                }),
            )
        }
    }
}
