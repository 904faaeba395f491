//! Client-facing error taxonomy.
//!
//! Every variant maps to one HTTP status and renders the JSON error body
//! `{"error", "code", "message"}`.  The enum implements
//! [`axum::response::IntoResponse`] so handlers and middleware can simply
//! return `Err(ApiError::NotFound)`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

use crate::auth::AuthError;
use crate::validation::ValidationError;

/// Generate a 16-character hex request ID.
pub fn generate_request_id() -> String {
    let bytes: [u8; 8] = rand::random();
    hex::encode(bytes).to_uppercase()
}

/// Errors surfaced to HTTP clients.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Missing, malformed, forged, or expired bearer token.
    #[error("Unauthorized")]
    Unauthenticated,

    /// The request itself is unusable (no file part, missing id, ...).
    #[error("{message}")]
    InvalidRequest { message: String },

    /// Declared or sniffed content type is not accepted.
    #[error("Invalid file type")]
    InvalidType,

    /// The upload exceeds the configured ceiling.
    #[error("File too large")]
    FileTooLarge,

    /// Unknown id, or an id owned by another subject.
    #[error("File not found")]
    NotFound,

    /// The subject has exhausted its per-minute request budget.
    #[error("Rate limit exceeded")]
    RateLimited,

    /// Storage or unexpected failure.  The cause is logged, never rendered.
    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),
}

/// JSON body attached to every non-2xx response.
#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ErrorBody {
    /// Short error title.
    pub error: String,
    /// Mirrors the HTTP status code.
    pub code: u16,
    /// Human-readable description.
    pub message: String,
}

impl ApiError {
    /// Return the appropriate HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ApiError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            ApiError::InvalidType => StatusCode::BAD_REQUEST,
            ApiError::FileTooLarge => StatusCode::BAD_REQUEST,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Shorthand for [`ApiError::InvalidRequest`].
    pub fn invalid_request(message: impl Into<String>) -> Self {
        ApiError::InvalidRequest {
            message: message.into(),
        }
    }

    /// Build the JSON body for this error.
    pub fn body(&self) -> ErrorBody {
        let message = self.to_string();
        ErrorBody {
            error: message.clone(),
            code: self.status_code().as_u16(),
            message,
        }
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        match err {
            ValidationError::FileTooLarge { .. } => ApiError::FileTooLarge,
            ValidationError::InvalidType { .. } => ApiError::InvalidType,
            ValidationError::Empty => ApiError::invalid_request("Empty file"),
            ValidationError::Unreadable(e) => ApiError::invalid_request(format!("Cannot read file: {e}")),
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(_: AuthError) -> Self {
        ApiError::Unauthenticated
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Internal(ref cause) = self {
            tracing::error!("Internal error: {:#}", cause);
        }

        let request_id = generate_request_id();
        let status = self.status_code();

        (
            status,
            [("x-request-id", request_id)],
            axum::Json(self.body()),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_is_16_hex_chars() {
        let id = generate_request_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(ApiError::Unauthenticated.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::InvalidType.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::FileTooLarge.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::NotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(ApiError::RateLimited.status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            ApiError::Internal(anyhow::anyhow!("disk on fire")).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_body_code_mirrors_status() {
        let body = ApiError::RateLimited.body();
        assert_eq!(body.code, 429);
        assert_eq!(body.error, "Rate limit exceeded");
        assert_eq!(body.message, "Rate limit exceeded");
    }

    #[test]
    fn test_internal_body_hides_cause() {
        let err = ApiError::Internal(anyhow::anyhow!("open /var/data/abc: permission denied"));
        let body = err.body();
        assert_eq!(body.message, "Internal server error");
        assert!(!body.message.contains("/var/data"));
    }

    #[tokio::test]
    async fn test_into_response_renders_json() {
        let response = ApiError::NotFound.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(response.headers().contains_key("x-request-id"));

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["code"], 404);
        assert_eq!(json["error"], "File not found");
    }
}
