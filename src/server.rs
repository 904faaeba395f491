//! Axum router construction and request middleware.
//!
//! The [`app`] function wires every endpoint to its handler and returns a
//! ready-to-serve [`axum::Router`].  A request passes, outermost first:
//! CORS, metrics, tracing, common headers, authentication, rate limiting,
//! and finally the handler.

use axum::{
    extract::{ConnectInfo, DefaultBodyLimit, State},
    http::{header, HeaderValue, Method, Request},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};
use utoipa::OpenApi;

use crate::auth::{self, AuthClaims};
use crate::errors::{generate_request_id, ApiError, ErrorBody};
use crate::handlers::{files, health};
use crate::metrics::{metrics_handler, metrics_middleware, RATE_LIMITED_TOTAL};
use crate::service::UploadResponse;
use crate::storage::backend::FileMetadata;
use crate::AppState;

// -- OpenAPI specification ----------------------------------------------------

/// OpenAPI documentation for the FileVault API.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "FileVault API",
        version = "0.1.0",
        description = "Authenticated file ingestion and retrieval service"
    ),
    paths(
        health::health_check,
        health::readiness,
        files::upload_file,
        files::download_file,
    ),
    components(schemas(UploadResponse, FileMetadata, ErrorBody)),
    tags(
        (name = "Health", description = "Liveness and readiness probes"),
        (name = "Files", description = "Upload and download"),
    )
)]
struct ApiDoc;

/// `GET /openapi.json` -- the generated OpenAPI document.
async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// Build the axum [`Router`] with all routes and middleware.
///
/// The returned router is ready to be passed to `axum::serve`.
pub fn app(state: Arc<AppState>) -> Router {
    let body_limit = state
        .config
        .upload
        .max_file_size
        .saturating_add(files::MULTIPART_SLACK);
    let body_limit = usize::try_from(body_limit).unwrap_or(usize::MAX);
    let metrics_enabled = state.config.observability.metrics;

    let mut router = Router::new()
        .route("/health", get(health::health_check))
        .route("/ready", get(health::readiness))
        .route("/openapi.json", get(openapi_json))
        .route("/api/v1/upload", post(files::upload_file))
        .route("/api/v1/files/", get(files::missing_file_id))
        .route("/api/v1/files/:id", get(files::download_file))
        // Backward-compatible alias.
        .route("/files/", get(files::missing_file_id))
        .route("/files/:id", get(files::download_file));

    if metrics_enabled {
        router = router.route("/metrics", get(metrics_handler));
    }

    let mut router = router
        .with_state(state.clone())
        // Layer ordering: inner layers run first, outer layers wrap them.
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit_middleware))
        .layer(middleware::from_fn_with_state(state, auth_middleware))
        .layer(middleware::from_fn(common_headers_middleware))
        .layer(TraceLayer::new_for_http());

    if metrics_enabled {
        router = router.layer(middleware::from_fn(metrics_middleware));
    }

    router
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([
                    Method::GET,
                    Method::POST,
                    Method::PUT,
                    Method::DELETE,
                    Method::OPTIONS,
                ])
                .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]),
        )
        .layer(DefaultBodyLimit::max(body_limit))
}

// -- Common headers middleware -----------------------------------------------

/// Adds common response headers to every response:
/// - `x-request-id`: 16-character uppercase hex string
/// - `Date`: RFC 7231 formatted timestamp
/// - `Server`: `FileVault`
async fn common_headers_middleware(req: Request<axum::body::Body>, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();

    // Error responses already carry one.
    if !headers.contains_key("x-request-id") {
        if let Ok(value) = HeaderValue::from_str(&generate_request_id()) {
            headers.insert("x-request-id", value);
        }
    }

    let date = httpdate::fmt_http_date(std::time::SystemTime::now());
    if let Ok(value) = HeaderValue::from_str(&date) {
        headers.insert(header::DATE, value);
    }
    headers.insert(header::SERVER, HeaderValue::from_static("FileVault"));

    response
}

// -- Auth middleware ---------------------------------------------------------

/// Paths that bypass authentication.
const AUTH_SKIP_PATHS: &[&str] = &["/health", "/ready", "/metrics", "/openapi.json"];

/// Bearer token middleware.
///
/// Verifies `Authorization: Bearer <token>` and stores the resulting
/// [`AuthClaims`] in the request extensions for later layers and handlers.
/// Any failure is reported as `Unauthenticated` without further detail.
async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let path = req.uri().path();
    if req.method() == Method::OPTIONS || AUTH_SKIP_PATHS.contains(&path) {
        return Ok(next.run(req).await);
    }

    let authorization = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    let claims = auth::parse_bearer(authorization)
        .and_then(|token| state.auth.verify(token))
        .map_err(|e| {
            debug!("Rejected request to {}: {}", req.uri().path(), e);
            ApiError::from(e)
        })?;

    debug!("Authenticated subject {}", claims.subject_id);
    req.extensions_mut().insert(claims);
    Ok(next.run(req).await)
}

// -- Rate limit middleware ---------------------------------------------------

/// `true` for routes that spend the caller's request budget.
fn is_rate_limited_path(path: &str) -> bool {
    path.starts_with("/api/v1/") || path.starts_with("/files/")
}

/// Per-subject rate limiting.
///
/// Keyed by the verified subject, falling back to the client address for
/// requests that carry no identity.
async fn rate_limit_middleware(
    State(state): State<Arc<AppState>>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, ApiError> {
    if !is_rate_limited_path(req.uri().path()) {
        return Ok(next.run(req).await);
    }

    let key = match req.extensions().get::<AuthClaims>() {
        Some(claims) => claims.subject_id.clone(),
        None => req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string()),
    };

    if !state.rate_limiter.allow(&key) {
        warn!(
            "Rate limit exceeded for {} ({} requests per minute)",
            key,
            state.rate_limiter.limit()
        );
        metrics::counter!(RATE_LIMITED_TOTAL).increment(1);
        return Err(ApiError::RateLimited);
    }

    Ok(next.run(req).await)
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::rate_limit::WINDOW;
    use crate::service::checksum;
    use crate::storage::memory::MemoryFileStore;
    use axum::body::Body;
    use axum::http::StatusCode;
    use std::time::{Duration, Instant};
    use tower::ServiceExt;

    const BOUNDARY: &str = "----filevault-test-boundary";
    const PNG_10: &[u8] = b"\x89PNG\r\n\x1a\n\x00\x00";
    const PDF: &[u8] = b"%PDF-1.4\n%\xe2\xe3\xcf\xd3\n";

    fn test_state(limit: usize) -> Arc<AppState> {
        let mut config = Config::default();
        config.auth.jwt_secret = "router-test-secret".to_string();
        config.rate_limit.requests_per_minute = limit;
        config.observability.metrics = false;
        Arc::new(AppState::new(config, Arc::new(MemoryFileStore::new())))
    }

    fn token(state: &AppState, subject: &str) -> String {
        state.auth.issue(subject).unwrap()
    }

    fn multipart_body(field: &str, file_name: &str, content_type: &str, data: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\n\
                 Content-Disposition: form-data; name=\"{field}\"; filename=\"{file_name}\"\r\n\
                 Content-Type: {content_type}\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(data);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn upload_request(token: &str, body: Vec<u8>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/v1/upload")
            .header("authorization", format!("Bearer {token}"))
            .header(
                "content-type",
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn get_request(uri: &str, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method("GET").uri(uri);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn send(state: &Arc<AppState>, req: Request<Body>) -> Response {
        app(state.clone()).oneshot(req).await.unwrap()
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        serde_json::from_slice(&body_bytes(response).await).unwrap()
    }

    #[tokio::test]
    async fn test_upload_rate_limit_then_download() {
        let state = test_state(2);
        let token = token(&state, "u1");
        let body = multipart_body("file", "pixel.png", "image/png", PNG_10);

        let first = send(&state, upload_request(&token, body.clone())).await;
        assert_eq!(first.status(), StatusCode::OK);
        let first = body_json(first).await;
        assert!(first["checksum"].as_str().unwrap().len() >= 16);
        assert_eq!(first["checksum"], checksum(PNG_10));
        assert_eq!(first["size"], 10);
        assert_eq!(first["contentType"], "image/png");

        let second = send(&state, upload_request(&token, body.clone())).await;
        assert_eq!(second.status(), StatusCode::OK);

        let third = send(&state, upload_request(&token, body)).await;
        assert_eq!(third.status(), StatusCode::TOO_MANY_REQUESTS);
        let third = body_json(third).await;
        assert_eq!(third["code"], 429);

        // Let the window pass.
        state
            .rate_limiter
            .purge_idle(Instant::now() + WINDOW + Duration::from_secs(1));

        let id = first["id"].as_str().unwrap();
        let response = send(&state, get_request(&format!("/api/v1/files/{id}"), Some(&token))).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "image/png");
        assert_eq!(response.headers()["content-length"], "10");
        assert!(response.headers()["content-disposition"]
            .to_str()
            .unwrap()
            .contains("pixel.png"));
        assert_eq!(body_bytes(response).await, PNG_10);
    }

    #[tokio::test]
    async fn test_legacy_path_and_json_metadata() {
        let state = test_state(100);
        let token = token(&state, "u1");
        let response = send(
            &state,
            upload_request(&token, multipart_body("file", "a.png", "image/png", PNG_10)),
        )
        .await;
        let id = body_json(response).await["id"].as_str().unwrap().to_string();

        let response = send(&state, get_request(&format!("/files/{id}"), Some(&token))).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, PNG_10);

        let req = Request::builder()
            .uri(format!("/api/v1/files/{id}"))
            .header("authorization", format!("Bearer {token}"))
            .header("accept", "application/json")
            .body(Body::empty())
            .unwrap();
        let response = send(&state, req).await;
        assert_eq!(response.status(), StatusCode::OK);
        let meta = body_json(response).await;
        assert_eq!(meta["id"], id.as_str());
        assert_eq!(meta["ownerId"], "u1");
        assert_eq!(meta["originalName"], "a.png");
    }

    #[tokio::test]
    async fn test_foreign_file_indistinguishable_from_missing() {
        let state = test_state(100);
        let alice = token(&state, "alice");
        let bob = token(&state, "bob");

        let response = send(
            &state,
            upload_request(&alice, multipart_body("file", "a.png", "image/png", PNG_10)),
        )
        .await;
        let id = body_json(response).await["id"].as_str().unwrap().to_string();

        let foreign = send(&state, get_request(&format!("/api/v1/files/{id}"), Some(&bob))).await;
        let missing = send(&state, get_request("/api/v1/files/does-not-exist", Some(&bob))).await;
        assert_eq!(foreign.status(), StatusCode::NOT_FOUND);
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(foreign).await, body_json(missing).await);
    }

    #[tokio::test]
    async fn test_requires_bearer_token() {
        let state = test_state(100);

        let response = send(&state, get_request("/api/v1/files/abc", None)).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key("x-request-id"));
        let json = body_json(response).await;
        assert_eq!(json["code"], 401);
        assert_eq!(json["error"], "Unauthorized");

        let response = send(&state, get_request("/api/v1/files/abc", Some("not-a-token"))).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let other = crate::auth::AuthGate::new("another-secret", Duration::from_secs(60));
        let forged = other.issue("u1").unwrap();
        let response = send(&state, get_request("/api/v1/files/abc", Some(&forged))).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_content_type_mismatch_rejected() {
        let state = test_state(100);
        let token = token(&state, "u1");
        let response = send(
            &state,
            upload_request(&token, multipart_body("file", "a.png", "image/png", PDF)),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"], "Invalid file type");
    }

    #[tokio::test]
    async fn test_oversized_content_length_rejected() {
        let state = test_state(100);
        let token = token(&state, "u1");
        let too_big = state.config.upload.max_file_size + files::MULTIPART_SLACK + 1;
        let req = Request::builder()
            .method("POST")
            .uri("/api/v1/upload")
            .header("authorization", format!("Bearer {token}"))
            .header(
                "content-type",
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .header("content-length", too_big.to_string())
            .body(Body::empty())
            .unwrap();
        let response = send(&state, req).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"], "File too large");
    }

    #[tokio::test]
    async fn test_missing_file_field() {
        let state = test_state(100);
        let token = token(&state, "u1");
        let response = send(
            &state,
            upload_request(&token, multipart_body("attachment", "a.png", "image/png", PNG_10)),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["message"], "No file provided");
    }

    #[tokio::test]
    async fn test_missing_file_id() {
        let state = test_state(100);
        let token = token(&state, "u1");
        let response = send(&state, get_request("/api/v1/files/", Some(&token))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_health_and_ready_skip_auth() {
        let state = test_state(1);

        let response = send(&state, get_request("/health", None)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["server"], "FileVault");
        assert!(response.headers().contains_key("date"));
        let json = body_json(response).await;
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["service"], "filevault");

        // Not rate limited either.
        let response = send(&state, get_request("/ready", None)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let response = send(&state, get_request("/ready", None)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["checks"]["storage"], "ok");
    }

    #[tokio::test]
    async fn test_ready_reports_unavailable_storage() {
        let dir = tempfile::tempdir().unwrap();
        let store = crate::storage::local::LocalFileStore::new(dir.path().join("files")).unwrap();
        let state = Arc::new(AppState::new(Config::default(), Arc::new(store)));

        std::fs::remove_dir_all(dir.path().join("files")).unwrap();
        let response = send(&state, get_request("/ready", None)).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = body_json(response).await;
        assert_eq!(json["checks"]["storage"], "unavailable");
        assert_eq!(json["error"], "Service Unavailable");
        assert_eq!(json["code"], 503);
        assert!(json["message"].is_string());
    }

    #[tokio::test]
    async fn test_ready_body_has_no_error_fields_when_ready() {
        let state = test_state(100);
        let json = body_json(send(&state, get_request("/ready", None)).await).await;
        assert_eq!(json["status"], "ready");
        assert!(json.get("error").is_none());
        assert!(json.get("code").is_none());
    }

    #[tokio::test]
    async fn test_truncated_upload_stores_nothing() {
        let store = Arc::new(MemoryFileStore::new());
        let mut config = Config::default();
        config.auth.jwt_secret = "router-test-secret".to_string();
        config.observability.metrics = false;
        let state = Arc::new(AppState::new(config, store.clone()));
        let token = token(&state, "u1");

        // The client goes away before the closing boundary arrives.
        let mut body = multipart_body("file", "pixel.png", "image/png", PNG_10);
        let closing = format!("\r\n--{BOUNDARY}--\r\n").len();
        body.truncate(body.len() - closing);

        let response = send(&state, upload_request(&token, body)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["code"], 400);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_openapi_document() {
        let state = test_state(1);
        let response = send(&state, get_request("/openapi.json", None)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert!(json["paths"].get("/api/v1/upload").is_some());
        assert!(json["paths"].get("/api/v1/files/{id}").is_some());
    }

    #[test]
    fn test_rate_limited_paths() {
        assert!(is_rate_limited_path("/api/v1/upload"));
        assert!(is_rate_limited_path("/files/abc"));
        assert!(!is_rate_limited_path("/health"));
        assert!(!is_rate_limited_path("/metrics"));
    }
}
