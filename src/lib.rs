//! FileVault library -- authenticated file ingestion and retrieval.
//!
//! This crate provides the components of the FileVault server: token
//! authentication, per-subject rate limiting, upload validation, pluggable
//! file storage, and the HTTP surface that ties them together.

use std::sync::Arc;

pub mod auth;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod metrics;
pub mod rate_limit;
pub mod server;
pub mod service;
pub mod storage;
pub mod validation;

use crate::auth::AuthGate;
use crate::config::Config;
use crate::rate_limit::RateLimiter;
use crate::service::IngestionService;
use crate::storage::backend::FileStore;
use crate::validation::Validator;

/// Shared application state passed to all handlers via `axum::extract::State`.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// Bearer token issuer and verifier.
    pub auth: AuthGate,
    /// Per-subject request budget.
    pub rate_limiter: RateLimiter,
    /// Upload and download pipelines over the configured store.
    pub service: IngestionService,
}

impl AppState {
    /// Wire the components described by `config` around `store`.
    pub fn new(config: Config, store: Arc<dyn FileStore>) -> Self {
        let auth = AuthGate::from_config(&config.auth);
        let rate_limiter = RateLimiter::new(config.rate_limit.requests_per_minute);
        let service = IngestionService::new(Validator::from_config(&config.upload), store);
        Self {
            config,
            auth,
            rate_limiter,
            service,
        }
    }
}
