//! Configuration loading and types for FileVault.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct, then selectively overridden from the process
//! environment.  The result is validated once at startup and handed to the
//! rest of the service as an immutable value.

use garde::Validate;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct Config {
    /// HTTP server settings.
    #[serde(default)]
    #[garde(dive)]
    pub server: ServerConfig,

    /// Upload limits and storage placement.
    #[serde(default)]
    #[garde(dive)]
    pub upload: UploadConfig,

    /// Token signing settings.
    #[serde(default)]
    #[garde(dive)]
    pub auth: AuthConfig,

    /// Per-subject request budget.
    #[serde(default)]
    #[garde(dive)]
    pub rate_limit: RateLimitConfig,

    /// Logging settings.
    #[serde(default)]
    #[garde(skip)]
    pub logging: LoggingConfig,

    /// Observability settings.
    #[serde(default)]
    #[garde(skip)]
    pub observability: ObservabilityConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            upload: UploadConfig::default(),
            auth: AuthConfig::default(),
            rate_limit: RateLimitConfig::default(),
            logging: LoggingConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ServerConfig {
    /// Bind host address.
    #[serde(default = "default_host")]
    #[garde(length(min = 1))]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_port")]
    #[garde(skip)]
    pub port: u16,

    /// Graceful shutdown timeout in seconds.
    #[serde(default = "default_shutdown_timeout")]
    #[garde(skip)]
    pub shutdown_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// Upload validation and storage settings.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct UploadConfig {
    /// Maximum accepted file size in bytes (default 25 MiB).
    #[serde(default = "default_max_file_size")]
    #[garde(range(min = 1))]
    pub max_file_size: u64,

    /// Content types accepted after declaration and sniffing.
    #[serde(default = "default_allowed_types")]
    #[garde(length(min = 1), inner(length(min = 1)))]
    pub allowed_types: Vec<String>,

    /// Root directory for stored content and metadata sidecars.
    #[serde(default = "default_storage_path")]
    #[garde(length(min = 1))]
    pub storage_path: String,

    /// Storage backend: `local` or `memory`.
    #[serde(default = "default_storage_backend")]
    #[garde(pattern(r"^(local|memory)$"))]
    pub backend: String,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_file_size: default_max_file_size(),
            allowed_types: default_allowed_types(),
            storage_path: default_storage_path(),
            backend: default_storage_backend(),
        }
    }
}

/// Token signing configuration.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct AuthConfig {
    /// Shared HMAC secret used to sign and verify bearer tokens.
    #[serde(alias = "secret", default = "default_jwt_secret")]
    #[garde(length(min = 1))]
    pub jwt_secret: String,

    /// Token lifetime in seconds.
    #[serde(default = "default_token_expiration")]
    #[garde(range(min = 1))]
    pub token_expiration: u64,
}

impl AuthConfig {
    /// Token lifetime as a [`Duration`].
    pub fn token_lifetime(&self) -> Duration {
        Duration::from_secs(self.token_expiration)
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: default_jwt_secret(),
            token_expiration: default_token_expiration(),
        }
    }
}

/// Request budget configuration.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct RateLimitConfig {
    /// Maximum requests per subject in any trailing 60-second interval.
    #[serde(default = "default_requests_per_minute")]
    #[garde(range(min = 1))]
    pub requests_per_minute: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: default_requests_per_minute(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Observability settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Enable Prometheus metrics collection and the `/metrics` endpoint.
    #[serde(default = "default_true")]
    pub metrics: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self { metrics: true }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_shutdown_timeout() -> u64 {
    10
}

fn default_max_file_size() -> u64 {
    25 * 1024 * 1024 // 25 MiB
}

fn default_allowed_types() -> Vec<String> {
    vec![
        "image/jpeg".to_string(),
        "image/png".to_string(),
        "application/pdf".to_string(),
    ]
}

fn default_storage_path() -> String {
    "./storage".to_string()
}

fn default_storage_backend() -> String {
    "local".to_string()
}

fn default_jwt_secret() -> String {
    "change-me-in-production".to_string()
}

fn default_token_expiration() -> u64 {
    24 * 60 * 60
}

fn default_requests_per_minute() -> usize {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Loader ------------------------------------------------------------------

impl Config {
    /// Apply environment overrides using `lookup` to read variables.
    ///
    /// Values that fail to parse are ignored and the existing value is kept.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("PORT").and_then(|v| v.parse().ok()) {
            self.server.port = port;
        }
        if let Some(size) = lookup("MAX_FILE_SIZE").and_then(|v| v.parse().ok()) {
            self.upload.max_file_size = size;
        }
        if let Some(path) = lookup("STORAGE_PATH").filter(|v| !v.is_empty()) {
            self.upload.storage_path = path;
        }
        if let Some(secret) = lookup("JWT_SECRET").filter(|v| !v.is_empty()) {
            self.auth.jwt_secret = secret;
        }
        if let Some(ttl) = lookup("TOKEN_EXPIRATION").and_then(|v| v.parse().ok()) {
            self.auth.token_expiration = ttl;
        }
        if let Some(limit) = lookup("RATE_LIMIT").and_then(|v| v.parse().ok()) {
            self.rate_limit.requests_per_minute = limit;
        }
    }

    /// Check every section once; the returned report lists all violations.
    pub fn check(&self) -> anyhow::Result<()> {
        Validate::validate(self).map_err(|report| anyhow::anyhow!("invalid configuration: {report}"))
    }
}

/// Parse configuration from YAML text without touching the environment.
pub fn parse_config(contents: &str) -> anyhow::Result<Config> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
}

/// Load configuration from `path` (if it exists), apply environment
/// overrides, and validate the result.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let path = path.as_ref();
    let mut config = if path.exists() {
        parse_config(&std::fs::read_to_string(path)?)?
    } else {
        tracing::warn!("Config file {} not found, using defaults", path.display());
        Config::default()
    };
    config.apply_overrides(|key| std::env::var(key).ok());
    config.check()?;
    Ok(config)
}
