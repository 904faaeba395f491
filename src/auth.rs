//! Bearer token authentication.
//!
//! Tokens are compact JWS values signed with HMAC-SHA256 under one
//! deployment-wide secret.  The claims carry only the subject identity and
//! the issue/expiry instants; ownership checks happen at the storage layer.
//!
//! Verification pins the algorithm to HS256 and rejects any token whose
//! header asserts something else, so a token cannot pick its own
//! verification scheme.

use chrono::{DateTime, Duration, TimeZone, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::AuthConfig;

/// The only accepted signing algorithm.
const SIGNING_ALGORITHM: Algorithm = Algorithm::HS256;

/// Why a token was refused.  All variants surface as `Unauthenticated`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    /// No `Authorization` header, or not of the form `Bearer <token>`.
    #[error("missing or malformed authorization header")]
    MissingBearer,
    /// The token could not be decoded.
    #[error("malformed token")]
    Malformed,
    /// The token names an algorithm other than HS256.
    #[error("unexpected signing algorithm")]
    AlgorithmMismatch,
    /// The signature does not verify under the service secret.
    #[error("invalid token signature")]
    BadSignature,
    /// `now >= expiresAt`.
    #[error("token expired")]
    Expired,
    /// Signing failed while issuing.
    #[error("failed to sign token: {0}")]
    Signing(String),
}

/// Wire form of the token claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TokenClaims {
    #[serde(rename = "user_id")]
    subject_id: String,
    iat: i64,
    exp: i64,
}

/// Verified identity extracted from a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthClaims {
    /// The authenticated subject.
    pub subject_id: String,
    /// When the token was issued.
    pub issued_at: DateTime<Utc>,
    /// When the token stops being valid.
    pub expires_at: DateTime<Utc>,
}

/// Issues and verifies signed identity tokens.  Stateless and cheap to share.
#[derive(Clone)]
pub struct AuthGate {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    lifetime: Duration,
    validation: Validation,
}

impl AuthGate {
    /// Create a gate signing with `secret`; issued tokens live for `lifetime`.
    pub fn new(secret: &str, lifetime: std::time::Duration) -> Self {
        let mut validation = Validation::new(SIGNING_ALGORITHM);
        // Expiry is checked against our own clock in `verify_at`.
        validation.validate_exp = false;
        validation.set_required_spec_claims(&["exp", "iat"]);

        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            lifetime: Duration::from_std(lifetime).unwrap_or_else(|_| Duration::days(36_500)),
            validation,
        }
    }

    /// Build a gate from the `auth` configuration section.
    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(&config.jwt_secret, config.token_lifetime())
    }

    /// Issue a token for `subject_id`, valid from now for the configured lifetime.
    pub fn issue(&self, subject_id: &str) -> Result<String, AuthError> {
        self.issue_at(subject_id, Utc::now())
    }

    /// Issue a token as if the current time were `now`.
    pub fn issue_at(&self, subject_id: &str, now: DateTime<Utc>) -> Result<String, AuthError> {
        let expires_at = now.checked_add_signed(self.lifetime).unwrap_or(DateTime::<Utc>::MAX_UTC);
        let claims = TokenClaims {
            subject_id: subject_id.to_string(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
        };

        encode(&Header::new(SIGNING_ALGORITHM), &claims, &self.encoding_key).map_err(|e| {
            tracing::error!("Failed to encode token: {}", e);
            AuthError::Signing(e.to_string())
        })
    }

    /// Verify `token` against the current time.
    pub fn verify(&self, token: &str) -> Result<AuthClaims, AuthError> {
        self.verify_at(token, Utc::now())
    }

    /// Verify `token`, treating `now` as the current time.
    pub fn verify_at(&self, token: &str, now: DateTime<Utc>) -> Result<AuthClaims, AuthError> {
        let data = decode::<TokenClaims>(token, &self.decoding_key, &self.validation).map_err(
            |e| {
                tracing::debug!("Token validation failed: {}", e);
                match e.kind() {
                    ErrorKind::InvalidAlgorithm => AuthError::AlgorithmMismatch,
                    ErrorKind::InvalidSignature => AuthError::BadSignature,
                    _ => AuthError::Malformed,
                }
            },
        )?;
        let claims = data.claims;

        if claims.subject_id.is_empty() {
            return Err(AuthError::Malformed);
        }
        if now.timestamp() >= claims.exp {
            return Err(AuthError::Expired);
        }

        let issued_at = Utc.timestamp_opt(claims.iat, 0).single().ok_or(AuthError::Malformed)?;
        let expires_at = Utc.timestamp_opt(claims.exp, 0).single().ok_or(AuthError::Malformed)?;

        Ok(AuthClaims {
            subject_id: claims.subject_id,
            issued_at,
            expires_at,
        })
    }
}

/// Extract the token from an `Authorization: Bearer <token>` header value.
pub fn parse_bearer(header: Option<&str>) -> Result<&str, AuthError> {
    let header = header.ok_or(AuthError::MissingBearer)?;
    let mut parts = header.split(' ');
    match (parts.next(), parts.next(), parts.next()) {
        (Some("Bearer"), Some(token), None) if !token.is_empty() => Ok(token),
        _ => Err(AuthError::MissingBearer),
    }
}

// ── Tests ───────────────────────────────────────────────────────────
