//! Request logging, rate limiting and shared-secret checks.

use crate::error::MeterError;
use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use std::{num::NonZeroU32, sync::Arc};
use tracing::{debug, warn};

/// Admin credential header.
pub const ADMIN_KEY_HEADER: &str = "x-admin-key";

/// Global rate limiter (not keyed by caller).
pub type GlobalLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Rate limiter state shared across requests.
#[derive(Clone)]
pub struct RateLimitState {
    pub global: Arc<GlobalLimiter>,
}

impl RateLimitState {
    pub fn new(requests_per_minute: u32) -> Self {
        let quota =
            Quota::per_minute(NonZeroU32::new(requests_per_minute).unwrap_or(NonZeroU32::MIN));

        Self {
            global: Arc::new(RateLimiter::direct(quota)),
        }
    }

    /// Create a permissive rate limiter for testing.
    pub fn permissive() -> Self {
        Self::new(100_000)
    }
}

/// Rate limiting middleware. Returns 429 once the global quota is spent.
pub async fn rate_limit_middleware(
    State(rate_limit): State<RateLimitState>,
    request: Request,
    next: Next,
) -> Result<Response, MeterError> {
    if rate_limit.global.check().is_err() {
        warn!("Global rate limit exceeded");
        return Err(MeterError::RateLimited);
    }

    Ok(next.run(request).await)
}

/// Logging middleware for requests.
pub async fn logging_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = std::time::Instant::now();

    debug!(%method, %uri, "Request started");

    let response = next.run(request).await;

    let duration = start.elapsed();
    let status = response.status();

    if status.is_success() {
        debug!(%method, %uri, %status, ?duration, "Request completed");
    } else {
        warn!(%method, %uri, %status, ?duration, "Request failed");
    }

    response
}

/// Hash a secret for comparison.
pub fn hash_secret(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

/// Digest of a configured secret, computed once at startup.
#[derive(Clone, Default)]
pub struct SecretDigest(Option<String>);

impl SecretDigest {
    pub fn new(secret: Option<&SecretString>) -> Self {
        Self(secret.map(|s| hash_secret(s.expose_secret())))
    }

    /// Whether `header` carries the configured secret.
    pub fn matches(&self, headers: &HeaderMap, header: &str) -> bool {
        match (&self.0, headers.get(header).and_then(|v| v.to_str().ok())) {
            (Some(expected), Some(provided)) => &hash_secret(provided) == expected,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_rate_limit_exhaustion() {
        let state = RateLimitState::new(1);
        assert!(state.global.check().is_ok());
        assert!(state.global.check().is_err());
    }

    #[test]
    fn test_permissive_rate_limit() {
        let state = RateLimitState::permissive();
        for _ in 0..100 {
            assert!(state.global.check().is_ok());
        }
    }

    #[test]
    fn test_hash_secret() {
        assert_eq!(hash_secret("test"), hash_secret("test"));
        assert_ne!(hash_secret("test"), hash_secret("different"));
        assert_eq!(hash_secret("test").len(), 64);
    }

    #[test]
    fn test_secret_digest_matches() {
        let secret = SecretString::new("admin-key".to_string());
        let digest = SecretDigest::new(Some(&secret));

        let mut headers = HeaderMap::new();
        assert!(!digest.matches(&headers, ADMIN_KEY_HEADER));

        headers.insert(ADMIN_KEY_HEADER, HeaderValue::from_static("wrong"));
        assert!(!digest.matches(&headers, ADMIN_KEY_HEADER));

        headers.insert(ADMIN_KEY_HEADER, HeaderValue::from_static("admin-key"));
        assert!(digest.matches(&headers, ADMIN_KEY_HEADER));

        // Nothing matches when no secret is configured
        assert!(!SecretDigest::default().matches(&headers, ADMIN_KEY_HEADER));
    }
}
