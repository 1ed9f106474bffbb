//! Caller identity resolution.
//!
//! Tokens are issued and verified by the identity provider in front of this
//! service. Here they are only decoded to read the caller's key.

use crate::error::MeterError;
use crate::types::Identity;
use axum::async_trait;
use axum::extract::{FromRequestParts, Query};
use axum::http::request::Parts;
use axum::http::{header, HeaderMap, Uri};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

/// Explicit identity override header.
pub const USER_EMAIL_HEADER: &str = "x-user-email";

const TOKEN_COOKIES: [&str; 2] = ["session", "token"];

#[derive(Debug, Default, Deserialize)]
struct IdentityQuery {
    email: Option<String>,
}

/// Resolve the caller: `x-user-email` header, `email` query parameter,
/// bearer token, then a `session`/`token` cookie.
pub fn resolve_identity(headers: &HeaderMap, uri: &Uri) -> Result<Identity, MeterError> {
    if let Some(email) = header_value(headers, USER_EMAIL_HEADER).and_then(non_empty) {
        return Ok(email);
    }

    let query = Query::<IdentityQuery>::try_from_uri(uri)
        .map(|Query(q)| q)
        .unwrap_or_default();
    if let Some(email) = query.email.as_deref().and_then(non_empty) {
        return Ok(email);
    }

    let bearer = header_value(headers, header::AUTHORIZATION.as_str())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);
    if let Some(identity) = bearer.and_then(identity_from_token) {
        return Ok(identity);
    }

    let from_cookie = headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .filter(|(name, _)| TOKEN_COOKIES.contains(name))
        .find_map(|(_, token)| identity_from_token(token));
    if let Some(identity) = from_cookie {
        return Ok(identity);
    }

    Err(MeterError::MissingIdentity)
}

/// Read `email` (else `sub`) from a JWT payload without verifying it.
pub fn identity_from_token(token: &str) -> Option<Identity> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| debug!("Undecodable token payload: {}", e))
        .ok()?;
    let claims: Value = serde_json::from_slice(&bytes).ok()?;

    ["email", "sub"]
        .iter()
        .find_map(|claim| claims.get(claim).and_then(Value::as_str).and_then(non_empty))
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn non_empty(value: &str) -> Option<Identity> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

/// Extractor for the resolved caller identity.
pub struct CallerIdentity(pub Identity);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for CallerIdentity {
    type Rejection = MeterError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        resolve_identity(&parts.headers, &parts.uri).map(CallerIdentity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use serde_json::json;

    fn token(claims: Value) -> String {
        format!(
            "eyJhbGciOiJSUzI1NiJ9.{}.signature",
            URL_SAFE_NO_PAD.encode(claims.to_string())
        )
    }

    fn uri(s: &str) -> Uri {
        s.parse().unwrap()
    }

    #[test]
    fn test_header_override_wins() {
        let mut headers = HeaderMap::new();
        headers.insert(USER_EMAIL_HEADER, HeaderValue::from_static("a@example.com"));
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token(json!({"email": "b@example.com"}))))
                .unwrap(),
        );

        let identity = resolve_identity(&headers, &uri("/billing/balance?email=c@example.com"));
        assert_eq!(identity.unwrap(), "a@example.com");
    }

    #[test]
    fn test_query_parameter() {
        let identity = resolve_identity(
            &HeaderMap::new(),
            &uri("/billing/balance?email=c%40example.com"),
        );
        assert_eq!(identity.unwrap(), "c@example.com");
    }

    #[test]
    fn test_bearer_token_email_then_sub() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token(json!({"sub": "user-42"})))).unwrap(),
        );
        assert_eq!(resolve_identity(&headers, &uri("/")).unwrap(), "user-42");

        let token = token(json!({"sub": "user-42", "email": "b@example.com"}));
        assert_eq!(identity_from_token(&token).unwrap(), "b@example.com");
    }

    #[test]
    fn test_cookie_token() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_str(&format!(
                "theme=dark; session={}",
                token(json!({"email": "d@example.com"}))
            ))
            .unwrap(),
        );
        assert_eq!(resolve_identity(&headers, &uri("/")).unwrap(), "d@example.com");
    }

    #[test]
    fn test_missing_identity() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer not-a-jwt"));
        headers.insert(USER_EMAIL_HEADER, HeaderValue::from_static("   "));

        let err = resolve_identity(&headers, &uri("/?email=")).unwrap_err();
        assert!(matches!(err, MeterError::MissingIdentity));
    }
}
