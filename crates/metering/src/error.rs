//! Metering error types.

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use rust_decimal::Decimal;
use serde_json::json;
use thiserror::Error;
use tracing::error;

/// Errors that can occur in the metering system.
#[derive(Error, Debug)]
pub enum MeterError {
    /// No caller identity could be resolved.
    #[error("Missing caller identity")]
    MissingIdentity,

    /// Malformed or incomplete request.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Missing or wrong admin key / internal secret.
    #[error("Unauthorized")]
    Unauthorized,

    /// Authenticated but not allowed.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Insufficient credits for the operation.
    #[error("Insufficient credits: required {required}, available {balance}")]
    InsufficientCredits { balance: Decimal, required: Decimal },

    /// Unknown job id.
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// Status change that would violate the job state machine.
    #[error("Invalid job transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// Every configured provider failed.
    #[error("All providers failed: {0}")]
    ProvidersExhausted(String),

    /// Request rate exceeded.
    #[error("Rate limit exceeded")]
    RateLimited,

    /// Storage I/O error.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl MeterError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            MeterError::MissingIdentity => "missing_identity",
            MeterError::InvalidRequest(_) => "invalid_request",
            MeterError::Unauthorized => "unauthorized",
            MeterError::Forbidden(_) => "forbidden",
            MeterError::InsufficientCredits { .. } => "insufficient_credits",
            MeterError::JobNotFound(_) => "job_not_found",
            MeterError::InvalidTransition { .. } => "invalid_transition",
            MeterError::ProvidersExhausted(_) => "providers_exhausted",
            MeterError::RateLimited => "rate_limited",
            MeterError::Storage(_)
            | MeterError::Serialization(_)
            | MeterError::Config(_)
            | MeterError::Internal(_) => "internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            MeterError::MissingIdentity | MeterError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            MeterError::Unauthorized => StatusCode::UNAUTHORIZED,
            MeterError::Forbidden(_) => StatusCode::FORBIDDEN,
            MeterError::InsufficientCredits { .. } => StatusCode::PAYMENT_REQUIRED,
            MeterError::JobNotFound(_) => StatusCode::NOT_FOUND,
            MeterError::InvalidTransition { .. } => StatusCode::CONFLICT,
            MeterError::ProvidersExhausted(_) => StatusCode::BAD_GATEWAY,
            MeterError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            MeterError::Storage(_)
            | MeterError::Serialization(_)
            | MeterError::Config(_)
            | MeterError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to show to callers. Internal faults are reduced to a
    /// generic message so storage paths and secrets never leave the process.
    pub fn public_message(&self) -> String {
        match self.status() {
            StatusCode::INTERNAL_SERVER_ERROR => "Internal server error".to_string(),
            _ => self.to_string(),
        }
    }

    /// Structured error body, also embedded in failed job results.
    pub fn to_body(&self) -> serde_json::Value {
        let mut body = json!({
            "error": self.code(),
            "message": self.public_message(),
        });
        if let MeterError::InsufficientCredits { balance, required } = self {
            body["balance"] = json!(balance);
            body["required"] = json!(required);
        }
        body
    }
}

impl IntoResponse for MeterError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("Request failed: {}", self);
        }
        (status, Json(self.to_body())).into_response()
    }
}

impl From<JsonRejection> for MeterError {
    fn from(rejection: JsonRejection) -> Self {
        MeterError::InvalidRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for MeterError {
    fn from(rejection: QueryRejection) -> Self {
        MeterError::InvalidRequest(rejection.body_text())
    }
}

impl From<sled::Error> for MeterError {
    fn from(e: sled::Error) -> Self {
        MeterError::Storage(e.to_string())
    }
}

impl From<std::io::Error> for MeterError {
    fn from(e: std::io::Error) -> Self {
        MeterError::Storage(e.to_string())
    }
}
