//! Completion client errors.

use thiserror::Error;

/// Failure of a single completion call.
#[derive(Error, Debug)]
pub enum CompletionError {
    /// The backend did not answer within the client timeout.
    #[error("Request timed out")]
    Timeout,

    #[error("Transport error: {0}")]
    Transport(reqwest::Error),

    #[error("Rate limited by backend")]
    RateLimit,

    #[error("Backend rejected credentials")]
    Unauthorized,

    #[error("Backend returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Malformed response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Backend returned no completion text")]
    EmptyResponse,
}

impl From<reqwest::Error> for CompletionError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            CompletionError::Timeout
        } else {
            CompletionError::Transport(err)
        }
    }
}
