//! HTTP client for OpenAI-compatible chat completion backends.

use crate::error::CompletionError;
use crate::types::*;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Upper bound on how much of an error body is kept in `CompletionError::Api`.
const MAX_ERROR_BODY_CHARS: usize = 300;

/// Client for one OpenAI-compatible backend.
///
/// The API key is stored using `SecretString` to prevent accidental
/// exposure in logs or debug output.
#[derive(Clone)]
pub struct CompletionClient {
    client: Client,
    base_url: String,
    api_key: SecretString,
    model: String,
}

impl CompletionClient {
    /// Create a new client.
    pub fn new(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, CompletionError> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: SecretString::new(api_key.into()),
            model: model.into(),
        })
    }

    /// Get the configured model name.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Get the configured base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Send a chat completion request.
    #[instrument(skip(self, messages), fields(model = %self.model, message_count = messages.len()))]
    pub async fn complete(
        &self,
        messages: Vec<Message>,
        temperature: Option<f32>,
        max_tokens: Option<u32>,
    ) -> Result<Completion, CompletionError> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages,
            temperature,
            max_tokens,
            stream: false,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header(
                "Authorization",
                format!("Bearer {}", self.api_key.expose_secret()),
            )
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await?;

        let chat_response = self.handle_response::<ChatResponse>(response).await?;
        let usage = chat_response.usage;
        let model = chat_response
            .model
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| self.model.clone());

        let text = chat_response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or(CompletionError::EmptyResponse)?;

        Ok(Completion { text, model, usage })
    }

    /// Handle HTTP response, converting errors appropriately.
    async fn handle_response<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, CompletionError> {
        let status = response.status();

        if status.is_success() {
            let body = response.text().await?;
            debug!(
                "Response body: {}",
                body.chars().take(200).collect::<String>()
            );
            serde_json::from_str(&body).map_err(CompletionError::from)
        } else {
            Err(self.extract_error(response).await)
        }
    }

    /// Extract error information from failed response.
    async fn extract_error(&self, response: reqwest::Response) -> CompletionError {
        let status = response.status();

        match status {
            StatusCode::TOO_MANY_REQUESTS => {
                warn!(base_url = %self.base_url, "Rate limit exceeded");
                CompletionError::RateLimit
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                warn!(base_url = %self.base_url, "Authentication failed");
                CompletionError::Unauthorized
            }
            _ => {
                let message: String = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "Unknown error".into())
                    .chars()
                    .take(MAX_ERROR_BODY_CHARS)
                    .collect();
                CompletionError::Api {
                    status: status.as_u16(),
                    message,
                }
            }
        }
    }
}

impl std::fmt::Debug for CompletionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionClient")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}
