//! Provider routing with ordered fallback.

mod openai;

pub use openai::OpenAiProvider;

use crate::config::{MeterConfig, ProviderDescriptor};
use crate::credits::{estimate_tokens, TokenUsage};
use crate::error::MeterError;
use async_trait::async_trait;
use completion_client::CompletionError;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Input for one completion.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// What a single provider returned.
#[derive(Debug, Clone)]
pub struct ProviderCompletion {
    pub text: String,
    pub model: String,
    /// Token counts reported by the backend, if any.
    pub usage: Option<TokenUsage>,
}

/// Normalized result of a routed call.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutedCompletion {
    pub text: String,
    pub provider: String,
    pub model: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error(transparent)]
    Client(#[from] CompletionError),

    #[error("{0}")]
    Unavailable(String),
}

/// A reason one provider failed.
#[derive(Debug, Clone)]
pub struct ProviderFailure {
    pub provider: String,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("No completion providers configured")]
    NoProviders,

    #[error("All providers failed: {}", format_failures(.0))]
    Exhausted(Vec<ProviderFailure>),
}

fn format_failures(failures: &[ProviderFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.provider, f.reason))
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<RouterError> for MeterError {
    fn from(err: RouterError) -> Self {
        MeterError::ProvidersExhausted(match err {
            RouterError::NoProviders => "no providers configured".to_string(),
            RouterError::Exhausted(failures) => format_failures(&failures),
        })
    }
}

/// An interchangeable completion backend.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    fn model(&self) -> &str;

    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<ProviderCompletion, ProviderError>;
}

/// Tries providers in order until one answers.
///
/// Holds no mutable state; the only side effect of `route` is the outbound
/// calls themselves.
#[derive(Clone, Default)]
pub struct ProviderRouter {
    providers: Vec<Arc<dyn Provider>>,
    default_provider: Option<String>,
}

impl ProviderRouter {
    pub fn new(providers: Vec<Arc<dyn Provider>>, default_provider: Option<String>) -> Self {
        Self {
            providers,
            default_provider,
        }
    }

    /// Build OpenAI-compatible providers from configuration, in configured order.
    pub fn from_config(config: &MeterConfig) -> Result<Self, MeterError> {
        let providers = config
            .providers
            .iter()
            .map(|descriptor: &ProviderDescriptor| {
                OpenAiProvider::from_descriptor(descriptor)
                    .map(|p| Arc::new(p) as Arc<dyn Provider>)
            })
            .collect::<Result<Vec<_>, _>>()?;

        info!(
            "Configured {} completion provider(s): {}",
            providers.len(),
            providers
                .iter()
                .map(|p| p.name())
                .collect::<Vec<_>>()
                .join(", ")
        );

        Ok(Self::new(providers, config.routing.default_provider.clone()))
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name().to_string()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Candidate order: the preferred provider (per call, else the configured
    /// default) followed by every other provider in configured order.
    fn candidates(&self, preferred: Option<&str>) -> Vec<Arc<dyn Provider>> {
        let preferred = preferred.or(self.default_provider.as_deref());
        let mut ordered: Vec<Arc<dyn Provider>> = Vec::with_capacity(self.providers.len());

        if let Some(name) = preferred {
            match self.providers.iter().find(|p| p.name() == name) {
                Some(p) => ordered.push(p.clone()),
                None => debug!("Preferred provider '{}' is not configured", name),
            }
        }
        for p in &self.providers {
            if !ordered.iter().any(|o| o.name() == p.name()) {
                ordered.push(p.clone());
            }
        }
        ordered
    }

    /// Call providers in candidate order and return the first success.
    pub async fn route(
        &self,
        request: &CompletionRequest,
        preferred: Option<&str>,
    ) -> Result<RoutedCompletion, RouterError> {
        let candidates = self.candidates(preferred);
        if candidates.is_empty() {
            return Err(RouterError::NoProviders);
        }

        let mut failures = Vec::new();
        for provider in candidates {
            match provider.complete(request).await {
                Ok(completion) => {
                    let usage = completion
                        .usage
                        .unwrap_or_else(|| estimate_usage(request, &completion.text));
                    debug!(
                        provider = provider.name(),
                        tokens_in = usage.tokens_in,
                        tokens_out = usage.tokens_out,
                        "Provider answered"
                    );
                    return Ok(RoutedCompletion {
                        text: completion.text,
                        provider: provider.name().to_string(),
                        model: completion.model,
                        tokens_in: usage.tokens_in,
                        tokens_out: usage.tokens_out,
                    });
                }
                Err(e) => {
                    warn!(provider = provider.name(), "Provider failed: {}", e);
                    failures.push(ProviderFailure {
                        provider: provider.name().to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        Err(RouterError::Exhausted(failures))
    }
}

fn estimate_usage(request: &CompletionRequest, text: &str) -> TokenUsage {
    let system = request
        .system_prompt
        .as_deref()
        .map(estimate_tokens)
        .unwrap_or(0);
    TokenUsage::new(
        system.saturating_add(estimate_tokens(&request.prompt)),
        estimate_tokens(text),
    )
}
