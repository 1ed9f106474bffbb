//! OpenAI-compatible provider.

use super::{CompletionRequest, Provider, ProviderCompletion, ProviderError};
use crate::config::ProviderDescriptor;
use crate::credits::TokenUsage;
use crate::error::MeterError;
use async_trait::async_trait;
use completion_client::{CompletionClient, Message};
use secrecy::ExposeSecret;

/// Provider backed by a `/chat/completions` endpoint.
pub struct OpenAiProvider {
    name: String,
    client: CompletionClient,
}

impl OpenAiProvider {
    pub fn new(name: impl Into<String>, client: CompletionClient) -> Self {
        Self {
            name: name.into(),
            client,
        }
    }

    pub fn from_descriptor(descriptor: &ProviderDescriptor) -> Result<Self, MeterError> {
        let client = CompletionClient::new(
            descriptor.credential.expose_secret().clone(),
            descriptor.base_url.clone(),
            descriptor.model.clone(),
            descriptor.timeout,
        )
        .map_err(|e| MeterError::Config(format!("provider '{}': {}", descriptor.name, e)))?;

        Ok(Self::new(descriptor.name.clone(), client))
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        self.client.model()
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<ProviderCompletion, ProviderError> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &request.system_prompt {
            messages.push(Message::system(system.clone()));
        }
        messages.push(Message::user(request.prompt.clone()));

        let completion = self
            .client
            .complete(messages, Some(request.temperature), Some(request.max_tokens))
            .await?;

        Ok(ProviderCompletion {
            text: completion.text,
            model: completion.model,
            usage: completion
                .usage
                .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens)),
        })
    }
}
