//! Eager, best-effort processing right after a job is created.

use super::Dispatcher;
use crate::config::{DispatchConfig, TriggerMode};
use crate::error::MeterError;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;
use tracing::{debug, warn};

/// Header carrying the internal shared secret.
pub const INTERNAL_SECRET_HEADER: &str = "x-internal-secret";

const TRIGGER_TIMEOUT: Duration = Duration::from_secs(10);

/// How a new job gets its first processing attempt. The sweep picks up
/// anything a trigger misses.
#[derive(Clone)]
pub enum EagerTrigger {
    /// POST `/admin/process-one` on this service with the internal secret.
    Http {
        client: Client,
        url: String,
        secret: SecretString,
    },
    /// Spawn `process_one` on the current runtime.
    InProcess(Dispatcher),
    Disabled,
}

impl EagerTrigger {
    pub fn from_config(
        config: &DispatchConfig,
        internal_secret: Option<&SecretString>,
        dispatcher: &Dispatcher,
    ) -> Result<Self, MeterError> {
        Ok(match config.trigger {
            TriggerMode::Http => {
                let Some(secret) = internal_secret else {
                    warn!("HTTP job trigger needs auth.internal_secret; relying on the sweep");
                    return Ok(EagerTrigger::Disabled);
                };
                let client = Client::builder()
                    .timeout(TRIGGER_TIMEOUT)
                    .build()
                    .map_err(|e| MeterError::Config(format!("trigger client: {}", e)))?;
                EagerTrigger::Http {
                    client,
                    url: format!(
                        "{}/admin/process-one",
                        config.self_url.trim_end_matches('/')
                    ),
                    secret: secret.clone(),
                }
            }
            TriggerMode::InProcess => EagerTrigger::InProcess(dispatcher.clone()),
            TriggerMode::Disabled => EagerTrigger::Disabled,
        })
    }

    /// Fire and forget. The outcome is only logged.
    pub fn fire(&self, job_id: &str) {
        let job_id = job_id.to_string();
        match self {
            EagerTrigger::Http {
                client,
                url,
                secret,
            } => {
                let request = client
                    .post(url.as_str())
                    .header(INTERNAL_SECRET_HEADER, secret.expose_secret().as_str());
                tokio::spawn(async move {
                    match request.send().await {
                        Ok(resp) if resp.status().is_success() => {
                            debug!(job_id = %job_id, "Job trigger delivered");
                        }
                        Ok(resp) => {
                            warn!(job_id = %job_id, status = %resp.status(), "Job trigger rejected");
                        }
                        Err(e) => warn!(job_id = %job_id, "Job trigger failed: {}", e),
                    }
                });
            }
            EagerTrigger::InProcess(dispatcher) => {
                let dispatcher = dispatcher.clone();
                tokio::spawn(async move {
                    if let Err(e) = dispatcher.process_one().await {
                        warn!(job_id = %job_id, "In-process job trigger failed: {}", e);
                    }
                });
            }
            EagerTrigger::Disabled => {
                debug!(job_id = %job_id, "Eager trigger disabled; job left for the sweep");
            }
        }
    }
}
