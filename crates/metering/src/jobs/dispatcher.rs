//! Job execution.

use super::store::JobStore;
use crate::billing::{Billing, SkillCall};
use crate::error::MeterError;
use crate::types::{Job, JobStatus};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Structured job failure, stored as the job's `result`.
#[derive(Debug, Clone, PartialEq)]
pub struct JobFailure {
    pub code: String,
    pub message: String,
}

impl JobFailure {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn to_value(&self) -> Value {
        json!({ "error": self.code, "message": self.message })
    }
}

impl From<MeterError> for JobFailure {
    fn from(err: MeterError) -> Self {
        Self::new(err.code(), err.public_message())
    }
}

/// Runs one job type.
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn job_type(&self) -> &str;

    async fn run(&self, job: &Job) -> Result<Value, JobFailure>;
}

/// Skill completion job (`si`), billed like `/si/ask`.
///
/// Params: `{input, skill?, provider?}`.
pub struct CompletionJobHandler {
    billing: Billing,
}

impl CompletionJobHandler {
    pub const JOB_TYPE: &'static str = "si";

    pub fn new(billing: Billing) -> Self {
        Self { billing }
    }
}

#[async_trait]
impl JobHandler for CompletionJobHandler {
    fn job_type(&self) -> &str {
        Self::JOB_TYPE
    }

    async fn run(&self, job: &Job) -> Result<Value, JobFailure> {
        let input = job
            .params
            .get("input")
            .and_then(Value::as_str)
            .ok_or_else(|| JobFailure::new("invalid_request", "params.input is required"))?;
        let skill = job
            .params
            .get("skill")
            .and_then(Value::as_str)
            .unwrap_or("general");
        let provider = job
            .params
            .get("provider")
            .and_then(Value::as_str)
            .map(str::to_string);

        let billed = self
            .billing
            .run_skill(
                &job.identity,
                SkillCall {
                    skill: skill.to_string(),
                    input: input.to_string(),
                    provider,
                    route: format!("job:{}", job.job_type),
                    meta: json!({ "job_id": job.id }),
                    allow_degraded: false,
                },
            )
            .await?;

        Ok(json!({
            "content": billed.text,
            "provider": billed.provider,
            "model": billed.model,
            "tokens_in": billed.tokens_in,
            "tokens_out": billed.tokens_out,
            "cost": billed.cost,
        }))
    }
}

/// Claims queued jobs and runs them to a terminal state.
#[derive(Clone)]
pub struct Dispatcher {
    store: JobStore,
    handlers: Arc<HashMap<String, Arc<dyn JobHandler>>>,
}

impl Dispatcher {
    pub fn new(store: JobStore, handlers: Vec<Arc<dyn JobHandler>>) -> Self {
        let handlers = handlers
            .into_iter()
            .map(|h| (h.job_type().to_string(), h))
            .collect();
        Self {
            store,
            handlers: Arc::new(handlers),
        }
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// Claim the oldest queued job and run it. Returns whether a job was processed.
    pub async fn process_one(&self) -> Result<bool, MeterError> {
        let Some(job) = self.store.claim_oldest_queued()? else {
            debug!("No queued jobs");
            return Ok(false);
        };
        self.execute(job).await?;
        Ok(true)
    }

    /// Create a job and run it to a terminal state in the caller's task.
    pub async fn run_job(
        &self,
        identity: &str,
        job_type: &str,
        params: Value,
    ) -> Result<Job, MeterError> {
        let job = self.store.create_claimed(identity, job_type, params)?;
        self.execute(job).await
    }

    /// Make up to `max_jobs` attempts, stopping once the queue is empty.
    /// A failed attempt is logged and does not end the sweep.
    pub async fn sweep(&self, max_jobs: usize) -> Result<usize, MeterError> {
        let mut processed = 0;
        for _ in 0..max_jobs {
            match self.process_one().await {
                Ok(true) => processed += 1,
                Ok(false) => break,
                Err(e) => warn!("Sweep attempt failed: {}", e),
            }
        }
        Ok(processed)
    }

    async fn execute(&self, job: Job) -> Result<Job, MeterError> {
        let outcome = match self.handlers.get(&job.job_type) {
            Some(handler) => handler.run(&job).await,
            None => Err(JobFailure::new(
                "unknown_job_type",
                format!("No handler for job type '{}'", job.job_type),
            )),
        };

        let (status, result) = match outcome {
            Ok(result) => (JobStatus::Succeeded, result),
            Err(failure) => {
                warn!(
                    job_id = %job.id,
                    code = %failure.code,
                    "Job failed: {}",
                    failure.message
                );
                (JobStatus::Failed, failure.to_value())
            }
        };

        let finished = match self.store.finish(&job.id, status, result) {
            Ok(job) => job,
            // Finalised by an admin while running; their outcome stands
            Err(MeterError::InvalidTransition { from, .. }) => {
                let current = self
                    .store
                    .get(&job.id)?
                    .ok_or_else(|| MeterError::JobNotFound(job.id.clone()))?;
                warn!(
                    job_id = %job.id,
                    status = %from,
                    "Job already finalised, outcome {} discarded",
                    status
                );
                current
            }
            Err(e) => {
                error!(job_id = %job.id, "Failed to record job outcome: {}", e);
                return Err(e);
            }
        };
        info!(job_id = %finished.id, status = %finished.status, "Job processed");
        Ok(finished)
    }
}
