//! Job persistence and the status state machine.

use crate::error::MeterError;
use crate::storage::Storage;
use crate::types::{stamp_to_datetime, IndexEntry, Job, JobStatus};
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

pub(crate) const JOB_PREFIX: &str = "job:";
pub(crate) const JOB_QUEUE_PREFIX: &str = "job_queue:";
pub(crate) const JOB_AGE_PREFIX: &str = "job_age:";

const MAX_WRITE_ATTEMPTS: usize = 64;
const QUEUE_SCAN_BATCH: usize = 32;

pub(crate) fn job_key(id: &str) -> String {
    format!("{JOB_PREFIX}{id}")
}

fn queue_key(job: &Job) -> String {
    format!("{JOB_QUEUE_PREFIX}{:020}:{}", job.seq, job.id)
}

/// Admin override of a job's status and/or result.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobPatch {
    #[serde(default)]
    pub status: Option<JobStatus>,
    #[serde(default)]
    pub result: Option<Value>,
}

enum Update {
    Missing,
    Skipped(Job),
    Written(Job),
}

/// Job store.
///
/// Every status change is a compare-and-swap on the job's stored bytes.
/// While a job is queued it also has an entry under `job_queue:` keyed by
/// its creation stamp, which is what `claim_oldest_queued` scans.
#[derive(Clone)]
pub struct JobStore {
    storage: Storage,
}

impl JobStore {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    pub fn create(&self, identity: &str, job_type: &str, params: Value) -> Result<Job, MeterError> {
        let job = self.insert(identity, job_type, params, JobStatus::Queued)?;
        self.storage.put_raw(&queue_key(&job), job.id.as_bytes())?;

        info!(job_id = %job.id, identity, job_type, "Job created");
        Ok(job)
    }

    /// Create a job already owned by the caller: `running`, never queued,
    /// so no sweep can claim it.
    pub fn create_claimed(
        &self,
        identity: &str,
        job_type: &str,
        params: Value,
    ) -> Result<Job, MeterError> {
        let job = self.insert(identity, job_type, params, JobStatus::Running)?;

        info!(job_id = %job.id, identity, job_type, "Job created for immediate run");
        Ok(job)
    }

    fn insert(
        &self,
        identity: &str,
        job_type: &str,
        params: Value,
        status: JobStatus,
    ) -> Result<Job, MeterError> {
        let stamp = self.storage.next_stamp();
        let now = stamp_to_datetime(stamp);
        let job = Job {
            id: Uuid::new_v4().to_string(),
            identity: identity.to_string(),
            job_type: job_type.to_string(),
            params,
            status,
            result: None,
            created_at: now,
            updated_at: now,
            seq: stamp,
        };

        let key = job_key(&job.id);
        self.storage.put_json(&key, &job)?;
        self.storage.put_json(
            &format!("{JOB_AGE_PREFIX}{stamp:020}:{}", job.id),
            &IndexEntry {
                identity: identity.to_string(),
                key,
            },
        )?;
        Ok(job)
    }

    pub fn get(&self, id: &str) -> Result<Option<Job>, MeterError> {
        self.storage.get_json(&job_key(id))
    }

    /// Move a specific queued job to `running`.
    ///
    /// Returns `None` if the job does not exist or is no longer queued. Of
    /// any number of concurrent claimers, exactly one gets `Some`.
    pub fn claim(&self, id: &str) -> Result<Option<Job>, MeterError> {
        let update = self.update(id, |job| {
            (job.status == JobStatus::Queued).then(|| Job {
                status: JobStatus::Running,
                ..job.clone()
            })
        })?;

        match update {
            Update::Written(job) => {
                self.storage.remove(&queue_key(&job))?;
                debug!(job_id = %job.id, "Job claimed");
                Ok(Some(job))
            }
            Update::Skipped(_) | Update::Missing => Ok(None),
        }
    }

    /// Claim the oldest queued job by creation order.
    pub fn claim_oldest_queued(&self) -> Result<Option<Job>, MeterError> {
        let mut after: Option<String> = None;

        loop {
            let batch =
                self.storage
                    .scan_prefix(JOB_QUEUE_PREFIX, after.as_deref(), QUEUE_SCAN_BATCH)?;
            if batch.is_empty() {
                return Ok(None);
            }

            for (queue_entry, id) in batch {
                let id = String::from_utf8_lossy(&id).into_owned();
                if let Some(job) = self.claim(&id)? {
                    return Ok(Some(job));
                }
                // Lost a race, or the job left the queue another way
                self.storage.remove(&queue_entry)?;
                after = Some(queue_entry);
            }
        }
    }

    /// Record the outcome of a running job.
    pub fn finish(&self, id: &str, status: JobStatus, result: Value) -> Result<Job, MeterError> {
        let update = self.update(id, |job| {
            if job.status.can_transition_to(status) && status.is_terminal() {
                Some(Job {
                    status,
                    result: Some(result.clone()),
                    ..job.clone()
                })
            } else {
                None
            }
        })?;

        match update {
            Update::Written(job) => {
                info!(job_id = %job.id, status = %job.status, "Job finished");
                Ok(job)
            }
            Update::Skipped(job) => Err(MeterError::InvalidTransition {
                from: job.status.to_string(),
                to: status.to_string(),
            }),
            Update::Missing => Err(MeterError::JobNotFound(id.to_string())),
        }
    }

    /// Admin override. Status may stay the same or move forward, never back.
    pub fn patch(&self, id: &str, patch: JobPatch) -> Result<Job, MeterError> {
        let update = self.update(id, |job| {
            let status = patch.status.unwrap_or(job.status);
            if !job.status.can_override_to(status) {
                return None;
            }
            Some(Job {
                status,
                result: patch.result.clone().or_else(|| job.result.clone()),
                ..job.clone()
            })
        })?;

        match update {
            Update::Written(job) => {
                if job.status != JobStatus::Queued {
                    self.storage.remove(&queue_key(&job))?;
                }
                info!(job_id = %job.id, status = %job.status, "Job patched by admin");
                Ok(job)
            }
            Update::Skipped(job) => Err(MeterError::InvalidTransition {
                from: job.status.to_string(),
                to: patch.status.unwrap_or(job.status).to_string(),
            }),
            Update::Missing => Err(MeterError::JobNotFound(id.to_string())),
        }
    }

    /// Read-modify-write loop. `apply` returns `None` to leave the job as is.
    fn update(&self, id: &str, apply: impl Fn(&Job) -> Option<Job>) -> Result<Update, MeterError> {
        let key = job_key(id);

        for attempt in 0..MAX_WRITE_ATTEMPTS {
            let Some(current_raw) = self.storage.get_raw(&key)? else {
                return Ok(Update::Missing);
            };
            let current: Job = serde_json::from_slice(&current_raw)?;

            let Some(mut next) = apply(&current) else {
                return Ok(Update::Skipped(current));
            };
            next.updated_at = Utc::now();
            let bytes = serde_json::to_vec(&next)?;

            if self
                .storage
                .compare_and_swap(&key, Some(current_raw.as_slice()), Some(bytes.as_slice()))?
            {
                return Ok(Update::Written(next));
            }
            debug!(job_id = id, attempt, "Job write conflict, retrying");
        }

        Err(MeterError::Storage(format!(
            "Update of job {} did not converge after {} attempts",
            id, MAX_WRITE_ATTEMPTS
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::Mutex;

    fn store() -> JobStore {
        JobStore::new(Storage::memory())
    }

    #[test]
    fn test_create_starts_queued() {
        let store = store();
        let job = store.create("a", "si", json!({"input": "hi"})).unwrap();

        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.result.is_none());
        assert_eq!(store.get(&job.id).unwrap(), Some(job));
        assert!(store.get("missing").unwrap().is_none());
    }

    #[test]
    fn test_create_claimed_is_never_queued() {
        let store = store();
        let job = store.create_claimed("a", "si", json!({})).unwrap();

        assert_eq!(job.status, JobStatus::Running);
        assert!(store.claim_oldest_queued().unwrap().is_none());
        assert!(store.claim(&job.id).unwrap().is_none());

        let done = store
            .finish(&job.id, JobStatus::Succeeded, json!({"ok": true}))
            .unwrap();
        assert_eq!(done.status, JobStatus::Succeeded);
    }

    #[test]
    fn test_claim_oldest_in_creation_order() {
        let store = store();
        let first = store.create("a", "si", json!({})).unwrap();
        let second = store.create("b", "si", json!({})).unwrap();

        let claimed = store.claim_oldest_queued().unwrap().unwrap();
        assert_eq!(claimed.id, first.id);
        assert_eq!(claimed.status, JobStatus::Running);

        assert_eq!(store.claim_oldest_queued().unwrap().unwrap().id, second.id);
        assert!(store.claim_oldest_queued().unwrap().is_none());
    }

    #[test]
    fn test_claim_specific_job_once() {
        let store = store();
        let job = store.create("a", "si", json!({})).unwrap();

        assert!(store.claim(&job.id).unwrap().is_some());
        assert!(store.claim(&job.id).unwrap().is_none());
        assert!(store.claim_oldest_queued().unwrap().is_none());
        assert!(store.claim("missing").unwrap().is_none());
    }

    #[test]
    fn test_concurrent_claims_never_share_a_job() {
        let store = store();
        let mut created = HashSet::new();
        for _ in 0..20 {
            created.insert(store.create("a", "si", json!({})).unwrap().id);
        }

        let claimed = Mutex::new(Vec::new());
        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    while let Some(job) = store.claim_oldest_queued().unwrap() {
                        claimed.lock().unwrap().push(job.id);
                    }
                });
            }
        });

        let claimed = claimed.into_inner().unwrap();
        assert_eq!(claimed.len(), 20);
        let unique: HashSet<String> = claimed.into_iter().collect();
        assert_eq!(unique, created);
    }

    #[test]
    fn test_finish_from_running_only() {
        let store = store();
        let job = store.create("a", "si", json!({})).unwrap();

        let err = store
            .finish(&job.id, JobStatus::Succeeded, json!({}))
            .unwrap_err();
        assert!(matches!(err, MeterError::InvalidTransition { .. }));

        store.claim(&job.id).unwrap();
        let done = store
            .finish(&job.id, JobStatus::Succeeded, json!({"content": "ok"}))
            .unwrap();
        assert_eq!(done.status, JobStatus::Succeeded);
        assert_eq!(done.result, Some(json!({"content": "ok"})));
        assert!(done.updated_at >= done.created_at);

        // Terminal states are final
        let err = store.finish(&job.id, JobStatus::Failed, json!({})).unwrap_err();
        assert!(matches!(err, MeterError::InvalidTransition { .. }));
        assert_eq!(
            store.get(&job.id).unwrap().unwrap().status,
            JobStatus::Succeeded
        );
    }

    #[test]
    fn test_finish_rejects_non_terminal_target() {
        let store = store();
        let job = store.create("a", "si", json!({})).unwrap();
        store.claim(&job.id).unwrap();

        let err = store.finish(&job.id, JobStatus::Running, json!({})).unwrap_err();
        assert!(matches!(err, MeterError::InvalidTransition { .. }));
    }

    #[test]
    fn test_finish_missing_job() {
        let err = store()
            .finish("missing", JobStatus::Failed, json!({}))
            .unwrap_err();
        assert!(matches!(err, MeterError::JobNotFound(_)));
    }

    #[test]
    fn test_patch_moves_forward_only() {
        let store = store();
        let job = store.create("a", "si", json!({})).unwrap();

        let patched = store
            .patch(
                &job.id,
                JobPatch {
                    status: Some(JobStatus::Failed),
                    result: Some(json!({"error": "cancelled"})),
                },
            )
            .unwrap();
        assert_eq!(patched.status, JobStatus::Failed);
        // Left the queue with the status change
        assert!(store.claim_oldest_queued().unwrap().is_none());

        let err = store
            .patch(
                &job.id,
                JobPatch {
                    status: Some(JobStatus::Queued),
                    result: None,
                },
            )
            .unwrap_err();
        assert!(matches!(err, MeterError::InvalidTransition { .. }));

        // Result-only patch keeps the status
        let patched = store
            .patch(
                &job.id,
                JobPatch {
                    status: None,
                    result: Some(json!({"note": "checked"})),
                },
            )
            .unwrap();
        assert_eq!(patched.status, JobStatus::Failed);
        assert_eq!(patched.result, Some(json!({"note": "checked"})));
    }

    #[test]
    fn test_patch_missing_job() {
        let err = store().patch("missing", JobPatch::default()).unwrap_err();
        assert!(matches!(err, MeterError::JobNotFound(_)));
    }
}
