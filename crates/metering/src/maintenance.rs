//! Retention cleanup over usage events and finished jobs.

use crate::error::MeterError;
use crate::jobs::JOB_AGE_PREFIX;
use crate::storage::{now_nanos, Storage};
use crate::types::{stamp_to_datetime, IndexEntry, Job};
use crate::usage::USAGE_AGE_PREFIX;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

const NANOS_PER_DAY: u64 = 86_400 * 1_000_000_000;

/// Hard ceiling on index entries read per category in one call, kept ones included.
pub const MAX_CLEANUP_LIMIT: usize = 5_000;

const SCAN_BATCH: usize = 256;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CleanupKind {
    Usage,
    Jobs,
    #[default]
    Both,
}

impl CleanupKind {
    fn includes_usage(self) -> bool {
        matches!(self, CleanupKind::Usage | CleanupKind::Both)
    }

    fn includes_jobs(self) -> bool {
        matches!(self, CleanupKind::Jobs | CleanupKind::Both)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CleanupRequest {
    #[serde(default)]
    pub kind: CleanupKind,

    #[serde(default = "default_older_than_days")]
    pub older_than_days: u32,

    /// Deletion candidates per category.
    #[serde(default = "default_limit")]
    pub limit: usize,

    #[serde(default)]
    pub dry_run: bool,

    /// Only delete records whose identity starts with this.
    #[serde(default)]
    pub identity_prefix: Option<String>,
}

fn default_older_than_days() -> u32 {
    30
}

fn default_limit() -> usize {
    500
}

impl Default for CleanupRequest {
    fn default() -> Self {
        Self {
            kind: CleanupKind::Both,
            older_than_days: default_older_than_days(),
            limit: default_limit(),
            dry_run: false,
            identity_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupCounts {
    pub scanned: usize,
    pub deleted: usize,
    pub kept: usize,
}

impl CleanupCounts {
    fn add(&mut self, other: &CleanupCounts) {
        self.scanned += other.scanned;
        self.deleted += other.deleted;
        self.kept += other.kept;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CleanupReport {
    pub scanned: usize,
    pub deleted: usize,
    pub kept: usize,
    pub dry_run: bool,
    pub cutoff: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<CleanupCounts>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jobs: Option<CleanupCounts>,
}

#[derive(Clone)]
pub struct Maintenance {
    storage: Storage,
}

impl Maintenance {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// Delete records strictly older than `older_than_days`, at most `limit`
    /// per category.
    pub fn cleanup(&self, request: &CleanupRequest) -> Result<CleanupReport, MeterError> {
        self.cleanup_at(request, now_nanos())
    }

    pub(crate) fn cleanup_at(
        &self,
        request: &CleanupRequest,
        now: u64,
    ) -> Result<CleanupReport, MeterError> {
        let cutoff = u64::from(request.older_than_days)
            .checked_mul(NANOS_PER_DAY)
            .map_or(0, |age| now.saturating_sub(age));
        let limit = request.limit.clamp(1, MAX_CLEANUP_LIMIT);

        let usage = if request.kind.includes_usage() {
            Some(self.sweep_index(USAGE_AGE_PREFIX, cutoff, limit, request, |_| Ok(true))?)
        } else {
            None
        };

        let jobs = if request.kind.includes_jobs() {
            Some(self.sweep_index(JOB_AGE_PREFIX, cutoff, limit, request, |entry| {
                // Only finished jobs are removable; a missing record leaves an orphaned index entry
                Ok(self
                    .storage
                    .get_json::<Job>(&entry.key)?
                    .map_or(true, |job| job.status.is_terminal()))
            })?)
        } else {
            None
        };

        let mut total = CleanupCounts::default();
        for counts in usage.iter().chain(jobs.iter()) {
            total.add(counts);
        }

        info!(
            kind = ?request.kind,
            dry_run = request.dry_run,
            scanned = total.scanned,
            deleted = total.deleted,
            kept = total.kept,
            "Cleanup complete"
        );

        Ok(CleanupReport {
            scanned: total.scanned,
            deleted: total.deleted,
            kept: total.kept,
            dry_run: request.dry_run,
            cutoff: stamp_to_datetime(cutoff),
            usage,
            jobs,
        })
    }

    /// Walk one age index oldest-first, stopping at the first entry that is
    /// not strictly older than `cutoff`.
    ///
    /// Kept entries are paged past, so only deletion candidates count
    /// against `limit`. Raw reads are capped by `MAX_CLEANUP_LIMIT`.
    fn sweep_index(
        &self,
        prefix: &str,
        cutoff: u64,
        limit: usize,
        request: &CleanupRequest,
        removable: impl Fn(&IndexEntry) -> Result<bool, MeterError>,
    ) -> Result<CleanupCounts, MeterError> {
        let mut counts = CleanupCounts::default();
        let mut candidates = 0;
        let mut read = 0;
        let mut after: Option<String> = None;

        'scan: while candidates < limit && read < MAX_CLEANUP_LIMIT {
            let batch_size = SCAN_BATCH.min(MAX_CLEANUP_LIMIT - read);
            let batch = self
                .storage
                .scan_prefix(prefix, after.as_deref(), batch_size)?;
            if batch.is_empty() {
                break;
            }

            for (index_key, bytes) in batch {
                read += 1;
                after = Some(index_key.clone());

                let Some(stamp) = index_stamp(&index_key, prefix) else {
                    warn!("Skipping malformed index key {}", index_key);
                    continue;
                };
                if stamp >= cutoff {
                    break 'scan;
                }
                counts.scanned += 1;

                let entry: IndexEntry = serde_json::from_slice(&bytes)?;
                let in_scope = request
                    .identity_prefix
                    .as_deref()
                    .map_or(true, |p| entry.identity.starts_with(p));

                if !in_scope || !removable(&entry)? {
                    counts.kept += 1;
                } else if request.dry_run {
                    candidates += 1;
                    counts.kept += 1;
                } else {
                    self.storage.remove(&entry.key)?;
                    self.storage.remove(&index_key)?;
                    candidates += 1;
                    counts.deleted += 1;
                }

                if candidates >= limit || read >= MAX_CLEANUP_LIMIT {
                    break 'scan;
                }
            }
        }

        Ok(counts)
    }
}

fn index_stamp(key: &str, prefix: &str) -> Option<u64> {
    key.strip_prefix(prefix)?.get(..20)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobStore;
    use crate::types::{JobStatus, UsageEvent};
    use crate::usage::{NewUsage, UsageRecorder};
    use rust_decimal::Decimal;
    use serde_json::json;

    struct Fixture {
        storage: Storage,
        usage: UsageRecorder,
        jobs: JobStore,
        maintenance: Maintenance,
    }

    fn fixture() -> Fixture {
        let storage = Storage::memory();
        Fixture {
            usage: UsageRecorder::new(storage.clone()),
            jobs: JobStore::new(storage.clone()),
            maintenance: Maintenance::new(storage.clone()),
            storage,
        }
    }

    fn record(usage: &UsageRecorder, identity: &str) -> UsageEvent {
        usage
            .append_usage(
                identity,
                NewUsage {
                    route: "/si/ask".into(),
                    tokens_in: 1,
                    tokens_out: 1,
                    cost_credits: Decimal::ZERO,
                    provider: "a".into(),
                    model: "m".into(),
                    meta: json!({}),
                },
            )
            .unwrap()
    }

    fn nanos(event: &UsageEvent) -> u64 {
        u64::try_from(event.created_at.timestamp_nanos_opt().unwrap()).unwrap()
    }

    /// Run with the clock a day ahead so everything just written is old enough.
    fn run(f: &Fixture, request: &CleanupRequest) -> CleanupReport {
        f.maintenance
            .cleanup_at(request, now_nanos() + NANOS_PER_DAY)
            .unwrap()
    }

    fn request(kind: CleanupKind, dry_run: bool) -> CleanupRequest {
        CleanupRequest {
            kind,
            older_than_days: 0,
            dry_run,
            ..CleanupRequest::default()
        }
    }

    #[test]
    fn test_dry_run_deletes_nothing() {
        let f = fixture();
        record(&f.usage, "a");
        record(&f.usage, "a");

        let report = run(&f, &request(CleanupKind::Usage, true));

        assert_eq!(report.scanned, 2);
        assert_eq!(report.deleted, 0);
        assert_eq!(report.kept, 2);
        assert!(report.jobs.is_none());
        assert_eq!(f.usage.list_usage("a", 10, None).unwrap().items.len(), 2);
    }

    #[test]
    fn test_deletes_exactly_entries_older_than_cutoff() {
        let f = fixture();
        let old = record(&f.usage, "a");
        let boundary = record(&f.usage, "a");
        let newer = record(&f.usage, "a");

        let report = f
            .maintenance
            .cleanup_at(&request(CleanupKind::Usage, false), nanos(&boundary))
            .unwrap();

        assert_eq!(report.scanned, 1);
        assert_eq!(report.deleted, 1);

        let left: Vec<String> = f
            .usage
            .list_usage("a", 10, None)
            .unwrap()
            .items
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(left, vec![newer.id, boundary.id]);
        assert!(!left.contains(&old.id));
        assert_eq!(
            f.storage.scan_prefix(USAGE_AGE_PREFIX, None, 10).unwrap().len(),
            2
        );
    }

    #[test]
    fn test_limit_bounds_scan() {
        let f = fixture();
        for _ in 0..5 {
            record(&f.usage, "a");
        }

        let mut req = request(CleanupKind::Usage, false);
        req.limit = 2;
        let report = run(&f, &req);

        assert_eq!(report.scanned, 2);
        assert_eq!(report.deleted, 2);
        assert_eq!(f.usage.list_usage("a", 10, None).unwrap().items.len(), 3);
    }

    #[test]
    fn test_identity_prefix_keeps_other_identities() {
        let f = fixture();
        record(&f.usage, "test-1@example.com");
        record(&f.usage, "real@example.com");

        let mut req = request(CleanupKind::Usage, false);
        req.identity_prefix = Some("test-".into());
        let report = run(&f, &req);

        assert_eq!((report.scanned, report.deleted, report.kept), (2, 1, 1));
        assert!(f
            .usage
            .list_usage("test-1@example.com", 10, None)
            .unwrap()
            .items
            .is_empty());
        assert_eq!(
            f.usage
                .list_usage("real@example.com", 10, None)
                .unwrap()
                .items
                .len(),
            1
        );
    }

    #[test]
    fn test_huge_retention_deletes_nothing() {
        let f = fixture();
        record(&f.usage, "a");

        let mut req = request(CleanupKind::Usage, false);
        req.older_than_days = u32::MAX;
        let report = run(&f, &req);

        assert_eq!(report.deleted, 0);
        assert_eq!(report.scanned, 0);
        assert_eq!(report.cutoff, stamp_to_datetime(0));
        assert_eq!(f.usage.list_usage("a", 10, None).unwrap().items.len(), 1);
    }

    #[test]
    fn test_kept_entries_do_not_block_later_candidates() {
        let f = fixture();
        for _ in 0..3 {
            record(&f.usage, "real@example.com");
        }
        record(&f.usage, "test-1@example.com");

        let mut req = request(CleanupKind::Usage, false);
        req.limit = 3;
        req.identity_prefix = Some("test-".into());
        let report = run(&f, &req);

        assert_eq!((report.scanned, report.deleted, report.kept), (4, 1, 3));
        assert!(f
            .usage
            .list_usage("test-1@example.com", 10, None)
            .unwrap()
            .items
            .is_empty());
        assert_eq!(
            f.usage
                .list_usage("real@example.com", 10, None)
                .unwrap()
                .items
                .len(),
            3
        );
    }

    #[test]
    fn test_running_job_does_not_block_cleanup() {
        let f = fixture();
        let stuck = f.jobs.create("a", "si", json!({})).unwrap();
        f.jobs.claim(&stuck.id).unwrap();
        let done = f.jobs.create("a", "si", json!({})).unwrap();
        f.jobs.claim(&done.id).unwrap();
        f.jobs
            .finish(&done.id, JobStatus::Failed, json!({}))
            .unwrap();

        let mut req = request(CleanupKind::Jobs, false);
        req.limit = 1;
        let jobs = run(&f, &req).jobs.unwrap();

        assert_eq!(jobs, CleanupCounts { scanned: 2, deleted: 1, kept: 1 });
        assert!(f.jobs.get(&stuck.id).unwrap().is_some());
        assert!(f.jobs.get(&done.id).unwrap().is_none());
    }

    #[test]
    fn test_jobs_only_terminal_removed() {
        let f = fixture();
        let queued = f.jobs.create("a", "si", json!({})).unwrap();
        let done = f.jobs.create("a", "si", json!({})).unwrap();
        f.jobs.claim(&done.id).unwrap();
        f.jobs
            .finish(&done.id, JobStatus::Succeeded, json!({}))
            .unwrap();

        let report = run(&f, &request(CleanupKind::Both, false));
        let jobs = report.jobs.unwrap();

        assert_eq!(jobs, CleanupCounts { scanned: 2, deleted: 1, kept: 1 });
        assert_eq!(report.usage, Some(CleanupCounts::default()));
        assert!(f.jobs.get(&done.id).unwrap().is_none());
        assert!(f.jobs.get(&queued.id).unwrap().is_some());
    }

    #[test]
    fn test_request_defaults() {
        let req: CleanupRequest = serde_json::from_value(json!({})).unwrap();
        assert_eq!(req.kind, CleanupKind::Both);
        assert_eq!(req.older_than_days, 30);
        assert_eq!(req.limit, 500);
        assert!(!req.dry_run);

        let req: CleanupRequest = serde_json::from_value(json!({"kind": "jobs"})).unwrap();
        assert_eq!(req.kind, CleanupKind::Jobs);
    }
}
