//! Core types for the metering system.

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Resolved caller key (email or account id).
pub type Identity = String;

/// Convert a storage stamp (nanoseconds since the epoch) to a timestamp.
pub fn stamp_to_datetime(stamp: u64) -> DateTime<Utc> {
    Utc.timestamp_nanos(i64::try_from(stamp).unwrap_or(i64::MAX))
}

/// Credit balance for an identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditBalance {
    pub identity: Identity,
    /// Remaining credits, rounded to 3 decimal places, never negative.
    pub balance_credits: Decimal,
    /// Last write. `None` for identities that were never written.
    pub updated_at: Option<DateTime<Utc>>,
}

impl CreditBalance {
    /// Zero balance for an identity that has never been written.
    pub fn empty(identity: impl Into<Identity>) -> Self {
        Self {
            identity: identity.into(),
            balance_credits: Decimal::ZERO,
            updated_at: None,
        }
    }

    /// Check if the balance covers the specified amount.
    pub fn covers(&self, amount: Decimal) -> bool {
        self.balance_credits > Decimal::ZERO && self.balance_credits >= amount
    }
}

/// One billed call. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageEvent {
    pub id: String,
    pub identity: Identity,
    /// Route or job type that produced the charge (e.g. `/si/ask`).
    pub route: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub cost_credits: Decimal,
    pub provider: String,
    pub model: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub meta: Value,
}

/// Job status. Transitions are monotonic: `queued → running → {succeeded | failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    /// Whether no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }

    /// Transitions taken by the dispatcher.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Succeeded)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }

    /// Transitions an admin override may take: same status, or any step forward.
    pub fn can_override_to(self, next: JobStatus) -> bool {
        self == next || (!self.is_terminal() && self.rank() < next.rank())
    }

    fn rank(self) -> u8 {
        match self {
            JobStatus::Queued => 0,
            JobStatus::Running => 1,
            JobStatus::Succeeded | JobStatus::Failed => 2,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Succeeded => write!(f, "succeeded"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A unit of deferred work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub identity: Identity,
    #[serde(rename = "type")]
    pub job_type: String,
    #[serde(default)]
    pub params: Value,
    pub status: JobStatus,
    #[serde(default)]
    pub result: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Creation stamp; orders the queue.
    pub seq: u64,
}

/// Age-index entry pointing at a primary record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub identity: Identity,
    pub key: String,
}
