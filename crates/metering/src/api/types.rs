//! API request and response types.

use crate::types::Job;
use crate::usage::UsagePage;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request to create (or synchronously run) a job.
#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    #[serde(rename = "type")]
    pub job_type: String,

    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Serialize)]
pub struct JobResponse {
    pub job: Job,
}

#[derive(Debug, Serialize)]
pub struct PatchJobResponse {
    pub ok: bool,
    pub job: Job,
}

#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub identity: String,
    pub balance: Decimal,
    pub balance_credits: Decimal,
    pub warn_credits: Decimal,
    /// Balance is below `warn_credits`.
    pub low_balance: bool,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Admin balance change. Exactly one of `set` and `delta`.
#[derive(Debug, Deserialize)]
pub struct AdjustCreditsRequest {
    pub email: String,

    #[serde(default)]
    pub set: Option<Decimal>,

    #[serde(default)]
    pub delta: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
pub struct UsageQuery {
    pub limit: Option<usize>,
    pub cursor: Option<String>,
}

pub type UsageResponse = UsagePage;

#[derive(Debug, Deserialize)]
pub struct AskRequest {
    #[serde(default = "default_skill")]
    pub skill: String,

    pub input: String,

    /// Provider to try first.
    #[serde(default)]
    pub provider: Option<String>,
}

fn default_skill() -> String {
    "general".to_string()
}

#[derive(Debug, Serialize)]
pub struct AskResponse {
    pub result: String,
    pub cost: Decimal,
    pub balance: Decimal,
    pub provider: String,
    pub model: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub degraded: bool,
}

#[derive(Debug, Serialize)]
pub struct ProcessOneResponse {
    pub processed: u8,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub providers: Vec<String>,
}
