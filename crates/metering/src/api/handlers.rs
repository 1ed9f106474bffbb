//! HTTP request handlers.

use super::types::{
    AdjustCreditsRequest, AskRequest, AskResponse, BalanceResponse, CreateJobRequest,
    HealthResponse, JobResponse, PatchJobResponse, ProcessOneResponse, UsageQuery, UsageResponse,
};
use super::AppState;
use crate::billing::SkillCall;
use crate::error::MeterError;
use crate::identity::{resolve_identity, CallerIdentity};
use crate::jobs::{CompletionJobHandler, JobPatch};
use crate::maintenance::{CleanupReport, CleanupRequest};
use crate::types::{CreditBalance, JobStatus};
use crate::usage::DEFAULT_PAGE_SIZE;
use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Uri},
    Json,
};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tracing::info;

/// Health check endpoint.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        providers: state.billing.router().provider_names(),
    })
}

/// Queue a job and fire the eager trigger.
pub async fn create_job(
    State(state): State<AppState>,
    CallerIdentity(identity): CallerIdentity,
    payload: Result<Json<CreateJobRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<JobResponse>), MeterError> {
    let Json(request) = payload?;
    precheck_job(&state, &identity, &request)?;

    let job = state.jobs.create(&identity, &request.job_type, request.params)?;
    state.trigger.fire(&job.id);

    Ok((StatusCode::ACCEPTED, Json(JobResponse { job })))
}

/// Create a job and run it to a terminal state before responding.
pub async fn run_job(
    State(state): State<AppState>,
    CallerIdentity(identity): CallerIdentity,
    payload: Result<Json<CreateJobRequest>, JsonRejection>,
) -> Result<(HeaderMap, Json<JobResponse>), MeterError> {
    let Json(request) = payload?;
    precheck_job(&state, &identity, &request)?;

    let job = state
        .dispatcher
        .run_job(&identity, &request.job_type, request.params)
        .await?;

    let billed = job
        .result
        .as_ref()
        .filter(|result| job.status == JobStatus::Succeeded && result.get("cost").is_some());
    let headers = match billed {
        Some(result) => {
            let balance = state.billing.ledger().get_balance(&identity);
            billed_headers(&[
                ("credits-used", value_text(&result["cost"])),
                ("credits-balance", credit_text(balance.balance_credits)),
                ("tokens-in", value_text(&result["tokens_in"])),
                ("tokens-out", value_text(&result["tokens_out"])),
                ("provider", value_text(&result["provider"])),
                ("model", value_text(&result["model"])),
            ])
        }
        None => HeaderMap::new(),
    };

    Ok((headers, Json(JobResponse { job })))
}

/// Fetch a job. Callers only see their own jobs unless they present the admin key.
pub async fn get_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    uri: Uri,
    Path(id): Path<String>,
) -> Result<Json<JobResponse>, MeterError> {
    let job = state
        .jobs
        .get(&id)?
        .ok_or_else(|| MeterError::JobNotFound(id.clone()))?;

    if !state.is_admin(&headers) {
        let identity = resolve_identity(&headers, &uri)?;
        if job.identity != identity {
            return Err(MeterError::JobNotFound(id));
        }
    }

    Ok(Json(JobResponse { job }))
}

/// Admin override of a job's status/result.
pub async fn patch_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    payload: Result<Json<JobPatch>, JsonRejection>,
) -> Result<Json<PatchJobResponse>, MeterError> {
    state.require_admin(&headers)?;
    let Json(patch) = payload?;

    let job = state.jobs.patch(&id, patch)?;
    Ok(Json(PatchJobResponse { ok: true, job }))
}

/// Caller's credit balance.
pub async fn get_balance(
    State(state): State<AppState>,
    CallerIdentity(identity): CallerIdentity,
) -> Json<BalanceResponse> {
    let balance = state.billing.ledger().get_balance(&identity);
    Json(balance_response(&state, balance))
}

/// Admin balance override or adjustment.
pub async fn adjust_credits(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<AdjustCreditsRequest>, JsonRejection>,
) -> Result<Json<BalanceResponse>, MeterError> {
    state.require_admin(&headers)?;
    let Json(request) = payload?;

    let identity = request.email.trim();
    if identity.is_empty() {
        return Err(MeterError::InvalidRequest("email is required".into()));
    }

    let ledger = state.billing.ledger();
    let balance = match (request.set, request.delta) {
        (Some(value), None) => ledger.set_balance(identity, value)?,
        (None, Some(delta)) => ledger.adjust_balance(identity, delta)?,
        _ => {
            return Err(MeterError::InvalidRequest(
                "exactly one of set or delta is required".into(),
            ))
        }
    };

    info!(
        identity,
        balance = %balance.balance_credits,
        "Credits adjusted by admin"
    );
    Ok(Json(balance_response(&state, balance)))
}

/// Caller's usage, most recent first.
pub async fn get_usage(
    State(state): State<AppState>,
    CallerIdentity(identity): CallerIdentity,
    query: Result<Query<UsageQuery>, QueryRejection>,
) -> Result<Json<UsageResponse>, MeterError> {
    let Query(query) = query?;
    let page = state.billing.usage().list_usage(
        &identity,
        query.limit.unwrap_or(DEFAULT_PAGE_SIZE),
        query.cursor.as_deref(),
    )?;
    Ok(Json(page))
}

/// Synchronous billed skill call.
pub async fn ask(
    State(state): State<AppState>,
    CallerIdentity(identity): CallerIdentity,
    payload: Result<Json<AskRequest>, JsonRejection>,
) -> Result<(HeaderMap, Json<AskResponse>), MeterError> {
    let Json(request) = payload?;

    let billed = state
        .billing
        .run_skill(
            &identity,
            SkillCall {
                skill: request.skill,
                input: request.input,
                provider: request.provider,
                route: "/si/ask".to_string(),
                meta: json!({}),
                allow_degraded: true,
            },
        )
        .await?;

    let headers = billed_headers(&[
        ("credits-used", credit_text(billed.cost)),
        ("credits-balance", credit_text(billed.balance.balance_credits)),
        ("tokens-in", billed.tokens_in.to_string()),
        ("tokens-out", billed.tokens_out.to_string()),
        ("provider", billed.provider.clone()),
        ("model", billed.model.clone()),
    ]);

    Ok((
        headers,
        Json(AskResponse {
            result: billed.text,
            cost: billed.cost,
            balance: billed.balance.balance_credits,
            provider: billed.provider,
            model: billed.model,
            tokens_in: billed.tokens_in,
            tokens_out: billed.tokens_out,
            degraded: billed.degraded,
        }),
    ))
}

/// Process the oldest queued job. Called by the eager trigger and by schedulers.
pub async fn process_one(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ProcessOneResponse>, MeterError> {
    state.require_internal(&headers)?;

    let processed = state.dispatcher.process_one().await?;
    Ok(Json(ProcessOneResponse {
        processed: u8::from(processed),
    }))
}

/// Retention cleanup.
pub async fn cleanup(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<CleanupRequest>, JsonRejection>,
) -> Result<Json<CleanupReport>, MeterError> {
    state.require_admin(&headers)?;
    let Json(request) = payload?;

    Ok(Json(state.maintenance.cleanup(&request)?))
}

/// Reject jobs that cannot be afforded before they are queued.
fn precheck_job(
    state: &AppState,
    identity: &str,
    request: &CreateJobRequest,
) -> Result<(), MeterError> {
    if request.job_type.trim().is_empty() {
        return Err(MeterError::InvalidRequest("type is required".into()));
    }

    if request.job_type == CompletionJobHandler::JOB_TYPE {
        let input = request
            .params
            .get("input")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| MeterError::InvalidRequest("params.input is required".into()))?;
        let skill = request
            .params
            .get("skill")
            .and_then(Value::as_str)
            .unwrap_or("general");

        let completion = state.billing.skill_request(skill, input);
        state
            .billing
            .check_funds(identity, input, completion.max_tokens)?;
    }

    Ok(())
}

fn balance_response(state: &AppState, balance: CreditBalance) -> BalanceResponse {
    let warn_credits: Decimal = state.billing.pricing().warn_credits();
    BalanceResponse {
        low_balance: balance.balance_credits < warn_credits,
        balance: balance.balance_credits,
        balance_credits: balance.balance_credits,
        warn_credits,
        updated_at: balance.updated_at,
        identity: balance.identity,
    }
}

fn billed_headers(values: &[(&'static str, String)]) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in values {
        if let Ok(value) = HeaderValue::from_str(value) {
            headers.insert(HeaderName::from_static(*name), value);
        }
    }
    headers
}

fn credit_text(amount: Decimal) -> String {
    amount.normalize().to_string()
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
