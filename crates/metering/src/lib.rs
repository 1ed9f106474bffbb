//! Credit metering for completion backends.
//!
//! Callers hold a prepaid credit balance. Every completion is routed to one of
//! several interchangeable providers, metered by tokens, recorded as a usage
//! event and debited from the balance. Long-running work goes through a job
//! queue that is drained by an eager trigger and a periodic sweep.
//!
//! # Architecture
//!
//! ```text
//! /si/ask   → check funds → route (with fallback) → record usage → debit
//! /jobs     → queue → eager trigger / sweep → claim → same billed path → finish
//! ```
//!
//! # Modules
//!
//! - [`credits`] - Credit ledger and pricing
//! - [`usage`] - Append-only usage events
//! - [`routing`] - Provider abstraction and fallback routing
//! - [`billing`] - The billed completion path shared by the API and jobs
//! - [`jobs`] - Job store, dispatcher, eager trigger and sweep
//! - [`maintenance`] - Retention cleanup
//! - [`api`] - HTTP API

pub mod api;
pub mod billing;
pub mod config;
pub mod credits;
pub mod error;
pub mod identity;
pub mod jobs;
pub mod maintenance;
pub mod routing;
pub mod storage;
pub mod types;
pub mod usage;

// Re-exports for convenience
pub use api::{create_router, AppState};
pub use billing::{BilledCompletion, Billing, SkillCall};
pub use config::{MeterConfig, PricingConfig};
pub use credits::{CreditLedger, PricingCalculator, TokenUsage};
pub use error::MeterError;
pub use jobs::{spawn_sweeper, Dispatcher, EagerTrigger, JobStore, JobSweeper};
pub use maintenance::{CleanupKind, CleanupReport, CleanupRequest, Maintenance};
pub use routing::{Provider, ProviderRouter};
pub use storage::Storage;
pub use types::{CreditBalance, Identity, Job, JobStatus, UsageEvent};
pub use usage::UsageRecorder;

use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::info;

/// Bind and run the server as a background task.
///
/// Returns the bound address (useful with port 0) and the server task.
pub async fn spawn_server(
    state: AppState,
) -> Result<(SocketAddr, tokio::task::JoinHandle<Result<(), MeterError>>), MeterError> {
    let listener = bind(&state).await?;
    let addr = listener
        .local_addr()
        .map_err(|e| MeterError::Internal(format!("Failed to read local address: {}", e)))?;
    info!("Metering server ready on {}", addr);

    let router = create_router(state);
    let handle = tokio::spawn(async move {
        axum::serve(listener, router)
            .await
            .map_err(|e| MeterError::Internal(format!("Server error: {}", e)))
    });

    Ok((addr, handle))
}

async fn bind(state: &AppState) -> Result<TcpListener, MeterError> {
    let server = &state.config.server;
    let addr = format!("{}:{}", server.listen_addr, server.port);
    TcpListener::bind(&addr)
        .await
        .map_err(|e| MeterError::Internal(format!("Failed to bind to {}: {}", addr, e)))
}
