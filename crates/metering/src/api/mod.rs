//! HTTP API for jobs, billing and admin operations.

mod handlers;
mod middleware;
mod types;

pub use handlers::*;
pub use middleware::{
    hash_secret, logging_middleware, rate_limit_middleware, RateLimitState, SecretDigest,
    ADMIN_KEY_HEADER,
};
pub use types::*;

use crate::billing::Billing;
use crate::config::MeterConfig;
use crate::credits::CreditLedger;
use crate::error::MeterError;
use crate::jobs::{
    CompletionJobHandler, Dispatcher, EagerTrigger, JobHandler, JobStore, INTERNAL_SECRET_HEADER,
};
use crate::maintenance::Maintenance;
use crate::routing::ProviderRouter;
use crate::storage::Storage;
use crate::usage::UsageRecorder;
use axum::{
    http::HeaderMap,
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<MeterConfig>,
    pub billing: Billing,
    pub jobs: JobStore,
    pub dispatcher: Dispatcher,
    pub trigger: EagerTrigger,
    pub maintenance: Maintenance,
    admin_key: SecretDigest,
    internal_secret: SecretDigest,
}

impl AppState {
    /// Wire the stores, router and dispatcher over one storage handle.
    pub fn new(
        config: MeterConfig,
        storage: Storage,
        router: ProviderRouter,
    ) -> Result<Self, MeterError> {
        let config = Arc::new(config);
        let billing = Billing::new(
            config.clone(),
            CreditLedger::new(storage.clone()),
            UsageRecorder::new(storage.clone()),
            router,
        );
        let jobs = JobStore::new(storage.clone());
        let handlers: Vec<Arc<dyn JobHandler>> =
            vec![Arc::new(CompletionJobHandler::new(billing.clone()))];
        let dispatcher = Dispatcher::new(jobs.clone(), handlers);
        let trigger = EagerTrigger::from_config(
            &config.dispatch,
            config.auth.internal_secret.as_ref(),
            &dispatcher,
        )?;

        Ok(Self {
            admin_key: SecretDigest::new(config.auth.admin_key.as_ref()),
            internal_secret: SecretDigest::new(config.auth.internal_secret.as_ref()),
            maintenance: Maintenance::new(storage),
            config,
            billing,
            jobs,
            dispatcher,
            trigger,
        })
    }

    /// Replace the eager trigger.
    pub fn with_trigger(mut self, trigger: EagerTrigger) -> Self {
        self.trigger = trigger;
        self
    }

    /// Whether the request carries the admin key.
    pub fn is_admin(&self, headers: &HeaderMap) -> bool {
        self.admin_key.matches(headers, ADMIN_KEY_HEADER)
    }

    /// 401 without the admin header, 403 when it does not match.
    pub fn require_admin(&self, headers: &HeaderMap) -> Result<(), MeterError> {
        if !headers.contains_key(ADMIN_KEY_HEADER) {
            return Err(MeterError::Unauthorized);
        }
        if !self.is_admin(headers) {
            return Err(MeterError::Forbidden("invalid admin key".into()));
        }
        Ok(())
    }

    /// Internal secret or admin key.
    pub fn require_internal(&self, headers: &HeaderMap) -> Result<(), MeterError> {
        if self.internal_secret.matches(headers, INTERNAL_SECRET_HEADER) || self.is_admin(headers)
        {
            return Ok(());
        }
        if headers.contains_key(INTERNAL_SECRET_HEADER) || headers.contains_key(ADMIN_KEY_HEADER) {
            return Err(MeterError::Forbidden("invalid credentials".into()));
        }
        Err(MeterError::Unauthorized)
    }
}

/// Create the API router, rate limited per `server.requests_per_minute`.
pub fn create_router(state: AppState) -> Router {
    let rate_limit = RateLimitState::new(state.config.server.requests_per_minute);
    create_router_with_rate_limit(state, rate_limit)
}

/// Create the API router with custom rate limiting.
pub fn create_router_with_rate_limit(state: AppState, rate_limit: RateLimitState) -> Router {
    let metered = Router::new()
        .route("/jobs", post(handlers::create_job))
        .route("/jobs/run", post(handlers::run_job))
        .route(
            "/jobs/:id",
            get(handlers::get_job).patch(handlers::patch_job),
        )
        .route("/billing/balance", get(handlers::get_balance))
        .route("/billing/usage", get(handlers::get_usage))
        .route("/credits/adjust", post(handlers::adjust_credits))
        .route("/si/ask", post(handlers::ask))
        .route("/admin/process-one", post(handlers::process_one))
        .route("/admin/cleanup", post(handlers::cleanup))
        .route_layer(axum_middleware::from_fn_with_state(
            rate_limit,
            rate_limit_middleware,
        ));

    Router::new()
        // Health check (no rate limiting)
        .route("/health", get(handlers::health))
        .merge(metered)
        .layer(axum_middleware::from_fn(logging_middleware))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .with_state(state)
}
