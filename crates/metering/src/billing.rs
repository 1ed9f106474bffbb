//! Billed completions.
//!
//! Shared by `/si/ask` and the `si` job handler: balance pre-check, routed
//! call, usage record, balance debit.

use crate::config::MeterConfig;
use crate::credits::{CreditLedger, PricingCalculator, TokenUsage};
use crate::error::MeterError;
use crate::routing::{CompletionRequest, ProviderRouter};
use crate::types::CreditBalance;
use crate::usage::{NewUsage, UsageRecorder};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

/// Characters of input echoed back in a degraded response.
const DEGRADED_ECHO_CHARS: usize = 200;

pub const DEGRADED_PROVIDER: &str = "degraded";

/// One skill invocation to bill.
#[derive(Debug, Clone)]
pub struct SkillCall {
    pub skill: String,
    pub input: String,
    /// Provider to try first.
    pub provider: Option<String>,
    /// Route or job type recorded on the usage event.
    pub route: String,
    /// Extra fields merged into the usage event's `meta`.
    pub meta: Value,
    /// Answer with a zero-cost echo when every provider fails.
    pub allow_degraded: bool,
}

/// Outcome of a billed call.
#[derive(Debug, Clone)]
pub struct BilledCompletion {
    pub text: String,
    pub provider: String,
    pub model: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub cost: Decimal,
    /// Balance after the debit.
    pub balance: CreditBalance,
    pub usage_id: String,
    pub degraded: bool,
}

#[derive(Clone)]
pub struct Billing {
    config: Arc<MeterConfig>,
    ledger: CreditLedger,
    usage: UsageRecorder,
    router: ProviderRouter,
    pricing: PricingCalculator,
}

impl Billing {
    pub fn new(
        config: Arc<MeterConfig>,
        ledger: CreditLedger,
        usage: UsageRecorder,
        router: ProviderRouter,
    ) -> Self {
        let pricing = PricingCalculator::new(config.pricing.clone());
        Self {
            config,
            ledger,
            usage,
            router,
            pricing,
        }
    }

    pub fn ledger(&self) -> &CreditLedger {
        &self.ledger
    }

    pub fn usage(&self) -> &UsageRecorder {
        &self.usage
    }

    pub fn router(&self) -> &ProviderRouter {
        &self.router
    }

    pub fn pricing(&self) -> &PricingCalculator {
        &self.pricing
    }

    /// Completion request for a skill, using its configured prompt and limits.
    pub fn skill_request(&self, skill: &str, input: &str) -> CompletionRequest {
        let settings = self.config.skill(skill);
        CompletionRequest {
            prompt: input.to_string(),
            system_prompt: Some(settings.system_prompt),
            max_tokens: settings
                .max_tokens
                .unwrap_or(self.config.routing.default_max_tokens),
            temperature: settings
                .temperature
                .unwrap_or(self.config.routing.default_temperature),
        }
    }

    /// Fail with `InsufficientCredits` unless the balance covers the
    /// estimated cost of answering `input`.
    pub fn check_funds(
        &self,
        identity: &str,
        input: &str,
        max_tokens: u32,
    ) -> Result<CreditBalance, MeterError> {
        let balance = self.ledger.get_balance(identity);
        let required = self.pricing.estimate(input, max_tokens);
        if !balance.covers(required) {
            info!(
                identity,
                balance = %balance.balance_credits,
                %required,
                "Insufficient credits"
            );
            return Err(MeterError::InsufficientCredits {
                balance: balance.balance_credits,
                required,
            });
        }
        Ok(balance)
    }

    /// Run a skill and bill the caller for it.
    ///
    /// Funds are checked against an estimate before any provider is called.
    /// A degraded answer costs nothing but is still recorded.
    pub async fn run_skill(
        &self,
        identity: &str,
        call: SkillCall,
    ) -> Result<BilledCompletion, MeterError> {
        if call.input.trim().is_empty() {
            return Err(MeterError::InvalidRequest("input is required".into()));
        }

        let request = self.skill_request(&call.skill, &call.input);
        let balance = self.check_funds(identity, &call.input, request.max_tokens)?;

        let routed = match self.router.route(&request, call.provider.as_deref()).await {
            Ok(routed) => routed,
            Err(e) if call.allow_degraded && self.config.routing.degraded_fallback => {
                warn!(identity, skill = %call.skill, "Answering degraded: {}", e);
                return self.degraded(identity, &call, balance, &e.to_string());
            }
            Err(e) => return Err(e.into()),
        };

        let cost = self
            .pricing
            .calculate(&TokenUsage::new(routed.tokens_in, routed.tokens_out));

        let event = self.usage.append_usage(
            identity,
            NewUsage {
                route: call.route.clone(),
                tokens_in: routed.tokens_in,
                tokens_out: routed.tokens_out,
                cost_credits: cost,
                provider: routed.provider.clone(),
                model: routed.model.clone(),
                meta: merge_meta(&call, json!({})),
            },
        )?;
        let balance = self.ledger.adjust_balance(identity, -cost)?;

        info!(
            identity,
            route = %call.route,
            provider = %routed.provider,
            %cost,
            balance = %balance.balance_credits,
            "Billed completion"
        );

        Ok(BilledCompletion {
            text: routed.text,
            provider: routed.provider,
            model: routed.model,
            tokens_in: routed.tokens_in,
            tokens_out: routed.tokens_out,
            cost,
            balance,
            usage_id: event.id,
            degraded: false,
        })
    }

    fn degraded(
        &self,
        identity: &str,
        call: &SkillCall,
        balance: CreditBalance,
        reason: &str,
    ) -> Result<BilledCompletion, MeterError> {
        let echo: String = call.input.chars().take(DEGRADED_ECHO_CHARS).collect();
        let event = self.usage.append_usage(
            identity,
            NewUsage {
                route: call.route.clone(),
                tokens_in: 0,
                tokens_out: 0,
                cost_credits: Decimal::ZERO,
                provider: DEGRADED_PROVIDER.to_string(),
                model: "none".to_string(),
                meta: merge_meta(call, json!({ "degraded": true, "error": reason })),
            },
        )?;

        Ok(BilledCompletion {
            text: format!("[degraded] {echo}"),
            provider: DEGRADED_PROVIDER.to_string(),
            model: "none".to_string(),
            tokens_in: 0,
            tokens_out: 0,
            cost: Decimal::ZERO,
            balance,
            usage_id: event.id,
            degraded: true,
        })
    }
}

fn merge_meta(call: &SkillCall, extra: Value) -> Value {
    let mut meta = json!({ "skill": call.skill });
    if let (Some(target), Some(source)) = (meta.as_object_mut(), call.meta.as_object()) {
        target.extend(source.clone());
    }
    if let (Some(target), Some(source)) = (meta.as_object_mut(), extra.as_object()) {
        target.extend(source.clone());
    }
    meta
}
