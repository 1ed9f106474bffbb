//! Pricing calculation for token-to-credit conversion.

use crate::config::PricingConfig;
use rust_decimal::{Decimal, RoundingStrategy};

/// Decimal places kept on every credit amount.
pub const CREDIT_SCALE: u32 = 3;

/// Token usage for one completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub tokens_in: u32,
    pub tokens_out: u32,
}

impl TokenUsage {
    pub fn new(tokens_in: u32, tokens_out: u32) -> Self {
        Self {
            tokens_in,
            tokens_out,
        }
    }

    pub fn total_tokens(&self) -> u32 {
        self.tokens_in.saturating_add(self.tokens_out)
    }
}

/// Round a credit amount to the ledger's precision.
pub fn round_credits(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(CREDIT_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// Estimate tokens for a text using ~4 characters per token.
pub fn estimate_tokens(text: &str) -> u32 {
    let chars = text.chars().count();
    u32::try_from(chars.div_ceil(4)).unwrap_or(u32::MAX)
}

/// Calculate credits for token usage.
///
/// Formula:
/// - cost = (tokens_in + tokens_out) / 1000 * credits_per_1k_tokens
/// - total = max(cost, minimum_charge) when any tokens were used, else 0
pub fn credits_for_tokens(tokens_in: u32, tokens_out: u32, config: &PricingConfig) -> Decimal {
    let total = u64::from(tokens_in) + u64::from(tokens_out);
    if total == 0 {
        return Decimal::ZERO;
    }

    let cost = Decimal::from(total) * config.credits_per_1k_tokens / Decimal::from(1000u32);
    round_credits(cost.max(config.minimum_charge))
}

/// Estimate credits for a prompt before calling any provider.
///
/// The completion is assumed to be about twice the prompt, capped by
/// `max_tokens`.
pub fn estimate_credits(prompt: &str, max_tokens: u32, config: &PricingConfig) -> Decimal {
    let prompt_tokens = estimate_tokens(prompt).max(1);
    let completion_tokens = prompt_tokens.saturating_mul(2).min(max_tokens.max(1));
    credits_for_tokens(prompt_tokens, completion_tokens, config)
}

/// Pricing calculator with cached config.
#[derive(Debug, Clone)]
pub struct PricingCalculator {
    config: PricingConfig,
}

impl PricingCalculator {
    pub fn new(config: PricingConfig) -> Self {
        Self { config }
    }

    /// Calculate credits for token usage.
    pub fn calculate(&self, usage: &TokenUsage) -> Decimal {
        credits_for_tokens(usage.tokens_in, usage.tokens_out, &self.config)
    }

    /// Estimate credits for a prompt.
    pub fn estimate(&self, prompt: &str, max_tokens: u32) -> Decimal {
        estimate_credits(prompt, max_tokens, &self.config)
    }

    /// Balance below which callers are warned.
    pub fn warn_credits(&self) -> Decimal {
        self.config.warn_credits
    }
}
