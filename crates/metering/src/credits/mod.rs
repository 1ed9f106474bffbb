//! Credit system: balances and pricing.

mod ledger;
mod pricing;

pub use ledger::CreditLedger;
pub use pricing::{
    credits_for_tokens, estimate_credits, estimate_tokens, round_credits, PricingCalculator,
    TokenUsage, CREDIT_SCALE,
};
