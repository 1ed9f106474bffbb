//! Per-identity credit balances.

use super::pricing::round_credits;
use crate::error::MeterError;
use crate::storage::Storage;
use crate::types::CreditBalance;
use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

const BALANCE_PREFIX: &str = "balance:";

/// Bound on compare-and-swap retries for one write.
const MAX_WRITE_ATTEMPTS: usize = 64;

fn balance_key(identity: &str) -> String {
    format!("{BALANCE_PREFIX}{identity}")
}

/// Credit ledger.
///
/// Every write is a compare-and-swap against the exact stored bytes, so
/// concurrent adjustments for one identity serialize instead of losing
/// updates.
#[derive(Clone)]
pub struct CreditLedger {
    storage: Storage,
}

impl CreditLedger {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// Current balance. Unknown identities (and unreadable records) read as 0.
    pub fn get_balance(&self, identity: &str) -> CreditBalance {
        match self.storage.get_json::<CreditBalance>(&balance_key(identity)) {
            Ok(Some(balance)) => balance,
            Ok(None) => CreditBalance::empty(identity),
            Err(e) => {
                warn!(identity, "Failed to read balance, treating as 0: {}", e);
                CreditBalance::empty(identity)
            }
        }
    }

    /// Apply a signed delta. The result is clamped at 0 and rounded to 3 places.
    pub fn adjust_balance(
        &self,
        identity: &str,
        delta: Decimal,
    ) -> Result<CreditBalance, MeterError> {
        let balance = self.update(identity, |current| current + delta)?;
        debug!(identity, %delta, balance = %balance.balance_credits, "Balance adjusted");
        Ok(balance)
    }

    /// Admin override to an absolute value.
    pub fn set_balance(&self, identity: &str, value: Decimal) -> Result<CreditBalance, MeterError> {
        let balance = self.update(identity, |_| value)?;
        info!(identity, balance = %balance.balance_credits, "Balance set by admin");
        Ok(balance)
    }

    fn update(
        &self,
        identity: &str,
        apply: impl Fn(Decimal) -> Decimal,
    ) -> Result<CreditBalance, MeterError> {
        let key = balance_key(identity);

        for attempt in 0..MAX_WRITE_ATTEMPTS {
            let current_raw = self.storage.get_raw(&key)?;
            let current = match &current_raw {
                Some(bytes) => serde_json::from_slice::<CreditBalance>(bytes)?.balance_credits,
                None => Decimal::ZERO,
            };

            let next = CreditBalance {
                identity: identity.to_string(),
                balance_credits: round_credits(apply(current).max(Decimal::ZERO)),
                updated_at: Some(Utc::now()),
            };
            let bytes = serde_json::to_vec(&next)?;

            if self
                .storage
                .compare_and_swap(&key, current_raw.as_deref(), Some(bytes.as_slice()))?
            {
                return Ok(next);
            }
            debug!(identity, attempt, "Balance write conflict, retrying");
        }

        Err(MeterError::Storage(format!(
            "Balance update for {} did not converge after {} attempts",
            identity, MAX_WRITE_ATTEMPTS
        )))
    }
}
