//! Credit account and pricing models.
//!
//! Credits are integral units. A tenant's spendable amount is never stored; it is
//! derived from the three counters every time it is read.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Price charged for endpoints without an explicit pricing row.
pub const DEFAULT_CREDITS_PER_CALL: i64 = 1;

/// Per-tenant credit counters.
///
/// # Database Table
///
/// Maps to `credit_accounts`, one row per tenant, created lazily with the free
/// grant when the tenant creates its first API key.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow, Serialize)]
pub struct CreditAccount {
    pub tenant_id: Uuid,

    /// Purchased credits
    pub balance: i64,

    pub free_granted: i64,

    /// Sum of all successful debits. Never decreases.
    pub total_consumed: i64,

    pub total_purchased: i64,

    /// When set, debits may push the effective balance below zero.
    pub allow_overdraft: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CreditAccount {
    pub fn effective_balance(&self) -> i64 {
        self.balance + self.free_granted - self.total_consumed
    }

    /// Whether a debit of `amount` would be accepted right now.
    pub fn can_afford(&self, amount: i64) -> bool {
        self.allow_overdraft || self.effective_balance() >= amount
    }
}

/// Result of a read-only pre-flight credit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CreditCheck {
    pub has_credits: bool,
    pub required: i64,
    pub balance: i64,
}

/// Credits charged for one call and what is left afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Charge {
    pub consumed: i64,
    pub remaining: i64,
}

/// Credit section of the usage and key-management responses.
#[derive(Debug, Serialize)]
pub struct CreditSummary {
    pub balance: i64,
    pub free_granted: i64,
    pub total_consumed: i64,
    pub total_purchased: i64,
    pub effective_balance: i64,
}

impl From<Option<CreditAccount>> for CreditSummary {
    fn from(account: Option<CreditAccount>) -> Self {
        match account {
            Some(account) => Self {
                effective_balance: account.effective_balance(),
                balance: account.balance,
                free_granted: account.free_granted,
                total_consumed: account.total_consumed,
                total_purchased: account.total_purchased,
            },
            None => Self {
                balance: 0,
                free_granted: 0,
                total_consumed: 0,
                total_purchased: 0,
                effective_balance: 0,
            },
        }
    }
}

/// Request body for adding purchased credits.
#[derive(Debug, Deserialize)]
pub struct TopUpRequest {
    pub amount: i64,
}

/// Request body for setting an endpoint price.
#[derive(Debug, Deserialize)]
pub struct PricingRequest {
    pub endpoint: String,
    pub credits_per_call: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(balance: i64, free: i64, consumed: i64) -> CreditAccount {
        CreditAccount {
            tenant_id: Uuid::new_v4(),
            balance,
            free_granted: free,
            total_consumed: consumed,
            total_purchased: balance,
            allow_overdraft: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn effective_balance_combines_all_counters() {
        assert_eq!(account(50, 100, 30).effective_balance(), 120);
        assert_eq!(account(0, 100, 100).effective_balance(), 0);
        assert_eq!(account(0, 10, 15).effective_balance(), -5);
    }

    #[test]
    fn overdraft_flag_bypasses_balance() {
        let mut acct = account(0, 1, 1);
        assert!(!acct.can_afford(1));
        acct.allow_overdraft = true;
        assert!(acct.can_afford(1));
    }

    #[test]
    fn missing_account_summarises_as_zero() {
        let summary = CreditSummary::from(None);
        assert_eq!(summary.effective_balance, 0);
        assert_eq!(summary.total_consumed, 0);
    }
}
