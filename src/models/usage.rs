//! API usage log.
//!
//! One immutable row per served (or billed-and-refused) request. The same rows
//! are the audit trail for billing and the substrate for rate-limit counting.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::models::credit::CreditSummary;

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct UsageRecord {
    pub id: Uuid,
    pub api_key_id: Uuid,
    pub tenant_id: Uuid,

    /// Endpoint identifier, e.g. `GET /api/v1/tenders`
    pub endpoint: String,

    pub method: String,
    pub status_code: i32,
    pub response_time_ms: i64,
    pub credits_charged: i64,
    pub ip_address: String,
    pub user_agent: String,
    pub created_at: DateTime<Utc>,
}

/// Values for a usage row about to be appended.
#[derive(Debug, Clone)]
pub struct NewUsageRecord {
    pub api_key_id: Uuid,
    pub tenant_id: Uuid,
    pub endpoint: String,
    pub method: String,
    pub status_code: i32,
    pub response_time_ms: i64,
    pub credits_charged: i64,
    pub ip_address: String,
    pub user_agent: String,
    pub created_at: DateTime<Utc>,
}

/// Call count and credits spent over a period.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, sqlx::FromRow, Serialize)]
pub struct UsageTotals {
    pub calls: i64,
    pub credits_spent: i64,
}

#[derive(Debug, Serialize)]
pub struct RateLimitSummary {
    pub per_minute: i32,
    pub per_day: i32,
}

/// Response body of `GET /api/v1/usage`.
#[derive(Debug, Serialize)]
pub struct UsageResponse {
    pub credits: CreditSummary,
    pub usage_today: UsageTotals,
    pub usage_month: UsageTotals,
    pub recent_calls: Vec<UsageRecord>,
    pub rate_limits: RateLimitSummary,
}
