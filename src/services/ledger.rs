//! Credit ledger: pricing, balance checks and billing of API calls.
//!
//! # Billing Flow
//!
//! Billed handlers call [`preflight`] before doing any work and [`settle`] after
//! the business query succeeded:
//!
//! 1. `preflight`: read-only check, 402 without writing anything
//! 2. business query
//! 3. `settle`: atomic debit, usage row, 402 if a concurrent call drained the
//!    balance in between (the payload is then discarded)
//!
//! Calls with side effects that cannot be discarded, such as starting a
//! workflow, use [`debit`] before the side effect and [`record_call`] once its
//! outcome is known, refunding the debit if the side effect failed.
//!
//! The debit is the only atomic step. Everything else reads derived values.

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use uuid::Uuid;

use crate::error::AppError;
use crate::middleware::api_key::{ApiKeyContext, CallMeta};
use crate::models::credit::{Charge, CreditAccount, CreditCheck, CreditSummary, DEFAULT_CREDITS_PER_CALL};
use crate::models::llm_usage::LlmUsageSummary;
use crate::models::usage::{NewUsageRecord, RateLimitSummary, UsageResponse};
use crate::store::Store;

/// Price of one call to `endpoint`.
pub async fn price(store: &dyn Store, endpoint: &str) -> Result<i64, AppError> {
    Ok(store
        .endpoint_price(endpoint)
        .await?
        .unwrap_or(DEFAULT_CREDITS_PER_CALL))
}

/// Read-only check of whether the tenant can afford one call to `endpoint`.
///
/// A tenant without an account has a balance of 0.
pub async fn check_credits(store: &dyn Store, tenant_id: Uuid, endpoint: &str) -> Result<CreditCheck, AppError> {
    let required = price(store, endpoint).await?;
    let account = store.credit_account(tenant_id).await?;

    let (has_credits, balance) = match &account {
        Some(account) => (account.can_afford(required), account.effective_balance()),
        None => (required <= 0, 0),
    };

    Ok(CreditCheck {
        has_credits,
        required,
        balance,
    })
}

/// Fail fast with 402 before running a billed query. Returns the price.
pub async fn preflight(store: &dyn Store, ctx: &ApiKeyContext, meta: &CallMeta) -> Result<i64, AppError> {
    let check = check_credits(store, ctx.tenant_id, &meta.endpoint).await?;
    if !check.has_credits {
        return Err(AppError::InsufficientCredits {
            balance: check.balance,
            required: check.required,
        });
    }
    Ok(check.required)
}

/// Charge a completed call and log it.
///
/// The usage row is written whether or not the debit succeeds; a failed debit
/// is logged with status 402 and zero credits.
pub async fn settle(store: &dyn Store, ctx: &ApiKeyContext, meta: &CallMeta, price: i64) -> Result<Charge, AppError> {
    let charge = debit(store, ctx, meta, price).await?;
    record_call(store, ctx, meta, 200, price).await?;
    Ok(charge)
}

/// Take `price` credits from the tenant without logging the call yet.
///
/// A refused debit is logged right away as a free 402 and returned as
/// `InsufficientCredits`.
pub async fn debit(store: &dyn Store, ctx: &ApiKeyContext, meta: &CallMeta, price: i64) -> Result<Charge, AppError> {
    let debited = store.debit_credits(ctx.tenant_id, price).await?;
    let remaining = remaining(store, ctx.tenant_id).await?;

    if !debited {
        record_call(store, ctx, meta, 402, 0).await?;
        tracing::warn!(
            tenant_id = %ctx.tenant_id,
            endpoint = %meta.endpoint,
            price,
            remaining,
            "debit refused after preflight passed"
        );
        return Err(AppError::InsufficientCredits {
            balance: remaining,
            required: price,
        });
    }

    Ok(Charge {
        consumed: price,
        remaining,
    })
}

/// Give back a debit whose call failed before doing anything billable.
pub async fn refund(store: &dyn Store, ctx: &ApiKeyContext, price: i64) -> Result<(), AppError> {
    if price > 0 {
        store.refund_credits(ctx.tenant_id, price).await?;
        tracing::info!(tenant_id = %ctx.tenant_id, price, "debit refunded");
    }
    Ok(())
}

/// Append the usage row for one call.
pub async fn record_call(
    store: &dyn Store,
    ctx: &ApiKeyContext,
    meta: &CallMeta,
    status_code: i32,
    credits_charged: i64,
) -> Result<(), AppError> {
    store
        .record_usage(NewUsageRecord {
            api_key_id: ctx.key_id,
            tenant_id: ctx.tenant_id,
            endpoint: meta.endpoint.clone(),
            method: meta.method.clone(),
            status_code,
            response_time_ms: meta.started.elapsed().as_millis() as i64,
            credits_charged,
            ip_address: meta.ip_address.clone(),
            user_agent: meta.user_agent.clone(),
            created_at: Utc::now(),
        })
        .await?;
    Ok(())
}

async fn remaining(store: &dyn Store, tenant_id: Uuid) -> Result<i64, AppError> {
    Ok(store
        .credit_account(tenant_id)
        .await?
        .map(|a| a.effective_balance())
        .unwrap_or(0))
}

/// Add purchased credits to a tenant's account.
pub async fn top_up(store: &dyn Store, tenant_id: Uuid, amount: i64) -> Result<CreditAccount, AppError> {
    if amount <= 0 {
        return Err(AppError::InvalidRequest("Amount must be positive".to_string()));
    }
    let account = store.top_up_credits(tenant_id, amount).await?;
    tracing::info!(tenant_id = %tenant_id, amount, balance = account.effective_balance(), "credits added");
    Ok(account)
}

/// Set the price of an endpoint. Takes effect on the next call.
pub async fn set_price(store: &dyn Store, endpoint: &str, credits_per_call: i64) -> Result<(), AppError> {
    if credits_per_call < 0 {
        return Err(AppError::InvalidRequest("credits_per_call must not be negative".to_string()));
    }
    if endpoint.split_once(' ').is_none_or(|(method, path)| method.is_empty() || !path.starts_with('/')) {
        return Err(AppError::InvalidRequest(
            "endpoint must look like 'GET /api/v1/tenders'".to_string(),
        ));
    }
    store.set_endpoint_price(endpoint, credits_per_call).await?;
    Ok(())
}

/// Credits and usage totals shown by `GET /api/v1/usage`.
pub async fn usage_summary(store: &dyn Store, ctx: &ApiKeyContext, now: DateTime<Utc>) -> Result<UsageResponse, AppError> {
    let (today, month) = period_starts(now);

    Ok(UsageResponse {
        credits: CreditSummary::from(store.credit_account(ctx.tenant_id).await?),
        usage_today: store.usage_totals_since(ctx.tenant_id, today).await?,
        usage_month: store.usage_totals_since(ctx.tenant_id, month).await?,
        recent_calls: store.recent_usage(ctx.tenant_id, 10).await?,
        rate_limits: RateLimitSummary {
            per_minute: ctx.rate_limit_per_minute,
            per_day: ctx.rate_limit_per_day,
        },
    })
}

/// Days of per-day LLM usage in the summary.
const LLM_USAGE_DAYS: i64 = 30;

/// LLM spend of the tenant: this month, plus one entry per day for the last
/// 30 days.
pub async fn llm_usage_summary(store: &dyn Store, tenant_id: Uuid, now: DateTime<Utc>) -> Result<LlmUsageSummary, AppError> {
    let (today, month) = period_starts(now);
    let daily_since = today - Duration::days(LLM_USAGE_DAYS);
    let records = store.llm_usage_since(tenant_id, month.min(daily_since)).await?;
    Ok(LlmUsageSummary::build(tenant_id, &records, month, daily_since))
}

/// Midnight today and midnight on the first of the month, UTC.
fn period_starts(now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let day = now.date_naive();
    let month = day.with_day(1).unwrap_or(day);
    (
        Utc.from_utc_datetime(&day.and_time(chrono::NaiveTime::MIN)),
        Utc.from_utc_datetime(&month.and_time(chrono::NaiveTime::MIN)),
    )
}
