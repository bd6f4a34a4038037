//! Storage traits.
//!
//! Every piece of durable state goes through these traits so the same services
//! run against PostgreSQL in production and the in-memory store in development
//! and tests. The two operations that must be atomic live here, not in the
//! services:
//!
//! - [`LedgerStore::debit_credits`]: check-and-decrement in one step
//! - [`ExecutionStore::create_execution_if_idle`]: check-and-insert in one step

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use uuid::Uuid;

use crate::models::api_key::{ApiKey, NewApiKey};
use crate::models::credit::CreditAccount;
use crate::models::execution::{
    ExecutionUpdate, LogEntry, NewExecution, WorkflowExecution, WorkflowKind,
};
use crate::models::llm_usage::{LlmUsageRecord, NewLlmUsage, RunLogEntry};
use crate::models::schedule::{CronSchedule, ScheduleDefinition, ScheduleOutcome};
use crate::models::tender::{Tender, TenderQuery, TenderStats};
use crate::models::usage::{NewUsageRecord, UsageRecord, UsageTotals};

/// Storage error types
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored value could not be mapped back into a model
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn corrupt(what: impl fmt::Display) -> Self {
        StoreError::Corrupt(what.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Insert a key unless the tenant already has `max_live` live keys.
    ///
    /// Returns `None` when the cap is reached.
    async fn insert_api_key(&self, key: NewApiKey, max_live: i64) -> StoreResult<Option<ApiKey>>;

    async fn find_api_key_by_hash(&self, key_hash: &str) -> StoreResult<Option<ApiKey>>;

    async fn list_api_keys(&self, tenant_id: Uuid) -> StoreResult<Vec<ApiKey>>;

    /// Returns false when the key does not exist or belongs to another tenant.
    async fn deactivate_api_key(&self, tenant_id: Uuid, key_id: Uuid) -> StoreResult<bool>;

    async fn delete_api_key(&self, tenant_id: Uuid, key_id: Uuid) -> StoreResult<bool>;

    async fn touch_api_key(&self, key_id: Uuid, at: DateTime<Utc>) -> StoreResult<()>;
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Create the tenant's account with `free_grant` credits if it does not exist yet.
    async fn ensure_credit_account(&self, tenant_id: Uuid, free_grant: i64) -> StoreResult<()>;

    async fn credit_account(&self, tenant_id: Uuid) -> StoreResult<Option<CreditAccount>>;

    /// Atomically add `amount` to `total_consumed` if the account can afford it.
    ///
    /// Returns false (and changes nothing) when it cannot, or when the account
    /// does not exist.
    async fn debit_credits(&self, tenant_id: Uuid, amount: i64) -> StoreResult<bool>;

    /// Give back credits taken by a debit whose work never happened.
    ///
    /// Added to `free_granted` so `total_consumed` keeps only growing. No-op
    /// when the account does not exist.
    async fn refund_credits(&self, tenant_id: Uuid, amount: i64) -> StoreResult<()>;

    /// Add purchased credits, creating the account if needed.
    async fn top_up_credits(&self, tenant_id: Uuid, amount: i64) -> StoreResult<CreditAccount>;

    async fn endpoint_price(&self, endpoint: &str) -> StoreResult<Option<i64>>;

    async fn set_endpoint_price(&self, endpoint: &str, credits_per_call: i64) -> StoreResult<()>;
}

#[async_trait]
pub trait UsageStore: Send + Sync {
    async fn record_usage(&self, record: NewUsageRecord) -> StoreResult<()>;

    /// Number of usage rows for the key strictly newer than `since`.
    async fn count_usage_since(&self, api_key_id: Uuid, since: DateTime<Utc>) -> StoreResult<i64>;

    async fn usage_totals_since(&self, tenant_id: Uuid, since: DateTime<Utc>) -> StoreResult<UsageTotals>;

    async fn recent_usage(&self, tenant_id: Uuid, limit: i64) -> StoreResult<Vec<UsageRecord>>;
}

#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// Create or replace the tenant's schedule for `definition.workflow`.
    async fn upsert_schedule(
        &self,
        tenant_id: Uuid,
        definition: ScheduleDefinition,
        next_run_at: Option<DateTime<Utc>>,
    ) -> StoreResult<CronSchedule>;

    async fn list_schedules(&self, tenant_id: Uuid) -> StoreResult<Vec<CronSchedule>>;

    async fn delete_schedule(&self, tenant_id: Uuid, workflow: WorkflowKind) -> StoreResult<bool>;

    /// All enabled schedules across tenants; the due selector filters them.
    async fn enabled_schedules(&self) -> StoreResult<Vec<CronSchedule>>;

    /// Write the result of a sweep attempt back onto the schedule.
    async fn record_schedule_outcome(
        &self,
        schedule_id: Uuid,
        ran_at: DateTime<Utc>,
        outcome: &ScheduleOutcome,
    ) -> StoreResult<()>;
}

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Insert a `PENDING` execution unless one is already `PENDING`/`RUNNING`
    /// for the same tenant and workflow. Returns `None` in that case.
    async fn create_execution_if_idle(&self, new: NewExecution) -> StoreResult<Option<WorkflowExecution>>;

    async fn get_execution(&self, id: Uuid) -> StoreResult<Option<WorkflowExecution>>;

    /// Apply a partial update as one serialized write. `None` if the id is unknown.
    async fn update_execution(&self, id: Uuid, update: ExecutionUpdate) -> StoreResult<Option<WorkflowExecution>>;

    /// Move a `PENDING` execution to `RUNNING`. No-op for any other status.
    async fn mark_running(&self, id: Uuid, current_step: &str) -> StoreResult<()>;

    /// Force every `PENDING`/`RUNNING` execution started before `cutoff` to `ERROR`.
    ///
    /// Returns the ids that were transitioned; an execution appears at most once
    /// across concurrent sweeps.
    async fn reap_stale_executions(&self, cutoff: DateTime<Utc>, message: &str) -> StoreResult<Vec<Uuid>>;

    /// Force one non-terminal execution of the tenant to `ERROR`.
    ///
    /// `None` if it does not exist, belongs to another tenant, or already finished.
    async fn cancel_execution(&self, tenant_id: Uuid, id: Uuid, log: LogEntry) -> StoreResult<Option<WorkflowExecution>>;

    /// Most recent executions of the tenant, newest first.
    async fn list_executions(
        &self,
        tenant_id: Uuid,
        workflow: Option<WorkflowKind>,
        active: bool,
        limit: i64,
    ) -> StoreResult<Vec<WorkflowExecution>>;
}

/// Append-only records written from engine completion callbacks.
#[async_trait]
pub trait RunLogStore: Send + Sync {
    async fn record_run_log(&self, entry: RunLogEntry) -> StoreResult<()>;

    async fn record_llm_usage(&self, rows: Vec<NewLlmUsage>) -> StoreResult<()>;

    /// The tenant's LLM usage rows created at or after `since`.
    async fn llm_usage_since(&self, tenant_id: Uuid, since: DateTime<Utc>) -> StoreResult<Vec<LlmUsageRecord>>;
}

/// Read access to the dashboard's tender tables, plus the review-phase advance.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn list_tenders(&self, tenant_id: Uuid, query: &TenderQuery) -> StoreResult<(Vec<Tender>, i64)>;

    async fn get_tender(&self, tenant_id: Uuid, id: Uuid) -> StoreResult<Option<Tender>>;

    async fn tender_stats(&self, tenant_id: Uuid) -> StoreResult<TenderStats>;

    /// Mark analyzed tenders and move `NEW` ones to their next review phase.
    ///
    /// Idempotent: running it twice changes nothing the second time. Returns the
    /// number of tenders whose review phase changed.
    async fn advance_review_phases(&self, tenant_id: Uuid) -> StoreResult<u64>;
}

/// Everything the service needs from storage.
#[async_trait]
pub trait Store:
    KeyStore + LedgerStore + UsageStore + ScheduleStore + ExecutionStore + RunLogStore + CatalogStore
{
    /// Cheap connectivity check for the health endpoint.
    async fn ping(&self) -> StoreResult<()>;
}
