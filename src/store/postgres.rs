//! PostgreSQL store.
//!
//! # Atomicity
//!
//! The check-and-act operations are single statements, so they stay correct
//! with any number of service instances sharing the database:
//!
//! - credit debits are a conditional `UPDATE` that matches zero rows when the
//!   account cannot afford the amount
//! - execution creation is an `INSERT ... ON CONFLICT DO NOTHING` against the
//!   partial unique index on in-flight executions
//! - the reaper is one `UPDATE ... RETURNING id`, so overlapping sweeps never
//!   report the same execution twice
//!
//! Enum columns are stored as `TEXT` and mapped through private row structs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use uuid::Uuid;

use super::{
    CatalogStore, ExecutionStore, KeyStore, LedgerStore, RunLogStore, ScheduleStore, Store,
    StoreError, StoreResult, UsageStore,
};
use crate::db::DbPool;
use crate::models::api_key::{ApiKey, NewApiKey, Permission};
use crate::models::attributes::Attributes;
use crate::models::credit::CreditAccount;
use crate::models::execution::{
    ExecutionStatus, ExecutionUpdate, LogEntry, LogLevel, NewExecution, TriggerSource,
    WorkflowExecution, WorkflowKind,
};
use crate::models::llm_usage::{LlmUsageRecord, NewLlmUsage, RunLogEntry};
use crate::models::schedule::{CronSchedule, Frequency, ScheduleDefinition, ScheduleOutcome};
use crate::models::tender::{
    OPPORTUNITY_REJECT, PHASE_NEW, PHASE_PRE_SCREENING, PHASE_REJECTED, STATUS_ANALYZED, Tender,
    TenderQuery, TenderStats,
};
use crate::models::usage::{NewUsageRecord, UsageRecord, UsageTotals};

#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct ApiKeyRow {
    id: Uuid,
    tenant_id: Uuid,
    name: String,
    key_hash: String,
    key_prefix: String,
    permissions: Vec<String>,
    rate_limit_per_minute: i32,
    rate_limit_per_day: i32,
    is_active: bool,
    expires_at: Option<DateTime<Utc>>,
    last_used_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl From<ApiKeyRow> for ApiKey {
    fn from(row: ApiKeyRow) -> Self {
        Self {
            id: row.id,
            tenant_id: row.tenant_id,
            name: row.name,
            key_hash: row.key_hash,
            key_prefix: row.key_prefix,
            // Scopes this build does not know are ignored rather than failing the lookup
            permissions: row.permissions.iter().filter_map(|p| Permission::parse(p)).collect(),
            rate_limit_per_minute: row.rate_limit_per_minute,
            rate_limit_per_day: row.rate_limit_per_day,
            is_active: row.is_active,
            expires_at: row.expires_at,
            last_used_at: row.last_used_at,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ScheduleRow {
    id: Uuid,
    tenant_id: Uuid,
    workflow: String,
    enabled: bool,
    frequency: String,
    hour: i32,
    minute: i32,
    days_of_week: Vec<i32>,
    timezone: String,
    params: Json<Attributes>,
    last_run_at: Option<DateTime<Utc>>,
    last_status: Option<String>,
    next_run_at: Option<DateTime<Utc>>,
    run_count: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ScheduleRow> for CronSchedule {
    type Error = StoreError;

    fn try_from(row: ScheduleRow) -> Result<Self, Self::Error> {
        let workflow = WorkflowKind::parse(&row.workflow)
            .ok_or_else(|| StoreError::corrupt(format!("schedule workflow {:?}", row.workflow)))?;
        let frequency = Frequency::parse(&row.frequency)
            .ok_or_else(|| StoreError::corrupt(format!("schedule frequency {:?}", row.frequency)))?;

        Ok(Self {
            id: row.id,
            tenant_id: row.tenant_id,
            definition: ScheduleDefinition {
                workflow,
                enabled: row.enabled,
                frequency,
                hour: row.hour.max(0) as u32,
                minute: row.minute.max(0) as u32,
                days_of_week: row.days_of_week.into_iter().map(|d| d.max(0) as u32).collect(),
                timezone: row.timezone,
                params: row.params.0,
            },
            last_run_at: row.last_run_at,
            last_status: row.last_status,
            next_run_at: row.next_run_at,
            run_count: row.run_count,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ExecutionRow {
    id: Uuid,
    tenant_id: Uuid,
    workflow: String,
    status: String,
    progress: i32,
    current_step: Option<String>,
    metrics: Json<Attributes>,
    logs: Json<Vec<LogEntry>>,
    trigger_source: String,
    triggered_by: Option<String>,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
}

impl TryFrom<ExecutionRow> for WorkflowExecution {
    type Error = StoreError;

    fn try_from(row: ExecutionRow) -> Result<Self, Self::Error> {
        let workflow = WorkflowKind::parse(&row.workflow)
            .ok_or_else(|| StoreError::corrupt(format!("execution workflow {:?}", row.workflow)))?;
        let status = ExecutionStatus::parse(&row.status)
            .ok_or_else(|| StoreError::corrupt(format!("execution status {:?}", row.status)))?;
        let trigger_source = TriggerSource::parse(&row.trigger_source).ok_or_else(|| {
            StoreError::corrupt(format!("execution trigger source {:?}", row.trigger_source))
        })?;

        Ok(Self {
            id: row.id,
            tenant_id: row.tenant_id,
            workflow,
            status,
            progress: row.progress,
            current_step: row.current_step,
            metrics: row.metrics.0,
            logs: row.logs.0,
            trigger_source,
            triggered_by: row.triggered_by,
            started_at: row.started_at,
            finished_at: row.finished_at,
            error_message: row.error_message,
        })
    }
}

fn executions(rows: Vec<ExecutionRow>) -> StoreResult<Vec<WorkflowExecution>> {
    rows.into_iter().map(WorkflowExecution::try_from).collect()
}

#[async_trait]
impl KeyStore for PgStore {
    async fn insert_api_key(&self, key: NewApiKey, max_live: i64) -> StoreResult<Option<ApiKey>> {
        let mut tx = self.pool.begin().await?;

        // Serialize key creation per tenant so the cap cannot be raced past
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1::TEXT))")
            .bind(key.tenant_id.to_string())
            .execute(&mut *tx)
            .await?;

        let live: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM api_keys
            WHERE tenant_id = $1
              AND is_active
              AND (expires_at IS NULL OR expires_at > NOW())
            "#,
        )
        .bind(key.tenant_id)
        .fetch_one(&mut *tx)
        .await?;

        if live >= max_live {
            tx.rollback().await?;
            return Ok(None);
        }

        let permissions: Vec<&str> = key.permissions.iter().map(|p| p.as_str()).collect();
        let row = sqlx::query_as::<_, ApiKeyRow>(
            r#"
            INSERT INTO api_keys (
                tenant_id, name, key_hash, key_prefix, permissions,
                rate_limit_per_minute, rate_limit_per_day, expires_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *
            "#,
        )
        .bind(key.tenant_id)
        .bind(&key.name)
        .bind(&key.key_hash)
        .bind(&key.key_prefix)
        .bind(&permissions)
        .bind(key.rate_limit_per_minute)
        .bind(key.rate_limit_per_day)
        .bind(key.expires_at)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(row.into()))
    }

    async fn find_api_key_by_hash(&self, key_hash: &str) -> StoreResult<Option<ApiKey>> {
        let row = sqlx::query_as::<_, ApiKeyRow>("SELECT * FROM api_keys WHERE key_hash = $1")
            .bind(key_hash)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }

    async fn list_api_keys(&self, tenant_id: Uuid) -> StoreResult<Vec<ApiKey>> {
        let rows = sqlx::query_as::<_, ApiKeyRow>(
            "SELECT * FROM api_keys WHERE tenant_id = $1 ORDER BY created_at DESC",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn deactivate_api_key(&self, tenant_id: Uuid, key_id: Uuid) -> StoreResult<bool> {
        let updated = sqlx::query("UPDATE api_keys SET is_active = FALSE WHERE id = $1 AND tenant_id = $2")
            .bind(key_id)
            .bind(tenant_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(updated == 1)
    }

    async fn delete_api_key(&self, tenant_id: Uuid, key_id: Uuid) -> StoreResult<bool> {
        let deleted = sqlx::query("DELETE FROM api_keys WHERE id = $1 AND tenant_id = $2")
            .bind(key_id)
            .bind(tenant_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(deleted == 1)
    }

    async fn touch_api_key(&self, key_id: Uuid, at: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query("UPDATE api_keys SET last_used_at = $2 WHERE id = $1")
            .bind(key_id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for PgStore {
    async fn ensure_credit_account(&self, tenant_id: Uuid, free_grant: i64) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO credit_accounts (tenant_id, free_granted)
            VALUES ($1, $2)
            ON CONFLICT (tenant_id) DO NOTHING
            "#,
        )
        .bind(tenant_id)
        .bind(free_grant)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn credit_account(&self, tenant_id: Uuid) -> StoreResult<Option<CreditAccount>> {
        let account = sqlx::query_as::<_, CreditAccount>(
            "SELECT * FROM credit_accounts WHERE tenant_id = $1",
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(account)
    }

    async fn debit_credits(&self, tenant_id: Uuid, amount: i64) -> StoreResult<bool> {
        // The affordability check and the increment are the same statement
        let updated = sqlx::query(
            r#"
            UPDATE credit_accounts
            SET total_consumed = total_consumed + $2,
                updated_at = NOW()
            WHERE tenant_id = $1
              AND (allow_overdraft OR balance + free_granted - total_consumed >= $2)
            "#,
        )
        .bind(tenant_id)
        .bind(amount)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated == 1)
    }

    async fn refund_credits(&self, tenant_id: Uuid, amount: i64) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE credit_accounts
            SET free_granted = free_granted + $2,
                updated_at = NOW()
            WHERE tenant_id = $1
            "#,
        )
        .bind(tenant_id)
        .bind(amount)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn top_up_credits(&self, tenant_id: Uuid, amount: i64) -> StoreResult<CreditAccount> {
        let account = sqlx::query_as::<_, CreditAccount>(
            r#"
            INSERT INTO credit_accounts (tenant_id, balance, total_purchased)
            VALUES ($1, $2, $2)
            ON CONFLICT (tenant_id) DO UPDATE
            SET balance = credit_accounts.balance + EXCLUDED.balance,
                total_purchased = credit_accounts.total_purchased + EXCLUDED.total_purchased,
                updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(tenant_id)
        .bind(amount)
        .fetch_one(&self.pool)
        .await?;
        Ok(account)
    }

    async fn endpoint_price(&self, endpoint: &str) -> StoreResult<Option<i64>> {
        let price = sqlx::query_scalar("SELECT credits_per_call FROM endpoint_pricing WHERE endpoint = $1")
            .bind(endpoint)
            .fetch_optional(&self.pool)
            .await?;
        Ok(price)
    }

    async fn set_endpoint_price(&self, endpoint: &str, credits_per_call: i64) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO endpoint_pricing (endpoint, credits_per_call)
            VALUES ($1, $2)
            ON CONFLICT (endpoint) DO UPDATE
            SET credits_per_call = EXCLUDED.credits_per_call,
                updated_at = NOW()
            "#,
        )
        .bind(endpoint)
        .bind(credits_per_call)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl UsageStore for PgStore {
    async fn record_usage(&self, record: NewUsageRecord) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO api_usage (
                api_key_id, tenant_id, endpoint, method, status_code,
                response_time_ms, credits_charged, ip_address, user_agent, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(record.api_key_id)
        .bind(record.tenant_id)
        .bind(&record.endpoint)
        .bind(&record.method)
        .bind(record.status_code)
        .bind(record.response_time_ms)
        .bind(record.credits_charged)
        .bind(&record.ip_address)
        .bind(&record.user_agent)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn count_usage_since(&self, api_key_id: Uuid, since: DateTime<Utc>) -> StoreResult<i64> {
        let count = sqlx::query_scalar(
            "SELECT COUNT(*) FROM api_usage WHERE api_key_id = $1 AND created_at > $2",
        )
        .bind(api_key_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn usage_totals_since(&self, tenant_id: Uuid, since: DateTime<Utc>) -> StoreResult<UsageTotals> {
        let totals = sqlx::query_as::<_, UsageTotals>(
            r#"
            SELECT COUNT(*) AS calls,
                   COALESCE(SUM(credits_charged), 0)::BIGINT AS credits_spent
            FROM api_usage
            WHERE tenant_id = $1 AND created_at > $2
            "#,
        )
        .bind(tenant_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(totals)
    }

    async fn recent_usage(&self, tenant_id: Uuid, limit: i64) -> StoreResult<Vec<UsageRecord>> {
        let records = sqlx::query_as::<_, UsageRecord>(
            "SELECT * FROM api_usage WHERE tenant_id = $1 ORDER BY created_at DESC LIMIT $2",
        )
        .bind(tenant_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }
}

#[async_trait]
impl ScheduleStore for PgStore {
    async fn upsert_schedule(
        &self,
        tenant_id: Uuid,
        definition: ScheduleDefinition,
        next_run_at: Option<DateTime<Utc>>,
    ) -> StoreResult<CronSchedule> {
        let days: Vec<i32> = definition.days_of_week.iter().map(|d| *d as i32).collect();
        let row = sqlx::query_as::<_, ScheduleRow>(
            r#"
            INSERT INTO cron_schedules (
                tenant_id, workflow, enabled, frequency, hour, minute,
                days_of_week, timezone, params, next_run_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (tenant_id, workflow) DO UPDATE
            SET enabled = EXCLUDED.enabled,
                frequency = EXCLUDED.frequency,
                hour = EXCLUDED.hour,
                minute = EXCLUDED.minute,
                days_of_week = EXCLUDED.days_of_week,
                timezone = EXCLUDED.timezone,
                params = EXCLUDED.params,
                next_run_at = EXCLUDED.next_run_at,
                updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(tenant_id)
        .bind(definition.workflow.as_str())
        .bind(definition.enabled)
        .bind(definition.frequency.as_str())
        .bind(definition.hour as i32)
        .bind(definition.minute as i32)
        .bind(&days)
        .bind(&definition.timezone)
        .bind(Json(&definition.params))
        .bind(next_run_at)
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    async fn list_schedules(&self, tenant_id: Uuid) -> StoreResult<Vec<CronSchedule>> {
        let rows = sqlx::query_as::<_, ScheduleRow>(
            "SELECT * FROM cron_schedules WHERE tenant_id = $1 ORDER BY workflow",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(CronSchedule::try_from).collect()
    }

    async fn delete_schedule(&self, tenant_id: Uuid, workflow: WorkflowKind) -> StoreResult<bool> {
        let deleted = sqlx::query("DELETE FROM cron_schedules WHERE tenant_id = $1 AND workflow = $2")
            .bind(tenant_id)
            .bind(workflow.as_str())
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(deleted == 1)
    }

    async fn enabled_schedules(&self) -> StoreResult<Vec<CronSchedule>> {
        let rows = sqlx::query_as::<_, ScheduleRow>("SELECT * FROM cron_schedules WHERE enabled")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(CronSchedule::try_from).collect()
    }

    async fn record_schedule_outcome(
        &self,
        schedule_id: Uuid,
        ran_at: DateTime<Utc>,
        outcome: &ScheduleOutcome,
    ) -> StoreResult<()> {
        let label = outcome.status_label();
        let query = match outcome {
            ScheduleOutcome::Triggered { next_run_at } => sqlx::query(
                r#"
                UPDATE cron_schedules
                SET last_run_at = $2, last_status = $3, next_run_at = $4,
                    run_count = run_count + 1, updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(schedule_id)
            .bind(ran_at)
            .bind(label)
            .bind(*next_run_at),
            ScheduleOutcome::Skipped { next_run_at, .. } => sqlx::query(
                r#"
                UPDATE cron_schedules
                SET last_status = $2, next_run_at = $3, updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(schedule_id)
            .bind(label)
            .bind(*next_run_at),
            ScheduleOutcome::Failed { .. } => sqlx::query(
                "UPDATE cron_schedules SET last_status = $2, updated_at = NOW() WHERE id = $1",
            )
            .bind(schedule_id)
            .bind(label),
        };
        query.execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl ExecutionStore for PgStore {
    async fn create_execution_if_idle(&self, new: NewExecution) -> StoreResult<Option<WorkflowExecution>> {
        let row = sqlx::query_as::<_, ExecutionRow>(
            r#"
            INSERT INTO workflow_executions (
                tenant_id, workflow, status, progress, current_step,
                logs, trigger_source, triggered_by, started_at
            )
            VALUES ($1, $2, 'PENDING', 0, $3, $4, $5, $6, $7)
            ON CONFLICT (tenant_id, workflow) WHERE status IN ('PENDING', 'RUNNING')
            DO NOTHING
            RETURNING *
            "#,
        )
        .bind(new.tenant_id)
        .bind(new.workflow.as_str())
        .bind(&new.current_step)
        .bind(Json(vec![&new.log]))
        .bind(new.trigger_source.as_str())
        .bind(&new.triggered_by)
        .bind(new.started_at)
        .fetch_optional(&self.pool)
        .await?;
        row.map(WorkflowExecution::try_from).transpose()
    }

    async fn get_execution(&self, id: Uuid) -> StoreResult<Option<WorkflowExecution>> {
        let row = sqlx::query_as::<_, ExecutionRow>("SELECT * FROM workflow_executions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(WorkflowExecution::try_from).transpose()
    }

    async fn update_execution(&self, id: Uuid, update: ExecutionUpdate) -> StoreResult<Option<WorkflowExecution>> {
        // Same rules as ExecutionUpdate::apply_to, in one statement
        let row = sqlx::query_as::<_, ExecutionRow>(
            r#"
            UPDATE workflow_executions
            SET progress = CASE
                    WHEN $2::INTEGER IS NULL THEN progress
                    ELSE GREATEST(progress, LEAST(GREATEST($2::INTEGER, 0), 100))
                END,
                current_step = COALESCE($3::TEXT, current_step),
                metrics = metrics || $4::JSONB,
                logs = CASE
                    WHEN $5::JSONB IS NULL THEN logs
                    ELSE logs || jsonb_build_array($5::JSONB)
                END,
                status = CASE
                    WHEN $6::TEXT IS NULL THEN status
                    WHEN status IN ('PENDING', 'RUNNING') OR $6::TEXT IN ('SUCCESS', 'ERROR') THEN $6::TEXT
                    ELSE status
                END,
                finished_at = CASE
                    WHEN $6::TEXT IN ('SUCCESS', 'ERROR') THEN NOW()
                    ELSE finished_at
                END,
                error_message = CASE
                    WHEN $7::TEXT IS NOT NULL THEN $7::TEXT
                    WHEN $6::TEXT = 'SUCCESS' THEN NULL
                    ELSE error_message
                END
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(update.progress)
        .bind(&update.current_step)
        .bind(Json(&update.metrics))
        .bind(update.log.as_ref().map(Json))
        .bind(update.status.map(ExecutionStatus::as_str))
        .bind(&update.error_message)
        .fetch_optional(&self.pool)
        .await?;
        row.map(WorkflowExecution::try_from).transpose()
    }

    async fn mark_running(&self, id: Uuid, current_step: &str) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE workflow_executions
            SET status = 'RUNNING', current_step = $2
            WHERE id = $1 AND status = 'PENDING'
            "#,
        )
        .bind(id)
        .bind(current_step)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reap_stale_executions(&self, cutoff: DateTime<Utc>, message: &str) -> StoreResult<Vec<Uuid>> {
        let log = LogEntry::new(LogLevel::Error, message);
        let ids = sqlx::query_scalar(
            r#"
            UPDATE workflow_executions
            SET status = 'ERROR',
                error_message = $2,
                finished_at = NOW(),
                progress = 100,
                logs = logs || jsonb_build_array($3::JSONB)
            WHERE status IN ('PENDING', 'RUNNING') AND started_at < $1
            RETURNING id
            "#,
        )
        .bind(cutoff)
        .bind(message)
        .bind(Json(&log))
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn cancel_execution(&self, tenant_id: Uuid, id: Uuid, log: LogEntry) -> StoreResult<Option<WorkflowExecution>> {
        let row = sqlx::query_as::<_, ExecutionRow>(
            r#"
            UPDATE workflow_executions
            SET status = 'ERROR',
                error_message = $3,
                finished_at = NOW(),
                progress = 100,
                logs = logs || jsonb_build_array($4::JSONB)
            WHERE id = $2 AND tenant_id = $1 AND status IN ('PENDING', 'RUNNING')
            RETURNING *
            "#,
        )
        .bind(tenant_id)
        .bind(id)
        .bind(&log.message)
        .bind(Json(&log))
        .fetch_optional(&self.pool)
        .await?;
        row.map(WorkflowExecution::try_from).transpose()
    }

    async fn list_executions(
        &self,
        tenant_id: Uuid,
        workflow: Option<WorkflowKind>,
        active: bool,
        limit: i64,
    ) -> StoreResult<Vec<WorkflowExecution>> {
        let rows = sqlx::query_as::<_, ExecutionRow>(
            r#"
            SELECT * FROM workflow_executions
            WHERE tenant_id = $1
              AND ($2::TEXT IS NULL OR workflow = $2::TEXT)
              AND (status IN ('PENDING', 'RUNNING')) = $3
            ORDER BY CASE WHEN $3 THEN started_at ELSE finished_at END DESC NULLS LAST
            LIMIT $4
            "#,
        )
        .bind(tenant_id)
        .bind(workflow.map(WorkflowKind::as_str))
        .bind(active)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        executions(rows)
    }
}

#[async_trait]
impl RunLogStore for PgStore {
    async fn record_run_log(&self, entry: RunLogEntry) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO workflow_run_log (tenant_id, workflow, status, metrics, received_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(entry.tenant_id)
        .bind(entry.workflow.as_str())
        .bind(&entry.status)
        .bind(Json(&entry.metrics))
        .bind(entry.received_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_llm_usage(&self, rows: Vec<NewLlmUsage>) -> StoreResult<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for row in &rows {
            sqlx::query(
                r#"
                INSERT INTO llm_usage (
                    tenant_id, workflow, model, tender_id, input_tokens, output_tokens,
                    total_tokens, cost_usd, latency_ms, metadata, created_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                "#,
            )
            .bind(row.tenant_id)
            .bind(&row.workflow)
            .bind(&row.model)
            .bind(row.tender_id)
            .bind(row.input_tokens)
            .bind(row.output_tokens)
            .bind(row.total_tokens)
            .bind(row.cost_usd)
            .bind(row.latency_ms)
            .bind(Json(&row.metadata))
            .bind(row.created_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn llm_usage_since(&self, tenant_id: Uuid, since: DateTime<Utc>) -> StoreResult<Vec<LlmUsageRecord>> {
        let records = sqlx::query_as::<_, LlmUsageRecord>(
            r#"
            SELECT workflow, model, total_tokens, cost_usd, created_at
            FROM llm_usage
            WHERE tenant_id = $1 AND created_at >= $2
            ORDER BY created_at
            "#,
        )
        .bind(tenant_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }
}

#[async_trait]
impl CatalogStore for PgStore {
    async fn list_tenders(&self, tenant_id: Uuid, query: &TenderQuery) -> StoreResult<(Vec<Tender>, i64)> {
        let search = query.search.as_ref().map(|s| format!("%{s}%"));

        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM tenders
            WHERE tenant_id = $1
              AND ($2::TEXT IS NULL OR status = $2)
              AND ($3::TEXT IS NULL OR state = $3)
              AND ($4::TEXT IS NULL OR title ILIKE $4 OR agency ILIKE $4)
            "#,
        )
        .bind(tenant_id)
        .bind(&query.status)
        .bind(&query.state)
        .bind(&search)
        .fetch_one(&self.pool)
        .await?;

        let tenders = sqlx::query_as::<_, Tender>(
            r#"
            SELECT * FROM tenders
            WHERE tenant_id = $1
              AND ($2::TEXT IS NULL OR status = $2)
              AND ($3::TEXT IS NULL OR state = $3)
              AND ($4::TEXT IS NULL OR title ILIKE $4 OR agency ILIKE $4)
            ORDER BY closes_at ASC NULLS LAST, id
            LIMIT $5 OFFSET $6
            "#,
        )
        .bind(tenant_id)
        .bind(&query.status)
        .bind(&query.state)
        .bind(&search)
        .bind(query.limit())
        .bind(query.offset())
        .fetch_all(&self.pool)
        .await?;

        Ok((tenders, total))
    }

    async fn get_tender(&self, tenant_id: Uuid, id: Uuid) -> StoreResult<Option<Tender>> {
        let tender = sqlx::query_as::<_, Tender>("SELECT * FROM tenders WHERE id = $1 AND tenant_id = $2")
            .bind(id)
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(tender)
    }

    async fn tender_stats(&self, tenant_id: Uuid) -> StoreResult<TenderStats> {
        let (total, analyzed, new, total_estimated_value): (i64, i64, i64, f64) = sqlx::query_as(
            r#"
            SELECT COUNT(*),
                   COUNT(*) FILTER (WHERE status = $2),
                   COUNT(*) FILTER (WHERE status = 'NEW'),
                   COALESCE(SUM(estimated_value), 0)::FLOAT8
            FROM tenders
            WHERE tenant_id = $1
            "#,
        )
        .bind(tenant_id)
        .bind(STATUS_ANALYZED)
        .fetch_one(&self.pool)
        .await?;

        let by_state = sqlx::query_as::<_, (String, i64)>(
            r#"
            SELECT state, COUNT(*) FROM tenders
            WHERE tenant_id = $1 AND state IS NOT NULL
            GROUP BY state
            ORDER BY COUNT(*) DESC, state
            LIMIT 10
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        let by_priority = sqlx::query_as::<_, (String, i64)>(
            r#"
            SELECT priority, COUNT(*) FROM tenders
            WHERE tenant_id = $1 AND priority IS NOT NULL
            GROUP BY priority
            ORDER BY priority
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(TenderStats {
            total,
            analyzed,
            new,
            total_estimated_value,
            by_state,
            by_priority,
        })
    }

    async fn advance_review_phases(&self, tenant_id: Uuid) -> StoreResult<u64> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE tenders
            SET status = $2, updated_at = NOW()
            WHERE tenant_id = $1
              AND status <> $2
              AND (priority IS NOT NULL OR opportunity_type IS NOT NULL)
            "#,
        )
        .bind(tenant_id)
        .bind(STATUS_ANALYZED)
        .execute(&mut *tx)
        .await?;

        let rejected = sqlx::query(
            r#"
            UPDATE tenders
            SET review_phase = $3, updated_at = NOW()
            WHERE tenant_id = $1 AND review_phase = $2 AND opportunity_type = $4
            "#,
        )
        .bind(tenant_id)
        .bind(PHASE_NEW)
        .bind(PHASE_REJECTED)
        .bind(OPPORTUNITY_REJECT)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let promoted = sqlx::query(
            r#"
            UPDATE tenders
            SET review_phase = $3, updated_at = NOW()
            WHERE tenant_id = $1
              AND review_phase = $2
              AND priority IN ('P1', 'P2')
              AND opportunity_type IS DISTINCT FROM $4
            "#,
        )
        .bind(tenant_id)
        .bind(PHASE_NEW)
        .bind(PHASE_PRE_SCREENING)
        .bind(OPPORTUNITY_REJECT)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;
        Ok(rejected + promoted)
    }
}

#[async_trait]
impl Store for PgStore {
    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
