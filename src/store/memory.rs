//! In-memory store.
//!
//! Used when no `DATABASE_URL` is configured and by the test suite. All state
//! sits behind one mutex, so every trait method is trivially atomic; the
//! check-and-act operations mirror what the Postgres store gets from
//! conditional updates and the partial unique index.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use super::{
    CatalogStore, ExecutionStore, KeyStore, LedgerStore, RunLogStore, ScheduleStore, Store,
    StoreResult, UsageStore,
};
use crate::models::api_key::{ApiKey, NewApiKey};
use crate::models::attributes::Attributes;
use crate::models::credit::CreditAccount;
use crate::models::execution::{
    ExecutionStatus, ExecutionUpdate, LogEntry, LogLevel, NewExecution, WorkflowExecution,
    WorkflowKind,
};
use crate::models::llm_usage::{LlmUsageRecord, NewLlmUsage, RunLogEntry};
use crate::models::schedule::{CronSchedule, ScheduleDefinition, ScheduleOutcome};
use crate::models::tender::{STATUS_ANALYZED, Tender, TenderQuery, TenderStats};
use crate::models::usage::{NewUsageRecord, UsageRecord, UsageTotals};

#[derive(Default)]
struct State {
    keys: HashMap<Uuid, ApiKey>,
    /// key_hash -> key id
    key_index: HashMap<String, Uuid>,
    accounts: HashMap<Uuid, CreditAccount>,
    pricing: HashMap<String, i64>,
    usage: Vec<UsageRecord>,
    schedules: HashMap<Uuid, CronSchedule>,
    executions: HashMap<Uuid, WorkflowExecution>,
    tenders: HashMap<Uuid, Tender>,
    run_log: Vec<RunLogEntry>,
    llm_usage: Vec<NewLlmUsage>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a tender. The tender tables are owned by the dashboard, so there is
    /// no write path for them in the service itself.
    pub fn insert_tender(&self, tender: Tender) {
        self.state.lock().tenders.insert(tender.id, tender);
    }

    /// Completion callbacks received for the tenant, oldest first.
    pub fn run_log(&self, tenant_id: Uuid) -> Vec<RunLogEntry> {
        let state = self.state.lock();
        state.run_log.iter().filter(|e| e.tenant_id == tenant_id).cloned().collect()
    }

    /// Allow or forbid the tenant's account from going negative.
    pub fn set_overdraft(&self, tenant_id: Uuid, allow: bool) {
        if let Some(account) = self.state.lock().accounts.get_mut(&tenant_id) {
            account.allow_overdraft = allow;
        }
    }
}

fn new_account(tenant_id: Uuid, free_grant: i64, now: DateTime<Utc>) -> CreditAccount {
    CreditAccount {
        tenant_id,
        balance: 0,
        free_granted: free_grant,
        total_consumed: 0,
        total_purchased: 0,
        allow_overdraft: false,
        created_at: now,
        updated_at: now,
    }
}

#[async_trait]
impl KeyStore for MemoryStore {
    async fn insert_api_key(&self, key: NewApiKey, max_live: i64) -> StoreResult<Option<ApiKey>> {
        let now = Utc::now();
        let mut state = self.state.lock();

        let live = state
            .keys
            .values()
            .filter(|k| k.tenant_id == key.tenant_id && k.is_live(now))
            .count() as i64;
        if live >= max_live {
            return Ok(None);
        }

        let record = ApiKey {
            id: Uuid::new_v4(),
            tenant_id: key.tenant_id,
            name: key.name,
            key_hash: key.key_hash,
            key_prefix: key.key_prefix,
            permissions: key.permissions,
            rate_limit_per_minute: key.rate_limit_per_minute,
            rate_limit_per_day: key.rate_limit_per_day,
            is_active: true,
            expires_at: key.expires_at,
            last_used_at: None,
            created_at: now,
        };
        state.key_index.insert(record.key_hash.clone(), record.id);
        state.keys.insert(record.id, record.clone());
        Ok(Some(record))
    }

    async fn find_api_key_by_hash(&self, key_hash: &str) -> StoreResult<Option<ApiKey>> {
        let state = self.state.lock();
        Ok(state
            .key_index
            .get(key_hash)
            .and_then(|id| state.keys.get(id))
            .cloned())
    }

    async fn list_api_keys(&self, tenant_id: Uuid) -> StoreResult<Vec<ApiKey>> {
        let state = self.state.lock();
        let mut keys: Vec<ApiKey> = state
            .keys
            .values()
            .filter(|k| k.tenant_id == tenant_id)
            .cloned()
            .collect();
        keys.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(keys)
    }

    async fn deactivate_api_key(&self, tenant_id: Uuid, key_id: Uuid) -> StoreResult<bool> {
        let mut state = self.state.lock();
        match state.keys.get_mut(&key_id) {
            Some(key) if key.tenant_id == tenant_id => {
                key.is_active = false;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_api_key(&self, tenant_id: Uuid, key_id: Uuid) -> StoreResult<bool> {
        let mut state = self.state.lock();
        if state.keys.get(&key_id).is_some_and(|k| k.tenant_id == tenant_id) {
            if let Some(key) = state.keys.remove(&key_id) {
                state.key_index.remove(&key.key_hash);
            }
            return Ok(true);
        }
        Ok(false)
    }

    async fn touch_api_key(&self, key_id: Uuid, at: DateTime<Utc>) -> StoreResult<()> {
        if let Some(key) = self.state.lock().keys.get_mut(&key_id) {
            key.last_used_at = Some(at);
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn ensure_credit_account(&self, tenant_id: Uuid, free_grant: i64) -> StoreResult<()> {
        let now = Utc::now();
        self.state
            .lock()
            .accounts
            .entry(tenant_id)
            .or_insert_with(|| new_account(tenant_id, free_grant, now));
        Ok(())
    }

    async fn credit_account(&self, tenant_id: Uuid) -> StoreResult<Option<CreditAccount>> {
        Ok(self.state.lock().accounts.get(&tenant_id).cloned())
    }

    async fn debit_credits(&self, tenant_id: Uuid, amount: i64) -> StoreResult<bool> {
        let mut state = self.state.lock();
        match state.accounts.get_mut(&tenant_id) {
            Some(account) if account.can_afford(amount) => {
                account.total_consumed += amount;
                account.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn refund_credits(&self, tenant_id: Uuid, amount: i64) -> StoreResult<()> {
        if let Some(account) = self.state.lock().accounts.get_mut(&tenant_id) {
            account.free_granted += amount;
            account.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn top_up_credits(&self, tenant_id: Uuid, amount: i64) -> StoreResult<CreditAccount> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let account = state
            .accounts
            .entry(tenant_id)
            .or_insert_with(|| new_account(tenant_id, 0, now));
        account.balance += amount;
        account.total_purchased += amount;
        account.updated_at = now;
        Ok(account.clone())
    }

    async fn endpoint_price(&self, endpoint: &str) -> StoreResult<Option<i64>> {
        Ok(self.state.lock().pricing.get(endpoint).copied())
    }

    async fn set_endpoint_price(&self, endpoint: &str, credits_per_call: i64) -> StoreResult<()> {
        self.state
            .lock()
            .pricing
            .insert(endpoint.to_string(), credits_per_call);
        Ok(())
    }
}

#[async_trait]
impl UsageStore for MemoryStore {
    async fn record_usage(&self, record: NewUsageRecord) -> StoreResult<()> {
        self.state.lock().usage.push(UsageRecord {
            id: Uuid::new_v4(),
            api_key_id: record.api_key_id,
            tenant_id: record.tenant_id,
            endpoint: record.endpoint,
            method: record.method,
            status_code: record.status_code,
            response_time_ms: record.response_time_ms,
            credits_charged: record.credits_charged,
            ip_address: record.ip_address,
            user_agent: record.user_agent,
            created_at: record.created_at,
        });
        Ok(())
    }

    async fn count_usage_since(&self, api_key_id: Uuid, since: DateTime<Utc>) -> StoreResult<i64> {
        let state = self.state.lock();
        Ok(state
            .usage
            .iter()
            .filter(|r| r.api_key_id == api_key_id && r.created_at > since)
            .count() as i64)
    }

    async fn usage_totals_since(&self, tenant_id: Uuid, since: DateTime<Utc>) -> StoreResult<UsageTotals> {
        let state = self.state.lock();
        Ok(state
            .usage
            .iter()
            .filter(|r| r.tenant_id == tenant_id && r.created_at > since)
            .fold(UsageTotals::default(), |acc, r| UsageTotals {
                calls: acc.calls + 1,
                credits_spent: acc.credits_spent + r.credits_charged,
            }))
    }

    async fn recent_usage(&self, tenant_id: Uuid, limit: i64) -> StoreResult<Vec<UsageRecord>> {
        let state = self.state.lock();
        let mut records: Vec<UsageRecord> = state
            .usage
            .iter()
            .filter(|r| r.tenant_id == tenant_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records.truncate(limit.max(0) as usize);
        Ok(records)
    }
}

#[async_trait]
impl ScheduleStore for MemoryStore {
    async fn upsert_schedule(
        &self,
        tenant_id: Uuid,
        definition: ScheduleDefinition,
        next_run_at: Option<DateTime<Utc>>,
    ) -> StoreResult<CronSchedule> {
        let now = Utc::now();
        let mut state = self.state.lock();

        let existing = state
            .schedules
            .values_mut()
            .find(|s| s.tenant_id == tenant_id && s.definition.workflow == definition.workflow);

        if let Some(schedule) = existing {
            schedule.definition = definition;
            schedule.next_run_at = next_run_at;
            schedule.updated_at = now;
            return Ok(schedule.clone());
        }

        let schedule = CronSchedule {
            id: Uuid::new_v4(),
            tenant_id,
            definition,
            last_run_at: None,
            last_status: None,
            next_run_at,
            run_count: 0,
            created_at: now,
            updated_at: now,
        };
        state.schedules.insert(schedule.id, schedule.clone());
        Ok(schedule)
    }

    async fn list_schedules(&self, tenant_id: Uuid) -> StoreResult<Vec<CronSchedule>> {
        let state = self.state.lock();
        let mut schedules: Vec<CronSchedule> = state
            .schedules
            .values()
            .filter(|s| s.tenant_id == tenant_id)
            .cloned()
            .collect();
        schedules.sort_by_key(|s| s.definition.workflow.as_str());
        Ok(schedules)
    }

    async fn delete_schedule(&self, tenant_id: Uuid, workflow: WorkflowKind) -> StoreResult<bool> {
        let mut state = self.state.lock();
        let before = state.schedules.len();
        state
            .schedules
            .retain(|_, s| !(s.tenant_id == tenant_id && s.definition.workflow == workflow));
        Ok(state.schedules.len() != before)
    }

    async fn enabled_schedules(&self) -> StoreResult<Vec<CronSchedule>> {
        let state = self.state.lock();
        Ok(state
            .schedules
            .values()
            .filter(|s| s.definition.enabled)
            .cloned()
            .collect())
    }

    async fn record_schedule_outcome(
        &self,
        schedule_id: Uuid,
        ran_at: DateTime<Utc>,
        outcome: &ScheduleOutcome,
    ) -> StoreResult<()> {
        let mut state = self.state.lock();
        let Some(schedule) = state.schedules.get_mut(&schedule_id) else {
            return Ok(());
        };
        schedule.last_status = Some(outcome.status_label());
        schedule.updated_at = Utc::now();
        match outcome {
            ScheduleOutcome::Triggered { next_run_at } => {
                schedule.last_run_at = Some(ran_at);
                schedule.next_run_at = Some(*next_run_at);
                schedule.run_count += 1;
            }
            ScheduleOutcome::Skipped { next_run_at, .. } => {
                schedule.next_run_at = Some(*next_run_at);
            }
            ScheduleOutcome::Failed { .. } => {}
        }
        Ok(())
    }
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn create_execution_if_idle(&self, new: NewExecution) -> StoreResult<Option<WorkflowExecution>> {
        let mut state = self.state.lock();

        let in_flight = state.executions.values().any(|e| {
            e.tenant_id == new.tenant_id && e.workflow == new.workflow && !e.status.is_terminal()
        });
        if in_flight {
            return Ok(None);
        }

        let execution = WorkflowExecution {
            id: Uuid::new_v4(),
            tenant_id: new.tenant_id,
            workflow: new.workflow,
            status: ExecutionStatus::Pending,
            progress: 0,
            current_step: Some(new.current_step),
            metrics: Attributes::new(),
            logs: vec![new.log],
            trigger_source: new.trigger_source,
            triggered_by: new.triggered_by,
            started_at: new.started_at,
            finished_at: None,
            error_message: None,
        };
        state.executions.insert(execution.id, execution.clone());
        Ok(Some(execution))
    }

    async fn get_execution(&self, id: Uuid) -> StoreResult<Option<WorkflowExecution>> {
        Ok(self.state.lock().executions.get(&id).cloned())
    }

    async fn update_execution(&self, id: Uuid, update: ExecutionUpdate) -> StoreResult<Option<WorkflowExecution>> {
        let mut state = self.state.lock();
        Ok(state.executions.get_mut(&id).map(|execution| {
            update.apply_to(execution, Utc::now());
            execution.clone()
        }))
    }

    async fn mark_running(&self, id: Uuid, current_step: &str) -> StoreResult<()> {
        let mut state = self.state.lock();
        if let Some(execution) = state.executions.get_mut(&id) {
            if execution.status == ExecutionStatus::Pending {
                execution.status = ExecutionStatus::Running;
                execution.current_step = Some(current_step.to_string());
            }
        }
        Ok(())
    }

    async fn reap_stale_executions(&self, cutoff: DateTime<Utc>, message: &str) -> StoreResult<Vec<Uuid>> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let mut reaped = Vec::new();
        for execution in state.executions.values_mut() {
            if !execution.status.is_terminal() && execution.started_at < cutoff {
                execution.status = ExecutionStatus::Error;
                execution.error_message = Some(message.to_string());
                execution.finished_at = Some(now);
                execution.progress = 100;
                execution.logs.push(LogEntry::new(LogLevel::Error, message));
                reaped.push(execution.id);
            }
        }
        Ok(reaped)
    }

    async fn cancel_execution(&self, tenant_id: Uuid, id: Uuid, log: LogEntry) -> StoreResult<Option<WorkflowExecution>> {
        let mut state = self.state.lock();
        match state.executions.get_mut(&id) {
            Some(execution) if execution.tenant_id == tenant_id && !execution.status.is_terminal() => {
                execution.status = ExecutionStatus::Error;
                execution.error_message = Some(log.message.clone());
                execution.finished_at = Some(Utc::now());
                execution.progress = 100;
                execution.logs.push(log);
                Ok(Some(execution.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn list_executions(
        &self,
        tenant_id: Uuid,
        workflow: Option<WorkflowKind>,
        active: bool,
        limit: i64,
    ) -> StoreResult<Vec<WorkflowExecution>> {
        let state = self.state.lock();
        let mut executions: Vec<WorkflowExecution> = state
            .executions
            .values()
            .filter(|e| e.tenant_id == tenant_id)
            .filter(|e| workflow.is_none_or(|w| e.workflow == w))
            .filter(|e| e.status.is_terminal() != active)
            .cloned()
            .collect();
        if active {
            executions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        } else {
            executions.sort_by(|a, b| b.finished_at.cmp(&a.finished_at));
        }
        executions.truncate(limit.max(0) as usize);
        Ok(executions)
    }
}

#[async_trait]
impl RunLogStore for MemoryStore {
    async fn record_run_log(&self, entry: RunLogEntry) -> StoreResult<()> {
        self.state.lock().run_log.push(entry);
        Ok(())
    }

    async fn record_llm_usage(&self, rows: Vec<NewLlmUsage>) -> StoreResult<()> {
        self.state.lock().llm_usage.extend(rows);
        Ok(())
    }

    async fn llm_usage_since(&self, tenant_id: Uuid, since: DateTime<Utc>) -> StoreResult<Vec<LlmUsageRecord>> {
        let state = self.state.lock();
        Ok(state
            .llm_usage
            .iter()
            .filter(|r| r.tenant_id == tenant_id && r.created_at >= since)
            .map(|r| LlmUsageRecord {
                workflow: r.workflow.clone(),
                model: r.model.clone(),
                total_tokens: r.total_tokens,
                cost_usd: r.cost_usd,
                created_at: r.created_at,
            })
            .collect())
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn list_tenders(&self, tenant_id: Uuid, query: &TenderQuery) -> StoreResult<(Vec<Tender>, i64)> {
        let state = self.state.lock();
        let mut matching: Vec<Tender> = state
            .tenders
            .values()
            .filter(|t| t.tenant_id == tenant_id && query.matches(t))
            .cloned()
            .collect();
        matching.sort_by_key(|t| (t.closes_at.is_none(), t.closes_at, t.id));

        let total = matching.len() as i64;
        let page = matching
            .into_iter()
            .skip(query.offset() as usize)
            .take(query.limit() as usize)
            .collect();
        Ok((page, total))
    }

    async fn get_tender(&self, tenant_id: Uuid, id: Uuid) -> StoreResult<Option<Tender>> {
        let state = self.state.lock();
        Ok(state.tenders.get(&id).filter(|t| t.tenant_id == tenant_id).cloned())
    }

    async fn tender_stats(&self, tenant_id: Uuid) -> StoreResult<TenderStats> {
        let state = self.state.lock();
        let mut stats = TenderStats::default();
        let mut by_state: HashMap<String, i64> = HashMap::new();
        let mut by_priority: HashMap<String, i64> = HashMap::new();

        for tender in state.tenders.values().filter(|t| t.tenant_id == tenant_id) {
            stats.total += 1;
            if tender.status == STATUS_ANALYZED {
                stats.analyzed += 1;
            }
            if tender.status == "NEW" {
                stats.new += 1;
            }
            stats.total_estimated_value += tender.estimated_value.unwrap_or(0.0);
            if let Some(uf) = &tender.state {
                *by_state.entry(uf.clone()).or_default() += 1;
            }
            if let Some(priority) = &tender.priority {
                *by_priority.entry(priority.clone()).or_default() += 1;
            }
        }

        stats.by_state = by_state.into_iter().collect();
        stats.by_state.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        stats.by_state.truncate(10);
        stats.by_priority = by_priority.into_iter().collect();
        stats.by_priority.sort();
        Ok(stats)
    }

    async fn advance_review_phases(&self, tenant_id: Uuid) -> StoreResult<u64> {
        let mut state = self.state.lock();
        let mut moved = 0;
        for tender in state.tenders.values_mut().filter(|t| t.tenant_id == tenant_id) {
            if tender.is_analyzed() && tender.status != STATUS_ANALYZED {
                tender.status = STATUS_ANALYZED.to_string();
            }
            if let Some(phase) = tender.next_review_phase() {
                tender.review_phase = phase.to_string();
                moved += 1;
            }
        }
        Ok(moved)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}
