//! Execution tracker: engine callbacks, the timeout reaper, cancel and status.
//!
//! Every write to an execution is a single store update, so callbacks racing
//! each other or the reaper cannot interleave half-applied changes. Terminal
//! executions are never revived; a late callback may only replace one terminal
//! status with another.

use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::attributes::Attributes;
use crate::models::execution::{
    CallbackAck, CompletionCallback, ExecutionStatus, ExecutionStatusResponse, ExecutionUpdate,
    LogEntry, LogLevel, ProgressCallback, WorkflowExecution, WorkflowKind,
};
use crate::models::llm_usage::{LlmUsageReport, NewLlmUsage, RunLogEntry};
use crate::state::AppState;

/// Active and recent executions returned by a status query, each.
const STATUS_LIMIT: i64 = 5;

pub fn timeout_message(minutes: i64) -> String {
    format!("Timeout: execution exceeded {minutes} minutes")
}

/// Validate a progress callback into an update.
///
/// # Errors
///
/// `InvalidRequest` when the callback tries to move an execution back to `PENDING`.
pub fn progress_update(callback: ProgressCallback) -> Result<ExecutionUpdate, AppError> {
    if callback.status == Some(ExecutionStatus::Pending) {
        return Err(AppError::InvalidRequest("status PENDING cannot be reported".to_string()));
    }

    let log = callback.log_message.map(|message| {
        LogEntry::new(callback.log_level.unwrap_or_default(), message)
    });

    Ok(ExecutionUpdate {
        progress: callback
            .progress
            .map(|p| p.clamp(0, 100) as i32),
        current_step: callback.current_step,
        metrics: callback.metrics.unwrap_or_default(),
        log,
        status: callback.status,
        error_message: None,
    })
}

/// Apply a progress callback.
///
/// `applied` is false for unknown executions and for callbacks that carry
/// nothing to change; those never reach the store.
pub async fn apply_progress(state: &AppState, callback: ProgressCallback) -> Result<CallbackAck, AppError> {
    let execution_id = callback.execution_id;
    let update = progress_update(callback)?;
    if update.is_empty() {
        tracing::debug!(execution_id = %execution_id, "empty progress callback ignored");
        return Ok(CallbackAck { received: true, applied: false });
    }

    let updated = state.store.update_execution(execution_id, update).await?;
    if updated.is_none() {
        tracing::warn!(execution_id = %execution_id, "progress for unknown execution");
    }

    Ok(CallbackAck {
        received: true,
        applied: updated.is_some(),
    })
}

/// Find the execution a completion callback refers to.
///
/// Callbacks without an execution id fall back to the tenant's in-flight
/// execution of that workflow.
async fn completion_target(
    state: &AppState,
    callback: &CompletionCallback,
) -> Result<Option<WorkflowExecution>, AppError> {
    match callback.execution_id {
        Some(id) => Ok(state
            .store
            .get_execution(id)
            .await?
            .filter(|e| e.tenant_id == callback.tenant_id && e.workflow == callback.workflow)),
        None => Ok(state
            .store
            .list_executions(callback.tenant_id, Some(callback.workflow), true, 1)
            .await?
            .into_iter()
            .next()),
    }
}

/// Apply a completion callback.
///
/// Every delivery is appended to the run log as received. A retried delivery
/// of the terminal status the execution already has is acknowledged without
/// changing anything else, so its LLM usage is not counted twice.
pub async fn complete(state: &AppState, mut callback: CompletionCallback) -> Result<CallbackAck, AppError> {
    let now = Utc::now();
    state
        .store
        .record_run_log(RunLogEntry {
            tenant_id: callback.tenant_id,
            workflow: callback.workflow,
            status: callback.status.clone(),
            metrics: callback.metrics.clone().unwrap_or_default(),
            received_at: now,
        })
        .await?;
    let llm_usage = std::mem::take(&mut callback.llm_usage);

    let Some(execution) = completion_target(state, &callback).await? else {
        tracing::warn!(
            tenant_id = %callback.tenant_id,
            workflow = %callback.workflow,
            execution_id = ?callback.execution_id,
            "completion for unknown execution"
        );
        record_llm_usage(state, &callback, llm_usage, now).await?;
        return Ok(CallbackAck { received: true, applied: false });
    };

    let succeeded = callback.succeeded();
    let status = if succeeded { ExecutionStatus::Success } else { ExecutionStatus::Error };

    if execution.status == status {
        tracing::debug!(execution_id = %execution.id, "duplicate completion ignored");
        return Ok(CallbackAck { received: true, applied: false });
    }

    let (step, log, error_message) = if succeeded {
        ("Completed".to_string(), LogEntry::new(LogLevel::Info, format!("{} finished", callback.workflow)), None)
    } else {
        let message = format!("Engine reported {}", callback.status);
        ("Failed".to_string(), LogEntry::new(LogLevel::Error, message.clone()), Some(message))
    };

    let update = ExecutionUpdate {
        progress: Some(100),
        current_step: Some(step),
        metrics: callback.metrics.clone().unwrap_or_else(Attributes::new),
        log: Some(log),
        status: Some(status),
        error_message,
    };
    state.store.update_execution(execution.id, update).await?;
    record_llm_usage(state, &callback, llm_usage, now).await?;

    tracing::info!(
        tenant_id = %callback.tenant_id,
        execution_id = %execution.id,
        workflow = %callback.workflow,
        status = status.as_str(),
        "execution completed"
    );

    if succeeded && callback.workflow == WorkflowKind::Analysis {
        let moved = state.store.advance_review_phases(callback.tenant_id).await?;
        tracing::info!(tenant_id = %callback.tenant_id, moved, "review phases advanced");
    }

    Ok(CallbackAck { received: true, applied: true })
}

async fn record_llm_usage(
    state: &AppState,
    callback: &CompletionCallback,
    reports: Vec<LlmUsageReport>,
    now: DateTime<Utc>,
) -> Result<(), AppError> {
    if reports.is_empty() {
        return Ok(());
    }

    let rows: Vec<NewLlmUsage> = reports
        .into_iter()
        .map(|report| NewLlmUsage::from_report(callback.tenant_id, callback.workflow, report, now))
        .collect();
    let calls = rows.len();
    let cost_usd: f64 = rows.iter().map(|r| r.cost_usd).sum();
    state.store.record_llm_usage(rows).await?;

    tracing::info!(tenant_id = %callback.tenant_id, calls, cost_usd, "llm usage recorded");
    Ok(())
}

/// Force every execution older than the configured timeout to `ERROR`.
pub async fn reap(state: &AppState, now: DateTime<Utc>) -> Result<Vec<Uuid>, AppError> {
    let minutes = state.config.execution_timeout_minutes;
    let cutoff = now - Duration::minutes(minutes);

    let reaped = state
        .store
        .reap_stale_executions(cutoff, &timeout_message(minutes))
        .await?;

    if !reaped.is_empty() {
        tracing::warn!(count = reaped.len(), ids = ?reaped, "reaped stale executions");
    }
    Ok(reaped)
}

/// Active and recent executions of the tenant. Reaps first so nothing stale
/// is reported as running.
pub async fn status(
    state: &AppState,
    tenant_id: Uuid,
    workflow: Option<WorkflowKind>,
) -> Result<ExecutionStatusResponse, AppError> {
    reap(state, Utc::now()).await?;

    let active = state
        .store
        .list_executions(tenant_id, workflow, true, STATUS_LIMIT)
        .await?;
    let recent = state
        .store
        .list_executions(tenant_id, workflow, false, STATUS_LIMIT)
        .await?;

    Ok(ExecutionStatusResponse {
        has_running: !active.is_empty(),
        active,
        recent,
    })
}

/// Force a non-terminal execution of the tenant to `ERROR`.
pub async fn cancel(
    state: &AppState,
    tenant_id: Uuid,
    execution_id: Uuid,
    cancelled_by: &str,
) -> Result<WorkflowExecution, AppError> {
    let log = LogEntry::new(LogLevel::Warn, format!("Cancelled by {cancelled_by}"));
    let execution = state
        .store
        .cancel_execution(tenant_id, execution_id, log)
        .await?
        .ok_or(AppError::NotFound("Running execution"))?;

    tracing::info!(tenant_id = %tenant_id, execution_id = %execution_id, "execution cancelled");
    Ok(execution)
}

/// Reap on a fixed interval until `shutdown` changes.
pub async fn run_reaper(state: AppState, interval: StdDuration, mut shutdown: watch::Receiver<bool>) {
    tracing::info!(interval_secs = interval.as_secs(), "reaper started");

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                if let Err(e) = reap(&state, Utc::now()).await {
                    tracing::error!(error = %e, "reaper sweep failed");
                }
            }
            _ = shutdown.changed() => {
                tracing::info!("reaper shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::attributes::Scalar;
    use crate::models::execution::{NewExecution, TriggerSource};
    use crate::models::tender::{PHASE_PRE_SCREENING, PHASE_REJECTED, OPPORTUNITY_REJECT, Tender};
    use crate::store::{ExecutionStore, RunLogStore};
    use crate::test_support::{Harness, harness};

    async fn start(h: &Harness, tenant_id: Uuid, workflow: WorkflowKind, age_minutes: i64) -> WorkflowExecution {
        let execution = h
            .store
            .create_execution_if_idle(NewExecution {
                tenant_id,
                workflow,
                current_step: workflow.queued_step().into(),
                trigger_source: TriggerSource::Cron,
                triggered_by: None,
                log: LogEntry::new(LogLevel::Info, "started"),
                started_at: Utc::now() - Duration::minutes(age_minutes),
            })
            .await
            .unwrap()
            .unwrap();
        h.store.mark_running(execution.id, workflow.running_step()).await.unwrap();
        execution
    }

    fn progress(execution_id: Uuid, value: i64) -> ProgressCallback {
        ProgressCallback {
            execution_id,
            progress: Some(value),
            current_step: None,
            metrics: None,
            log_message: None,
            log_level: None,
            status: None,
        }
    }

    fn completion(execution: &WorkflowExecution, status: &str) -> CompletionCallback {
        CompletionCallback {
            workflow: execution.workflow,
            tenant_id: execution.tenant_id,
            status: status.into(),
            metrics: None,
            execution_id: Some(execution.id),
            llm_usage: Vec::new(),
        }
    }

    #[tokio::test]
    async fn reaper_only_touches_stale_executions() {
        let h = harness();
        let stale = start(&h, Uuid::new_v4(), WorkflowKind::Ingestion, 31).await;
        let fresh = start(&h, Uuid::new_v4(), WorkflowKind::Ingestion, 29).await;

        let reaped = reap(&h.state, Utc::now()).await.unwrap();
        assert_eq!(reaped, vec![stale.id]);

        let stale = h.store.get_execution(stale.id).await.unwrap().unwrap();
        assert_eq!(stale.status, ExecutionStatus::Error);
        assert_eq!(stale.error_message.as_deref(), Some("Timeout: execution exceeded 30 minutes"));
        assert_eq!(stale.progress, 100);
        assert!(stale.finished_at.is_some());

        let fresh = h.store.get_execution(fresh.id).await.unwrap().unwrap();
        assert_eq!(fresh.status, ExecutionStatus::Running);

        assert!(reap(&h.state, Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn progress_is_monotonic_and_unknown_ids_are_acknowledged() {
        let h = harness();
        let execution = start(&h, Uuid::new_v4(), WorkflowKind::Ingestion, 0).await;

        apply_progress(&h.state, progress(execution.id, 60)).await.unwrap();
        apply_progress(&h.state, progress(execution.id, 30)).await.unwrap();
        let ack = apply_progress(&h.state, progress(execution.id, 400)).await.unwrap();
        assert!(ack.applied);
        assert_eq!(h.store.get_execution(execution.id).await.unwrap().unwrap().progress, 100);

        let ack = apply_progress(&h.state, progress(Uuid::new_v4(), 10)).await.unwrap();
        assert!(ack.received);
        assert!(!ack.applied);
    }

    #[tokio::test]
    async fn progress_cannot_report_pending() {
        let mut callback = progress(Uuid::new_v4(), 10);
        callback.status = Some(ExecutionStatus::Pending);
        assert!(matches!(progress_update(callback), Err(AppError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn progress_log_and_metrics() {
        let h = harness();
        let execution = start(&h, Uuid::new_v4(), WorkflowKind::Ingestion, 0).await;

        let mut metrics = Attributes::new();
        metrics.insert("found".into(), Scalar::Int(12));
        let callback = ProgressCallback {
            metrics: Some(metrics),
            log_message: Some("page 1 done".into()),
            log_level: Some(LogLevel::Warn),
            current_step: Some("Fetching page 2".into()),
            ..progress(execution.id, 10)
        };
        apply_progress(&h.state, callback).await.unwrap();

        let stored = h.store.get_execution(execution.id).await.unwrap().unwrap();
        assert_eq!(stored.metrics["found"], Scalar::Int(12));
        assert_eq!(stored.current_step.as_deref(), Some("Fetching page 2"));
        let last = stored.logs.last().unwrap();
        assert_eq!((last.level, last.message.as_str()), (LogLevel::Warn, "page 1 done"));
    }

    #[tokio::test]
    async fn completion_is_idempotent() {
        let h = harness();
        let execution = start(&h, Uuid::new_v4(), WorkflowKind::Ingestion, 0).await;

        let ack = complete(&h.state, completion(&execution, "OK")).await.unwrap();
        assert!(ack.applied);
        let done = h.store.get_execution(execution.id).await.unwrap().unwrap();
        assert_eq!(done.status, ExecutionStatus::Success);
        assert_eq!(done.progress, 100);
        let logs = done.logs.len();

        let ack = complete(&h.state, completion(&execution, "SUCCESS")).await.unwrap();
        assert!(!ack.applied);
        assert_eq!(h.store.get_execution(execution.id).await.unwrap().unwrap().logs.len(), logs);
    }

    #[tokio::test]
    async fn late_progress_does_not_revive_reaped_execution() {
        let h = harness();
        let execution = start(&h, Uuid::new_v4(), WorkflowKind::Ingestion, 45).await;
        reap(&h.state, Utc::now()).await.unwrap();

        let mut callback = progress(execution.id, 50);
        callback.status = Some(ExecutionStatus::Running);
        apply_progress(&h.state, callback).await.unwrap();
        assert_eq!(
            h.store.get_execution(execution.id).await.unwrap().unwrap().status,
            ExecutionStatus::Error
        );

        // A late success report still lands and drops the timeout message
        complete(&h.state, completion(&execution, "OK")).await.unwrap();
        let done = h.store.get_execution(execution.id).await.unwrap().unwrap();
        assert_eq!(done.status, ExecutionStatus::Success);
        assert_eq!(done.error_message, None);
    }

    #[tokio::test]
    async fn empty_progress_is_not_written() {
        let h = harness();
        let execution = start(&h, Uuid::new_v4(), WorkflowKind::Ingestion, 0).await;
        let before = h.store.get_execution(execution.id).await.unwrap().unwrap();

        let empty = ProgressCallback { progress: None, ..progress(execution.id, 0) };
        let ack = apply_progress(&h.state, empty).await.unwrap();
        assert!(ack.received);
        assert!(!ack.applied);

        let after = h.store.get_execution(execution.id).await.unwrap().unwrap();
        assert_eq!(after.logs.len(), before.logs.len());
        assert_eq!(after.progress, before.progress);
    }

    #[tokio::test]
    async fn completion_logs_every_delivery_and_counts_llm_usage_once() {
        let h = harness();
        let tenant = Uuid::new_v4();
        let execution = start(&h, tenant, WorkflowKind::Analysis, 0).await;

        let report = |model: &str, input, output| LlmUsageReport {
            model: Some(model.into()),
            input_tokens: Some(input),
            output_tokens: Some(output),
            ..Default::default()
        };
        let delivery = || CompletionCallback {
            llm_usage: vec![report("gpt-4.1-mini", 1000, 500), report("text-embedding-3-small", 4000, 0)],
            ..completion(&execution, "OK")
        };

        assert!(complete(&h.state, delivery()).await.unwrap().applied);
        assert!(!complete(&h.state, delivery()).await.unwrap().applied);

        let run_log = h.store.run_log(tenant);
        assert_eq!(run_log.len(), 2);
        assert!(run_log.iter().all(|e| e.status == "OK" && e.workflow == WorkflowKind::Analysis));

        let usage = h.state.store.llm_usage_since(tenant, Utc::now() - Duration::hours(1)).await.unwrap();
        assert_eq!(usage.len(), 2);
        assert!(usage.iter().all(|u| u.workflow == "ANALYSIS"));
        let tokens: i64 = usage.iter().map(|u| u.total_tokens).sum();
        assert_eq!(tokens, 5500);
    }

    #[tokio::test]
    async fn completion_for_unknown_execution_still_records_usage() {
        let h = harness();
        let tenant = Uuid::new_v4();
        let callback = CompletionCallback {
            workflow: WorkflowKind::Ingestion,
            tenant_id: tenant,
            status: "OK".into(),
            metrics: None,
            execution_id: Some(Uuid::new_v4()),
            llm_usage: vec![LlmUsageReport { model: Some("gpt-4.1".into()), ..Default::default() }],
        };

        assert!(!complete(&h.state, callback).await.unwrap().applied);
        assert_eq!(h.store.run_log(tenant).len(), 1);
        let usage = h.state.store.llm_usage_since(tenant, Utc::now() - Duration::hours(1)).await.unwrap();
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].model, "gpt-4.1");
    }

    #[tokio::test]
    async fn completion_without_id_targets_in_flight_execution() {
        let h = harness();
        let tenant = Uuid::new_v4();
        let execution = start(&h, tenant, WorkflowKind::Ingestion, 0).await;

        let callback = CompletionCallback {
            workflow: WorkflowKind::Ingestion,
            tenant_id: tenant,
            status: "failed: portal down".into(),
            metrics: None,
            execution_id: None,
            llm_usage: Vec::new(),
        };
        assert!(complete(&h.state, callback).await.unwrap().applied);

        let stored = h.store.get_execution(execution.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Error);
        assert_eq!(stored.error_message.as_deref(), Some("Engine reported failed: portal down"));
    }

    #[tokio::test]
    async fn analysis_success_advances_review_phases() {
        let h = harness();
        let tenant = Uuid::new_v4();
        let tender = |priority: Option<&str>, kind: Option<&str>| Tender {
            id: Uuid::new_v4(),
            tenant_id: tenant,
            title: "Street lighting".into(),
            agency: "City of Santos".into(),
            state: Some("SP".into()),
            estimated_value: Some(250_000.0),
            published_at: None,
            closes_at: None,
            status: "NEW".into(),
            review_phase: "NEW".into(),
            priority: priority.map(Into::into),
            opportunity_type: kind.map(Into::into),
            created_at: Utc::now(),
        };
        let promoted = tender(Some("P1"), None);
        let rejected = tender(Some("P2"), Some(OPPORTUNITY_REJECT));
        let untouched = tender(Some("P4"), None);
        for t in [&promoted, &rejected, &untouched] {
            h.store.insert_tender(t.clone());
        }

        let execution = start(&h, tenant, WorkflowKind::Analysis, 0).await;
        complete(&h.state, completion(&execution, "OK")).await.unwrap();

        let get = |id| h.state.store.get_tender(tenant, id);
        assert_eq!(get(promoted.id).await.unwrap().unwrap().review_phase, PHASE_PRE_SCREENING);
        assert_eq!(get(rejected.id).await.unwrap().unwrap().review_phase, PHASE_REJECTED);
        let untouched = get(untouched.id).await.unwrap().unwrap();
        assert_eq!(untouched.review_phase, "NEW");
        assert_eq!(untouched.status, "ANALYZED");
    }

    #[tokio::test]
    async fn cancel_and_status() {
        let h = harness();
        let tenant = Uuid::new_v4();
        let execution = start(&h, tenant, WorkflowKind::Analysis, 0).await;

        let before = status(&h.state, tenant, None).await.unwrap();
        assert!(before.has_running);
        assert_eq!(before.active.len(), 1);

        let cancelled = cancel(&h.state, tenant, execution.id, "user-1").await.unwrap();
        assert_eq!(cancelled.status, ExecutionStatus::Error);
        assert_eq!(cancelled.progress, 100);
        assert!(cancelled.finished_at.is_some());
        assert!(matches!(
            cancel(&h.state, tenant, execution.id, "user-1").await,
            Err(AppError::NotFound(_))
        ));

        let after = status(&h.state, tenant, Some(WorkflowKind::Analysis)).await.unwrap();
        assert!(!after.has_running);
        assert_eq!(after.recent.len(), 1);
    }
}
