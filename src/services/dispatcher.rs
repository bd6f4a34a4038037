//! Workflow dispatcher.
//!
//! # Process
//!
//! 1. Create the `PENDING` execution, unless one is already in flight for the
//!    same tenant and workflow (409)
//! 2. For API triggers, debit the call's price (402 if the balance is gone)
//! 3. Call the engine webhook
//! 4. On acceptance, move the execution to `RUNNING` and log the billed call
//! 5. On failure, finish the execution as `ERROR`, refund the debit and return
//!    502. The next trigger or schedule tick can start a fresh run right away.
//!
//! The row is created before the network call so the in-flight guard already
//! holds while the engine is being contacted, and the debit happens before the
//! engine is called so a started run is always paid for.

use chrono::Utc;
use uuid::Uuid;

use crate::engine::EnginePayload;
use crate::error::AppError;
use crate::middleware::api_key::{ApiKeyContext, CallMeta};
use crate::models::attributes::Attributes;
use crate::models::credit::Charge;
use crate::models::execution::{
    ExecutionStatus, ExecutionUpdate, LogEntry, LogLevel, NewExecution, TriggerSource,
    WorkflowExecution, WorkflowKind,
};
use crate::services::ledger;
use crate::state::AppState;

#[derive(Debug, Clone)]
pub struct DispatchCommand {
    pub tenant_id: Uuid,
    pub workflow: WorkflowKind,
    pub source: TriggerSource,
    /// User id or API key id, for the audit trail
    pub triggered_by: Option<String>,
    pub params: Attributes,
}

/// The API call a dispatch is billed to.
#[derive(Debug, Clone, Copy)]
pub struct Billing<'a> {
    pub ctx: &'a ApiKeyContext,
    pub meta: &'a CallMeta,
    pub price: i64,
}

/// Usage status logged for an accepted, billed trigger.
const ACCEPTED: i32 = 202;
const BAD_GATEWAY: i32 = 502;

/// Dispatch without billing, for schedules and dashboard triggers.
pub async fn dispatch(state: &AppState, command: DispatchCommand) -> Result<WorkflowExecution, AppError> {
    let (execution, _) = dispatch_billed(state, command, None).await?;
    Ok(execution)
}

/// Dispatch, charging `billing` when given.
///
/// Returns the execution and, for billed dispatches, the charge.
pub async fn dispatch_billed(
    state: &AppState,
    command: DispatchCommand,
    billing: Option<Billing<'_>>,
) -> Result<(WorkflowExecution, Option<Charge>), AppError> {
    let DispatchCommand {
        tenant_id,
        workflow,
        source,
        triggered_by,
        params,
    } = command;
    let store = state.store.as_ref();

    let new = NewExecution {
        tenant_id,
        workflow,
        current_step: workflow.queued_step().to_string(),
        trigger_source: source,
        triggered_by,
        log: LogEntry::new(LogLevel::Info, format!("{workflow} triggered ({})", source.as_str())),
        started_at: Utc::now(),
    };

    let execution = store
        .create_execution_if_idle(new)
        .await?
        .ok_or(AppError::AlreadyRunning(workflow))?;

    let charge = match billing {
        Some(b) => match ledger::debit(store, b.ctx, b.meta, b.price).await {
            Ok(charge) => Some(charge),
            Err(e) => {
                abandon(state, execution.id, format!("Not dispatched: {e}")).await;
                return Err(e);
            }
        },
        None => None,
    };

    let payload = EnginePayload::new(&state.config, tenant_id, execution.id, workflow, params);

    if let Err(e) = state.engine.start(&payload).await {
        tracing::warn!(
            tenant_id = %tenant_id,
            execution_id = %execution.id,
            workflow = %workflow,
            error = %e,
            "engine dispatch failed"
        );

        abandon(state, execution.id, format!("Dispatch failed: {e}")).await;
        if let Some(b) = billing {
            ledger::refund(store, b.ctx, b.price).await?;
            ledger::record_call(store, b.ctx, b.meta, BAD_GATEWAY, 0).await?;
        }
        return Err(AppError::Dispatch(e.to_string()));
    }

    store.mark_running(execution.id, workflow.running_step()).await?;
    if let Some(b) = billing {
        ledger::record_call(store, b.ctx, b.meta, ACCEPTED, b.price).await?;
    }

    tracing::info!(
        tenant_id = %tenant_id,
        execution_id = %execution.id,
        workflow = %workflow,
        source = source.as_str(),
        "workflow dispatched"
    );

    // A fast engine may already have called back; report what is stored
    let stored = store.get_execution(execution.id).await?.unwrap_or(execution);
    Ok((stored, charge))
}

/// Finish an execution that never reached the engine, releasing the in-flight
/// guard for the next trigger.
async fn abandon(state: &AppState, execution_id: Uuid, message: String) {
    let update = ExecutionUpdate {
        progress: Some(100),
        current_step: Some("Failed".to_string()),
        log: Some(LogEntry::new(LogLevel::Error, message.clone())),
        status: Some(ExecutionStatus::Error),
        error_message: Some(message),
        ..Default::default()
    };
    if let Err(e) = state.store.update_execution(execution_id, update).await {
        tracing::error!(execution_id = %execution_id, error = %e, "failed to finish undispatched execution");
    }
}
