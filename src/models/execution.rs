//! Workflow execution records and the engine's callback payloads.
//!
//! # Lifecycle
//!
//! `PENDING` (row created before the engine is called) → `RUNNING` (engine
//! accepted the webhook) → `SUCCESS` | `ERROR` (callback, reaper or cancel).
//! A run the engine never accepted goes straight from `PENDING` to `ERROR`.
//! At most one `PENDING`/`RUNNING` execution exists per tenant and workflow.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::attributes::Attributes;
use crate::models::llm_usage::LlmUsageReport;

/// Workflows the external engine runs on a tenant's behalf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WorkflowKind {
    /// Pulls new tenders from the public procurement portal
    Ingestion,
    /// AI analysis of ingested tenders
    Analysis,
}

impl WorkflowKind {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowKind::Ingestion => "INGESTION",
            WorkflowKind::Analysis => "ANALYSIS",
        }
    }

    /// Accepts the canonical name in any case, so it can come straight from a URL path.
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "INGESTION" => Some(WorkflowKind::Ingestion),
            "ANALYSIS" => Some(WorkflowKind::Analysis),
            _ => None,
        }
    }

    /// Step label shown while the row waits for the engine to accept the webhook.
    pub fn queued_step(self) -> &'static str {
        match self {
            WorkflowKind::Ingestion => "Starting tender ingestion...",
            WorkflowKind::Analysis => "Starting AI analysis...",
        }
    }

    /// Step label once the engine has accepted the webhook.
    pub fn running_step(self) -> &'static str {
        match self {
            WorkflowKind::Ingestion => "Connecting to procurement portal...",
            WorkflowKind::Analysis => "Loading pending tenders...",
        }
    }
}

impl std::fmt::Display for WorkflowKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Success,
    Error,
}

impl ExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "PENDING",
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Success => "SUCCESS",
            ExecutionStatus::Error => "ERROR",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(ExecutionStatus::Pending),
            "RUNNING" => Some(ExecutionStatus::Running),
            "SUCCESS" => Some(ExecutionStatus::Success),
            "ERROR" => Some(ExecutionStatus::Error),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ExecutionStatus::Success | ExecutionStatus::Error)
    }
}

/// What started an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TriggerSource {
    Cron,
    Manual,
    Api,
}

impl TriggerSource {
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerSource::Cron => "CRON",
            TriggerSource::Manual => "MANUAL",
            TriggerSource::Api => "API",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "CRON" => Some(TriggerSource::Cron),
            "MANUAL" => Some(TriggerSource::Manual),
            "API" => Some(TriggerSource::Api),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    #[default]
    Info,
    Warn,
    Error,
}

/// One line of an execution's log. Entries are only ever appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub time: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            time: Utc::now(),
            level,
            message: message.into(),
        }
    }
}

/// Represents a workflow execution row.
///
/// # Database Table
///
/// Maps to `workflow_executions`. A partial unique index on
/// `(tenant_id, workflow) WHERE status IN ('PENDING', 'RUNNING')` enforces the
/// one-in-flight rule.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowExecution {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub workflow: WorkflowKind,
    pub status: ExecutionStatus,

    /// 0 to 100, never decreasing
    pub progress: i32,

    pub current_step: Option<String>,
    pub metrics: Attributes,
    pub logs: Vec<LogEntry>,
    pub trigger_source: TriggerSource,

    /// User id for manual triggers, key id for API triggers
    pub triggered_by: Option<String>,

    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// Values for a new `PENDING` execution.
#[derive(Debug, Clone)]
pub struct NewExecution {
    pub tenant_id: Uuid,
    pub workflow: WorkflowKind,
    pub current_step: String,
    pub trigger_source: TriggerSource,
    pub triggered_by: Option<String>,
    pub log: LogEntry,
    pub started_at: DateTime<Utc>,
}

/// A validated, partial update to an execution.
///
/// Applied as one serialized write: progress is clamped and only moves forward,
/// metrics are merged, the log line is appended, and a status is applied only if
/// it does not revive a terminal execution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionUpdate {
    pub progress: Option<i32>,
    pub current_step: Option<String>,
    pub metrics: Attributes,
    pub log: Option<LogEntry>,
    pub status: Option<ExecutionStatus>,
    pub error_message: Option<String>,
}

impl ExecutionUpdate {
    pub fn is_empty(&self) -> bool {
        self.progress.is_none()
            && self.current_step.is_none()
            && self.metrics.is_empty()
            && self.log.is_none()
            && self.status.is_none()
            && self.error_message.is_none()
    }

    /// Apply this update to an in-memory copy of an execution.
    ///
    /// The Postgres store expresses the same rules in a single `UPDATE`.
    pub fn apply_to(&self, execution: &mut WorkflowExecution, now: DateTime<Utc>) {
        if let Some(progress) = self.progress {
            execution.progress = execution.progress.max(progress.clamp(0, 100));
        }
        if let Some(step) = &self.current_step {
            execution.current_step = Some(step.clone());
        }
        crate::models::attributes::merge(&mut execution.metrics, &self.metrics);
        if let Some(log) = &self.log {
            execution.logs.push(log.clone());
        }
        if let Some(status) = self.status {
            if status.is_terminal() || !execution.status.is_terminal() {
                execution.status = status;
                if status.is_terminal() {
                    execution.finished_at = Some(now);
                }
                if status == ExecutionStatus::Success {
                    execution.error_message = None;
                }
            }
        }
        if let Some(message) = &self.error_message {
            execution.error_message = Some(message.clone());
        }
    }
}

/// Incremental progress callback from the engine.
///
/// # JSON Example
///
/// ```json
/// {
///   "execution_id": "550e8400-e29b-41d4-a716-446655440000",
///   "progress": 40,
///   "current_step": "Fetching page 4 of 10",
///   "metrics": { "found": 120 },
///   "log_message": "page 4 done",
///   "log_level": "info"
/// }
/// ```
#[derive(Debug, Deserialize)]
pub struct ProgressCallback {
    pub execution_id: Uuid,
    #[serde(default)]
    pub progress: Option<i64>,
    #[serde(default)]
    pub current_step: Option<String>,
    #[serde(default)]
    pub metrics: Option<Attributes>,
    #[serde(default)]
    pub log_message: Option<String>,
    #[serde(default)]
    pub log_level: Option<LogLevel>,
    /// Only `RUNNING`, `SUCCESS` and `ERROR` are accepted
    #[serde(default)]
    pub status: Option<ExecutionStatus>,
}

/// Terminal callback from the engine.
///
/// # JSON Example
///
/// ```json
/// {
///   "workflow": "ANALYSIS",
///   "tenant_id": "550e8400-e29b-41d4-a716-446655440000",
///   "status": "OK",
///   "metrics": { "analyzed": 42 },
///   "execution_id": "660e8400-e29b-41d4-a716-446655440001"
/// }
/// ```
///
/// `status` is `OK` or `SUCCESS` for success; any other value is reported as the error.
/// An optional `llm_usage` array lists the model calls the run made, see
/// [`LlmUsageReport`].
#[derive(Debug, Deserialize)]
pub struct CompletionCallback {
    pub workflow: WorkflowKind,
    pub tenant_id: Uuid,
    pub status: String,
    #[serde(default)]
    pub metrics: Option<Attributes>,
    #[serde(default)]
    pub execution_id: Option<Uuid>,
    #[serde(default)]
    pub llm_usage: Vec<LlmUsageReport>,
}

impl CompletionCallback {
    pub fn succeeded(&self) -> bool {
        matches!(self.status.as_str(), "OK" | "SUCCESS")
    }
}

/// Acknowledgement returned to the engine for callbacks.
#[derive(Debug, Serialize)]
pub struct CallbackAck {
    pub received: bool,
    /// False when the execution id is unknown or the update was a retry no-op
    pub applied: bool,
}

/// Response body of the execution status endpoints.
#[derive(Debug, Serialize)]
pub struct ExecutionStatusResponse {
    pub active: Vec<WorkflowExecution>,
    pub recent: Vec<WorkflowExecution>,
    pub has_running: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::attributes::Scalar;

    fn running() -> WorkflowExecution {
        WorkflowExecution {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            workflow: WorkflowKind::Ingestion,
            status: ExecutionStatus::Running,
            progress: 40,
            current_step: None,
            metrics: Attributes::new(),
            logs: Vec::new(),
            trigger_source: TriggerSource::Cron,
            triggered_by: None,
            started_at: Utc::now(),
            finished_at: None,
            error_message: None,
        }
    }

    #[test]
    fn progress_is_clamped_and_monotonic() {
        let mut exec = running();

        ExecutionUpdate { progress: Some(20), ..Default::default() }.apply_to(&mut exec, Utc::now());
        assert_eq!(exec.progress, 40);

        ExecutionUpdate { progress: Some(250), ..Default::default() }.apply_to(&mut exec, Utc::now());
        assert_eq!(exec.progress, 100);
    }

    #[test]
    fn terminal_execution_is_not_revived() {
        let mut exec = running();
        exec.status = ExecutionStatus::Error;

        ExecutionUpdate { status: Some(ExecutionStatus::Running), ..Default::default() }
            .apply_to(&mut exec, Utc::now());
        assert_eq!(exec.status, ExecutionStatus::Error);

        ExecutionUpdate { status: Some(ExecutionStatus::Success), ..Default::default() }
            .apply_to(&mut exec, Utc::now());
        assert_eq!(exec.status, ExecutionStatus::Success);
        assert!(exec.finished_at.is_some());
    }

    #[test]
    fn late_success_clears_the_timeout_message() {
        let mut exec = running();
        exec.status = ExecutionStatus::Error;
        exec.error_message = Some("Timeout: no completion within 30 minutes".into());

        ExecutionUpdate { status: Some(ExecutionStatus::Success), ..Default::default() }
            .apply_to(&mut exec, Utc::now());
        assert_eq!(exec.status, ExecutionStatus::Success);
        assert_eq!(exec.error_message, None);

        ExecutionUpdate {
            status: Some(ExecutionStatus::Error),
            error_message: Some("Engine reported FAILED".into()),
            ..Default::default()
        }
        .apply_to(&mut exec, Utc::now());
        assert_eq!(exec.error_message.as_deref(), Some("Engine reported FAILED"));
    }

    #[test]
    fn logs_append_and_metrics_merge() {
        let mut exec = running();
        exec.metrics.insert("found".into(), Scalar::Int(1));

        let mut metrics = Attributes::new();
        metrics.insert("saved".into(), Scalar::Int(2));
        let update = ExecutionUpdate {
            metrics,
            log: Some(LogEntry::new(LogLevel::Info, "first")),
            ..Default::default()
        };
        update.apply_to(&mut exec, Utc::now());
        ExecutionUpdate { log: Some(LogEntry::new(LogLevel::Warn, "second")), ..Default::default() }
            .apply_to(&mut exec, Utc::now());

        assert_eq!(exec.metrics.len(), 2);
        let messages: Vec<_> = exec.logs.iter().map(|l| l.message.as_str()).collect();
        assert_eq!(messages, ["first", "second"]);
    }

    #[test]
    fn completion_status_mapping() {
        let callback: CompletionCallback = serde_json::from_value(serde_json::json!({
            "workflow": "ANALYSIS",
            "tenant_id": Uuid::new_v4(),
            "status": "OK"
        }))
        .unwrap();
        assert!(callback.succeeded());
        assert_eq!(WorkflowKind::parse("analysis"), Some(WorkflowKind::Analysis));
        assert_eq!(WorkflowKind::parse("reports"), None);
    }
}
