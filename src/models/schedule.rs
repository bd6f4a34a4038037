//! Recurring workflow schedules.
//!
//! One schedule per tenant and workflow. The sweep rewrites `last_*`,
//! `next_run_at` and `run_count` after every dispatch attempt; user edits rewrite
//! the definition and recompute `next_run_at`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::attributes::Attributes;
use crate::models::execution::WorkflowKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Frequency {
    Hourly,
    Daily,
    /// Same arithmetic as `Daily`; the day list is usually a single weekday.
    Weekly,
}

impl Frequency {
    pub fn as_str(self) -> &'static str {
        match self {
            Frequency::Hourly => "HOURLY",
            Frequency::Daily => "DAILY",
            Frequency::Weekly => "WEEKLY",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "HOURLY" => Some(Frequency::Hourly),
            "DAILY" => Some(Frequency::Daily),
            "WEEKLY" => Some(Frequency::Weekly),
            _ => None,
        }
    }
}

/// The user-editable part of a schedule.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleDefinition {
    pub workflow: WorkflowKind,
    pub enabled: bool,
    pub frequency: Frequency,
    pub hour: u32,
    pub minute: u32,
    /// Weekdays, 0 = Sunday through 6 = Saturday
    pub days_of_week: Vec<u32>,
    /// IANA timezone name all day/time arithmetic happens in
    pub timezone: String,
    pub params: Attributes,
}

/// Represents a schedule row.
///
/// # Database Table
///
/// Maps to `cron_schedules`, unique on `(tenant_id, workflow)`.
#[derive(Debug, Clone, Serialize)]
pub struct CronSchedule {
    pub id: Uuid,
    pub tenant_id: Uuid,

    #[serde(flatten)]
    pub definition: ScheduleDefinition,

    pub last_run_at: Option<DateTime<Utc>>,

    /// `SUCCESS`, `SKIPPED: ...` or `ERROR: <message>`
    pub last_status: Option<String>,

    /// Authoritative due time. Null means "due at the next sweep".
    pub next_run_at: Option<DateTime<Utc>>,

    pub run_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// How a sweep attempt ended, as recorded back onto the schedule.
#[derive(Debug, Clone, PartialEq)]
pub enum ScheduleOutcome {
    /// Dispatched. Advances `next_run_at` and increments `run_count`.
    Triggered { next_run_at: DateTime<Utc> },
    /// Another execution was still in flight. Advances `next_run_at` only.
    Skipped { next_run_at: DateTime<Utc>, reason: String },
    /// Dispatch failed. `next_run_at` is kept so the next sweep retries.
    Failed { message: String },
}

impl ScheduleOutcome {
    pub fn status_label(&self) -> String {
        match self {
            ScheduleOutcome::Triggered { .. } => "SUCCESS".to_string(),
            ScheduleOutcome::Skipped { reason, .. } => format!("SKIPPED: {reason}"),
            ScheduleOutcome::Failed { message } => {
                let truncated: String = message.chars().take(200).collect();
                format!("ERROR: {truncated}")
            }
        }
    }
}

/// Request body for creating or replacing a tenant's schedule for one workflow.
///
/// # JSON Example
///
/// ```json
/// {
///   "enabled": true,
///   "frequency": "DAILY",
///   "hour": 6,
///   "minute": 0,
///   "days_of_week": [1, 3, 5],
///   "timezone": "America/Sao_Paulo",
///   "params": { "lookback_days": 2 }
/// }
/// ```
#[derive(Debug, Deserialize)]
pub struct UpsertScheduleRequest {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default = "default_frequency")]
    pub frequency: Frequency,

    #[serde(default = "default_hour")]
    pub hour: u32,

    #[serde(default)]
    pub minute: u32,

    #[serde(default = "default_days")]
    pub days_of_week: Vec<u32>,

    /// Defaults to the service's configured timezone
    #[serde(default)]
    pub timezone: Option<String>,

    #[serde(default)]
    pub params: Attributes,
}

fn default_enabled() -> bool {
    true
}

fn default_frequency() -> Frequency {
    Frequency::Daily
}

fn default_hour() -> u32 {
    6
}

fn default_days() -> Vec<u32> {
    vec![1, 2, 3, 4, 5]
}

/// One line of the cron sweep summary.
#[derive(Debug, Clone, Serialize)]
pub struct SweepResult {
    pub tenant_id: Uuid,
    pub workflow: WorkflowKind,
    /// `triggered`, `skipped` or `error`
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Response body of the cron trigger endpoint.
#[derive(Debug, Serialize)]
pub struct SweepSummary {
    pub checked: usize,
    pub triggered: usize,
    pub skipped: usize,
    pub errors: usize,
    pub results: Vec<SweepResult>,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_label_is_truncated() {
        let outcome = ScheduleOutcome::Failed {
            message: "x".repeat(500),
        };
        let label = outcome.status_label();
        assert!(label.starts_with("ERROR: "));
        assert_eq!(label.len(), "ERROR: ".len() + 200);
    }

    #[test]
    fn upsert_request_fills_defaults() {
        let req: UpsertScheduleRequest = serde_json::from_str("{}").unwrap();
        assert!(req.enabled);
        assert_eq!(req.frequency, Frequency::Daily);
        assert_eq!(req.hour, 6);
        assert_eq!(req.days_of_week, vec![1, 2, 3, 4, 5]);
        assert!(req.params.is_empty());
    }
}
