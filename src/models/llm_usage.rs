//! LLM token usage reported by the engine, and the completion run log.
//!
//! The engine attaches an `llm_usage` array to completion callbacks. Each entry
//! becomes one `llm_usage` row with an estimated USD cost. Every completion
//! callback, including retried deliveries, also appends one `workflow_run_log`
//! row with the raw status the engine sent.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::models::attributes::Attributes;
use crate::models::execution::WorkflowKind;

/// USD per million tokens as `(model, input, output)`.
///
/// Lookup takes an exact match first, then the first entry whose name is
/// contained in the reported model, so more specific names come first.
const MODEL_RATES: &[(&str, f64, f64)] = &[
    ("text-embedding-3-small", 0.02, 0.0),
    ("text-embedding-3-large", 0.13, 0.0),
    ("gpt-4.1-mini", 0.4, 1.6),
    ("gpt-4.1", 2.0, 8.0),
    ("gemini-3-pro-preview", 1.25, 10.0),
    ("gemini-2.0-flash", 0.1, 0.4),
    ("claude-sonnet-4-5", 3.0, 15.0),
];

/// Rates for models missing from the table.
const FALLBACK_RATES: (f64, f64) = (1.0, 4.0);

const UNKNOWN_MODEL: &str = "unknown";

/// `(input, output)` USD per million tokens for `model`.
pub fn model_rates(model: &str) -> (f64, f64) {
    MODEL_RATES
        .iter()
        .find(|(name, ..)| *name == model)
        .or_else(|| MODEL_RATES.iter().find(|(name, ..)| model.contains(name)))
        .map(|&(_, input, output)| (input, output))
        .unwrap_or(FALLBACK_RATES)
}

pub fn estimate_cost(model: &str, input_tokens: i64, output_tokens: i64) -> f64 {
    let (input, output) = model_rates(model);
    (input_tokens as f64 * input + output_tokens as f64 * output) / 1_000_000.0
}

/// One entry of a completion callback's `llm_usage` array.
///
/// # JSON Example
///
/// ```json
/// {
///   "model": "gpt-4.1-mini",
///   "workflow": "ANALYSIS",
///   "tender_id": "770e8400-e29b-41d4-a716-446655440002",
///   "input_tokens": 1200,
///   "output_tokens": 300,
///   "latency_ms": 850,
///   "metadata": { "step": "summary" }
/// }
/// ```
///
/// Every field is optional. The workflow defaults to the callback's.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LlmUsageReport {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub workflow: Option<String>,
    #[serde(default)]
    pub tender_id: Option<Uuid>,
    #[serde(default)]
    pub input_tokens: Option<i64>,
    #[serde(default)]
    pub output_tokens: Option<i64>,
    #[serde(default)]
    pub latency_ms: Option<i64>,
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
}

/// Values for an `llm_usage` row about to be appended.
#[derive(Debug, Clone, PartialEq)]
pub struct NewLlmUsage {
    pub tenant_id: Uuid,
    pub workflow: String,
    pub model: String,
    pub tender_id: Option<Uuid>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
    pub cost_usd: f64,
    pub latency_ms: Option<i64>,
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl NewLlmUsage {
    /// Price one report. Missing or negative token counts count as zero.
    pub fn from_report(
        tenant_id: Uuid,
        workflow: WorkflowKind,
        report: LlmUsageReport,
        now: DateTime<Utc>,
    ) -> Self {
        let model = report
            .model
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| UNKNOWN_MODEL.to_string());
        let input_tokens = report.input_tokens.unwrap_or(0).max(0);
        let output_tokens = report.output_tokens.unwrap_or(0).max(0);

        Self {
            tenant_id,
            workflow: report
                .workflow
                .filter(|w| !w.trim().is_empty())
                .unwrap_or_else(|| workflow.as_str().to_string()),
            cost_usd: estimate_cost(&model, input_tokens, output_tokens),
            model,
            tender_id: report.tender_id,
            input_tokens,
            output_tokens,
            total_tokens: input_tokens.saturating_add(output_tokens),
            latency_ms: report.latency_ms,
            metadata: report.metadata.unwrap_or_default(),
            created_at: now,
        }
    }
}

/// The columns of a stored `llm_usage` row the summary reads.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow, Serialize)]
pub struct LlmUsageRecord {
    pub workflow: String,
    pub model: String,
    pub total_tokens: i64,
    pub cost_usd: f64,
    pub created_at: DateTime<Utc>,
}

/// One `workflow_run_log` row: a completion callback exactly as received.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunLogEntry {
    pub tenant_id: Uuid,
    pub workflow: WorkflowKind,
    /// Raw engine status, e.g. `OK` or `failed: portal down`
    pub status: String,
    pub metrics: Attributes,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LlmUsageTotals {
    pub calls: i64,
    pub tokens: i64,
    pub cost_usd: f64,
}

impl LlmUsageTotals {
    fn add(&mut self, record: &LlmUsageRecord) {
        self.calls += 1;
        self.tokens += record.total_tokens;
        self.cost_usd += record.cost_usd;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LlmUsageBreakdown {
    pub workflow: String,
    pub model: String,
    #[serde(flatten)]
    pub totals: LlmUsageTotals,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LlmUsageDay {
    pub day: NaiveDate,
    #[serde(flatten)]
    pub totals: LlmUsageTotals,
}

/// Response body of `GET /internal/llm-usage`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LlmUsageSummary {
    pub tenant_id: Uuid,
    /// Since the first of the month, UTC
    pub current_month: LlmUsageTotals,
    /// Current month per workflow and model, most expensive first
    pub by_workflow: Vec<LlmUsageBreakdown>,
    /// One entry per day with usage since `daily_since`, oldest first
    pub daily: Vec<LlmUsageDay>,
}

impl LlmUsageSummary {
    pub fn build(
        tenant_id: Uuid,
        records: &[LlmUsageRecord],
        month_start: DateTime<Utc>,
        daily_since: DateTime<Utc>,
    ) -> Self {
        let mut current_month = LlmUsageTotals::default();
        let mut by_workflow: BTreeMap<(String, String), LlmUsageTotals> = BTreeMap::new();
        let mut daily: BTreeMap<NaiveDate, LlmUsageTotals> = BTreeMap::new();

        for record in records {
            if record.created_at >= month_start {
                current_month.add(record);
                by_workflow
                    .entry((record.workflow.clone(), record.model.clone()))
                    .or_default()
                    .add(record);
            }
            if record.created_at >= daily_since {
                daily.entry(record.created_at.date_naive()).or_default().add(record);
            }
        }

        let mut by_workflow: Vec<LlmUsageBreakdown> = by_workflow
            .into_iter()
            .map(|((workflow, model), totals)| LlmUsageBreakdown { workflow, model, totals })
            .collect();
        by_workflow.sort_by(|a, b| b.totals.cost_usd.total_cmp(&a.totals.cost_usd));

        Self {
            tenant_id,
            current_month,
            by_workflow,
            daily: daily
                .into_iter()
                .map(|(day, totals)| LlmUsageDay { day, totals })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn rates_prefer_exact_then_contained_names() {
        assert_eq!(model_rates("gpt-4.1"), (2.0, 8.0));
        assert_eq!(model_rates("gpt-4.1-mini-2025-04-14"), (0.4, 1.6));
        assert_eq!(model_rates("openai/gpt-4.1"), (2.0, 8.0));
        assert_eq!(model_rates("llama-3"), FALLBACK_RATES);
    }

    #[test]
    fn cost_is_per_million_tokens() {
        assert!(close(estimate_cost("claude-sonnet-4-5", 1_000_000, 1_000_000), 18.0));
        assert!(close(estimate_cost("gpt-4.1-mini", 1200, 300), (1200.0 * 0.4 + 300.0 * 1.6) / 1e6));
        assert!(close(estimate_cost("text-embedding-3-small", 500_000, 0), 0.01));
        assert!(close(estimate_cost("mystery", 1000, 1000), 0.005));
    }

    #[test]
    fn report_defaults() {
        let tenant = Uuid::new_v4();
        let now = Utc::now();
        let row = NewLlmUsage::from_report(
            tenant,
            WorkflowKind::Analysis,
            LlmUsageReport { input_tokens: Some(-5), output_tokens: Some(10), ..Default::default() },
            now,
        );
        assert_eq!(row.model, "unknown");
        assert_eq!(row.workflow, "ANALYSIS");
        assert_eq!((row.input_tokens, row.output_tokens, row.total_tokens), (0, 10, 10));
        assert!(close(row.cost_usd, 10.0 * 4.0 / 1e6));
        assert!(row.metadata.is_empty());

        let report: LlmUsageReport = serde_json::from_value(serde_json::json!({
            "model": "gemini-2.0-flash",
            "workflow": "EMBEDDINGS",
            "input_tokens": 100,
            "metadata": { "step": "summary", "pages": [1, 2] }
        }))
        .unwrap();
        let row = NewLlmUsage::from_report(tenant, WorkflowKind::Analysis, report, now);
        assert_eq!(row.workflow, "EMBEDDINGS");
        assert_eq!(row.metadata.len(), 2);
    }

    #[test]
    fn summary_groups_month_and_days() {
        let at = |d, h| Utc.with_ymd_and_hms(2025, 3, d, h, 0, 0).unwrap();
        let record = |workflow: &str, model: &str, tokens, cost, created_at| LlmUsageRecord {
            workflow: workflow.into(),
            model: model.into(),
            total_tokens: tokens,
            cost_usd: cost,
            created_at,
        };
        let records = vec![
            record("ANALYSIS", "gpt-4.1", 1000, 0.5, at(2, 9)),
            record("ANALYSIS", "gpt-4.1", 500, 0.25, at(2, 15)),
            record("INGESTION", "text-embedding-3-small", 9000, 0.01, at(3, 8)),
        ];
        let mut previous_month = record("ANALYSIS", "gpt-4.1", 7, 7.0, at(1, 0));
        previous_month.created_at -= chrono::Duration::hours(1);
        let mut all = records.clone();
        all.push(previous_month);

        let summary = LlmUsageSummary::build(Uuid::nil(), &all, at(1, 0), at(1, 0) - chrono::Duration::days(30));

        assert_eq!(summary.current_month.calls, 3);
        assert_eq!(summary.current_month.tokens, 10_500);
        assert!(close(summary.current_month.cost_usd, 0.76));

        assert_eq!(summary.by_workflow.len(), 2);
        assert_eq!(summary.by_workflow[0].model, "gpt-4.1");
        assert_eq!(summary.by_workflow[0].totals.calls, 2);

        let days: Vec<_> = summary.daily.iter().map(|d| (d.day.to_string(), d.totals.calls)).collect();
        assert_eq!(
            days,
            [("2025-02-28".to_string(), 1), ("2025-03-02".to_string(), 2), ("2025-03-03".to_string(), 1)]
        );
    }
}
