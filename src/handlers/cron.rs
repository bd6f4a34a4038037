//! External cron trigger for the schedule sweep.

use axum::{Json, extract::State};
use chrono::Utc;

use crate::error::AppError;
use crate::models::schedule::SweepSummary;
use crate::services::scheduler;
use crate::state::AppState;

/// Run one sweep over the due schedules.
///
/// # Endpoint
///
/// `GET|POST /api/cron/execute` with `Authorization: Bearer <CRON_SECRET>`
///
/// # Response (200 OK)
///
/// ```json
/// {
///   "checked": 2,
///   "triggered": 1,
///   "skipped": 1,
///   "errors": 0,
///   "results": [
///     { "tenant_id": "...", "workflow": "INGESTION", "status": "triggered", "execution_id": "..." },
///     { "tenant_id": "...", "workflow": "ANALYSIS", "status": "skipped" }
///   ],
///   "timestamp": "2025-03-17T09:00:00Z"
/// }
/// ```
pub async fn execute(State(state): State<AppState>) -> Result<Json<SweepSummary>, AppError> {
    let summary = scheduler::run_due_schedules(&state, Utc::now()).await?;
    Ok(Json(summary))
}
