//! Schedule management, due-schedule selection and the cron sweep.
//!
//! All day and time arithmetic happens in the schedule's own timezone. The
//! server's timezone never enters into it.
//!
//! A schedule is due when either
//! - its `next_run_at` is unset or has passed, or
//! - the local weekday and time of day fall inside the tolerance window after
//!   its configured time, which catches schedules whose `next_run_at` drifted.
//!
//! Both conditions can hold for the same cycle; the dispatcher's in-flight
//! guard keeps that from producing a second execution.

use std::time::Duration as StdDuration;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::execution::{TriggerSource, WorkflowKind};
use crate::models::schedule::{
    CronSchedule, Frequency, ScheduleDefinition, ScheduleOutcome, SweepResult, SweepSummary,
    UpsertScheduleRequest,
};
use crate::services::dispatcher::{self, DispatchCommand};
use crate::state::AppState;

/// Longest DST gap searched when a local time does not exist.
const MAX_GAP_MINUTES: i64 = 24 * 60;

/// Parse an IANA timezone name.
pub fn parse_timezone(name: &str) -> Result<Tz, AppError> {
    name.parse::<Tz>()
        .map_err(|_| AppError::InvalidRequest(format!("Unknown timezone '{name}'")))
}

/// Timezone of a stored schedule, falling back to `default` and then UTC.
pub fn resolve_timezone(name: &str, default: &str) -> Tz {
    name.parse()
        .or_else(|_| default.parse())
        .unwrap_or(Tz::UTC)
}

/// Map a local wall-clock time to an instant.
///
/// Ambiguous times (clocks going back) take the earlier instant. Times inside
/// a gap (clocks going forward) take the first valid instant after the gap.
fn resolve_local(tz: Tz, local: NaiveDateTime) -> DateTime<Utc> {
    for offset in 0..=MAX_GAP_MINUTES {
        let candidate = local + Duration::minutes(offset);
        if let Some(instant) = tz.from_local_datetime(&candidate).earliest() {
            return instant.with_timezone(&Utc);
        }
    }
    Utc.from_utc_datetime(&local)
}

fn at_time(tz: Tz, date: NaiveDate, hour: u32, minute: u32) -> DateTime<Utc> {
    let time = NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN);
    resolve_local(tz, date.and_time(time))
}

fn runs_on(definition: &ScheduleDefinition, date: NaiveDate) -> bool {
    definition
        .days_of_week
        .contains(&date.weekday().num_days_from_sunday())
}

/// Next hour, snapped to the configured minute.
fn next_hourly(definition: &ScheduleDefinition, tz: Tz, now: DateTime<Utc>) -> DateTime<Utc> {
    let local = (now + Duration::hours(1)).with_timezone(&tz).naive_local();
    at_time(tz, local.date(), local.hour(), definition.minute)
}

/// Next run once the schedule has fired at `now`.
///
/// Daily and weekly schedules never fire again on the same local date.
pub fn next_run_after(definition: &ScheduleDefinition, tz: Tz, now: DateTime<Utc>) -> DateTime<Utc> {
    if definition.frequency == Frequency::Hourly {
        return next_hourly(definition, tz, now);
    }

    let today = now.with_timezone(&tz).date_naive();
    (1..=7)
        .filter_map(|d| today.checked_add_days(chrono::Days::new(d)))
        .find(|date| runs_on(definition, *date))
        .map(|date| at_time(tz, date, definition.hour, definition.minute))
        .unwrap_or_else(|| tomorrow_at(definition, tz, today))
}

/// Next run for a schedule that was just created or edited at `now`.
///
/// Unlike [`next_run_after`] a later time today counts.
pub fn next_run_from(definition: &ScheduleDefinition, tz: Tz, now: DateTime<Utc>) -> DateTime<Utc> {
    if definition.frequency == Frequency::Hourly {
        return next_hourly(definition, tz, now);
    }

    let today = now.with_timezone(&tz).date_naive();
    (0..=7)
        .filter_map(|d| today.checked_add_days(chrono::Days::new(d)))
        .filter(|date| runs_on(definition, *date))
        .map(|date| at_time(tz, date, definition.hour, definition.minute))
        .find(|candidate| *candidate > now)
        .unwrap_or_else(|| tomorrow_at(definition, tz, today))
}

fn tomorrow_at(definition: &ScheduleDefinition, tz: Tz, today: NaiveDate) -> DateTime<Utc> {
    let tomorrow = today.succ_opt().unwrap_or(today);
    at_time(tz, tomorrow, definition.hour, definition.minute)
}

/// Whether local time at `now` is within `tolerance_minutes` after the
/// configured time, on a configured weekday.
pub fn time_matches(definition: &ScheduleDefinition, tz: Tz, now: DateTime<Utc>, tolerance_minutes: i64) -> bool {
    let local = now.with_timezone(&tz);
    if !definition
        .days_of_week
        .contains(&local.weekday().num_days_from_sunday())
    {
        return false;
    }

    let elapsed = match definition.frequency {
        Frequency::Hourly => (i64::from(local.minute()) - i64::from(definition.minute)).rem_euclid(60),
        Frequency::Daily | Frequency::Weekly => {
            let local_minute = i64::from(local.hour() * 60 + local.minute());
            local_minute - i64::from(definition.hour * 60 + definition.minute)
        }
    };
    (0..tolerance_minutes).contains(&elapsed)
}

pub fn is_due(schedule: &CronSchedule, tz: Tz, now: DateTime<Utc>, tolerance_minutes: i64) -> bool {
    if !schedule.definition.enabled {
        return false;
    }
    let past_due = schedule.next_run_at.is_none_or(|at| at <= now);
    past_due || time_matches(&schedule.definition, tz, now, tolerance_minutes)
}

/// Due schedules among `schedules`, each paired with its resolved timezone.
pub fn select_due(
    schedules: Vec<CronSchedule>,
    now: DateTime<Utc>,
    tolerance_minutes: i64,
    default_timezone: &str,
) -> Vec<(CronSchedule, Tz)> {
    schedules
        .into_iter()
        .map(|s| {
            let tz = resolve_timezone(&s.definition.timezone, default_timezone);
            (s, tz)
        })
        .filter(|(s, tz)| is_due(s, *tz, now, tolerance_minutes))
        .collect()
}

/// Validate a schedule edit and turn it into a definition.
pub fn definition_from_request(
    workflow: WorkflowKind,
    request: UpsertScheduleRequest,
    default_timezone: &str,
) -> Result<ScheduleDefinition, AppError> {
    if request.hour > 23 {
        return Err(AppError::InvalidRequest("hour must be between 0 and 23".to_string()));
    }
    if request.minute > 59 {
        return Err(AppError::InvalidRequest("minute must be between 0 and 59".to_string()));
    }
    if request.days_of_week.iter().any(|d| *d > 6) {
        return Err(AppError::InvalidRequest(
            "days_of_week must contain values from 0 (Sunday) to 6 (Saturday)".to_string(),
        ));
    }
    if request.days_of_week.is_empty() {
        return Err(AppError::InvalidRequest("days_of_week must not be empty".to_string()));
    }

    let timezone = request.timezone.unwrap_or_else(|| default_timezone.to_string());
    parse_timezone(&timezone)?;

    let mut days_of_week = request.days_of_week;
    days_of_week.sort_unstable();
    days_of_week.dedup();

    Ok(ScheduleDefinition {
        workflow,
        enabled: request.enabled,
        frequency: request.frequency,
        hour: request.hour,
        minute: request.minute,
        days_of_week,
        timezone,
        params: request.params,
    })
}

/// Create or replace the tenant's schedule for `workflow`.
///
/// `next_run_at` is recomputed from now, or cleared when the schedule is disabled.
pub async fn upsert_schedule(
    state: &AppState,
    tenant_id: Uuid,
    workflow: WorkflowKind,
    request: UpsertScheduleRequest,
) -> Result<CronSchedule, AppError> {
    let definition = definition_from_request(workflow, request, &state.config.default_timezone)?;

    let next_run_at = if definition.enabled {
        let tz = parse_timezone(&definition.timezone)?;
        Some(next_run_from(&definition, tz, Utc::now()))
    } else {
        None
    };

    let schedule = state
        .store
        .upsert_schedule(tenant_id, definition, next_run_at)
        .await?;

    tracing::info!(
        tenant_id = %tenant_id,
        workflow = %workflow,
        enabled = schedule.definition.enabled,
        next_run_at = ?schedule.next_run_at,
        "schedule saved"
    );
    Ok(schedule)
}

pub async fn delete_schedule(state: &AppState, tenant_id: Uuid, workflow: WorkflowKind) -> Result<(), AppError> {
    if !state.store.delete_schedule(tenant_id, workflow).await? {
        return Err(AppError::NotFound("Schedule"));
    }
    Ok(())
}

/// Dispatch every due schedule once.
///
/// One schedule's failure never aborts the sweep; it is recorded on that
/// schedule and retried next cycle.
pub async fn run_due_schedules(state: &AppState, now: DateTime<Utc>) -> Result<SweepSummary, AppError> {
    let schedules = state.store.enabled_schedules().await?;
    let due = select_due(
        schedules,
        now,
        state.config.schedule_tolerance_minutes,
        &state.config.default_timezone,
    );

    let mut results = Vec::with_capacity(due.len());

    for (schedule, tz) in &due {
        let workflow = schedule.definition.workflow;
        let command = DispatchCommand {
            tenant_id: schedule.tenant_id,
            workflow,
            source: TriggerSource::Cron,
            triggered_by: None,
            params: schedule.definition.params.clone(),
        };

        let (outcome, result) = match dispatcher::dispatch(state, command).await {
            Ok(execution) => (
                ScheduleOutcome::Triggered {
                    next_run_at: next_run_after(&schedule.definition, *tz, now),
                },
                SweepResult {
                    tenant_id: schedule.tenant_id,
                    workflow,
                    status: "triggered",
                    execution_id: Some(execution.id),
                    error: None,
                },
            ),
            Err(AppError::AlreadyRunning(_)) => (
                ScheduleOutcome::Skipped {
                    next_run_at: next_run_after(&schedule.definition, *tz, now),
                    reason: format!("{workflow} already running"),
                },
                SweepResult {
                    tenant_id: schedule.tenant_id,
                    workflow,
                    status: "skipped",
                    execution_id: None,
                    error: None,
                },
            ),
            Err(e) => {
                let message = e.to_string();
                tracing::warn!(
                    schedule_id = %schedule.id,
                    tenant_id = %schedule.tenant_id,
                    workflow = %workflow,
                    error = %message,
                    "scheduled dispatch failed"
                );
                (
                    ScheduleOutcome::Failed {
                        message: message.clone(),
                    },
                    SweepResult {
                        tenant_id: schedule.tenant_id,
                        workflow,
                        status: "error",
                        execution_id: None,
                        error: Some(message),
                    },
                )
            }
        };

        if let Err(e) = state
            .store
            .record_schedule_outcome(schedule.id, now, &outcome)
            .await
        {
            tracing::error!(schedule_id = %schedule.id, error = %e, "failed to record schedule outcome");
        }
        results.push(result);
    }

    let count = |status: &str| results.iter().filter(|r| r.status == status).count();
    let summary = SweepSummary {
        checked: due.len(),
        triggered: count("triggered"),
        skipped: count("skipped"),
        errors: count("error"),
        results,
        timestamp: now,
    };

    tracing::info!(
        checked = summary.checked,
        triggered = summary.triggered,
        skipped = summary.skipped,
        errors = summary.errors,
        "schedule sweep finished"
    );
    Ok(summary)
}

/// Sweep on a fixed interval until `shutdown` changes.
///
/// Only used when the service is not driven by an external cron.
pub async fn run_scheduler(state: AppState, interval: StdDuration, mut shutdown: watch::Receiver<bool>) {
    tracing::info!(interval_secs = interval.as_secs(), "scheduler started");

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                if let Err(e) = run_due_schedules(&state, Utc::now()).await {
                    tracing::error!(error = %e, "schedule sweep failed");
                }
            }
            _ = shutdown.changed() => {
                tracing::info!("scheduler shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::attributes::Attributes;
    use crate::models::execution::ExecutionStatus;
    use crate::test_support::harness;

    const SAO_PAULO: &str = "America/Sao_Paulo";

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn definition(frequency: Frequency, hour: u32, minute: u32, days: &[u32], tz: &str) -> ScheduleDefinition {
        ScheduleDefinition {
            workflow: WorkflowKind::Ingestion,
            enabled: true,
            frequency,
            hour,
            minute,
            days_of_week: days.to_vec(),
            timezone: tz.to_string(),
            params: Attributes::new(),
        }
    }

    fn tz(name: &str) -> Tz {
        parse_timezone(name).unwrap()
    }

    #[test]
    fn saturday_rolls_to_monday_in_schedule_timezone() {
        // 2025-03-15 is a Saturday
        let def = definition(Frequency::Daily, 6, 0, &[1, 3, 5], SAO_PAULO);
        let next = next_run_after(&def, tz(SAO_PAULO), utc(2025, 3, 15, 12, 0));
        // Monday 06:00 in Sao Paulo (UTC-3)
        assert_eq!(next, utc(2025, 3, 17, 9, 0));
    }

    #[test]
    fn local_weekday_differs_from_utc_weekday() {
        // Monday 01:00 UTC is Sunday 22:00 in Sao Paulo
        let now = utc(2025, 3, 17, 1, 0);
        let def = definition(Frequency::Daily, 6, 0, &[1], SAO_PAULO);
        assert_eq!(next_run_after(&def, tz(SAO_PAULO), now), utc(2025, 3, 17, 9, 0));

        let sunday_night = definition(Frequency::Daily, 22, 0, &[0], SAO_PAULO);
        assert!(time_matches(&sunday_night, tz(SAO_PAULO), now, 15));
        assert!(!time_matches(&sunday_night, Tz::UTC, now, 15));
    }

    #[test]
    fn hourly_snaps_to_configured_minute() {
        let def = definition(Frequency::Hourly, 0, 5, &[0, 1, 2, 3, 4, 5, 6], SAO_PAULO);
        let next = next_run_after(&def, tz(SAO_PAULO), utc(2025, 3, 15, 12, 40));
        assert_eq!(next, utc(2025, 3, 15, 13, 5));
    }

    #[test]
    fn after_never_fires_twice_on_the_same_day() {
        let def = definition(Frequency::Daily, 18, 0, &[0, 1, 2, 3, 4, 5, 6], SAO_PAULO);
        // 09:00 local on Saturday; 18:00 today is still ahead
        let now = utc(2025, 3, 15, 12, 0);
        assert_eq!(next_run_after(&def, tz(SAO_PAULO), now), utc(2025, 3, 16, 21, 0));
        assert_eq!(next_run_from(&def, tz(SAO_PAULO), now), utc(2025, 3, 15, 21, 0));
    }

    #[test]
    fn from_skips_todays_time_once_passed() {
        let def = definition(Frequency::Weekly, 6, 0, &[6], SAO_PAULO);
        // Saturday 09:00 local, after 06:00
        let next = next_run_from(&def, tz(SAO_PAULO), utc(2025, 3, 15, 12, 0));
        assert_eq!(next, utc(2025, 3, 22, 9, 0));
    }

    #[test]
    fn dst_gap_resolves_to_first_valid_instant() {
        // New York springs forward on 2025-03-09: 02:00 jumps to 03:00
        let def = definition(Frequency::Daily, 2, 30, &[0], "America/New_York");
        let next = next_run_after(&def, tz("America/New_York"), utc(2025, 3, 8, 17, 0));
        // 03:00 EDT
        assert_eq!(next, utc(2025, 3, 9, 7, 0));
    }

    #[test]
    fn time_match_window() {
        let def = definition(Frequency::Daily, 6, 0, &[6], SAO_PAULO);
        let tz = tz(SAO_PAULO);
        assert!(time_matches(&def, tz, utc(2025, 3, 15, 9, 0), 15));
        assert!(time_matches(&def, tz, utc(2025, 3, 15, 9, 14), 15));
        assert!(!time_matches(&def, tz, utc(2025, 3, 15, 9, 15), 15));
        assert!(!time_matches(&def, tz, utc(2025, 3, 15, 8, 59), 15));
        // Right time, wrong weekday
        assert!(!time_matches(&def, tz, utc(2025, 3, 16, 9, 5), 15));
    }

    #[test]
    fn hourly_time_match_wraps_the_hour() {
        let def = definition(Frequency::Hourly, 0, 55, &[6], SAO_PAULO);
        assert!(time_matches(&def, tz(SAO_PAULO), utc(2025, 3, 15, 14, 3), 15));
        assert!(!time_matches(&def, tz(SAO_PAULO), utc(2025, 3, 15, 14, 20), 15));
    }

    #[test]
    fn unknown_timezones_are_rejected_on_write_and_defaulted_on_read() {
        assert!(parse_timezone("Mars/Olympus").is_err());
        assert_eq!(resolve_timezone("Mars/Olympus", SAO_PAULO), tz(SAO_PAULO));
        assert_eq!(resolve_timezone("Europe/Lisbon", SAO_PAULO), tz("Europe/Lisbon"));
    }

    #[test]
    fn request_validation() {
        let base = || UpsertScheduleRequest {
            enabled: true,
            frequency: Frequency::Daily,
            hour: 6,
            minute: 0,
            days_of_week: vec![5, 1, 1],
            timezone: None,
            params: Attributes::new(),
        };

        let def = definition_from_request(WorkflowKind::Analysis, base(), SAO_PAULO).unwrap();
        assert_eq!(def.days_of_week, vec![1, 5]);
        assert_eq!(def.timezone, SAO_PAULO);

        let bad_hour = UpsertScheduleRequest { hour: 24, ..base() };
        assert!(definition_from_request(WorkflowKind::Analysis, bad_hour, SAO_PAULO).is_err());

        let bad_day = UpsertScheduleRequest { days_of_week: vec![7], ..base() };
        assert!(definition_from_request(WorkflowKind::Analysis, bad_day, SAO_PAULO).is_err());

        let bad_tz = UpsertScheduleRequest { timezone: Some("Nowhere".into()), ..base() };
        assert!(definition_from_request(WorkflowKind::Analysis, bad_tz, SAO_PAULO).is_err());
    }

    #[tokio::test]
    async fn sweep_triggers_skips_and_records() {
        let h = harness();
        let now = Utc::now();
        let tenant = Uuid::new_v4();

        // Null next_run_at: due immediately
        let every_day = definition(Frequency::Daily, 6, 0, &[0, 1, 2, 3, 4, 5, 6], SAO_PAULO);
        let schedule = h.state.store.upsert_schedule(tenant, every_day, None).await.unwrap();

        // Far in the future and outside its window: not due
        let mut later = definition(Frequency::Daily, 6, 0, &[0, 1, 2, 3, 4, 5, 6], SAO_PAULO);
        later.workflow = WorkflowKind::Analysis;
        let local = now.with_timezone(&tz(SAO_PAULO));
        later.hour = (local.hour() + 12) % 24;
        h.state
            .store
            .upsert_schedule(tenant, later, Some(now + Duration::days(1)))
            .await
            .unwrap();

        let summary = run_due_schedules(&h.state, now).await.unwrap();
        assert_eq!(summary.checked, 1);
        assert_eq!(summary.triggered, 1);
        assert_eq!(summary.results[0].workflow, WorkflowKind::Ingestion);

        let stored = &h.state.store.list_schedules(tenant).await.unwrap();
        let ingestion = stored.iter().find(|s| s.id == schedule.id).unwrap();
        assert_eq!(ingestion.run_count, 1);
        assert_eq!(ingestion.last_status.as_deref(), Some("SUCCESS"));
        assert_eq!(ingestion.last_run_at, Some(now));
        assert!(ingestion.next_run_at.unwrap() > now);

        // Force it due again while the first execution is still running
        h.state
            .store
            .record_schedule_outcome(schedule.id, now, &ScheduleOutcome::Triggered { next_run_at: now })
            .await
            .unwrap();
        let summary = run_due_schedules(&h.state, now).await.unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(h.engine.started().len(), 1);

        let stored = h.state.store.list_schedules(tenant).await.unwrap();
        let ingestion = stored.iter().find(|s| s.id == schedule.id).unwrap();
        assert!(ingestion.last_status.as_deref().unwrap().starts_with("SKIPPED"));
        assert!(ingestion.next_run_at.unwrap() > now);
    }

    #[tokio::test]
    async fn failed_sweep_dispatch_keeps_next_run() {
        let h = harness();
        h.engine.set_failing(true);
        let now = Utc::now();
        let tenant = Uuid::new_v4();

        let def = definition(Frequency::Daily, 6, 0, &[0, 1, 2, 3, 4, 5, 6], SAO_PAULO);
        let due_at = now - Duration::minutes(1);
        let schedule = h.state.store.upsert_schedule(tenant, def, Some(due_at)).await.unwrap();

        let summary = run_due_schedules(&h.state, now).await.unwrap();
        assert_eq!(summary.errors, 1);
        assert!(summary.results[0].error.is_some());

        let stored = h.state.store.list_schedules(tenant).await.unwrap();
        let failed = stored.iter().find(|s| s.id == schedule.id).unwrap();
        assert!(failed.last_status.as_deref().unwrap().starts_with("ERROR: "));
        assert_eq!(failed.next_run_at, Some(due_at));
        assert_eq!(failed.run_count, 0);

        assert!(h.state.store.list_executions(tenant, None, true, 5).await.unwrap().is_empty());
        let finished = h.state.store.list_executions(tenant, None, false, 5).await.unwrap();
        assert_eq!(finished[0].status, ExecutionStatus::Error);

        // Engine back: the next tick retries instead of skipping as already running
        h.engine.set_failing(false);
        let later = now + Duration::minutes(15);
        let summary = run_due_schedules(&h.state, later).await.unwrap();
        assert_eq!((summary.triggered, summary.skipped, summary.errors), (1, 0, 0));
        assert_eq!(h.engine.started().len(), 1);

        let stored = h.state.store.list_schedules(tenant).await.unwrap();
        let retried = stored.iter().find(|s| s.id == schedule.id).unwrap();
        assert_eq!(retried.run_count, 1);
        assert_eq!(retried.last_status.as_deref(), Some("SUCCESS"));
        assert!(retried.next_run_at.unwrap() > later);
    }

    #[tokio::test]
    async fn disabled_schedules_have_no_next_run() {
        let h = harness();
        let tenant = Uuid::new_v4();
        let request = UpsertScheduleRequest {
            enabled: false,
            frequency: Frequency::Daily,
            hour: 6,
            minute: 0,
            days_of_week: vec![1],
            timezone: None,
            params: Attributes::new(),
        };

        let schedule = upsert_schedule(&h.state, tenant, WorkflowKind::Analysis, request).await.unwrap();
        assert!(schedule.next_run_at.is_none());
        assert!(!is_due(&schedule, tz(SAO_PAULO), Utc::now(), 15));
    }
}
