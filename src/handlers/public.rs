//! Public, API-key authenticated endpoints under `/api/v1`.
//!
//! Billed handlers follow the same three steps: [`ledger::preflight`] before
//! any work, the query itself, then [`ledger::settle`]. The trigger endpoint
//! instead debits before the engine is called, see [`dispatcher`]. A
//! successful billed response carries `X-Credits-Consumed`,
//! `X-Credits-Remaining` and `X-RateLimit-Limit`.

use axum::{
    Extension, Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::middleware::api_key::{ApiKeyContext, CallMeta};
use crate::models::attributes::Attributes;
use crate::models::credit::Charge;
use crate::models::execution::{ExecutionStatusResponse, TriggerSource, WorkflowKind};
use crate::models::schedule::UpsertScheduleRequest;
use crate::models::tender::{Pagination, TenderPage, TenderQuery};
use crate::models::usage::UsageResponse;
use crate::services::dispatcher::{self, Billing, DispatchCommand};
use crate::services::{ledger, scheduler, tracker};
use crate::state::AppState;

/// Query string of the execution status endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct ExecutionQuery {
    #[serde(default)]
    pub workflow: Option<String>,
}

impl ExecutionQuery {
    pub fn workflow(&self) -> Result<Option<WorkflowKind>, AppError> {
        self.workflow.as_deref().map(parse_workflow).transpose()
    }
}

/// Optional body of the trigger endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct TriggerRequest {
    #[serde(default)]
    pub params: Attributes,
}

pub fn parse_workflow(value: &str) -> Result<WorkflowKind, AppError> {
    WorkflowKind::parse(value).ok_or_else(|| AppError::InvalidRequest(format!("Unknown workflow '{value}'")))
}

/// Trigger params from an optional JSON body. An empty body means no params.
pub fn trigger_params(body: &Bytes) -> Result<Attributes, AppError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Attributes::new());
    }
    serde_json::from_slice::<TriggerRequest>(body)
        .map(|r| r.params)
        .map_err(|e| AppError::InvalidRequest(format!("Invalid trigger body: {e}")))
}

/// Attach the metering headers to a billed response.
fn billed(ctx: &ApiKeyContext, charge: Charge, body: impl IntoResponse) -> Response {
    let mut response = body.into_response();
    let headers = response.headers_mut();
    headers.insert("x-credits-consumed", HeaderValue::from(charge.consumed));
    headers.insert("x-credits-remaining", HeaderValue::from(charge.remaining));
    headers.insert("x-ratelimit-limit", HeaderValue::from(ctx.rate_limit_per_minute));
    response
}

/// List the tenant's tenders.
///
/// # Endpoint
///
/// `GET /api/v1/tenders?page=1&limit=20&status=NEW&state=SP&search=lighting`
///
/// # Response
///
/// - **200**: `{ "data": [...], "pagination": { page, limit, total, total_pages } }`
/// - **402**: not enough credits, nothing charged
pub async fn list_tenders(
    State(state): State<AppState>,
    Extension(ctx): Extension<ApiKeyContext>,
    Extension(meta): Extension<CallMeta>,
    Query(query): Query<TenderQuery>,
) -> Result<Response, AppError> {
    let store = state.store.as_ref();
    let price = ledger::preflight(store, &ctx, &meta).await?;

    let (data, total) = store.list_tenders(ctx.tenant_id, &query).await?;
    let page = TenderPage {
        data,
        pagination: Pagination::new(query.page(), query.limit(), total),
    };

    let charge = ledger::settle(store, &ctx, &meta, price).await?;
    Ok(billed(&ctx, charge, Json(page)))
}

/// `GET /api/v1/tenders/{id}`. Another tenant's tender is a 404, and is not billed.
pub async fn get_tender(
    State(state): State<AppState>,
    Extension(ctx): Extension<ApiKeyContext>,
    Extension(meta): Extension<CallMeta>,
    Path(id): Path<Uuid>,
) -> Result<Response, AppError> {
    let store = state.store.as_ref();
    let price = ledger::preflight(store, &ctx, &meta).await?;

    let tender = store
        .get_tender(ctx.tenant_id, id)
        .await?
        .ok_or(AppError::NotFound("Tender"))?;

    let charge = ledger::settle(store, &ctx, &meta, price).await?;
    Ok(billed(&ctx, charge, Json(tender)))
}

pub async fn stats(
    State(state): State<AppState>,
    Extension(ctx): Extension<ApiKeyContext>,
    Extension(meta): Extension<CallMeta>,
) -> Result<Response, AppError> {
    let store = state.store.as_ref();
    let price = ledger::preflight(store, &ctx, &meta).await?;
    let stats = store.tender_stats(ctx.tenant_id).await?;
    let charge = ledger::settle(store, &ctx, &meta, price).await?;
    Ok(billed(&ctx, charge, Json(stats)))
}

/// `GET /api/v1/usage`. Not billed.
pub async fn usage(
    State(state): State<AppState>,
    Extension(ctx): Extension<ApiKeyContext>,
) -> Result<Json<UsageResponse>, AppError> {
    let summary = ledger::usage_summary(state.store.as_ref(), &ctx, chrono::Utc::now()).await?;
    Ok(Json(summary))
}

/// `GET /api/v1/executions?workflow=ANALYSIS`. Not billed.
pub async fn executions(
    State(state): State<AppState>,
    Extension(ctx): Extension<ApiKeyContext>,
    Query(query): Query<ExecutionQuery>,
) -> Result<Json<ExecutionStatusResponse>, AppError> {
    let status = tracker::status(&state, ctx.tenant_id, query.workflow()?).await?;
    Ok(Json(status))
}

/// Create or replace the tenant's schedule.
///
/// # Endpoint
///
/// `PUT /api/v1/schedules/{workflow}` with an [`UpsertScheduleRequest`] body.
/// Needs the `write` permission.
pub async fn upsert_schedule(
    State(state): State<AppState>,
    Extension(ctx): Extension<ApiKeyContext>,
    Extension(meta): Extension<CallMeta>,
    Path(workflow): Path<String>,
    Json(request): Json<UpsertScheduleRequest>,
) -> Result<Response, AppError> {
    let workflow = parse_workflow(&workflow)?;
    let price = ledger::preflight(state.store.as_ref(), &ctx, &meta).await?;

    let schedule = scheduler::upsert_schedule(&state, ctx.tenant_id, workflow, request).await?;

    let charge = ledger::settle(state.store.as_ref(), &ctx, &meta, price).await?;
    Ok(billed(&ctx, charge, Json(schedule)))
}

/// Start a workflow run.
///
/// # Endpoint
///
/// `POST /api/v1/workflows/{workflow}/trigger`, optional body `{ "params": {...} }`.
/// Needs the `trigger` permission.
///
/// # Response
///
/// - **202**: the execution, already `RUNNING`
/// - **402**: not enough credits; the engine is not called
/// - **409**: a run of this workflow is still in flight, nothing charged
/// - **502**: the engine rejected the webhook, the debit is refunded
pub async fn trigger(
    State(state): State<AppState>,
    Extension(ctx): Extension<ApiKeyContext>,
    Extension(meta): Extension<CallMeta>,
    Path(workflow): Path<String>,
    body: Bytes,
) -> Result<Response, AppError> {
    let workflow = parse_workflow(&workflow)?;
    let params = trigger_params(&body)?;
    let price = ledger::preflight(state.store.as_ref(), &ctx, &meta).await?;

    let (execution, charge) = dispatcher::dispatch_billed(
        &state,
        DispatchCommand {
            tenant_id: ctx.tenant_id,
            workflow,
            source: TriggerSource::Api,
            triggered_by: Some(ctx.key_id.to_string()),
            params,
        },
        Some(Billing {
            ctx: &ctx,
            meta: &meta,
            price,
        }),
    )
    .await?;

    let response = (StatusCode::ACCEPTED, Json(execution));
    match charge {
        Some(charge) => Ok(billed(&ctx, charge, response)),
        None => Ok(response.into_response()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_trigger_body_means_no_params() {
        assert!(trigger_params(&Bytes::new()).unwrap().is_empty());
        assert!(trigger_params(&Bytes::from_static(b"  \n")).unwrap().is_empty());
    }

    #[test]
    fn trigger_params_must_be_flat() {
        let params = trigger_params(&Bytes::from_static(br#"{"params":{"lookback_days":3}}"#)).unwrap();
        assert_eq!(params.len(), 1);

        let err = trigger_params(&Bytes::from_static(br#"{"params":{"nested":{"a":1}}}"#)).unwrap_err();
        assert!(matches!(err, AppError::InvalidRequest(_)));
    }

    #[test]
    fn workflow_names_are_validated() {
        assert_eq!(parse_workflow("ingestion").unwrap(), WorkflowKind::Ingestion);
        assert!(parse_workflow("reports").is_err());
    }
}
