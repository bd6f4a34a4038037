//! Dashboard endpoints under `/internal`.
//!
//! Every handler acts for the tenant in [`SessionContext`]; nothing here is
//! rate limited or billed. Granting credits and pricing need the super admin
//! role, the LLM usage report needs an admin.

use axum::{
    Extension, Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
};
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::handlers::public::{ExecutionQuery, parse_workflow, trigger_params};
use crate::middleware::session::SessionContext;
use crate::models::api_key::{ApiKeyResponse, CreateApiKeyRequest, CreatedApiKeyResponse, RevokeApiKeyRequest};
use crate::models::credit::{CreditSummary, PricingRequest, TopUpRequest};
use crate::models::execution::{ExecutionStatusResponse, TriggerSource, WorkflowExecution};
use crate::models::llm_usage::LlmUsageSummary;
use crate::models::schedule::{CronSchedule, UpsertScheduleRequest};
use crate::services::dispatcher::{self, DispatchCommand};
use crate::services::{api_keys, ledger, scheduler, tracker};
use crate::state::AppState;

/// `GET /internal/api-keys`
pub async fn list_api_keys(
    State(state): State<AppState>,
    Extension(session): Extension<SessionContext>,
) -> Result<Json<Vec<ApiKeyResponse>>, AppError> {
    Ok(Json(api_keys::list_keys(&state, session.tenant_id).await?))
}

/// Create a key for the session's tenant.
///
/// # Endpoint
///
/// `POST /internal/api-keys`
///
/// # Response (201 Created)
///
/// The raw `key` appears in this response only.
pub async fn create_api_key(
    State(state): State<AppState>,
    Extension(session): Extension<SessionContext>,
    Json(request): Json<CreateApiKeyRequest>,
) -> Result<(StatusCode, Json<CreatedApiKeyResponse>), AppError> {
    let created = api_keys::create_key(&state, session.tenant_id, request).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// `DELETE /internal/api-keys/{id}?action=deactivate`
pub async fn revoke_api_key(
    State(state): State<AppState>,
    Extension(session): Extension<SessionContext>,
    Path(id): Path<Uuid>,
    Query(query): Query<RevokeApiKeyRequest>,
) -> Result<StatusCode, AppError> {
    let soft = query.action.as_deref() == Some("deactivate");
    api_keys::revoke_key(&state, session.tenant_id, id, soft).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_schedules(
    State(state): State<AppState>,
    Extension(session): Extension<SessionContext>,
) -> Result<Json<Vec<CronSchedule>>, AppError> {
    Ok(Json(state.store.list_schedules(session.tenant_id).await?))
}

pub async fn upsert_schedule(
    State(state): State<AppState>,
    Extension(session): Extension<SessionContext>,
    Path(workflow): Path<String>,
    Json(request): Json<UpsertScheduleRequest>,
) -> Result<Json<CronSchedule>, AppError> {
    let workflow = parse_workflow(&workflow)?;
    let schedule = scheduler::upsert_schedule(&state, session.tenant_id, workflow, request).await?;
    Ok(Json(schedule))
}

pub async fn delete_schedule(
    State(state): State<AppState>,
    Extension(session): Extension<SessionContext>,
    Path(workflow): Path<String>,
) -> Result<StatusCode, AppError> {
    let workflow = parse_workflow(&workflow)?;
    scheduler::delete_schedule(&state, session.tenant_id, workflow).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Manual trigger from the dashboard, recorded with the acting user.
///
/// `POST /internal/workflows/{workflow}/trigger`
pub async fn trigger(
    State(state): State<AppState>,
    Extension(session): Extension<SessionContext>,
    Path(workflow): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<WorkflowExecution>), AppError> {
    let workflow = parse_workflow(&workflow)?;
    let execution = dispatcher::dispatch(
        &state,
        DispatchCommand {
            tenant_id: session.tenant_id,
            workflow,
            source: TriggerSource::Manual,
            triggered_by: Some(session.user_id),
            params: trigger_params(&body)?,
        },
    )
    .await?;
    Ok((StatusCode::ACCEPTED, Json(execution)))
}

pub async fn executions(
    State(state): State<AppState>,
    Extension(session): Extension<SessionContext>,
    Query(query): Query<ExecutionQuery>,
) -> Result<Json<ExecutionStatusResponse>, AppError> {
    let status = tracker::status(&state, session.tenant_id, query.workflow()?).await?;
    Ok(Json(status))
}

/// `POST /internal/executions/{id}/cancel`
pub async fn cancel_execution(
    State(state): State<AppState>,
    Extension(session): Extension<SessionContext>,
    Path(id): Path<Uuid>,
) -> Result<Json<WorkflowExecution>, AppError> {
    let execution = tracker::cancel(&state, session.tenant_id, id, &session.user_id).await?;
    Ok(Json(execution))
}

pub async fn credits(
    State(state): State<AppState>,
    Extension(session): Extension<SessionContext>,
) -> Result<Json<CreditSummary>, AppError> {
    let account = state.store.credit_account(session.tenant_id).await?;
    Ok(Json(CreditSummary::from(account)))
}

/// `POST /internal/credits/top-up` with `{ "amount": 500 }`. Super admins only.
pub async fn top_up(
    State(state): State<AppState>,
    Extension(session): Extension<SessionContext>,
    Json(request): Json<TopUpRequest>,
) -> Result<Json<CreditSummary>, AppError> {
    session.require_super_admin()?;
    let account = ledger::top_up(state.store.as_ref(), session.tenant_id, request.amount).await?;
    tracing::info!(user_id = %session.user_id, tenant_id = %session.tenant_id, amount = request.amount, "credits granted");
    Ok(Json(CreditSummary::from(Some(account))))
}

/// `PUT /internal/pricing` with `{ "endpoint": "GET /api/v1/stats", "credits_per_call": 2 }`
///
/// Prices are global, so only super admins may change them.
pub async fn set_pricing(
    State(state): State<AppState>,
    Extension(session): Extension<SessionContext>,
    Json(request): Json<PricingRequest>,
) -> Result<StatusCode, AppError> {
    session.require_super_admin()?;
    ledger::set_price(state.store.as_ref(), &request.endpoint, request.credits_per_call).await?;
    tracing::info!(
        user_id = %session.user_id,
        endpoint = %request.endpoint,
        credits_per_call = request.credits_per_call,
        "endpoint price updated"
    );
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Default, Deserialize)]
pub struct LlmUsageQuery {
    /// Another tenant to report on; super admins only
    #[serde(default)]
    pub tenant_id: Option<Uuid>,
}

/// LLM token spend reported by the engine.
///
/// # Endpoint
///
/// `GET /internal/llm-usage`, or `GET /internal/llm-usage?tenant_id=...` for a
/// super admin looking at another tenant. Needs an admin role.
pub async fn llm_usage(
    State(state): State<AppState>,
    Extension(session): Extension<SessionContext>,
    Query(query): Query<LlmUsageQuery>,
) -> Result<Json<LlmUsageSummary>, AppError> {
    session.require_admin()?;
    let tenant_id = match query.tenant_id {
        Some(other) if other != session.tenant_id => {
            session.require_super_admin()?;
            other
        }
        _ => session.tenant_id,
    };
    let summary = ledger::llm_usage_summary(state.store.as_ref(), tenant_id, Utc::now()).await?;
    Ok(Json(summary))
}
