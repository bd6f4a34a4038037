//! API key gateway for the public API.
//!
//! Every `/api/v1` request passes through [`authenticate`] before its handler:
//! 1. Extract the key from `Authorization: Bearer` or `X-API-Key`
//! 2. Hash it and look it up
//! 3. Reject disabled, expired or under-scoped keys
//! 4. Apply the per-minute and per-day rate limits
//! 5. Inject [`ApiKeyContext`] and [`CallMeta`] into the request
//!
//! The gateway never touches credits; billed handlers do that themselves once
//! they know the call succeeded.

use std::net::SocketAddr;
use std::time::Instant;

use axum::{
    extract::{ConnectInfo, MatchedPath, Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::api_key::Permission;
use crate::services::{api_keys, rate_limit};
use crate::state::AppState;

/// Authentication context attached to authenticated requests.
///
/// Handlers extract it with `Extension<ApiKeyContext>`; every query they run is
/// scoped to `tenant_id`.
#[derive(Debug, Clone)]
pub struct ApiKeyContext {
    pub key_id: Uuid,
    pub tenant_id: Uuid,
    pub permissions: Vec<Permission>,
    pub rate_limit_per_minute: i32,
    pub rate_limit_per_day: i32,
}

/// What the usage log needs to know about the call.
#[derive(Debug, Clone)]
pub struct CallMeta {
    /// Route template with the method, e.g. `GET /api/v1/tenders/{id}`
    pub endpoint: String,
    pub method: String,
    pub ip_address: String,
    pub user_agent: String,
    pub started: Instant,
}

impl CallMeta {
    fn from_request(request: &Request) -> Self {
        let method = request.method().as_str().to_string();
        let path = request
            .extensions()
            .get::<MatchedPath>()
            .map(|p| p.as_str().to_string())
            .unwrap_or_else(|| request.uri().path().to_string());
        let headers = request.headers();

        let ip_address = header_str(headers, "x-forwarded-for")
            .and_then(|v| v.split(',').next())
            .or_else(|| header_str(headers, "x-real-ip"))
            .map(|v| v.trim().to_string())
            .or_else(|| {
                request
                    .extensions()
                    .get::<ConnectInfo<SocketAddr>>()
                    .map(|info| info.0.ip().to_string())
            })
            .unwrap_or_else(|| "unknown".to_string());

        Self {
            endpoint: format!("{method} {path}"),
            method,
            ip_address,
            user_agent: header_str(headers, "user-agent").unwrap_or("unknown").to_string(),
            started: Instant::now(),
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|h| h.to_str().ok())
}

/// Raw key from `Authorization: Bearer <key>`, falling back to `X-API-Key`.
pub fn presented_key(headers: &HeaderMap) -> Option<&str> {
    header_str(headers, "authorization")
        .and_then(|h| h.strip_prefix("Bearer "))
        .or_else(|| header_str(headers, "x-api-key"))
        .map(str::trim)
        .filter(|k| !k.is_empty())
}

/// Run the gateway checks for one request.
///
/// # Errors
///
/// - `ApiKeyRequired` / `InvalidApiKey`: 401
/// - `ApiKeyDisabled` / `ApiKeyExpired` / `InsufficientPermissions`: 403
/// - `RateLimited`: 429
pub async fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
    required: Permission,
) -> Result<ApiKeyContext, AppError> {
    let raw_key = presented_key(headers).ok_or(AppError::ApiKeyRequired)?;

    let key = state
        .store
        .find_api_key_by_hash(&api_keys::hash_api_key(raw_key))
        .await?
        .ok_or(AppError::InvalidApiKey)?;

    let now = Utc::now();
    if !key.is_active {
        return Err(AppError::ApiKeyDisabled);
    }
    if key.is_expired(now) {
        return Err(AppError::ApiKeyExpired);
    }
    if !key.has_permission(required) {
        return Err(AppError::InsufficientPermissions(required));
    }

    rate_limit::enforce(state.store.as_ref(), &key, now).await?;

    // Best effort; a failed touch must not fail the request
    let store = state.store.clone();
    let key_id = key.id;
    tokio::spawn(async move {
        if let Err(e) = store.touch_api_key(key_id, now).await {
            tracing::warn!(key_id = %key_id, error = %e, "failed to update last_used_at");
        }
    });

    Ok(ApiKeyContext {
        key_id: key.id,
        tenant_id: key.tenant_id,
        permissions: key.permissions,
        rate_limit_per_minute: key.rate_limit_per_minute,
        rate_limit_per_day: key.rate_limit_per_day,
    })
}

async fn gate(state: AppState, required: Permission, mut request: Request, next: Next) -> Result<Response, AppError> {
    let meta = CallMeta::from_request(&request);
    let context = authenticate(&state, request.headers(), required).await?;

    tracing::debug!(
        key_id = %context.key_id,
        tenant_id = %context.tenant_id,
        endpoint = %meta.endpoint,
        "api key accepted"
    );

    request.extensions_mut().insert(context);
    request.extensions_mut().insert(meta);
    Ok(next.run(request).await)
}

/// Gateway for routes that need the `read` permission.
pub async fn require_read(State(state): State<AppState>, request: Request, next: Next) -> Result<Response, AppError> {
    gate(state, Permission::Read, request, next).await
}

/// Gateway for routes that need the `write` permission.
pub async fn require_write(State(state): State<AppState>, request: Request, next: Next) -> Result<Response, AppError> {
    gate(state, Permission::Write, request, next).await
}

/// Gateway for routes that need the `trigger` permission.
pub async fn require_trigger(State(state): State<AppState>, request: Request, next: Next) -> Result<Response, AppError> {
    gate(state, Permission::Trigger, request, next).await
}
