//! Shared-secret authentication for the dashboard, the cron trigger and the engine.
//!
//! The dashboard authenticates its users itself and calls `/internal` routes
//! with `Authorization: Bearer <DASHBOARD_SECRET>` plus the tenant, user and
//! role it is acting for. The tenant is per-request context, never process
//! state. Without a configured `DASHBOARD_SECRET` every `/internal` request is
//! refused.
//!
//! Tokens are compared in constant time.

use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

/// Dashboard role of the acting user, from `X-User-Role`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    SuperAdmin,
    Admin,
    #[default]
    Member,
}

impl Role {
    /// Unknown or missing roles get no privileges.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_uppercase().as_str() {
            "SUPER_ADMIN" => Role::SuperAdmin,
            "ADMIN" => Role::Admin,
            _ => Role::Member,
        }
    }

    pub fn is_admin(self) -> bool {
        matches!(self, Role::SuperAdmin | Role::Admin)
    }
}

/// Who a dashboard request acts for.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub tenant_id: Uuid,
    pub user_id: String,
    pub role: Role,
}

impl SessionContext {
    /// Tenant admins and platform admins.
    pub fn require_admin(&self) -> Result<(), AppError> {
        if self.role.is_admin() {
            Ok(())
        } else {
            Err(AppError::Forbidden("admin"))
        }
    }

    /// Platform-wide operations such as pricing and granting credits.
    pub fn require_super_admin(&self) -> Result<(), AppError> {
        if self.role == Role::SuperAdmin {
            Ok(())
        } else {
            Err(AppError::Forbidden("super admin"))
        }
    }
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
}

fn token_is(headers: &HeaderMap, secret: &str) -> bool {
    bearer(headers).is_some_and(|token| bool::from(token.as_bytes().ct_eq(secret.as_bytes())))
}

/// Whether the request carries `expected` as its bearer token.
///
/// An unset secret accepts every request; startup logs a warning for it.
pub fn secret_matches(headers: &HeaderMap, expected: Option<&str>) -> bool {
    match expected {
        None => true,
        Some(secret) => token_is(headers, secret),
    }
}

/// Read the acting tenant, user and role from `X-Tenant-Id`, `X-User-Id` and
/// `X-User-Role`.
pub fn session_from_headers(headers: &HeaderMap) -> Result<SessionContext, AppError> {
    let tenant_id = headers
        .get("x-tenant-id")
        .and_then(|h| h.to_str().ok())
        .and_then(|v| Uuid::parse_str(v.trim()).ok())
        .ok_or(AppError::Unauthorized)?;

    let user_id = headers
        .get("x-user-id")
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or(AppError::Unauthorized)?
        .to_string();

    let role = headers
        .get("x-user-role")
        .and_then(|h| h.to_str().ok())
        .map(Role::parse)
        .unwrap_or_default();

    Ok(SessionContext { tenant_id, user_id, role })
}

pub async fn require_session(State(state): State<AppState>, mut request: Request, next: Next) -> Result<Response, AppError> {
    let Some(secret) = state.config.dashboard_secret.as_deref() else {
        tracing::warn!(path = %request.uri().path(), "DASHBOARD_SECRET not set, internal request refused");
        return Err(AppError::Unauthorized);
    };
    if !token_is(request.headers(), secret) {
        tracing::warn!(path = %request.uri().path(), "dashboard secret rejected");
        return Err(AppError::Unauthorized);
    }

    let session = session_from_headers(request.headers())?;
    request.extensions_mut().insert(session);
    Ok(next.run(request).await)
}

pub async fn require_cron_secret(State(state): State<AppState>, request: Request, next: Next) -> Result<Response, AppError> {
    if !secret_matches(request.headers(), state.config.cron_secret.as_deref()) {
        tracing::warn!("cron secret rejected");
        return Err(AppError::Unauthorized);
    }
    Ok(next.run(request).await)
}

pub async fn require_engine_secret(State(state): State<AppState>, request: Request, next: Next) -> Result<Response, AppError> {
    if !secret_matches(request.headers(), state.config.engine_secret.as_deref()) {
        tracing::warn!(path = %request.uri().path(), "engine secret rejected");
        return Err(AppError::Unauthorized);
    }
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn unset_secret_accepts_anything() {
        assert!(secret_matches(&HeaderMap::new(), None));
    }

    #[test]
    fn configured_secret_must_match() {
        let mut headers = HeaderMap::new();
        assert!(!secret_matches(&headers, Some("s3cret")));

        headers.insert("authorization", HeaderValue::from_static("Bearer wrong"));
        assert!(!secret_matches(&headers, Some("s3cret")));

        headers.insert("authorization", HeaderValue::from_static("Bearer s3cre"));
        assert!(!secret_matches(&headers, Some("s3cret")));

        headers.insert("authorization", HeaderValue::from_static("Bearer s3cret"));
        assert!(secret_matches(&headers, Some("s3cret")));
    }

    #[test]
    fn roles_default_to_member() {
        assert_eq!(Role::parse("super_admin"), Role::SuperAdmin);
        assert_eq!(Role::parse(" ADMIN "), Role::Admin);
        assert_eq!(Role::parse("owner"), Role::Member);
        assert!(!Role::Member.is_admin());

        let session = SessionContext {
            tenant_id: Uuid::new_v4(),
            user_id: "user-1".into(),
            role: Role::Admin,
        };
        assert!(session.require_admin().is_ok());
        assert!(matches!(session.require_super_admin(), Err(AppError::Forbidden(_))));
    }

    #[test]
    fn session_needs_tenant_and_user() {
        let mut headers = HeaderMap::new();
        headers.insert("x-user-id", HeaderValue::from_static("user-1"));
        assert!(matches!(session_from_headers(&headers), Err(AppError::Unauthorized)));

        headers.insert("x-tenant-id", HeaderValue::from_static("not-a-uuid"));
        assert!(session_from_headers(&headers).is_err());

        let tenant = Uuid::new_v4();
        headers.insert("x-tenant-id", HeaderValue::from_str(&tenant.to_string()).unwrap());
        let session = session_from_headers(&headers).unwrap();
        assert_eq!(session.tenant_id, tenant);
        assert_eq!(session.user_id, "user-1");
        assert_eq!(session.role, Role::Member);

        headers.insert("x-user-role", HeaderValue::from_static("SUPER_ADMIN"));
        assert_eq!(session_from_headers(&headers).unwrap().role, Role::SuperAdmin);
    }
}
