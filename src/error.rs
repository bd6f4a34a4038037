//! Error types and HTTP error response handling.
//!
//! This module defines all application errors and how they are converted
//! into HTTP responses with appropriate status codes and JSON bodies.

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::{Map, Value, json};

use crate::models::api_key::Permission;
use crate::models::execution::WorkflowKind;
use crate::services::rate_limit::RateWindow;
use crate::store::StoreError;

/// Application-wide error type.
///
/// Each variant maps to one HTTP status code and one stable error `code`
/// string that clients can match on.
///
/// # Error Categories
///
/// - **Authentication**: missing, unknown, disabled or expired API keys, and
///   failed shared-secret checks
/// - **Metering**: rate limits and insufficient credits
/// - **Workflow**: duplicate executions and engine dispatch failures
/// - **Storage**: anything the store backend reports
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Storage backend failed. Details are logged, never returned.
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    /// No key in `Authorization: Bearer` or `X-API-Key`.
    #[error("API key required")]
    ApiKeyRequired,

    #[error("Invalid API key")]
    InvalidApiKey,

    #[error("API key is disabled")]
    ApiKeyDisabled,

    #[error("API key has expired")]
    ApiKeyExpired,

    #[error("API key lacks the '{0}' permission")]
    InsufficientPermissions(Permission),

    /// Shared-secret check failed on a cron, engine or dashboard route.
    #[error("Unauthorized")]
    Unauthorized,

    /// The dashboard user's role is not allowed to do this.
    #[error("Requires the {0} role")]
    Forbidden(&'static str),

    /// Returns HTTP 429 with a `Retry-After` header.
    #[error("Rate limit exceeded: {limit} requests per {window}")]
    RateLimited { window: RateWindow, limit: i32 },

    /// Returns HTTP 402. The body carries the balance and the price.
    #[error("Insufficient credits")]
    InsufficientCredits { balance: i64, required: i64 },

    #[error("Workflow {0} is already running")]
    AlreadyRunning(WorkflowKind),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("API key limit of {0} reached")]
    KeyLimitReached(i64),

    /// The engine rejected or never answered the webhook.
    #[error("Workflow dispatch failed: {0}")]
    Dispatch(String),

    #[error("Invalid request")]
    InvalidRequest(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::ApiKeyRequired | AppError::InvalidApiKey | AppError::Unauthorized => {
                StatusCode::UNAUTHORIZED
            }
            AppError::ApiKeyDisabled
            | AppError::ApiKeyExpired
            | AppError::InsufficientPermissions(_)
            | AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::InsufficientCredits { .. } => StatusCode::PAYMENT_REQUIRED,
            AppError::AlreadyRunning(_) => StatusCode::CONFLICT,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::KeyLimitReached(_) | AppError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Dispatch(_) => StatusCode::BAD_GATEWAY,
            AppError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AppError::Store(_) => "internal_error",
            AppError::ApiKeyRequired => "api_key_required",
            AppError::InvalidApiKey => "invalid_api_key",
            AppError::ApiKeyDisabled => "api_key_disabled",
            AppError::ApiKeyExpired => "api_key_expired",
            AppError::InsufficientPermissions(_) => "insufficient_permissions",
            AppError::Unauthorized => "unauthorized",
            AppError::Forbidden(_) => "forbidden",
            AppError::RateLimited { .. } => "rate_limit_exceeded",
            AppError::InsufficientCredits { .. } => "insufficient_credits",
            AppError::AlreadyRunning(_) => "workflow_already_running",
            AppError::NotFound(_) => "not_found",
            AppError::KeyLimitReached(_) => "key_limit_reached",
            AppError::Dispatch(_) => "dispatch_failed",
            AppError::InvalidRequest(_) => "invalid_request",
        }
    }
}

/// Convert AppError into an HTTP response.
///
/// # Response Format
///
/// ```json
/// {
///   "error": {
///     "code": "insufficient_credits",
///     "message": "Insufficient credits",
///     "balance": 0,
///     "required": 2
///   }
/// }
/// ```
///
/// Extra fields appear only for metering errors: `retry_after_seconds` on 429,
/// `balance` and `required` on 402.
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();

        let message = match &self {
            AppError::InvalidRequest(msg) => msg.clone(),
            AppError::Store(err) => {
                tracing::error!(error = %err, "storage failure");
                "An internal error occurred".to_string()
            }
            other => other.to_string(),
        };

        let mut error = Map::new();
        error.insert("code".into(), json!(self.code()));
        error.insert("message".into(), json!(message));

        let mut retry_after = None;
        match &self {
            AppError::RateLimited { window, .. } => {
                let secs = window.retry_after_secs();
                error.insert("retry_after_seconds".into(), json!(secs));
                retry_after = Some(secs);
            }
            AppError::InsufficientCredits { balance, required } => {
                error.insert("balance".into(), json!(balance));
                error.insert("required".into(), json!(required));
            }
            _ => {}
        }

        let body = Json(json!({ "error": Value::Object(error) }));
        let mut response = (status, body).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_sets_retry_after() {
        let response = AppError::RateLimited {
            window: RateWindow::Minute,
            limit: 60,
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "60");
    }

    #[test]
    fn status_mapping() {
        assert_eq!(AppError::ApiKeyRequired.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(AppError::ApiKeyExpired.status(), StatusCode::FORBIDDEN);
        assert_eq!(AppError::Forbidden("admin").status(), StatusCode::FORBIDDEN);
        assert_eq!(
            AppError::InsufficientCredits { balance: 0, required: 1 }.status(),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(AppError::AlreadyRunning(WorkflowKind::Analysis).status(), StatusCode::CONFLICT);
        assert_eq!(AppError::Dispatch("timeout".into()).status(), StatusCode::BAD_GATEWAY);
    }
}
