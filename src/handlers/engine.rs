//! Callbacks from the workflow engine.
//!
//! Bodies are parsed by hand so a malformed callback is logged before it is
//! answered with 400; the engine has no other way to surface its mistakes.

use axum::{Json, body::Bytes, extract::State};
use serde::de::DeserializeOwned;

use crate::error::AppError;
use crate::models::execution::{CallbackAck, CompletionCallback, ProgressCallback};
use crate::services::tracker;
use crate::state::AppState;

fn parse_callback<T: DeserializeOwned>(kind: &'static str, body: &Bytes) -> Result<T, AppError> {
    serde_json::from_slice(body).map_err(|e| {
        tracing::warn!(kind, error = %e, "malformed engine callback");
        AppError::InvalidRequest(format!("Invalid {kind} callback: {e}"))
    })
}

/// `POST /api/engine/progress`
pub async fn progress(State(state): State<AppState>, body: Bytes) -> Result<Json<CallbackAck>, AppError> {
    let callback: ProgressCallback = parse_callback("progress", &body)?;
    let ack = tracker::apply_progress(&state, callback).await?;
    Ok(Json(ack))
}

/// `POST /api/engine/callback`
///
/// # Request Body
///
/// ```json
/// { "workflow": "ANALYSIS", "tenant_id": "...", "status": "OK", "metrics": {}, "execution_id": "..." }
/// ```
pub async fn completion(State(state): State<AppState>, body: Bytes) -> Result<Json<CallbackAck>, AppError> {
    let callback: CompletionCallback = parse_callback("completion", &body)?;
    let ack = tracker::complete(&state, callback).await?;
    Ok(Json(ack))
}
