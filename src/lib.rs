//! Workflow Gateway
//!
//! Metered front door for an external workflow engine. Tenants call the public
//! API with API keys that are rate limited and billed in credits, schedule
//! recurring workflow runs, and follow those runs through engine callbacks.
//!
//! # Architecture
//!
//! - **Web Framework**: Axum, with per-group authentication middleware
//! - **Storage**: PostgreSQL through sqlx, or an in-memory store without `DATABASE_URL`
//! - **Engine**: outbound webhooks through reqwest, signed with HMAC-SHA256
//! - **Background**: execution reaper and an optional schedule ticker

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod state;
pub mod store;

#[cfg(test)]
mod test_support;

use axum::{
    Router, middleware as axum_middleware,
    routing::{delete, get, post, put},
};
use tower_http::trace::TraceLayer;

use crate::middleware::{api_key, session};
use crate::state::AppState;

/// Build the full HTTP router.
///
/// Routes are grouped by how they authenticate; each group carries its own
/// `route_layer` so unknown paths fall through to a plain 404.
pub fn build_router(state: AppState) -> Router {
    let read_routes = Router::new()
        .route("/api/v1/tenders", get(handlers::public::list_tenders))
        .route("/api/v1/tenders/{id}", get(handlers::public::get_tender))
        .route("/api/v1/stats", get(handlers::public::stats))
        .route("/api/v1/usage", get(handlers::public::usage))
        .route("/api/v1/executions", get(handlers::public::executions))
        .route_layer(axum_middleware::from_fn_with_state(state.clone(), api_key::require_read));

    let write_routes = Router::new()
        .route("/api/v1/schedules/{workflow}", put(handlers::public::upsert_schedule))
        .route_layer(axum_middleware::from_fn_with_state(state.clone(), api_key::require_write));

    let trigger_routes = Router::new()
        .route("/api/v1/workflows/{workflow}/trigger", post(handlers::public::trigger))
        .route_layer(axum_middleware::from_fn_with_state(state.clone(), api_key::require_trigger));

    let cron_routes = Router::new()
        .route(
            "/api/cron/execute",
            get(handlers::cron::execute).post(handlers::cron::execute),
        )
        .route_layer(axum_middleware::from_fn_with_state(state.clone(), session::require_cron_secret));

    let engine_routes = Router::new()
        .route("/api/engine/callback", post(handlers::engine::completion))
        .route("/api/engine/progress", post(handlers::engine::progress))
        .route_layer(axum_middleware::from_fn_with_state(state.clone(), session::require_engine_secret));

    let internal_routes = Router::new()
        .route(
            "/internal/api-keys",
            get(handlers::internal::list_api_keys).post(handlers::internal::create_api_key),
        )
        .route("/internal/api-keys/{id}", delete(handlers::internal::revoke_api_key))
        .route("/internal/schedules", get(handlers::internal::list_schedules))
        .route(
            "/internal/schedules/{workflow}",
            put(handlers::internal::upsert_schedule).delete(handlers::internal::delete_schedule),
        )
        .route("/internal/workflows/{workflow}/trigger", post(handlers::internal::trigger))
        .route("/internal/executions", get(handlers::internal::executions))
        .route("/internal/executions/{id}/cancel", post(handlers::internal::cancel_execution))
        .route("/internal/credits", get(handlers::internal::credits))
        .route("/internal/credits/top-up", post(handlers::internal::top_up))
        .route("/internal/pricing", put(handlers::internal::set_pricing))
        .route("/internal/llm-usage", get(handlers::internal::llm_usage))
        .route_layer(axum_middleware::from_fn_with_state(state.clone(), session::require_session));

    Router::new()
        .route("/health", get(handlers::health::health_check))
        .merge(read_routes)
        .merge(write_routes)
        .merge(trigger_routes)
        .merge(cron_routes)
        .merge(engine_routes)
        .merge(internal_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
