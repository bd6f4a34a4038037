//! HTTP middleware components.
//!
//! Middleware run before route handlers. They authenticate the caller, inject
//! the request context the handlers extract, and short-circuit rejected
//! requests with the matching error response.

/// API key gateway for the public API
pub mod api_key;
/// Shared-secret checks for the dashboard, cron and engine routes
pub mod session;
