//! HTTP request handlers (route handlers).
//!
//! Each handler is an async function that:
//! 1. Extracts the request context injected by the middleware
//! 2. Calls into a service
//! 3. Returns JSON or an [`AppError`](crate::error::AppError)

/// Schedule sweep trigger
pub mod cron;
/// Engine progress and completion callbacks
pub mod engine;
pub mod health;
/// Dashboard endpoints
pub mod internal;
/// API-key endpoints, some of them billed
pub mod public;
