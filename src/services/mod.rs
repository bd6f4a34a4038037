//! Business logic services.
//!
//! Services contain the core logic separated from HTTP handlers. They work on
//! [`AppState`](crate::state::AppState) or directly on the store traits, so the
//! background loops and the handlers share one implementation.

/// Key issuance, listing and revocation
pub mod api_keys;
/// Engine dispatch with the one-in-flight guard
pub mod dispatcher;
/// Pricing, credit checks and billing
pub mod ledger;
/// Sliding-window limits derived from the usage log
pub mod rate_limit;
/// Schedule arithmetic and the due-schedule sweep
pub mod scheduler;
/// Engine callbacks, reaper and status queries
pub mod tracker;
