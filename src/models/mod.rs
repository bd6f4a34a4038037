//! Data models representing stored entities and their API shapes.
//!
//! This module contains all data structures that map to database tables.

/// API key authentication model
pub mod api_key;
/// Schema-less key→scalar maps used for schedule params and execution metrics
pub mod attributes;
/// Per-tenant credit account and pricing
pub mod credit;
/// Workflow execution records and engine callback payloads
pub mod execution;
/// LLM token usage and the completion run log
pub mod llm_usage;
/// Recurring workflow schedules
pub mod schedule;
/// Billable resource served by the public API
pub mod tender;
/// Append-only API usage log
pub mod usage;
