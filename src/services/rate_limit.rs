//! Per-key request rate limits.
//!
//! Counts are derived from the usage log: a key is over its limit when it
//! already has `limit` usage rows inside the trailing window. Requests racing
//! at the boundary can both get through; the limit is advisory to that extent.

use std::fmt;

use chrono::{DateTime, Duration, Utc};

use crate::error::AppError;
use crate::models::api_key::ApiKey;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateWindow {
    Minute,
    Day,
}

impl RateWindow {
    pub fn duration(self) -> Duration {
        match self {
            RateWindow::Minute => Duration::minutes(1),
            RateWindow::Day => Duration::hours(24),
        }
    }

    /// Value of the `Retry-After` header when this window is exhausted.
    pub fn retry_after_secs(self) -> u64 {
        match self {
            RateWindow::Minute => 60,
            RateWindow::Day => 3600,
        }
    }
}

impl fmt::Display for RateWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateWindow::Minute => f.write_str("minute"),
            RateWindow::Day => f.write_str("day"),
        }
    }
}

/// Reject the request if the key has used up either window.
///
/// The minute window is checked first, so a key over both limits is told to
/// retry in 60 seconds.
pub async fn enforce(store: &dyn Store, key: &ApiKey, now: DateTime<Utc>) -> Result<(), AppError> {
    let windows = [
        (RateWindow::Minute, key.rate_limit_per_minute),
        (RateWindow::Day, key.rate_limit_per_day),
    ];

    for (window, limit) in windows {
        let used = store.count_usage_since(key.id, now - window.duration()).await?;
        if used >= i64::from(limit) {
            tracing::info!(
                key_id = %key.id,
                tenant_id = %key.tenant_id,
                window = %window,
                used,
                limit,
                "rate limit exceeded"
            );
            return Err(AppError::RateLimited { window, limit });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::api_key::{NewApiKey, Permission};
    use crate::models::usage::NewUsageRecord;
    use crate::store::memory::MemoryStore;
    use crate::store::{KeyStore, UsageStore};
    use uuid::Uuid;

    async fn key(store: &MemoryStore, per_minute: i32, per_day: i32) -> ApiKey {
        store
            .insert_api_key(
                NewApiKey {
                    tenant_id: Uuid::new_v4(),
                    name: "limits".into(),
                    key_hash: Uuid::new_v4().to_string(),
                    key_prefix: "sk-live-0000000...".into(),
                    permissions: vec![Permission::Read],
                    rate_limit_per_minute: per_minute,
                    rate_limit_per_day: per_day,
                    expires_at: None,
                },
                10,
            )
            .await
            .unwrap()
            .unwrap()
    }

    async fn call(store: &MemoryStore, key: &ApiKey, at: DateTime<Utc>) {
        store
            .record_usage(NewUsageRecord {
                api_key_id: key.id,
                tenant_id: key.tenant_id,
                endpoint: "GET /api/v1/stats".into(),
                method: "GET".into(),
                status_code: 200,
                response_time_ms: 3,
                credits_charged: 1,
                ip_address: "unknown".into(),
                user_agent: "test".into(),
                created_at: at,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn minute_limit_trips_at_the_limit() {
        let store = MemoryStore::new();
        let key = key(&store, 2, 100).await;
        let now = Utc::now();

        call(&store, &key, now).await;
        assert!(enforce(&store, &key, now).await.is_ok());

        call(&store, &key, now).await;
        let err = enforce(&store, &key, now).await.unwrap_err();
        assert!(matches!(err, AppError::RateLimited { window: RateWindow::Minute, limit: 2 }));
    }

    #[tokio::test]
    async fn old_calls_fall_out_of_the_minute_window() {
        let store = MemoryStore::new();
        let key = key(&store, 1, 100).await;
        let now = Utc::now();

        call(&store, &key, now - Duration::seconds(90)).await;
        assert!(enforce(&store, &key, now).await.is_ok());
    }

    #[tokio::test]
    async fn day_limit_reports_hour_retry() {
        let store = MemoryStore::new();
        let key = key(&store, 100, 2).await;
        let now = Utc::now();

        call(&store, &key, now - Duration::hours(3)).await;
        call(&store, &key, now - Duration::hours(2)).await;

        match enforce(&store, &key, now).await {
            Err(AppError::RateLimited { window, .. }) => {
                assert_eq!(window, RateWindow::Day);
                assert_eq!(window.retry_after_secs(), 3600);
            }
            other => panic!("expected day limit, got {other:?}"),
        }
    }
}
