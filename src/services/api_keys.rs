//! API key issuance and management for the dashboard.

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::api_key::{
    ApiKeyResponse, CreateApiKeyRequest, CreatedApiKeyResponse, NewApiKey, Permission,
};
use crate::state::AppState;

/// Prefix of every raw key this service issues.
pub const KEY_PREFIX: &str = "sk-live-";

const DEFAULT_RATE_LIMIT_PER_MINUTE: i32 = 60;
const DEFAULT_RATE_LIMIT_PER_DAY: i32 = 1000;

/// Longest lifetime a key can be issued with.
pub const MAX_EXPIRY_DAYS: i64 = 3650;

/// A freshly generated key. `key` is the only copy of the secret.
pub struct GeneratedKey {
    pub key: String,
    pub hash: String,
    pub prefix: String,
}

/// Generate a raw key, its hash and its display prefix.
///
/// # Output
///
/// `sk-live-` followed by 64 hex characters (32 random bytes)
pub fn generate_api_key() -> GeneratedKey {
    let bytes: [u8; 32] = rand::random();
    let key = format!("{KEY_PREFIX}{}", hex::encode(bytes));
    let hash = hash_api_key(&key);
    let prefix = format!("{}...", &key[..16]);
    GeneratedKey { key, hash, prefix }
}

/// SHA-256 of the raw key as 64 lowercase hex characters.
pub fn hash_api_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Expiry instant for a key issued at `now` that lives `days` days.
pub fn expiry_after(now: DateTime<Utc>, days: i64) -> Result<DateTime<Utc>, AppError> {
    if !(1..=MAX_EXPIRY_DAYS).contains(&days) {
        return Err(AppError::InvalidRequest(format!(
            "expires_in_days must be between 1 and {MAX_EXPIRY_DAYS}"
        )));
    }
    Duration::try_days(days)
        .and_then(|lifetime| now.checked_add_signed(lifetime))
        .ok_or_else(|| AppError::InvalidRequest("expires_in_days is out of range".to_string()))
}

/// Keep known permission names, defaulting to `read` when none survive.
fn parse_permissions(requested: Option<&[String]>) -> Vec<Permission> {
    let mut permissions: Vec<Permission> = Vec::new();
    for name in requested.unwrap_or_default() {
        if let Some(p) = Permission::parse(name.trim()) {
            if !permissions.contains(&p) {
                permissions.push(p);
            }
        }
    }
    if permissions.is_empty() {
        permissions.push(Permission::Read);
    }
    permissions
}

/// Create a key for the tenant.
///
/// Also opens the tenant's credit account with the free grant the first time.
///
/// # Errors
///
/// - `InvalidRequest`: name shorter than 2 characters, bad expiry or limits
/// - `KeyLimitReached`: the tenant already has the maximum number of live keys
pub async fn create_key(
    state: &AppState,
    tenant_id: Uuid,
    request: CreateApiKeyRequest,
) -> Result<CreatedApiKeyResponse, AppError> {
    let name = request.name.trim().to_string();
    if name.chars().count() < 2 {
        return Err(AppError::InvalidRequest("Name must be at least 2 characters".to_string()));
    }

    let expires_at = request
        .expires_in_days
        .map(|days| expiry_after(Utc::now(), days))
        .transpose()?;

    let rate_limit_per_minute = request.rate_limit_per_minute.unwrap_or(DEFAULT_RATE_LIMIT_PER_MINUTE);
    let rate_limit_per_day = request.rate_limit_per_day.unwrap_or(DEFAULT_RATE_LIMIT_PER_DAY);
    if rate_limit_per_minute <= 0 || rate_limit_per_day <= 0 {
        return Err(AppError::InvalidRequest("Rate limits must be positive".to_string()));
    }

    let generated = generate_api_key();
    let max_keys = state.config.max_keys_per_tenant;

    let key = state
        .store
        .insert_api_key(
            NewApiKey {
                tenant_id,
                name,
                key_hash: generated.hash,
                key_prefix: generated.prefix,
                permissions: parse_permissions(request.permissions.as_deref()),
                rate_limit_per_minute,
                rate_limit_per_day,
                expires_at,
            },
            max_keys,
        )
        .await?
        .ok_or(AppError::KeyLimitReached(max_keys))?;

    state
        .store
        .ensure_credit_account(tenant_id, state.config.free_credit_grant)
        .await?;

    tracing::info!(tenant_id = %tenant_id, key_id = %key.id, prefix = %key.key_prefix, "api key created");

    Ok(CreatedApiKeyResponse {
        key: generated.key,
        details: key.into(),
    })
}

pub async fn list_keys(state: &AppState, tenant_id: Uuid) -> Result<Vec<ApiKeyResponse>, AppError> {
    let keys = state.store.list_api_keys(tenant_id).await?;
    Ok(keys.into_iter().map(Into::into).collect())
}

/// Deactivate (`soft = true`) or delete a key of the tenant.
pub async fn revoke_key(state: &AppState, tenant_id: Uuid, key_id: Uuid, soft: bool) -> Result<(), AppError> {
    let found = if soft {
        state.store.deactivate_api_key(tenant_id, key_id).await?
    } else {
        state.store.delete_api_key(tenant_id, key_id).await?
    };

    if !found {
        return Err(AppError::NotFound("API key"));
    }

    tracing::info!(tenant_id = %tenant_id, key_id = %key_id, soft, "api key revoked");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::harness;

    fn request(name: &str, permissions: Option<Vec<&str>>) -> CreateApiKeyRequest {
        CreateApiKeyRequest {
            name: name.to_string(),
            permissions: permissions.map(|p| p.into_iter().map(String::from).collect()),
            expires_in_days: None,
            rate_limit_per_minute: None,
            rate_limit_per_day: None,
        }
    }

    #[test]
    fn generated_key_shape() {
        let generated = generate_api_key();
        assert!(generated.key.starts_with(KEY_PREFIX));
        assert_eq!(generated.key.len(), KEY_PREFIX.len() + 64);
        assert_eq!(generated.hash, hash_api_key(&generated.key));
        assert_eq!(generated.hash.len(), 64);
        assert_eq!(generated.prefix.len(), 19);
        assert!(generated.prefix.ends_with("..."));
    }

    #[test]
    fn unknown_permissions_are_dropped() {
        let perms = parse_permissions(Some(&["trigger".to_string(), "admin".to_string(), "trigger".to_string()][..]));
        assert_eq!(perms, vec![Permission::Trigger]);
        assert_eq!(parse_permissions(Some(&["admin".to_string()][..])), vec![Permission::Read]);
        assert_eq!(parse_permissions(None), vec![Permission::Read]);
    }

    #[tokio::test]
    async fn create_opens_credit_account_once() {
        let state = harness().state;
        let tenant = Uuid::new_v4();

        let created = create_key(&state, tenant, request("Reporting", None)).await.unwrap();
        assert_eq!(created.details.permissions, vec![Permission::Read]);

        let account = state.store.credit_account(tenant).await.unwrap().unwrap();
        assert_eq!(account.free_granted, state.config.free_credit_grant);

        create_key(&state, tenant, request("Second", Some(vec!["read", "write"]))).await.unwrap();
        let account = state.store.credit_account(tenant).await.unwrap().unwrap();
        assert_eq!(account.effective_balance(), state.config.free_credit_grant);
    }

    #[test]
    fn expiry_is_capped() {
        let now = Utc::now();
        assert_eq!(expiry_after(now, 30).unwrap(), now + Duration::days(30));
        assert!(expiry_after(now, MAX_EXPIRY_DAYS).is_ok());

        for days in [0, -1, MAX_EXPIRY_DAYS + 1, i64::MAX, i64::MIN] {
            assert!(matches!(expiry_after(now, days), Err(AppError::InvalidRequest(_))), "{days}");
        }
    }

    #[tokio::test]
    async fn huge_expiry_is_a_bad_request() {
        let h = harness();
        let mut req = request("ci", None);
        req.expires_in_days = Some(i64::MAX);
        let err = create_key(&h.state, Uuid::new_v4(), req).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn short_names_are_rejected() {
        let state = harness().state;
        let err = create_key(&state, Uuid::new_v4(), request("x", None)).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn live_key_cap_ignores_revoked_keys() {
        let state = harness().state;
        let tenant = Uuid::new_v4();
        let max = state.config.max_keys_per_tenant;

        let mut first = None;
        for i in 0..max {
            let created = create_key(&state, tenant, request(&format!("key {i}"), None)).await.unwrap();
            first.get_or_insert(created.details.id);
        }
        let err = create_key(&state, tenant, request("one too many", None)).await.unwrap_err();
        assert!(matches!(err, AppError::KeyLimitReached(_)));

        revoke_key(&state, tenant, first.unwrap(), true).await.unwrap();
        assert!(create_key(&state, tenant, request("replacement", None)).await.is_ok());
    }

    #[tokio::test]
    async fn revoke_is_tenant_scoped() {
        let state = harness().state;
        let tenant = Uuid::new_v4();
        let created = create_key(&state, tenant, request("Mine", None)).await.unwrap();

        let err = revoke_key(&state, Uuid::new_v4(), created.details.id, false).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));

        revoke_key(&state, tenant, created.details.id, false).await.unwrap();
        assert!(list_keys(&state, tenant).await.unwrap().is_empty());
    }
}
