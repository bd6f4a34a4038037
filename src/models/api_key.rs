//! API Key model for authentication.
//!
//! API keys authenticate tenants calling the public, credit-billed API. Only a
//! SHA-256 hash of each key is stored; the raw key is returned once, at creation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Scope a key may be granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Read,
    Write,
    Trigger,
}

impl Permission {
    pub const ALL: [Permission; 3] = [Permission::Read, Permission::Write, Permission::Trigger];

    pub fn as_str(self) -> &'static str {
        match self {
            Permission::Read => "read",
            Permission::Write => "write",
            Permission::Trigger => "trigger",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.as_str() == value)
    }
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Represents an API key record.
///
/// # Database Table
///
/// Maps to the `api_keys` table. `key_hash` is unique, which makes lookup by the
/// presented secret a single indexed read.
#[derive(Debug, Clone)]
pub struct ApiKey {
    pub id: Uuid,

    /// Tenant whose credits and rate limits this key draws on
    pub tenant_id: Uuid,

    pub name: String,

    /// SHA-256 hash of the raw key (64 hex characters)
    pub key_hash: String,

    /// First characters of the raw key, safe to display
    pub key_prefix: String,

    pub permissions: Vec<Permission>,
    pub rate_limit_per_minute: i32,
    pub rate_limit_per_day: i32,

    /// Inactive keys are rejected with 403. Deactivation is the soft alternative to deletion.
    pub is_active: bool,

    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ApiKey {
    pub fn has_permission(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at < now)
    }

    /// Active and unexpired keys count toward the per-tenant cap.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.is_active && !self.is_expired(now)
    }
}

/// Values needed to persist a freshly generated key.
#[derive(Debug, Clone)]
pub struct NewApiKey {
    pub tenant_id: Uuid,
    pub name: String,
    pub key_hash: String,
    pub key_prefix: String,
    pub permissions: Vec<Permission>,
    pub rate_limit_per_minute: i32,
    pub rate_limit_per_day: i32,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Request body for creating a new API key.
///
/// # JSON Example
///
/// ```json
/// {
///   "name": "Reporting integration",
///   "permissions": ["read", "trigger"],
///   "expires_in_days": 90
/// }
/// ```
///
/// Unknown permission names are dropped. An empty or missing list means `["read"]`.
#[derive(Debug, Deserialize)]
pub struct CreateApiKeyRequest {
    pub name: String,

    #[serde(default)]
    pub permissions: Option<Vec<String>>,

    #[serde(default)]
    pub expires_in_days: Option<i64>,

    #[serde(default)]
    pub rate_limit_per_minute: Option<i32>,

    #[serde(default)]
    pub rate_limit_per_day: Option<i32>,
}

/// Response body for key listings. Never includes the hash or the raw key.
#[derive(Debug, Serialize)]
pub struct ApiKeyResponse {
    pub id: Uuid,
    pub name: String,
    pub key_prefix: String,
    pub permissions: Vec<Permission>,
    pub rate_limit_per_minute: i32,
    pub rate_limit_per_day: i32,
    pub is_active: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<ApiKey> for ApiKeyResponse {
    fn from(key: ApiKey) -> Self {
        Self {
            id: key.id,
            name: key.name,
            key_prefix: key.key_prefix,
            permissions: key.permissions,
            rate_limit_per_minute: key.rate_limit_per_minute,
            rate_limit_per_day: key.rate_limit_per_day,
            is_active: key.is_active,
            expires_at: key.expires_at,
            last_used_at: key.last_used_at,
            created_at: key.created_at,
        }
    }
}

/// Response returned once, when a key is created. `key` is the only copy of the secret.
#[derive(Debug, Serialize)]
pub struct CreatedApiKeyResponse {
    pub key: String,
    #[serde(flatten)]
    pub details: ApiKeyResponse,
}

/// Query string of `DELETE /internal/api-keys/{id}`.
#[derive(Debug, Default, Deserialize)]
pub struct RevokeApiKeyRequest {
    /// `"deactivate"` keeps the row for audit; anything else deletes it.
    #[serde(default)]
    pub action: Option<String>,
}
