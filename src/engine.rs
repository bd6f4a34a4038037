//! Client for the external workflow engine.
//!
//! The engine exposes one webhook per workflow. A dispatch is a signed JSON
//! POST; the engine reports back asynchronously through the progress and
//! completion callbacks.

use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use url::Url;
use uuid::Uuid;

use crate::config::Config;
use crate::models::attributes::Attributes;
use crate::models::execution::WorkflowKind;

type HmacSha256 = Hmac<Sha256>;

/// Webhook request timeout.
const ENGINE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("no engine webhook configured for {0}")]
    NotConfigured(WorkflowKind),

    #[error("invalid engine URL: {0}")]
    InvalidUrl(String),

    #[error("engine request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("engine webhook failed ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("failed to encode engine payload: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("invalid signing key")]
    Signature,
}

/// Body POSTed to the engine webhook.
///
/// # JSON Example
///
/// ```json
/// {
///   "tenant_id": "550e8400-e29b-41d4-a716-446655440000",
///   "execution_id": "660e8400-e29b-41d4-a716-446655440001",
///   "workflow": "INGESTION",
///   "callback_url": "https://app.example.com/api/engine/callback",
///   "progress_url": "https://app.example.com/api/engine/progress",
///   "params": { "lookback_days": 2 }
/// }
/// ```
#[derive(Debug, Clone, Serialize)]
pub struct EnginePayload {
    pub tenant_id: Uuid,
    pub execution_id: Uuid,
    pub workflow: WorkflowKind,
    pub callback_url: String,
    pub progress_url: String,
    pub params: Attributes,
}

impl EnginePayload {
    pub fn new(config: &Config, tenant_id: Uuid, execution_id: Uuid, workflow: WorkflowKind, params: Attributes) -> Self {
        let base = config.callback_base();
        Self {
            tenant_id,
            execution_id,
            workflow,
            callback_url: format!("{base}/api/engine/callback"),
            progress_url: format!("{base}/api/engine/progress"),
            params,
        }
    }
}

/// Starts workflows on the external engine.
#[async_trait]
pub trait WorkflowEngine: Send + Sync {
    /// Returns once the engine has accepted the run. Completion arrives later
    /// through the callbacks.
    async fn start(&self, payload: &EnginePayload) -> Result<(), EngineError>;
}

/// Webhook-based engine client.
pub struct HttpEngine {
    client: reqwest::Client,
    ingestion_url: Option<Url>,
    analysis_url: Option<Url>,
    secret: Option<String>,
}

impl HttpEngine {
    pub fn from_config(config: &Config) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder().timeout(ENGINE_TIMEOUT).build()?;

        let parse = |url: &Option<String>| url.as_deref().map(validate_engine_url).transpose();

        Ok(Self {
            client,
            ingestion_url: parse(&config.engine_ingestion_url)?,
            analysis_url: parse(&config.engine_analysis_url)?,
            secret: config.engine_secret.clone(),
        })
    }

    fn url_for(&self, workflow: WorkflowKind) -> Option<&Url> {
        match workflow {
            WorkflowKind::Ingestion => self.ingestion_url.as_ref(),
            WorkflowKind::Analysis => self.analysis_url.as_ref(),
        }
    }
}

#[async_trait]
impl WorkflowEngine for HttpEngine {
    /// # Headers Sent
    ///
    /// - `Content-Type: application/json`
    /// - `Authorization: Bearer <secret>` (when a secret is configured)
    /// - `X-Webhook-Signature: sha256=<hex>` (when a secret is configured)
    async fn start(&self, payload: &EnginePayload) -> Result<(), EngineError> {
        let url = self
            .url_for(payload.workflow)
            .ok_or(EngineError::NotConfigured(payload.workflow))?;

        let body = serde_json::to_string(payload)?;

        let mut request = self
            .client
            .post(url.clone())
            .header("Content-Type", "application/json");
        if let Some(secret) = &self.secret {
            request = request
                .bearer_auth(secret)
                .header("X-Webhook-Signature", generate_signature(secret, &body)?);
        }

        let response = request.body(body).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Rejected {
                status: status.as_u16(),
                body: body.chars().take(500).collect(),
            });
        }

        tracing::debug!(
            execution_id = %payload.execution_id,
            workflow = %payload.workflow,
            status = status.as_u16(),
            "engine accepted webhook"
        );
        Ok(())
    }
}

/// HMAC-SHA256 of the request body, formatted as `sha256=<hex>`.
///
/// The engine recomputes it with the shared secret to authenticate the call.
pub fn generate_signature(secret: &str, payload: &str) -> Result<String, EngineError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| EngineError::Signature)?;
    mac.update(payload.as_bytes());
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

/// Validate an engine webhook URL.
///
/// # Rules
///
/// - Must be a valid absolute URL with a host
/// - Must be HTTP or HTTPS
/// - Maximum 2048 characters
///
/// Plain HTTP to a non-local host is accepted (engines usually sit on a private
/// network) but logged.
pub fn validate_engine_url(url: &str) -> Result<Url, EngineError> {
    if url.len() > 2048 {
        return Err(EngineError::InvalidUrl("URL exceeds 2048 characters".to_string()));
    }

    let parsed = Url::parse(url).map_err(|_| EngineError::InvalidUrl(format!("{url:?} is not a valid URL")))?;

    let host = parsed
        .host_str()
        .ok_or_else(|| EngineError::InvalidUrl(format!("{url:?} has no host")))?;

    match parsed.scheme() {
        "https" => {}
        "http" => {
            if !matches!(host, "localhost" | "127.0.0.1" | "0.0.0.0") {
                tracing::warn!(url = %parsed, "engine webhook uses plain HTTP");
            }
        }
        other => {
            return Err(EngineError::InvalidUrl(format!(
                "scheme {other:?} is not supported, use HTTP or HTTPS"
            )));
        }
    }

    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_prefixed_hex() {
        let sig = generate_signature("secret", "{}").unwrap();
        assert!(sig.starts_with("sha256="));
        assert_eq!(sig.len(), "sha256=".len() + 64);
        assert_eq!(sig, generate_signature("secret", "{}").unwrap());
        assert_ne!(sig, generate_signature("other", "{}").unwrap());
    }

    #[test]
    fn engine_url_rules() {
        assert!(validate_engine_url("https://engine.example.com/webhook/ingest").is_ok());
        assert!(validate_engine_url("http://localhost:5678/webhook").is_ok());
        assert!(validate_engine_url("ftp://engine.example.com").is_err());
        assert!(validate_engine_url("not a url").is_err());
    }

    #[test]
    fn payload_carries_callback_urls() {
        let config = Config {
            app_url: "https://app.example.com/".into(),
            ..Config::default()
        };
        let payload = EnginePayload::new(&config, Uuid::new_v4(), Uuid::new_v4(), WorkflowKind::Analysis, Attributes::new());
        assert_eq!(payload.callback_url, "https://app.example.com/api/engine/callback");
        assert_eq!(payload.progress_url, "https://app.example.com/api/engine/progress");
    }

    #[test]
    fn unconfigured_workflow_is_rejected() {
        let engine = HttpEngine::from_config(&Config::default()).unwrap();
        assert!(engine.url_for(WorkflowKind::Ingestion).is_none());
    }
}
