//! Application configuration management.
//!
//! This module handles loading configuration from environment variables.
//! It uses the `envy` crate to automatically deserialize environment variables into a type-safe struct.

use serde::Deserialize;

/// Application configuration loaded from environment variables.
///
/// # Environment Variables
///
/// - `DATABASE_URL` (optional): PostgreSQL connection string. Without it the
///   service runs against the in-memory store.
/// - `SERVER_PORT` (optional): HTTP server port, defaults to 3000
/// - `APP_URL` (optional): public base URL used to build engine callback URLs
/// - `CRON_SECRET` (optional): bearer secret expected by the schedule trigger endpoint
/// - `ENGINE_SECRET` (optional): shared secret for engine webhooks and callbacks
/// - `DASHBOARD_SECRET` (optional): bearer secret the dashboard presents on `/internal` routes
/// - `ENGINE_INGESTION_URL` / `ENGINE_ANALYSIS_URL` (optional): engine webhook per workflow
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database_url: Option<String>,

    #[serde(default = "default_port")]
    pub server_port: u16,

    #[serde(default = "default_app_url")]
    pub app_url: String,

    #[serde(default)]
    pub cron_secret: Option<String>,

    #[serde(default)]
    pub engine_secret: Option<String>,

    #[serde(default)]
    pub dashboard_secret: Option<String>,

    #[serde(default)]
    pub engine_ingestion_url: Option<String>,

    #[serde(default)]
    pub engine_analysis_url: Option<String>,

    /// Timezone applied to schedules whose own timezone cannot be parsed.
    #[serde(default = "default_timezone")]
    pub default_timezone: String,

    /// Non-terminal executions older than this are force-failed by the reaper.
    #[serde(default = "default_execution_timeout")]
    pub execution_timeout_minutes: i64,

    #[serde(default = "default_reaper_interval")]
    pub reaper_interval_secs: u64,

    /// Internal schedule sweep cadence. 0 leaves the sweep to the external cron.
    #[serde(default)]
    pub scheduler_interval_secs: u64,

    /// Width of the time-of-day match used by the due-schedule fallback.
    #[serde(default = "default_schedule_tolerance")]
    pub schedule_tolerance_minutes: i64,

    #[serde(default = "default_free_grant")]
    pub free_credit_grant: i64,

    #[serde(default = "default_max_keys")]
    pub max_keys_per_tenant: i64,
}

/// Default port if SERVER_PORT environment variable is not set.
fn default_port() -> u16 {
    3000
}

fn default_app_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_timezone() -> String {
    "America/Sao_Paulo".to_string()
}

fn default_execution_timeout() -> i64 {
    30
}

fn default_reaper_interval() -> u64 {
    60
}

fn default_schedule_tolerance() -> i64 {
    15
}

fn default_free_grant() -> i64 {
    100
}

fn default_max_keys() -> i64 {
    10
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            server_port: default_port(),
            app_url: default_app_url(),
            cron_secret: None,
            engine_secret: None,
            dashboard_secret: None,
            engine_ingestion_url: None,
            engine_analysis_url: None,
            default_timezone: default_timezone(),
            execution_timeout_minutes: default_execution_timeout(),
            reaper_interval_secs: default_reaper_interval(),
            scheduler_interval_secs: 0,
            schedule_tolerance_minutes: default_schedule_tolerance(),
            free_credit_grant: default_free_grant(),
            max_keys_per_tenant: default_max_keys(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// This method first attempts to load a `.env` file (which is optional),
    /// then reads environment variables and deserializes them into a Config struct.
    ///
    /// # Errors
    ///
    /// Returns an error if environment variable values cannot be parsed into expected types.
    pub fn from_env() -> Result<Self, envy::Error> {
        // Try to load .env file if it exists (does nothing if not found)
        dotenvy::dotenv().ok();

        // Field names are automatically converted: database_url -> DATABASE_URL
        envy::from_env::<Config>()
    }

    /// Base URL the engine should call back into, without a trailing slash.
    pub fn callback_base(&self) -> &str {
        self.app_url.trim_end_matches('/')
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_variables_are_missing() {
        let config: Config = envy::from_iter(Vec::<(String, String)>::new()).unwrap();
        assert_eq!(config.server_port, 3000);
        assert_eq!(config.execution_timeout_minutes, 30);
        assert_eq!(config.max_keys_per_tenant, 10);
        assert!(config.database_url.is_none());
    }

    #[test]
    fn variables_override_defaults() {
        let vars = vec![
            ("SERVER_PORT".to_string(), "8080".to_string()),
            ("CRON_SECRET".to_string(), "s3cret".to_string()),
            ("APP_URL".to_string(), "https://app.example.com/".to_string()),
        ];
        let config: Config = envy::from_iter(vars).unwrap();
        assert_eq!(config.server_port, 8080);
        assert_eq!(config.cron_secret.as_deref(), Some("s3cret"));
        assert_eq!(config.callback_base(), "https://app.example.com");
    }
}
