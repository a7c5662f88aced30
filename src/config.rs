//! Sync configuration
//!
//! Defaults suit the production service. Every field can be overridden from
//! the environment (a `.env` file is loaded first):
//! - `ORIEL_API_URL`
//! - `ORIEL_AUTO_SYNC`
//! - `ORIEL_REQUEST_TIMEOUT_SECS`
//! - `ORIEL_RETRY_BASE_DELAY_MS`, `ORIEL_RETRY_MAX_DELAY_MS`, `ORIEL_RETRY_MAX_ATTEMPTS`
//! - `ORIEL_POLL_INTERVAL_SECS` (0 disables polling)
//! - `ORIEL_DB_PATH`

use crate::preferences::PreferencesOptions;
use crate::sync::{RetryPolicy, API_BASE_URL};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// Constants
// ============================================================================

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 15;
const MAX_REQUEST_TIMEOUT_SECS: u64 = 300;
const DATABASE_FILE: &str = "oriel-preferences.db";

// ============================================================================
// Config
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub api_base_url: String,
    pub auto_sync: bool,
    pub request_timeout_secs: u64,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub retry_max_attempts: u32,
    pub poll_interval_secs: u64,
    /// `None` selects the platform data directory
    pub database_path: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            api_base_url: API_BASE_URL.to_string(),
            auto_sync: true,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            retry_base_delay_ms: retry.base_delay.as_millis() as u64,
            retry_max_delay_ms: retry.max_delay.as_millis() as u64,
            retry_max_attempts: retry.max_attempts,
            poll_interval_secs: 0,
            database_path: None,
        }
    }
}

impl SyncConfig {
    /// Defaults overridden by `.env` and process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("ORIEL_API_URL") {
            config.api_base_url = url;
        }
        if let Some(raw) = lookup("ORIEL_AUTO_SYNC") {
            config.auto_sync = parse_bool("ORIEL_AUTO_SYNC", &raw)?;
        }
        if let Some(raw) = lookup("ORIEL_REQUEST_TIMEOUT_SECS") {
            config.request_timeout_secs = parse_number("ORIEL_REQUEST_TIMEOUT_SECS", &raw)?;
        }
        if let Some(raw) = lookup("ORIEL_RETRY_BASE_DELAY_MS") {
            config.retry_base_delay_ms = parse_number("ORIEL_RETRY_BASE_DELAY_MS", &raw)?;
        }
        if let Some(raw) = lookup("ORIEL_RETRY_MAX_DELAY_MS") {
            config.retry_max_delay_ms = parse_number("ORIEL_RETRY_MAX_DELAY_MS", &raw)?;
        }
        if let Some(raw) = lookup("ORIEL_RETRY_MAX_ATTEMPTS") {
            config.retry_max_attempts = parse_number("ORIEL_RETRY_MAX_ATTEMPTS", &raw)?;
        }
        if let Some(raw) = lookup("ORIEL_POLL_INTERVAL_SECS") {
            config.poll_interval_secs = parse_number("ORIEL_POLL_INTERVAL_SECS", &raw)?;
        }
        if let Some(path) = lookup("ORIEL_DB_PATH") {
            config.database_path = Some(PathBuf::from(path));
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_base_url.trim().is_empty() {
            return Err(ConfigError::Invalid("API URL must not be empty".to_string()));
        }
        if self.request_timeout_secs == 0 || self.request_timeout_secs > MAX_REQUEST_TIMEOUT_SECS {
            return Err(ConfigError::Invalid(format!(
                "Request timeout must be 1-{} seconds, got {}",
                MAX_REQUEST_TIMEOUT_SECS, self.request_timeout_secs
            )));
        }
        if self.retry_max_attempts == 0 {
            return Err(ConfigError::Invalid("Retry attempts must be at least 1".to_string()));
        }
        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "Retry base delay {}ms exceeds max delay {}ms",
                self.retry_base_delay_ms, self.retry_max_delay_ms
            )));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            max_attempts: self.retry_max_attempts,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn preferences_options(&self) -> PreferencesOptions {
        PreferencesOptions {
            auto_sync: self.auto_sync,
            poll_interval: match self.poll_interval_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
        }
    }

    /// Configured database path, or the platform data directory
    pub fn resolve_database_path(&self) -> Result<PathBuf, ConfigError> {
        if let Some(path) = &self.database_path {
            return Ok(path.clone());
        }

        let dirs = directories::ProjectDirs::from("com", "orielsignalfx", "oriel-signal-fx")
            .ok_or(ConfigError::NoDataDir)?;
        Ok(dirs.data_dir().join(DATABASE_FILE))
    }
}

fn parse_bool(name: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            name: name.to_string(),
            value: raw.to_string(),
        }),
    }
}

fn parse_number<T: FromStr>(name: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
        name: name.to_string(),
        value: raw.to_string(),
    })
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {name}: '{value}'")]
    InvalidValue { name: String, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to determine the application data directory")]
    NoDataDir,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = SyncConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, SyncConfig::default());
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        assert_eq!(config.preferences_options().poll_interval, None);
        assert!(config.auto_sync);
    }

    #[test]
    fn test_environment_overrides() {
        let config = SyncConfig::from_lookup(lookup(&[
            ("ORIEL_API_URL", "http://localhost:8080"),
            ("ORIEL_AUTO_SYNC", "off"),
            ("ORIEL_REQUEST_TIMEOUT_SECS", "5"),
            ("ORIEL_RETRY_MAX_ATTEMPTS", "2"),
            ("ORIEL_POLL_INTERVAL_SECS", "60"),
            ("ORIEL_DB_PATH", "/tmp/oriel.db"),
        ]))
        .unwrap();

        assert_eq!(config.api_base_url, "http://localhost:8080");
        assert!(!config.auto_sync);
        assert_eq!(config.request_timeout(), Duration::from_secs(5));
        assert_eq!(config.retry_policy().max_attempts, 2);
        assert_eq!(
            config.preferences_options().poll_interval,
            Some(Duration::from_secs(60))
        );
        assert_eq!(
            config.resolve_database_path().unwrap(),
            PathBuf::from("/tmp/oriel.db")
        );
    }

    #[test]
    fn test_malformed_values_are_rejected() {
        let err = SyncConfig::from_lookup(lookup(&[("ORIEL_AUTO_SYNC", "sometimes")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        let err = SyncConfig::from_lookup(lookup(&[("ORIEL_RETRY_MAX_ATTEMPTS", "-1")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        let err = SyncConfig::from_lookup(lookup(&[("ORIEL_REQUEST_TIMEOUT_SECS", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_deserialize_partial_config() {
        let config: SyncConfig = serde_json::from_str(r#"{"auto_sync": false}"#).unwrap();
        assert!(!config.auto_sync);
        assert_eq!(config.request_timeout_secs, DEFAULT_REQUEST_TIMEOUT_SECS);
    }
}
