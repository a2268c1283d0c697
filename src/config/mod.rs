//! # Configuration Module
//!
//! Loading and validating configuration from environment variables. All
//! subsystem tunables are centralized here.
//!
//! ## Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `FRAUD_VELOCITY_WINDOW_SECS` | Velocity counter window | `60` |
//! | `FRAUD_IP_ATTEMPT_LIMIT` | Attempts per IP per window before blocking | `5` |
//! | `FRAUD_MERCHANT_ATTEMPT_LIMIT` | Attempts per merchant per window | `20` |
//! | `WEBHOOK_TIMEOUT_SECS` | Per-attempt delivery timeout | `10` |
//! | `WEBHOOK_MAX_RETRIES` | Total attempts before a delivery is abandoned | `5` |
//! | `WEBHOOK_RETRY_POLL_INTERVAL_SECS` | Retry scheduler tick | `60` |
//! | `WEBHOOK_FAILURE_SPIKE_WINDOW_SECS` | Trailing window for spike detection | `600` |
//! | `WEBHOOK_FAILURE_SPIKE_THRESHOLD` | Permanent failures that trigger an alert | `3` |
//! | `ALERT_CHANNEL_SECRET` | Shared secret observers present to subscribe | *required* |

use std::env;
use thiserror::Error;

/// Errors that can occur when loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// Failed to parse a value.
    #[error("Failed to parse {0}: {1}")]
    ParseError(String, String),
}

/// Subsystem configuration loaded from environment variables.
///
/// ## Example
///
/// ```rust,ignore
/// let config = DefenseConfig::from_env()?;
/// ```
#[derive(Debug, Clone)]
pub struct DefenseConfig {
    // ==========================================
    // FRAUD GUARD SETTINGS
    // ==========================================
    /// Width of the velocity counter window, in seconds.
    pub velocity_window_secs: u64,

    /// Attempts from one IP inside the window before the guard blocks
    /// without a persisted rule.
    pub ip_attempt_limit: u32,

    /// Attempts against one merchant inside the window before the guard
    /// blocks. Merchants aggregate many users, so this sits well above the
    /// per-IP limit.
    pub merchant_attempt_limit: u32,

    // ==========================================
    // WEBHOOK SETTINGS
    // ==========================================
    /// Hard timeout for a single delivery attempt, in seconds.
    pub webhook_timeout_secs: u64,

    /// Total attempts (first + retries) before a delivery is marked
    /// permanently failed.
    pub webhook_max_retries: u32,

    /// How often the retry scheduler scans for ready items, in seconds.
    pub retry_poll_interval_secs: u64,

    /// Trailing window for failure spike detection, in seconds.
    pub failure_spike_window_secs: u64,

    /// Permanent failures for one merchant inside the window that raise a
    /// high-severity alert.
    pub failure_spike_threshold: usize,

    // ==========================================
    // ALERT CHANNEL SETTINGS
    // ==========================================
    /// Shared secret observers must present before joining the alert
    /// broadcast group.
    pub alert_channel_secret: String,
}

impl DefenseConfig {
    /// Load configuration from environment variables.
    ///
    /// A `.env` file in the working directory is loaded first; variables
    /// already set in the real environment win over `.env` values.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Ok(Self {
            velocity_window_secs: parse_env_or("FRAUD_VELOCITY_WINDOW_SECS", 60)?,
            ip_attempt_limit: parse_env_or("FRAUD_IP_ATTEMPT_LIMIT", 5)?,
            merchant_attempt_limit: parse_env_or("FRAUD_MERCHANT_ATTEMPT_LIMIT", 20)?,
            webhook_timeout_secs: parse_env_or("WEBHOOK_TIMEOUT_SECS", 10)?,
            webhook_max_retries: parse_env_or("WEBHOOK_MAX_RETRIES", 5)?,
            retry_poll_interval_secs: parse_env_or("WEBHOOK_RETRY_POLL_INTERVAL_SECS", 60)?,
            failure_spike_window_secs: parse_env_or("WEBHOOK_FAILURE_SPIKE_WINDOW_SECS", 600)?,
            failure_spike_threshold: parse_env_or("WEBHOOK_FAILURE_SPIKE_THRESHOLD", 3)?,
            alert_channel_secret: get_env("ALERT_CHANNEL_SECRET")?,
        })
    }

    /// Deterministic configuration for unit tests. Avoids env mutation so
    /// tests stay parallel-safe.
    pub fn for_tests() -> Self {
        Self {
            velocity_window_secs: 60,
            ip_attempt_limit: 5,
            merchant_attempt_limit: 20,
            webhook_timeout_secs: 10,
            webhook_max_retries: 5,
            retry_poll_interval_secs: 60,
            failure_spike_window_secs: 600,
            failure_spike_threshold: 3,
            alert_channel_secret: "test-secret".to_string(),
        }
    }
}

/// Get a required environment variable.
fn get_env(key: &str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_string()))
}

/// Parse an environment variable, falling back to a default when unset.
/// An unparseable value is an error, not a silent fallback.
fn parse_env_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(value) => value
            .parse()
            .map_err(|e: T::Err| ConfigError::ParseError(key.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_env_or_returns_default_when_unset() {
        let value: u64 = parse_env_or("NONEXISTENT_VAR_12345", 42).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn test_from_env_requires_alert_secret() {
        crate::test_support::init_tracing();
        // The secret has no default; everything else does. Whether the
        // variable is set depends on the host environment, so accept both
        // outcomes but nothing else.
        match DefenseConfig::from_env() {
            Ok(config) => assert!(!config.alert_channel_secret.is_empty()),
            Err(ConfigError::MissingEnvVar(var)) => assert_eq!(var, "ALERT_CHANNEL_SECRET"),
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    #[test]
    fn test_for_tests_matches_documented_defaults() {
        let config = DefenseConfig::for_tests();
        assert_eq!(config.webhook_max_retries, 5);
        assert_eq!(config.failure_spike_threshold, 3);
        assert_eq!(config.webhook_timeout_secs, 10);
    }
}
