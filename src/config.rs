//! Configuration module for the location streamer.
//!
//! This module provides environment-based configuration: ingestion endpoint,
//! credential paths, sampling thresholds and retry/backpressure settings.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::certs::CertificatePaths;
use crate::queue::{QueueConfig, RetryPolicy};
use crate::sampler::SamplingThresholds;

const ENDPOINT_URL_VAR: &str = "LOCATION_STREAMER_ENDPOINT_URL";
const CERT_PATH_VAR: &str = "LOCATION_STREAMER_CERT_PATH";
const KEY_PATH_VAR: &str = "LOCATION_STREAMER_KEY_PATH";
const ROOT_CA_PATH_VAR: &str = "LOCATION_STREAMER_ROOT_CA_PATH";
const MIN_INTERVAL_VAR: &str = "LOCATION_STREAMER_MIN_INTERVAL_MS";
const MIN_DISTANCE_VAR: &str = "LOCATION_STREAMER_MIN_DISTANCE_M";
const RETRY_BUDGET_VAR: &str = "LOCATION_STREAMER_RETRY_BUDGET";
const BASE_BACKOFF_VAR: &str = "LOCATION_STREAMER_BASE_BACKOFF_MS";
const MAX_BACKOFF_VAR: &str = "LOCATION_STREAMER_MAX_BACKOFF_SECS";
const QUEUE_CAPACITY_VAR: &str = "LOCATION_STREAMER_QUEUE_CAPACITY";
const REQUEST_TIMEOUT_VAR: &str = "LOCATION_STREAMER_REQUEST_TIMEOUT_SECS";

/// Endpoint used by `Config::default`, for tests and local runs.
const DEFAULT_ENDPOINT_URL: &str = "https://localhost:8443/topics/location?qos=1";

const DEFAULT_CERT_PATH: &str = "certs/client.pem.crt";
const DEFAULT_KEY_PATH: &str = "certs/client.pem.key";
const DEFAULT_ROOT_CA_PATH: &str = "certs/root-ca.pem";

const DEFAULT_MIN_INTERVAL_MS: u64 = 1_000;
const MAX_MIN_INTERVAL_MS: u64 = 3_600_000;

const DEFAULT_RETRY_BUDGET: u32 = 5;
const MAX_RETRY_BUDGET: u32 = 20;

const DEFAULT_BASE_BACKOFF_MS: u64 = 1_000;

const DEFAULT_MAX_BACKOFF_SECS: u64 = 30;
const MAX_MAX_BACKOFF_SECS: u64 = 600;

const DEFAULT_QUEUE_CAPACITY: usize = 50;
const MAX_QUEUE_CAPACITY: usize = 1_000;

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

/// Configuration for the location streamer.
///
/// All settings can be configured via environment variables:
/// - `LOCATION_STREAMER_ENDPOINT_URL`: HTTPS ingestion URL (required)
/// - `LOCATION_STREAMER_CERT_PATH` / `_KEY_PATH` / `_ROOT_CA_PATH`: mutual TLS credentials
/// - `LOCATION_STREAMER_MIN_INTERVAL_MS`: minimum time between samples (default: 1000)
/// - `LOCATION_STREAMER_MIN_DISTANCE_M`: minimum displacement between samples (default: 0)
/// - `LOCATION_STREAMER_RETRY_BUDGET`: retries per sample (default: 5)
/// - `LOCATION_STREAMER_BASE_BACKOFF_MS`: backoff base delay (default: 1000)
/// - `LOCATION_STREAMER_MAX_BACKOFF_SECS`: backoff cap (default: 30)
/// - `LOCATION_STREAMER_QUEUE_CAPACITY`: retry queue bound (default: 50)
/// - `LOCATION_STREAMER_REQUEST_TIMEOUT_SECS`: per-attempt timeout (default: 10)
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Full URL of the ingestion endpoint
    pub endpoint_url: String,

    /// Client certificate, private key and trusted root locations
    pub certificates: CertificatePaths,

    /// Minimum wall time between accepted samples
    pub min_interval: Duration,

    /// Minimum displacement in meters between accepted samples
    pub min_distance: f64,

    /// Retries allowed per sample after the first attempt
    pub retry_budget: u32,

    /// Base delay for exponential backoff
    pub base_backoff: Duration,

    /// Cap on the backoff delay
    pub max_backoff: Duration,

    /// Maximum number of samples waiting for delivery
    pub queue_capacity: usize,

    /// Per-attempt HTTP timeout
    pub request_timeout: Duration,
}

/// Error type for configuration loading failures
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub env_var: Option<String>,
}

impl ConfigError {
    fn for_var(env_var: &str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            env_var: Some(env_var.to_string()),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.env_var {
            Some(var) => write!(f, "Configuration error for {}: {}", var, self.message),
            None => write!(f, "Configuration error: {}", self.message),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - `LOCATION_STREAMER_ENDPOINT_URL` is missing or not an `https://` URL
    /// - a numeric variable does not parse or falls outside its allowed range
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use location_streamer::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Endpoint: {}", config.endpoint_url);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let endpoint_url = Self::parse_endpoint_url()?;

        let certificates = CertificatePaths::new(
            Self::parse_path(CERT_PATH_VAR, DEFAULT_CERT_PATH)?,
            Self::parse_path(KEY_PATH_VAR, DEFAULT_KEY_PATH)?,
            Self::parse_path(ROOT_CA_PATH_VAR, DEFAULT_ROOT_CA_PATH)?,
        );

        let min_interval_ms: u64 = parse_var(MIN_INTERVAL_VAR, DEFAULT_MIN_INTERVAL_MS)?;
        if min_interval_ms > MAX_MIN_INTERVAL_MS {
            return Err(ConfigError::for_var(
                MIN_INTERVAL_VAR,
                format!(
                    "minimum interval {}ms exceeds maximum ({}ms)",
                    min_interval_ms, MAX_MIN_INTERVAL_MS
                ),
            ));
        }

        let min_distance: f64 = parse_var(MIN_DISTANCE_VAR, 0.0)?;
        if !min_distance.is_finite() || min_distance < 0.0 {
            return Err(ConfigError::for_var(
                MIN_DISTANCE_VAR,
                "minimum distance must be a finite, non-negative number of meters",
            ));
        }

        let retry_budget: u32 = parse_var(RETRY_BUDGET_VAR, DEFAULT_RETRY_BUDGET)?;
        if retry_budget > MAX_RETRY_BUDGET {
            return Err(ConfigError::for_var(
                RETRY_BUDGET_VAR,
                format!(
                    "retry budget {} exceeds maximum ({})",
                    retry_budget, MAX_RETRY_BUDGET
                ),
            ));
        }

        let base_backoff_ms: u64 = parse_var(BASE_BACKOFF_VAR, DEFAULT_BASE_BACKOFF_MS)?;
        if base_backoff_ms == 0 {
            return Err(ConfigError::for_var(
                BASE_BACKOFF_VAR,
                "base backoff must be greater than 0",
            ));
        }

        let max_backoff_secs: u64 = parse_var(MAX_BACKOFF_VAR, DEFAULT_MAX_BACKOFF_SECS)?;
        if max_backoff_secs == 0 || max_backoff_secs > MAX_MAX_BACKOFF_SECS {
            return Err(ConfigError::for_var(
                MAX_BACKOFF_VAR,
                format!(
                    "max backoff {}s must be between 1 and {}",
                    max_backoff_secs, MAX_MAX_BACKOFF_SECS
                ),
            ));
        }

        let queue_capacity: usize = parse_var(QUEUE_CAPACITY_VAR, DEFAULT_QUEUE_CAPACITY)?;
        if queue_capacity == 0 {
            return Err(ConfigError::for_var(
                QUEUE_CAPACITY_VAR,
                "queue capacity must be greater than 0",
            ));
        }
        if queue_capacity > MAX_QUEUE_CAPACITY {
            return Err(ConfigError::for_var(
                QUEUE_CAPACITY_VAR,
                format!(
                    "queue capacity {} exceeds maximum allowed ({})",
                    queue_capacity, MAX_QUEUE_CAPACITY
                ),
            ));
        }

        let request_timeout_secs: u64 =
            parse_var(REQUEST_TIMEOUT_VAR, DEFAULT_REQUEST_TIMEOUT_SECS)?;
        if request_timeout_secs == 0 {
            return Err(ConfigError::for_var(
                REQUEST_TIMEOUT_VAR,
                "request timeout must be greater than 0",
            ));
        }

        Ok(Self {
            endpoint_url,
            certificates,
            min_interval: Duration::from_millis(min_interval_ms),
            min_distance,
            retry_budget,
            base_backoff: Duration::from_millis(base_backoff_ms),
            max_backoff: Duration::from_secs(max_backoff_secs),
            queue_capacity,
            request_timeout: Duration::from_secs(request_timeout_secs),
        })
    }

    fn parse_endpoint_url() -> Result<String, ConfigError> {
        let value = env::var(ENDPOINT_URL_VAR)
            .map_err(|_| ConfigError::for_var(ENDPOINT_URL_VAR, "ingestion endpoint is required"))?;

        let value = value.trim().to_string();
        if !value.starts_with("https://") || value.len() <= "https://".len() {
            return Err(ConfigError::for_var(
                ENDPOINT_URL_VAR,
                format!("'{}' is not an https:// URL", value),
            ));
        }

        Ok(value)
    }

    fn parse_path(env_var: &str, default: &str) -> Result<String, ConfigError> {
        match env::var(env_var) {
            Ok(value) if value.trim().is_empty() => {
                Err(ConfigError::for_var(env_var, "path must not be empty"))
            }
            Ok(value) => Ok(value),
            Err(_) => Ok(default.to_string()),
        }
    }

    /// Sampling thresholds for a new session.
    pub fn thresholds(&self) -> SamplingThresholds {
        SamplingThresholds::new(self.min_interval, self.min_distance)
    }

    /// Retry queue settings for a new session.
    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig::new(
            self.queue_capacity,
            RetryPolicy {
                retry_budget: self.retry_budget,
                base_backoff: self.base_backoff,
                max_backoff: self.max_backoff,
            },
        )
    }
}

/// Parse an optional numeric variable, falling back to `default` when unset.
fn parse_var<T: FromStr>(env_var: &str, default: T) -> Result<T, ConfigError> {
    match env::var(env_var) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::for_var(env_var, format!("'{}' is not a valid number", value))),
        Err(_) => Ok(default),
    }
}

impl Default for Config {
    /// Create a default configuration using default values.
    ///
    /// This is useful for testing or when environment variables are not set.
    fn default() -> Self {
        Self {
            endpoint_url: DEFAULT_ENDPOINT_URL.to_string(),
            certificates: CertificatePaths::new(
                DEFAULT_CERT_PATH,
                DEFAULT_KEY_PATH,
                DEFAULT_ROOT_CA_PATH,
            ),
            min_interval: Duration::from_millis(DEFAULT_MIN_INTERVAL_MS),
            min_distance: 0.0,
            retry_budget: DEFAULT_RETRY_BUDGET,
            base_backoff: Duration::from_millis(DEFAULT_BASE_BACKOFF_MS),
            max_backoff: Duration::from_secs(DEFAULT_MAX_BACKOFF_SECS),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::{Mutex, MutexGuard};

    // Tests in this module share process-wide environment variables
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn lock_env() -> MutexGuard<'static, ()> {
        ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // Helper to temporarily set environment variables for testing
    struct EnvGuard {
        key: String,
        original: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &str, value: &str) -> Self {
            let original = env::var(key).ok();
            env::set_var(key, value);
            Self {
                key: key.to_string(),
                original,
            }
        }

        fn remove(key: &str) -> Self {
            let original = env::var(key).ok();
            env::remove_var(key);
            Self {
                key: key.to_string(),
                original,
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.original {
                Some(val) => env::set_var(&self.key, val),
                None => env::remove_var(&self.key),
            }
        }
    }

    fn clear_optional_vars() -> Vec<EnvGuard> {
        [
            CERT_PATH_VAR,
            KEY_PATH_VAR,
            ROOT_CA_PATH_VAR,
            MIN_INTERVAL_VAR,
            MIN_DISTANCE_VAR,
            RETRY_BUDGET_VAR,
            BASE_BACKOFF_VAR,
            MAX_BACKOFF_VAR,
            QUEUE_CAPACITY_VAR,
            REQUEST_TIMEOUT_VAR,
        ]
        .iter()
        .map(|var| EnvGuard::remove(var))
        .collect()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.endpoint_url.starts_with("https://"));
        assert_eq!(config.retry_budget, 5);
        assert_eq!(config.max_backoff, Duration::from_secs(30));
        assert_eq!(config.queue_capacity, 50);
        assert_eq!(config.min_distance, 0.0);
    }

    #[test]
    fn test_endpoint_is_required() {
        let _lock = lock_env();
        let _guard = EnvGuard::remove(ENDPOINT_URL_VAR);

        let err = Config::from_env().unwrap_err();
        assert_eq!(err.env_var.as_deref(), Some(ENDPOINT_URL_VAR));
        assert!(err.message.contains("required"));
    }

    #[test]
    fn test_endpoint_must_be_https() {
        let _lock = lock_env();
        let _guard = EnvGuard::set(ENDPOINT_URL_VAR, "http://insecure.example.com/ingest");

        let err = Config::from_env().unwrap_err();
        assert!(err.message.contains("https://"));
    }

    #[test]
    fn test_config_from_env_with_defaults() {
        let _lock = lock_env();
        let _endpoint = EnvGuard::set(ENDPOINT_URL_VAR, "https://iot.example.com:8443/topics/track");
        let _cleared = clear_optional_vars();

        let config = Config::from_env().expect("Should load with defaults");
        assert_eq!(config.endpoint_url, "https://iot.example.com:8443/topics/track");
        assert_eq!(config.certificates.certificate.to_str(), Some("certs/client.pem.crt"));
        assert_eq!(config.min_interval, Duration::from_secs(1));
        assert_eq!(config.retry_budget, 5);
        assert_eq!(config.queue_capacity, 50);
        assert_eq!(config.request_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_config_from_env_custom_values() {
        let _lock = lock_env();
        let _cleared = clear_optional_vars();
        let _g1 = EnvGuard::set(ENDPOINT_URL_VAR, " https://iot.example.com/topics/t ");
        let _g2 = EnvGuard::set(MIN_INTERVAL_VAR, "5000");
        let _g3 = EnvGuard::set(MIN_DISTANCE_VAR, "12.5");
        let _g4 = EnvGuard::set(QUEUE_CAPACITY_VAR, "2");
        let _g5 = EnvGuard::set(MAX_BACKOFF_VAR, "8");
        let _g6 = EnvGuard::set(KEY_PATH_VAR, "/etc/device/key.pem");

        let config = Config::from_env().expect("Should load custom values");
        assert_eq!(config.endpoint_url, "https://iot.example.com/topics/t");
        assert_eq!(config.min_interval, Duration::from_secs(5));
        assert_eq!(config.min_distance, 12.5);
        assert_eq!(config.queue_capacity, 2);
        assert_eq!(config.max_backoff, Duration::from_secs(8));
        assert_eq!(
            config.certificates.private_key.to_str(),
            Some("/etc/device/key.pem")
        );

        let thresholds = config.thresholds();
        assert_eq!(thresholds.min_interval, Duration::from_secs(5));
        let queue = config.queue_config();
        assert_eq!(queue.capacity, 2);
        assert_eq!(queue.policy.max_backoff, Duration::from_secs(8));
    }

    #[test]
    fn test_invalid_number() {
        let _lock = lock_env();
        let _cleared = clear_optional_vars();
        let _endpoint = EnvGuard::set(ENDPOINT_URL_VAR, "https://iot.example.com");
        let _guard = EnvGuard::set(RETRY_BUDGET_VAR, "lots");

        let err = Config::from_env().unwrap_err();
        assert!(err.message.contains("not a valid number"));
        assert_eq!(err.env_var.as_deref(), Some(RETRY_BUDGET_VAR));
    }

    #[test]
    fn test_zero_queue_capacity() {
        let _lock = lock_env();
        let _cleared = clear_optional_vars();
        let _endpoint = EnvGuard::set(ENDPOINT_URL_VAR, "https://iot.example.com");
        let _guard = EnvGuard::set(QUEUE_CAPACITY_VAR, "0");

        let err = Config::from_env().unwrap_err();
        assert!(err.message.contains("greater than 0"));
    }

    #[test]
    fn test_queue_capacity_exceeds_max() {
        let _lock = lock_env();
        let _cleared = clear_optional_vars();
        let _endpoint = EnvGuard::set(ENDPOINT_URL_VAR, "https://iot.example.com");
        let _guard = EnvGuard::set(QUEUE_CAPACITY_VAR, "99999");

        let err = Config::from_env().unwrap_err();
        assert!(err.message.contains("exceeds maximum"));
    }

    #[test]
    fn test_negative_distance_rejected() {
        let _lock = lock_env();
        let _cleared = clear_optional_vars();
        let _endpoint = EnvGuard::set(ENDPOINT_URL_VAR, "https://iot.example.com");
        let _guard = EnvGuard::set(MIN_DISTANCE_VAR, "-3");

        let err = Config::from_env().unwrap_err();
        assert!(err.message.contains("non-negative"));
    }

    #[test]
    fn test_max_backoff_out_of_range() {
        let _lock = lock_env();
        let _cleared = clear_optional_vars();
        let _endpoint = EnvGuard::set(ENDPOINT_URL_VAR, "https://iot.example.com");
        let _guard = EnvGuard::set(MAX_BACKOFF_VAR, "0");

        assert!(Config::from_env().is_err());
    }

    #[test]
    fn test_empty_path_rejected() {
        let _lock = lock_env();
        let _cleared = clear_optional_vars();
        let _endpoint = EnvGuard::set(ENDPOINT_URL_VAR, "https://iot.example.com");
        let _guard = EnvGuard::set(ROOT_CA_PATH_VAR, "  ");

        let err = Config::from_env().unwrap_err();
        assert_eq!(err.env_var.as_deref(), Some(ROOT_CA_PATH_VAR));
    }

    #[test]
    fn test_config_error_display() {
        let error = ConfigError {
            message: "test error".to_string(),
            env_var: Some("TEST_VAR".to_string()),
        };
        assert_eq!(
            format!("{}", error),
            "Configuration error for TEST_VAR: test error"
        );

        let error_no_var = ConfigError {
            message: "general error".to_string(),
            env_var: None,
        };
        assert_eq!(
            format!("{}", error_no_var),
            "Configuration error: general error"
        );
    }
}
