//! Client defaults and the deserialisable configuration surface.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::failure::FailureKind;
use crate::request::RequestExecutorOptions;
use crate::retry::RetryPolicy;
use crate::stream::client::StreamOptions;

/// Built-in defaults used when a value is not configured.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ClientDefaults;

impl ClientDefaults {
    pub const API_BASE_URL: &'static str = "http://localhost:8000/api";
    pub const STREAM_BASE_URL: &'static str = "ws://localhost:8000";
    pub const REQUEST_MAX_ATTEMPTS: usize = 3;
    pub const RECONNECT_MAX_ATTEMPTS: usize = 5;
    pub const BASE_DELAY: Duration = Duration::from_millis(1_000);
    pub const MAX_DELAY: Duration = Duration::from_millis(30_000);
    pub const BACKOFF_MULTIPLIER: f64 = 2.0;
    pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(30_000);
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);
    pub const RETRYABLE_STATUS_CODES: [u16; 6] = [408, 429, 500, 502, 503, 504];
    pub const NON_RETRYABLE_STATUS_CODES: [u16; 4] = [400, 401, 403, 404];
    pub const RETRYABLE_NETWORK_ERROR_CODES: [&'static str; 7] = [
        "ECONNRESET",
        "ECONNREFUSED",
        "ETIMEDOUT",
        "ECONNABORTED",
        "EPIPE",
        "ENOTFOUND",
        "EAI_AGAIN",
    ];
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A value is outside its allowed range.
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// A status code was listed as both retryable and non-retryable.
    #[error("status codes listed as both retryable and non-retryable: {0:?}")]
    OverlappingStatusCodes(Vec<u16>),

    /// Configuration document could not be decoded.
    #[error("failed to parse configuration: {0}")]
    Json(#[from] serde_json::Error),

    /// Endpoint is not a valid URL.
    #[error("invalid endpoint: {0}")]
    Endpoint(#[from] url::ParseError),

    /// HTTP client could not be constructed.
    #[error("failed to build http client: {0}")]
    HttpClient(#[source] reqwest::Error),
}

impl ConfigError {
    pub fn kind(&self) -> FailureKind {
        FailureKind::Config
    }
}

/// Client configuration. Every field is optional.
///
/// Keys are camelCase; snake_case spellings are accepted as aliases.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct ClientConfig {
    #[serde(alias = "api_base_url")]
    pub api_base_url: String,
    #[serde(alias = "stream_base_url")]
    pub stream_base_url: String,
    #[serde(alias = "retry_enabled")]
    pub retry_enabled: bool,
    #[serde(alias = "max_attempts")]
    pub max_attempts: usize,
    #[serde(alias = "reconnect_max_attempts")]
    pub reconnect_max_attempts: usize,
    #[serde(alias = "base_delay_ms", alias = "baseDelayMs")]
    pub base_delay: u64,
    #[serde(alias = "max_delay_ms", alias = "maxDelayMs")]
    pub max_delay: u64,
    #[serde(alias = "backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(alias = "heartbeat_interval_ms", alias = "heartbeatIntervalMs")]
    pub heartbeat_interval: u64,
    /// Per-attempt stream connect timeout in milliseconds. `null` disables it.
    #[serde(alias = "connect_timeout_ms", alias = "connectTimeoutMs")]
    pub connect_timeout: Option<u64>,
    /// Stream idle timeout in milliseconds. Off unless set.
    #[serde(alias = "idle_timeout_ms", alias = "idleTimeoutMs")]
    pub idle_timeout: Option<u64>,
    /// Per-attempt HTTP request timeout in milliseconds.
    #[serde(alias = "attempt_timeout_ms", alias = "attemptTimeoutMs")]
    pub attempt_timeout: u64,
    #[serde(alias = "retryable_status_codes")]
    pub retryable_status_codes: Vec<u16>,
    #[serde(alias = "non_retryable_status_codes")]
    pub non_retryable_status_codes: Vec<u16>,
    #[serde(alias = "retryable_network_error_codes")]
    pub retryable_network_error_codes: Vec<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: ClientDefaults::API_BASE_URL.to_string(),
            stream_base_url: ClientDefaults::STREAM_BASE_URL.to_string(),
            retry_enabled: true,
            max_attempts: ClientDefaults::REQUEST_MAX_ATTEMPTS,
            reconnect_max_attempts: ClientDefaults::RECONNECT_MAX_ATTEMPTS,
            base_delay: ClientDefaults::BASE_DELAY.as_millis() as u64,
            max_delay: ClientDefaults::MAX_DELAY.as_millis() as u64,
            backoff_multiplier: ClientDefaults::BACKOFF_MULTIPLIER,
            heartbeat_interval: ClientDefaults::HEARTBEAT_INTERVAL.as_millis() as u64,
            connect_timeout: Some(ClientDefaults::CONNECT_TIMEOUT.as_millis() as u64),
            idle_timeout: None,
            attempt_timeout: ClientDefaults::ATTEMPT_TIMEOUT.as_millis() as u64,
            retryable_status_codes: ClientDefaults::RETRYABLE_STATUS_CODES.to_vec(),
            non_retryable_status_codes: ClientDefaults::NON_RETRYABLE_STATUS_CODES.to_vec(),
            retryable_network_error_codes: ClientDefaults::RETRYABLE_NETWORK_ERROR_CODES
                .iter()
                .map(|code| code.to_string())
                .collect(),
        }
    }
}

impl ClientConfig {
    /// Parses a JSON document, filling unset fields with defaults.
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        url::Url::parse(&self.api_base_url)?;
        url::Url::parse(&self.stream_base_url)?;
        if self.heartbeat_interval == 0 {
            return Err(ConfigError::Invalid(
                "heartbeatInterval must be > 0".to_string(),
            ));
        }
        if self.attempt_timeout == 0 {
            return Err(ConfigError::Invalid(
                "attemptTimeout must be > 0".to_string(),
            ));
        }
        if self.connect_timeout == Some(0) {
            return Err(ConfigError::Invalid(
                "connectTimeout must be > 0 or null".to_string(),
            ));
        }
        if self.idle_timeout == Some(0) {
            return Err(ConfigError::Invalid(
                "idleTimeout must be > 0 or null".to_string(),
            ));
        }
        self.request_policy()?;
        self.reconnect_policy()?;
        Ok(())
    }

    /// Retry policy for request/response calls.
    ///
    /// With `retry_enabled = false` the policy makes a single attempt.
    pub fn request_policy(&self) -> Result<RetryPolicy, ConfigError> {
        let policy = self.policy_with_attempts(self.max_attempts);
        policy.validate()?;
        if self.retry_enabled {
            Ok(policy)
        } else {
            Ok(policy.single_attempt())
        }
    }

    /// Backoff policy for stream reconnects.
    pub fn reconnect_policy(&self) -> Result<RetryPolicy, ConfigError> {
        let policy = self.policy_with_attempts(self.reconnect_max_attempts);
        policy.validate()?;
        Ok(policy)
    }

    pub fn executor_options(&self) -> Result<RequestExecutorOptions, ConfigError> {
        Ok(RequestExecutorOptions {
            base_url: self.api_base_url.clone(),
            attempt_timeout: Duration::from_millis(self.attempt_timeout),
            retry_policy: self.request_policy()?,
            ..RequestExecutorOptions::default()
        })
    }

    pub fn stream_options(&self) -> Result<StreamOptions, ConfigError> {
        Ok(StreamOptions {
            reconnect_enabled: true,
            reconnect_policy: self.reconnect_policy()?,
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval),
            connect_timeout: self.connect_timeout.map(Duration::from_millis),
            idle_timeout: self.idle_timeout.map(Duration::from_millis),
        })
    }

    fn policy_with_attempts(&self, max_attempts: usize) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(self.base_delay),
            backoff_multiplier: self.backoff_multiplier,
            max_delay: Duration::from_millis(self.max_delay),
            jitter: Duration::ZERO,
            retryable_status_codes: self.retryable_status_codes.iter().copied().collect(),
            non_retryable_status_codes: self.non_retryable_status_codes.iter().copied().collect(),
            retryable_network_error_codes: self
                .retryable_network_error_codes
                .iter()
                .cloned()
                .collect(),
        }
    }
}
