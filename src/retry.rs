//! Retry and timeout utilities.
//!
//! The helpers in this module are transport-agnostic. [`RetryPolicy`] drives
//! both request retries in [`crate::request`] and the reconnect schedule of
//! [`crate::stream::connection`].

use std::collections::BTreeSet;
use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::config::{ClientDefaults, ConfigError};

/// Policy controlling retry attempts and exponential backoff behavior.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts including the first attempt.
    pub max_attempts: usize,
    /// Delay used before the first retry.
    pub base_delay: Duration,
    /// Growth factor applied to the delay after every failed attempt.
    pub backoff_multiplier: f64,
    /// Upper bound for exponential backoff delay growth.
    pub max_delay: Duration,
    /// Maximum random jitter added to each retry delay.
    pub jitter: Duration,
    /// HTTP statuses worth another attempt.
    pub retryable_status_codes: BTreeSet<u16>,
    /// HTTP statuses that are never retried. Checked before
    /// `retryable_status_codes`.
    pub non_retryable_status_codes: BTreeSet<u16>,
    /// Transport error codes (`ECONNRESET`, `ETIMEDOUT`, ...) worth another
    /// attempt.
    pub retryable_network_error_codes: BTreeSet<String>,
}

impl RetryPolicy {
    /// Default policy for request/response calls.
    pub fn request_default() -> Self {
        Self {
            max_attempts: ClientDefaults::REQUEST_MAX_ATTEMPTS,
            base_delay: ClientDefaults::BASE_DELAY,
            backoff_multiplier: ClientDefaults::BACKOFF_MULTIPLIER,
            max_delay: ClientDefaults::MAX_DELAY,
            jitter: Duration::ZERO,
            retryable_status_codes: ClientDefaults::RETRYABLE_STATUS_CODES
                .iter()
                .copied()
                .collect(),
            non_retryable_status_codes: ClientDefaults::NON_RETRYABLE_STATUS_CODES
                .iter()
                .copied()
                .collect(),
            retryable_network_error_codes: ClientDefaults::RETRYABLE_NETWORK_ERROR_CODES
                .iter()
                .map(|code| code.to_string())
                .collect(),
        }
    }

    /// Default policy for stream reconnects.
    pub fn reconnect_default() -> Self {
        Self {
            max_attempts: ClientDefaults::RECONNECT_MAX_ATTEMPTS,
            ..Self::request_default()
        }
    }

    /// Returns a copy of this policy that makes exactly one attempt.
    pub fn single_attempt(mut self) -> Self {
        self.max_attempts = 1;
        self
    }

    /// Checks the numeric bounds and that the status sets are disjoint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts < 1 {
            return Err(ConfigError::Invalid(
                "max_attempts must be >= 1".to_string(),
            ));
        }
        if self.base_delay.is_zero() {
            return Err(ConfigError::Invalid("base_delay must be > 0".to_string()));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier <= 1.0 {
            return Err(ConfigError::Invalid(
                "backoff_multiplier must be a finite number > 1".to_string(),
            ));
        }
        if self.max_delay < self.base_delay {
            return Err(ConfigError::Invalid(
                "max_delay must be >= base_delay".to_string(),
            ));
        }
        let overlap: Vec<u16> = self
            .retryable_status_codes
            .intersection(&self.non_retryable_status_codes)
            .copied()
            .collect();
        if !overlap.is_empty() {
            return Err(ConfigError::OverlappingStatusCodes(overlap));
        }
        Ok(())
    }

    /// Computes the delay to apply after the given failed attempt.
    ///
    /// `attempt` is 1-based: attempt 1 waits `base_delay`, attempt 2 waits
    /// `base_delay * backoff_multiplier`, and so on up to `max_delay`.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as usize) as i32;
        let factor = self.backoff_multiplier.powi(exponent);
        let nanos = self.base_delay.as_nanos() as f64 * factor;
        let delay = if nanos.is_finite() && nanos < self.max_delay.as_nanos() as f64 {
            Duration::from_nanos(nanos.round() as u64)
        } else {
            self.max_delay
        };
        delay + jitter_duration(self.jitter, attempt)
    }

    /// Whether a response with `status` may be retried.
    pub fn is_status_retryable(&self, status: u16) -> bool {
        if self.non_retryable_status_codes.contains(&status) {
            return false;
        }
        self.retryable_status_codes.contains(&status)
    }

    /// Whether a transport failure may be retried.
    ///
    /// Failures without an identifying code are generic transport failures
    /// and are retried.
    pub fn is_network_code_retryable(&self, code: Option<&str>) -> bool {
        match code {
            Some(code) => self.retryable_network_error_codes.contains(code),
            None => true,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::request_default()
    }
}

/// Executes an async operation with retry behavior controlled by `policy`.
///
/// `op` receives the 1-based attempt number and must return a future that
/// resolves to the operation result. `should_retry` determines whether each
/// error is retryable.
pub async fn retry_async<T, E, Op, Fut, ShouldRetry>(
    policy: &RetryPolicy,
    mut op: Op,
    mut should_retry: ShouldRetry,
) -> Result<T, E>
where
    Op: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    ShouldRetry: FnMut(&E) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if attempt >= max_attempts || !should_retry(&error) {
                    return Err(error);
                }

                let delay = policy.delay_for_attempt(attempt);
                debug!(
                    event = "retry_attempt_failed",
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                attempt += 1;
            }
        }
    }
}

/// Applies a timeout to an async computation.
pub async fn with_timeout<T, Fut>(
    timeout: Duration,
    future: Fut,
) -> Result<T, tokio::time::error::Elapsed>
where
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, future).await
}

fn jitter_duration(max_jitter: Duration, attempt: usize) -> Duration {
    if max_jitter.is_zero() {
        return Duration::ZERO;
    }

    let limit_nanos = max_jitter.as_nanos().min(u64::MAX as u128) as u64;
    if limit_nanos == 0 {
        return Duration::ZERO;
    }

    let now_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    let mixed = now_nanos ^ ((attempt as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    Duration::from_nanos(mixed % (limit_nanos + 1))
}
