//! Retry utilities with exponential backoff and jitter.
//!
//! Reads against the API server are idempotent, so a reconcile pass may retry
//! them in place. Writes are never retried here: a failed write ends the pass
//! and the controller re-runs it from scratch, after a delay from
//! [`FailureBackoff`] that grows while the same IdentityServer keeps failing.
//!
//! # Example
//!
//! ```ignore
//! use warden_common::retry::{retry_transient, RetryConfig};
//!
//! let ingress = retry_transient(
//!     &RetryConfig::with_max_attempts(3),
//!     "get_ingress",
//!     || client.get_ingress("ns", "keycloak-ingress"),
//! ).await?;
//! ```

use std::future::Future;
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use tracing::{error, warn};

use crate::Error;

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0, // infinite
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Delay before the next attempt, capped at `max_delay`
    fn next_delay(&self, delay: Duration) -> Duration {
        Duration::from_secs_f64(
            (delay.as_secs_f64() * self.backoff_multiplier).min(self.max_delay.as_secs_f64()),
        )
    }
}

/// Execute an async operation with exponential backoff and jitter.
///
/// Retries until success, or until `max_attempts` is exhausted when set.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_while(config, operation_name, operation, |_| true).await
}

/// Like [`retry_with_backoff`], but gives up immediately on errors that
/// [`Error::is_retryable`] classifies as permanent.
pub async fn retry_transient<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    operation: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    retry_while(config, operation_name, operation, Error::is_retryable).await
}

async fn retry_while<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !should_retry(&e) => return Err(e),
            Err(e) => {
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                // Jitter: 0.5x to 1.5x of the delay
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let jittered_delay = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = jittered_delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(jittered_delay).await;
                delay = config.next_delay(delay);
            }
        }
    }
}

/// Requeue delays that double with each consecutive failure of one object.
///
/// Keys are object identities (`namespace/name`). The count is dropped by
/// [`FailureBackoff::reset`] once a pass for that object succeeds.
#[derive(Debug)]
pub struct FailureBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    failures: DashMap<String, u32>,
}

impl FailureBackoff {
    /// First failure waits `initial_delay`; later ones double up to `max_delay`
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            failures: DashMap::new(),
        }
    }

    /// Record a failure for `key` and return how long to wait before the next pass
    pub fn next_delay(&self, key: &str) -> Duration {
        let exponent = {
            let mut count = self.failures.entry(key.to_string()).or_insert(0);
            let exponent = *count;
            *count = count.saturating_add(1);
            exponent
        };
        let factor = 2f64.powi(exponent.min(32) as i32);
        Duration::from_secs_f64(
            (self.initial_delay.as_secs_f64() * factor).min(self.max_delay.as_secs_f64()),
        )
    }

    /// Consecutive failures recorded for `key`
    pub fn failures(&self, key: &str) -> u32 {
        self.failures.get(key).map(|count| *count).unwrap_or(0)
    }

    /// Forget the failures of `key` after a successful pass
    pub fn reset(&self, key: &str) {
        self.failures.remove(key);
    }
}
