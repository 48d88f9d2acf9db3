//! Retry policy with exponential backoff.
//!
//! The retry loop is deliberately ignorant of the error taxonomy: it branches
//! only on [`AiError::retryable`], which the provider adapters set during
//! classification. Backoff is pure exponential with no jitter.
//!
//! # Policy
//!
//! - Max retries: 3 (4 total attempts)
//! - Initial delay: 1s, doubled per retry, capped at 30s
//! - Each attempt races an optional per-attempt deadline; an elapsed deadline
//!   counts as a retryable timeout
//! - A non-retryable error propagates immediately, unchanged

use std::future::Future;
use std::time::Duration;

use ember_types::{AiError, AiErrorKind, Provider};

/// Retry configuration.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retries (not counting the initial attempt).
    pub max_retries: u32,
    /// Backoff delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on any single backoff delay.
    pub max_delay: Duration,
    /// Growth factor applied per retry.
    pub backoff_multiplier: f64,
    /// Deadline for a single attempt; `None` means attempts are unbounded.
    pub attempt_timeout: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            attempt_timeout: Some(Duration::from_secs(120)),
        }
    }
}

/// Calculate the backoff delay before retry `backoff_step` (0-based).
///
/// `initial_delay * backoff_multiplier^backoff_step`, capped at `max_delay`.
/// No jitter: two runs with the same config see the same schedule.
#[must_use]
pub fn calculate_retry_delay(backoff_step: u32, config: &RetryConfig) -> Duration {
    let base =
        config.initial_delay.as_secs_f64() * config.backoff_multiplier.powi(backoff_step as i32);
    let capped = base.min(config.max_delay.as_secs_f64());
    Duration::from_secs_f64(capped)
}

/// Run `op` with automatic retries.
///
/// `op` is invoked once per attempt. An attempt that outlives
/// `config.attempt_timeout` is converted into a retryable
/// [`AiErrorKind::Timeout`] attributed to `provider`. The loop stops on the
/// first success, the first non-retryable error, or after
/// `config.max_retries` retries; the final error is returned unchanged.
pub async fn execute_with_retry<T, F, Fut>(
    provider: Provider,
    config: &RetryConfig,
    mut op: F,
) -> Result<T, AiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AiError>>,
{
    let mut attempt: u32 = 0;
    loop {
        let result = match config.attempt_timeout {
            Some(deadline) => match tokio::time::timeout(deadline, op()).await {
                Ok(result) => result,
                Err(_) => Err(AiError::new(
                    AiErrorKind::Timeout,
                    provider,
                    format!("attempt exceeded {}s deadline", deadline.as_secs()),
                )),
            },
            None => op().await,
        };

        match result {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !err.retryable() || attempt >= config.max_retries {
                    return Err(err);
                }
                let delay = calculate_retry_delay(attempt, config);
                tracing::debug!(
                    provider = %provider,
                    kind = err.kind().as_str(),
                    retry = attempt + 1,
                    delay_ms = delay.as_millis(),
                    "Retrying after retryable provider error"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
