//! Retry with exponential backoff for outbound model calls.
//!
//! Every completion request the engine issues goes through
//! [`with_backoff`]. Only the three-kind [`LlmError`] taxonomy decides
//! what retries: rate limits and transient failures back off and retry,
//! permanent failures surface immediately, and after the retry budget is
//! spent the last error is returned unchanged.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::error::LlmError;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the initial attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Fractional jitter applied to each delay, e.g. 0.1 for +-10%.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl RetryConfig {
    /// Backoff delay before retry number `attempt` (zero-based), capped at
    /// `max_delay`, before jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.powi(attempt as i32);
        let raw = self.base_delay.as_secs_f64() * exp;
        Duration::from_secs_f64(raw.min(self.max_delay.as_secs_f64()))
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return delay;
        }
        let factor = rand::rng().random_range(1.0 - self.jitter..1.0 + self.jitter);
        Duration::from_secs_f64((delay.as_secs_f64() * factor).max(0.0))
    }
}

/// Run `call` until it succeeds, fails permanently, or exhausts the retry
/// budget. Retry delays honor a rate-limit `retry_after` hint when it is
/// longer than the computed backoff.
pub async fn with_backoff<T, F, Fut>(config: &RetryConfig, call: F) -> Result<T, LlmError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LlmError>>,
{
    with_backoff_observed(config, call, |error, attempt| {
        warn!(attempt, "model call failed, will retry: {error}");
    })
    .await
}

/// [`with_backoff`] with a caller-supplied observer, invoked once per
/// failed attempt that will be retried.
pub async fn with_backoff_observed<T, F, Fut, O>(
    config: &RetryConfig,
    mut call: F,
    mut on_retry: O,
) -> Result<T, LlmError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LlmError>>,
    O: FnMut(&LlmError, u32),
{
    let mut last_error: Option<LlmError> = None;
    for attempt in 0..=config.max_retries {
        match call().await {
            Ok(value) => return Ok(value),
            Err(error) if !error.is_retryable() => return Err(error),
            Err(error) => {
                if attempt < config.max_retries {
                    on_retry(&error, attempt);
                    let mut delay = config.jittered(config.delay_for_attempt(attempt));
                    if let LlmError::RateLimited {
                        retry_after: Some(hint),
                        ..
                    } = &error
                    {
                        delay = delay.max(*hint);
                    }
                    last_error = Some(error);
                    tokio::time::sleep(delay).await;
                } else {
                    last_error = Some(error);
                }
            }
        }
    }
    Err(last_error.unwrap_or_else(|| LlmError::transient("retry loop finished without an error")))
}
