//! Transient-failure retry with configurable backoff for generative backend calls.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use pipewright_types::{duration_serde, PipewrightError, Result};

/// Backoff policy controlling the delay between retry attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// Fixed delay between retries.
    Fixed {
        #[serde(with = "duration_serde")]
        delay: Duration,
    },
    /// Exponential backoff: base * 2^attempt, capped at max.
    Exponential {
        #[serde(with = "duration_serde")]
        base: Duration,
        #[serde(with = "duration_serde")]
        max: Duration,
    },
    /// No delay between retries.
    None,
}

impl BackoffPolicy {
    /// Compute the delay for a given retry number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        match self {
            BackoffPolicy::Fixed { delay } => *delay,
            BackoffPolicy::Exponential { base, max } => {
                let millis = (base.as_millis() as u64)
                    .saturating_mul(2u64.saturating_pow(attempt as u32));
                Duration::from_millis(millis).min(*max)
            }
            BackoffPolicy::None => Duration::ZERO,
        }
    }

    /// Delay before retrying after `err`; a provider's `retry_after` hint
    /// wins when it asks for a longer wait.
    fn delay_after(&self, attempt: usize, err: &PipewrightError) -> Duration {
        let base = self.delay_for_attempt(attempt);
        match err {
            PipewrightError::RateLimited { retry_after_ms, .. } => {
                base.max(Duration::from_millis(*retry_after_ms))
            }
            _ => base,
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Exponential {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
        }
    }
}

/// Run `f` up to `max_retries + 1` times, retrying only errors that
/// satisfy [`PipewrightError::is_retryable`].
///
/// Backoff sleeps are abandoned as soon as `cancel` fires.
pub async fn execute_with_retry<T, F, Fut>(
    mut f: F,
    max_retries: usize,
    policy: &BackoffPolicy,
    label: &str,
    cancel: &CancellationToken,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < max_retries => {
                let delay = policy.delay_after(attempt, &e);
                tracing::warn!(
                    call = %label,
                    attempt,
                    delay_ms = %delay.as_millis(),
                    error = %e,
                    "Transient backend failure, retrying"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(PipewrightError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
