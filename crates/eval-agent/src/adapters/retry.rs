//! Retry policy for model calls.
//!
//! Exponential backoff capped at `max_delay`, scaled by a jitter factor that
//! is derived from a hash of the call key, so reruns back off identically.

use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use crate::config::RetryConfig;

use super::errors::GenerationError;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction in `[0, 1]`; the delay is scaled by a factor in `[1 - j, 1 + j]`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            max_delay: Duration::from_millis(cfg.max_delay_ms),
            jitter: cfg.jitter.clamp(0.0, 1.0),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, after `attempt` failures.
    pub fn delay_for(&self, attempt: u32, key: &str) -> Duration {
        let exp = attempt.saturating_sub(1).min(30);
        let raw = self.base_delay.saturating_mul(1u32 << exp).min(self.max_delay);
        if self.jitter == 0.0 || raw.is_zero() {
            return raw;
        }

        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        attempt.hash(&mut hasher);
        // Uniform in [0, 1).
        let unit = (hasher.finish() >> 11) as f64 / (1u64 << 53) as f64;
        let factor = 1.0 - self.jitter + 2.0 * self.jitter * unit;
        raw.mul_f64(factor).min(self.max_delay)
    }
}

/// Outcome of [`retry_with_policy`]: the last result and the calls made.
pub struct Retried<T> {
    pub result: Result<T, GenerationError>,
    pub attempts: u32,
}

/// Call `op` until it succeeds, fails with a non-retriable error, or the
/// attempt budget is spent. `op` receives the 1-based attempt number.
pub async fn retry_with_policy<T, F, Fut>(policy: &RetryPolicy, key: &str, mut op: F) -> Retried<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, GenerationError>>,
{
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => {
                return Retried {
                    result: Ok(value),
                    attempts: attempt,
                }
            }
            Err(e) if e.is_retriable() && attempt < policy.max_attempts => {
                let delay = e
                    .retry_after()
                    .map(|d| d.min(policy.max_delay))
                    .unwrap_or_else(|| policy.delay_for(attempt, key));
                tracing::warn!(
                    key,
                    attempt,
                    category = %e.retry_category(),
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying model call"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                return Retried {
                    result: Err(e),
                    attempts: attempt,
                }
            }
        }
    }
}
