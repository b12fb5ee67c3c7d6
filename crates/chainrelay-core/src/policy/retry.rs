//! Retry/backoff policy shared by the background tasks.
//!
//! Two shapes are used across the workspace:
//! - [`Backoff::Linear`]: `step * attempt`; the connectivity observer sleeps
//!   `0s, 1s, 2s, 3s, 4s` before forcing a redial.
//! - [`Backoff::Exponential`]: `initial * multiplier^(attempt-1)`, capped;
//!   token refresh retries and result-stream resubscription.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Delay curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// `step * attempt`.
    Linear { step_ms: u64 },
    /// `initial * multiplier^(attempt - 1)`, never above `max`.
    Exponential {
        initial_ms: u64,
        max_ms: u64,
        multiplier: f64,
    },
}

/// Configuration for the retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not counting the first try).
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Backoff::Exponential {
                initial_ms: 250,
                max_ms: 5_000,
                multiplier: 2.0,
            },
        }
    }
}

impl RetryConfig {
    /// Linear policy with `step` per attempt.
    pub fn linear(max_retries: u32, step: Duration) -> Self {
        Self {
            max_retries,
            backoff: Backoff::Linear {
                step_ms: step.as_millis() as u64,
            },
        }
    }
}

/// Stateless retry policy: computes the delay for a given attempt number.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Delay curve value at `attempt`, ignoring `max_retries`.
    ///
    /// Linear curves are 0-based (`attempt = 0` → zero delay); exponential
    /// curves treat `attempt = 0` like `attempt = 1`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.config.backoff {
            Backoff::Linear { step_ms } => {
                Duration::from_millis(step_ms.saturating_mul(u64::from(attempt)))
            }
            Backoff::Exponential {
                initial_ms,
                max_ms,
                multiplier,
            } => {
                let exp = attempt.saturating_sub(1).min(63) as i32;
                let ms = (initial_ms as f64 * multiplier.powi(exp)).min(max_ms as f64);
                Duration::from_millis(ms as u64)
            }
        }
    }

    /// Returns the delay before the `attempt`-th retry (1-based), or `None`
    /// once `attempt` exceeds `max_retries`.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        self.should_retry(attempt).then(|| self.delay_for(attempt))
    }

    /// Returns `true` if any retries remain after `attempt` failures.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt <= self.config.max_retries
    }
}
