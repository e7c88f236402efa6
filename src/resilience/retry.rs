/// Retry with exponential backoff
///
/// Delay before retry `n` (0-based) is `initial_delay * multiplier^n`, optionally capped.
/// A caller-supplied predicate stops retrying early for errors that are not transient.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Retry budget and backoff curve
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Retries after the first attempt (total invocations = max_retries + 1)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Geometric growth factor between consecutive delays
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Upper bound for any single delay
    #[serde(default)]
    pub max_delay_ms: Option<u64>,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: None,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_delay_ms: u64, backoff_multiplier: f64) -> Self {
        Self {
            max_retries,
            initial_delay_ms,
            backoff_multiplier,
            max_delay_ms: None,
        }
    }

    /// Single attempt, no retries
    pub fn none() -> Self {
        Self::new(0, 0, 1.0)
    }

    /// Delay before retry number `retry` (0-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.min(32) as i32;
        let millis = self.initial_delay_ms as f64 * self.backoff_multiplier.max(1.0).powi(exponent);
        let millis = match self.max_delay_ms {
            Some(cap) => millis.min(cap as f64),
            None => millis,
        };
        Duration::from_millis(millis.round().min(u64::MAX as f64) as u64)
    }
}

/// Last error plus how many times the operation ran
#[derive(Debug, Clone, PartialEq)]
pub struct RetryExhausted<E> {
    pub error: E,
    pub attempts: u32,
}

/// Run `operation` until it succeeds, the budget runs out, or `retry_if` rejects the error
pub async fn retry_with_backoff<T, E, F, Fut, C>(
    policy: &RetryPolicy,
    mut operation: F,
    retry_if: C,
) -> Result<T, RetryExhausted<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => {
                let attempts = attempt + 1;
                if attempt >= policy.max_retries || !retry_if(&error) {
                    return Err(RetryExhausted { error, attempts });
                }

                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    "🔁 Attempt {}/{} failed: {}. Retrying in {:?}",
                    attempts,
                    policy.max_retries + 1,
                    error,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
