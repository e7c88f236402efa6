/// Resilience Wrapper
///
/// Every module call goes through `ResilienceLayer::call`, which applies the platform
/// rate limiter and the operation's circuit breaker, and classifies the raw
/// `ModuleError` into the engine's error taxonomy. This is the only place module errors
/// are classified.

pub mod circuit;
pub mod dead_letter;
pub mod rate_limit;
pub mod retry;

use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::{ErrorKind, StepError};
use crate::modules::ModuleError;
use circuit::{Admission, CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot};
use rate_limit::{RateLimitConfig, RateLimiter};

pub use dead_letter::{DeadLetterContext, DeadLetterItem, DeadLetterQueue};
pub use retry::{retry_with_backoff, RetryExhausted, RetryPolicy};

/// Breaker and limiter settings
#[derive(Debug, Clone, Default)]
pub struct ResilienceConfig {
    pub circuit: CircuitBreakerConfig,
    /// Limits used for platforms without an explicit entry
    pub default_rate_limit: RateLimitConfig,
    /// Per-platform limits, keyed by platform name
    pub rate_limits: HashMap<String, RateLimitConfig>,
}

/// Rejection raised before the module is ever called
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ResilienceError {
    #[error("circuit open for {0}")]
    CircuitOpen(String),

    #[error(transparent)]
    RateLimited(#[from] rate_limit::RateLimited),
}

impl From<ResilienceError> for StepError {
    fn from(err: ResilienceError) -> Self {
        match err {
            ResilienceError::CircuitOpen(_) => StepError::new(ErrorKind::CircuitOpen, err.to_string()),
            ResilienceError::RateLimited(_) => StepError::new(ErrorKind::TransientUpstream, err.to_string()),
        }
    }
}

/// Map a raw module failure onto the taxonomy
pub fn classify(err: &ModuleError) -> ErrorKind {
    match err {
        ModuleError::Timeout(_) | ModuleError::RateLimited { .. } => ErrorKind::TransientUpstream,
        ModuleError::Http { status, .. } if *status == 429 || *status >= 500 => ErrorKind::TransientUpstream,
        ModuleError::Http { .. } | ModuleError::Failed(_) => ErrorKind::PermanentUpstream,
        ModuleError::InvalidInput(_) => ErrorKind::Validation,
    }
}

/// Status of every breaker created so far
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResilienceStatus {
    pub circuits: Vec<CircuitSnapshot>,
}

/// HalfOpen slot taken by one call, handed back if the call never reports an outcome
struct HalfOpenSlot<'a> {
    breaker: &'a CircuitBreaker,
    held: bool,
}

impl Drop for HalfOpenSlot<'_> {
    fn drop(&mut self) {
        if self.held {
            tracing::debug!("↩️ Half-open call for '{}' ended without an outcome", self.breaker.name());
            self.breaker.record_neutral();
        }
    }
}

/// Shared registry of per-operation breakers and per-platform limiters
#[derive(Debug)]
pub struct ResilienceLayer {
    config: ResilienceConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    limiters: RwLock<HashMap<String, Arc<RateLimiter>>>,
}

impl ResilienceLayer {
    pub fn new(config: ResilienceConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
            limiters: RwLock::new(HashMap::new()),
        }
    }

    /// Run one module call under the operation's breaker and the platform's limiter
    pub async fn call<F, Fut, T>(&self, operation: &str, platform: &str, call: F) -> Result<T, StepError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ModuleError>>,
    {
        let breaker = self.breaker(operation).await;
        let admission = breaker.admit();
        if admission == Admission::Rejected {
            tracing::debug!("⛔ Circuit open, failing fast: {}", operation);
            return Err(ResilienceError::CircuitOpen(operation.to_string()).into());
        }
        // Released on drop so a cancelled trial call cannot hold the HalfOpen slot
        let mut slot = HalfOpenSlot {
            breaker: &breaker,
            held: admission == Admission::Trial,
        };

        let limiter = self.limiter(platform).await;
        let _permit = match limiter.acquire().await {
            Ok(permit) => permit,
            Err(limited) => return Err(ResilienceError::from(limited).into()),
        };

        let result = call().await;
        slot.held = false;
        match result {
            Ok(value) => {
                breaker.record_success();
                Ok(value)
            }
            Err(err) => {
                let kind = classify(&err);
                if kind == ErrorKind::TransientUpstream {
                    breaker.record_failure();
                } else {
                    breaker.record_neutral();
                }
                Err(StepError::new(kind, err.to_string()))
            }
        }
    }

    pub async fn breaker(&self, operation: &str) -> Arc<CircuitBreaker> {
        {
            let breakers = self.breakers.read().await;
            if let Some(breaker) = breakers.get(operation) {
                return Arc::clone(breaker);
            }
        }

        let mut breakers = self.breakers.write().await;
        // Another task may have created it between the two locks
        if let Some(breaker) = breakers.get(operation) {
            return Arc::clone(breaker);
        }
        let breaker = Arc::new(CircuitBreaker::new(operation, self.config.circuit.clone()));
        breakers.insert(operation.to_string(), Arc::clone(&breaker));
        breaker
    }

    pub async fn limiter(&self, platform: &str) -> Arc<RateLimiter> {
        {
            let limiters = self.limiters.read().await;
            if let Some(limiter) = limiters.get(platform) {
                return Arc::clone(limiter);
            }
        }

        let mut limiters = self.limiters.write().await;
        if let Some(limiter) = limiters.get(platform) {
            return Arc::clone(limiter);
        }
        let config = self
            .config
            .rate_limits
            .get(platform)
            .cloned()
            .unwrap_or_else(|| self.config.default_rate_limit.clone());
        let limiter = Arc::new(RateLimiter::new(platform, config));
        limiters.insert(platform.to_string(), Arc::clone(&limiter));
        limiter
    }

    pub async fn status(&self) -> ResilienceStatus {
        let breakers = self.breakers.read().await;
        let mut circuits: Vec<CircuitSnapshot> = breakers.values().map(|b| b.snapshot()).collect();
        circuits.sort_by(|a, b| a.name.cmp(&b.name));
        ResilienceStatus { circuits }
    }
}

impl Default for ResilienceLayer {
    fn default() -> Self {
        Self::new(ResilienceConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use circuit::CircuitStateKind;
    use std::time::Duration;

    fn layer(failure_threshold: u32) -> ResilienceLayer {
        ResilienceLayer::new(ResilienceConfig {
            circuit: CircuitBreakerConfig {
                failure_threshold,
                volume_threshold: 1_000,
                reset_timeout: Duration::from_secs(30),
                ..CircuitBreakerConfig::default()
            },
            ..ResilienceConfig::default()
        })
    }

    #[test]
    fn classifies_module_errors_once() {
        let http = |status| ModuleError::Http { status, message: String::new() };
        assert_eq!(classify(&http(503)), ErrorKind::TransientUpstream);
        assert_eq!(classify(&http(429)), ErrorKind::TransientUpstream);
        assert_eq!(classify(&http(404)), ErrorKind::PermanentUpstream);
        assert_eq!(classify(&ModuleError::Timeout("slow".into())), ErrorKind::TransientUpstream);
        assert_eq!(classify(&ModuleError::RateLimited { retry_after_ms: None }), ErrorKind::TransientUpstream);
        assert_eq!(classify(&ModuleError::InvalidInput("x".into())), ErrorKind::Validation);
        assert_eq!(classify(&ModuleError::Failed("x".into())), ErrorKind::PermanentUpstream);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_open_the_circuit() {
        let layer = layer(2);
        for _ in 0..2 {
            let err = layer
                .call("crm.hubspot.createContact", "hubspot", || async {
                    Err::<(), _>(ModuleError::Http { status: 502, message: "bad gateway".into() })
                })
                .await
                .unwrap_err();
            assert_eq!(err.kind, ErrorKind::TransientUpstream);
        }

        let err = layer
            .call("crm.hubspot.createContact", "hubspot", || async { Ok::<_, ModuleError>(()) })
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::CircuitOpen);
        assert!(err.is_retryable());

        // Other operations on the same platform keep working
        assert!(layer
            .call("crm.hubspot.getContact", "hubspot", || async { Ok::<_, ModuleError>(()) })
            .await
            .is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failures_do_not_trip_the_breaker() {
        let layer = layer(1);
        for _ in 0..3 {
            let err = layer
                .call("crm.hubspot.createContact", "hubspot", || async {
                    Err::<(), _>(ModuleError::Http { status: 400, message: "bad email".into() })
                })
                .await
                .unwrap_err();
            assert_eq!(err.kind, ErrorKind::PermanentUpstream);
        }
        assert_eq!(
            layer.breaker("crm.hubspot.createContact").await.state(),
            CircuitStateKind::Closed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_rejection_is_retryable() {
        let mut rate_limits = HashMap::new();
        rate_limits.insert(
            "twitter".to_string(),
            RateLimitConfig {
                max_concurrent: 1,
                reservoir: Some(1),
                reservoir_refresh_ms: 60_000,
                max_wait_ms: 100,
                ..RateLimitConfig::default()
            },
        );
        let layer = ResilienceLayer::new(ResilienceConfig { rate_limits, ..ResilienceConfig::default() });

        let ok = || async { Ok::<_, ModuleError>(()) };
        assert!(layer.call("social.twitter.postTweet", "twitter", ok).await.is_ok());
        let err = layer.call("social.twitter.postTweet", "twitter", ok).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::TransientUpstream);
        assert!(err.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_half_open_call_releases_the_slot() {
        let layer = layer(1);
        let op = "crm.hubspot.createContact";
        layer
            .call(op, "hubspot", || async {
                Err::<(), _>(ModuleError::Http { status: 503, message: "unavailable".into() })
            })
            .await
            .unwrap_err();
        assert_eq!(layer.breaker(op).await.state(), CircuitStateKind::Open);

        tokio::time::advance(Duration::from_secs(31)).await;
        let slow = layer.call(op, "hubspot", || async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok::<_, ModuleError>(())
        });
        assert!(tokio::time::timeout(Duration::from_millis(10), slow).await.is_err());

        tokio::time::advance(Duration::from_secs(3600)).await;
        let value = layer
            .call(op, "hubspot", || async { Ok::<_, ModuleError>(serde_json::json!(1)) })
            .await
            .unwrap();
        assert_eq!(value, serde_json::json!(1));
        assert_eq!(layer.breaker(op).await.state(), CircuitStateKind::Closed);
    }
}
