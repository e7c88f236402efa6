/// Token-bucket rate limiter per external platform
///
/// Three knobs, applied in order: a concurrency cap, a minimum spacing between call
/// starts, and a reservoir of tokens refilled to full on a fixed interval. Callers wait
/// for capacity up to `max_wait`; past that the call is rejected as rate limited.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

/// Limits for one platform, expressed the way vendors publish quotas
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    /// Calls allowed in flight at once
    pub max_concurrent: usize,
    /// Minimum time between two call starts
    pub min_time_ms: u64,
    /// Tokens available per refresh interval; None disables the reservoir
    pub reservoir: Option<u32>,
    /// Interval after which the reservoir is refilled to full
    pub reservoir_refresh_ms: u64,
    /// Longest a caller may wait before being rejected
    pub max_wait_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            min_time_ms: 0,
            reservoir: None,
            reservoir_refresh_ms: 60_000,
            max_wait_ms: 30_000,
        }
    }
}

/// Rejection returned when capacity does not free up within `max_wait`
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("rate limit exceeded for '{platform}' (waited {waited_ms}ms)")]
pub struct RateLimited {
    pub platform: String,
    pub waited_ms: u64,
}

#[derive(Debug)]
struct BucketState {
    last_start: Option<Instant>,
    tokens: u32,
    last_refill: Instant,
}

/// Held for the duration of one call; dropping it frees the concurrency slot
#[derive(Debug)]
pub struct RateLimitPermit {
    _permit: OwnedSemaphorePermit,
}

#[derive(Debug)]
pub struct RateLimiter {
    platform: String,
    config: RateLimitConfig,
    concurrency: Arc<Semaphore>,
    bucket: Mutex<BucketState>,
}

impl RateLimiter {
    pub fn new(platform: impl Into<String>, config: RateLimitConfig) -> Self {
        let max_concurrent = config.max_concurrent.max(1);
        let tokens = config.reservoir.unwrap_or(0);
        Self {
            platform: platform.into(),
            concurrency: Arc::new(Semaphore::new(max_concurrent)),
            bucket: Mutex::new(BucketState {
                last_start: None,
                tokens,
                last_refill: Instant::now(),
            }),
            config,
        }
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }

    /// Wait for a slot, respecting concurrency, spacing and reservoir limits
    pub async fn acquire(&self) -> Result<RateLimitPermit, RateLimited> {
        let started = Instant::now();
        let deadline = started + Duration::from_millis(self.config.max_wait_ms);

        let permit = match tokio::time::timeout_at(deadline, Arc::clone(&self.concurrency).acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            _ => return Err(self.rejected(started)),
        };

        // Holding the bucket lock while sleeping queues waiters in arrival order
        let mut bucket = self.bucket.lock().await;
        loop {
            let now = Instant::now();
            self.refill(&mut bucket, now);

            let spacing_ready = bucket
                .last_start
                .map(|last| last + Duration::from_millis(self.config.min_time_ms))
                .unwrap_or(now);
            let token_ready = match self.config.reservoir {
                Some(_) if bucket.tokens == 0 => {
                    bucket.last_refill + Duration::from_millis(self.config.reservoir_refresh_ms)
                }
                _ => now,
            };
            let ready_at = spacing_ready.max(token_ready);

            if ready_at <= now {
                if self.config.reservoir.is_some() {
                    bucket.tokens -= 1;
                }
                bucket.last_start = Some(now);
                return Ok(RateLimitPermit { _permit: permit });
            }
            if ready_at > deadline {
                return Err(self.rejected(started));
            }

            tracing::debug!("⏳ Rate limiter '{}' delaying call by {:?}", self.platform, ready_at - now);
            tokio::time::sleep_until(ready_at).await;
        }
    }

    /// Tokens left in the reservoir (None when unlimited)
    pub async fn available_tokens(&self) -> Option<u32> {
        let size = self.config.reservoir?;
        let mut bucket = self.bucket.lock().await;
        self.refill(&mut bucket, Instant::now());
        Some(bucket.tokens.min(size))
    }

    fn refill(&self, bucket: &mut BucketState, now: Instant) {
        let Some(size) = self.config.reservoir else {
            return;
        };
        let interval = Duration::from_millis(self.config.reservoir_refresh_ms.max(1));
        let elapsed = now.duration_since(bucket.last_refill);
        if elapsed >= interval {
            let periods = (elapsed.as_millis() / interval.as_millis()) as u32;
            bucket.tokens = size;
            bucket.last_refill += interval * periods;
        }
    }

    fn rejected(&self, started: Instant) -> RateLimited {
        tracing::warn!("🚦 Rate limit exceeded for platform '{}'", self.platform);
        RateLimited {
            platform: self.platform.clone(),
            waited_ms: started.elapsed().as_millis() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn enforces_minimum_spacing_between_starts() {
        let limiter = RateLimiter::new(
            "twitter",
            RateLimitConfig {
                max_concurrent: 10,
                min_time_ms: 200,
                ..RateLimitConfig::default()
            },
        );

        let start = Instant::now();
        let _a = limiter.acquire().await.unwrap();
        let _b = limiter.acquire().await.unwrap();
        let _c = limiter.acquire().await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn reservoir_blocks_until_refill() {
        let limiter = RateLimiter::new(
            "stripe",
            RateLimitConfig {
                max_concurrent: 10,
                min_time_ms: 0,
                reservoir: Some(2),
                reservoir_refresh_ms: 1_000,
                max_wait_ms: 5_000,
            },
        );

        let start = Instant::now();
        drop(limiter.acquire().await.unwrap());
        drop(limiter.acquire().await.unwrap());
        assert_eq!(limiter.available_tokens().await, Some(0));

        drop(limiter.acquire().await.unwrap());
        assert_eq!(start.elapsed(), Duration::from_millis(1_000));
        assert_eq!(limiter.available_tokens().await, Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_when_wait_exceeds_budget() {
        let limiter = RateLimiter::new(
            "reddit",
            RateLimitConfig {
                max_concurrent: 10,
                min_time_ms: 0,
                reservoir: Some(1),
                reservoir_refresh_ms: 60_000,
                max_wait_ms: 500,
            },
        );

        drop(limiter.acquire().await.unwrap());
        let err = limiter.acquire().await.unwrap_err();
        assert_eq!(err.platform, "reddit");
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_cap_times_out() {
        let limiter = RateLimiter::new(
            "pinecone",
            RateLimitConfig {
                max_concurrent: 1,
                max_wait_ms: 100,
                ..RateLimitConfig::default()
            },
        );

        let held = limiter.acquire().await.unwrap();
        assert!(limiter.acquire().await.is_err());
        drop(held);
        assert!(limiter.acquire().await.is_ok());
    }
}
