/// Circuit breaker per wrapped operation
///
/// Closed -> Open after too many transient failures (consecutive count, or failure
/// percentage inside a rolling window). Open fails fast until `reset_timeout` passes,
/// then HalfOpen lets exactly one probe through: success closes, failure re-opens.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Thresholds for opening and probing the circuit
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Failure percentage inside the rolling window that opens the circuit
    pub error_threshold_percentage: f64,
    /// Minimum calls inside the window before the percentage rule applies
    pub volume_threshold: u32,
    /// Width of the rolling window
    pub rolling_window: Duration,
    /// Time spent Open before a probe is allowed
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            error_threshold_percentage: 50.0,
            volume_threshold: 10,
            rolling_window: Duration::from_secs(60),
            reset_timeout: Duration::from_secs(30),
        }
    }
}

/// Circuit state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CircuitState {
    Closed,
    Open { opened_at: Instant },
    HalfOpen { probe_in_flight: bool },
}

/// Result of asking the breaker for a call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Rejected,
    /// Normal call while Closed
    Call,
    /// The single HalfOpen call; its owner must settle it with an outcome
    Trial,
}

/// Reportable circuit state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStateKind {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    /// (when, failed) outcomes inside the rolling window
    window: VecDeque<(Instant, bool)>,
    total_calls: u64,
    total_failures: u64,
    rejected_calls: u64,
}

/// Snapshot for status endpoints
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitStateKind,
    pub consecutive_failures: u32,
    pub total_calls: u64,
    pub total_failures: u64,
    pub rejected_calls: u64,
}

/// Circuit breaker guarding one operation
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                window: VecDeque::new(),
                total_calls: 0,
                total_failures: 0,
                rejected_calls: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask permission to call the operation
    ///
    /// Returns false while Open (before the reset timeout) or while a HalfOpen probe is
    /// already in flight.
    pub fn try_acquire(&self) -> bool {
        self.admit() != Admission::Rejected
    }

    /// Like `try_acquire`, but tells the caller whether it now holds the HalfOpen slot
    pub fn admit(&self) -> Admission {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Admission::Call,
            CircuitState::Open { opened_at } => {
                if opened_at.elapsed() >= self.config.reset_timeout {
                    tracing::info!("🟡 Circuit '{}' half-open, allowing probe call", self.name);
                    inner.state = CircuitState::HalfOpen { probe_in_flight: true };
                    Admission::Trial
                } else {
                    inner.rejected_calls += 1;
                    Admission::Rejected
                }
            }
            CircuitState::HalfOpen { probe_in_flight: true } => {
                inner.rejected_calls += 1;
                Admission::Rejected
            }
            CircuitState::HalfOpen { probe_in_flight: false } => {
                inner.state = CircuitState::HalfOpen { probe_in_flight: true };
                Admission::Trial
            }
        }
    }

    /// Record a successful call
    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.total_calls += 1;
        inner.consecutive_failures = 0;
        self.push_outcome(&mut inner, false);

        if !matches!(inner.state, CircuitState::Closed) {
            tracing::info!("🟢 Circuit '{}' closed after successful probe", self.name);
            inner.state = CircuitState::Closed;
            inner.window.clear();
        }
    }

    /// Record a failure that reflects upstream health
    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.total_calls += 1;
        inner.total_failures += 1;
        inner.consecutive_failures += 1;
        self.push_outcome(&mut inner, true);

        match inner.state {
            CircuitState::HalfOpen { .. } => {
                tracing::warn!("🔴 Circuit '{}' probe failed, re-opening", self.name);
                inner.state = CircuitState::Open { opened_at: Instant::now() };
            }
            CircuitState::Closed => {
                if self.should_open(&inner) {
                    tracing::warn!(
                        "🔴 Circuit '{}' opened ({} consecutive failures)",
                        self.name,
                        inner.consecutive_failures
                    );
                    inner.state = CircuitState::Open { opened_at: Instant::now() };
                }
            }
            CircuitState::Open { .. } => {}
        }
    }

    /// Release a probe slot without judging upstream health (e.g. a validation error)
    pub fn record_neutral(&self) {
        let mut inner = self.lock();
        if let CircuitState::HalfOpen { probe_in_flight: true } = inner.state {
            inner.state = CircuitState::HalfOpen { probe_in_flight: false };
        }
    }

    pub fn state(&self) -> CircuitStateKind {
        match self.lock().state {
            CircuitState::Closed => CircuitStateKind::Closed,
            CircuitState::Open { .. } => CircuitStateKind::Open,
            CircuitState::HalfOpen { .. } => CircuitStateKind::HalfOpen,
        }
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let state = self.state();
        let inner = self.lock();
        CircuitSnapshot {
            name: self.name.clone(),
            state,
            consecutive_failures: inner.consecutive_failures,
            total_calls: inner.total_calls,
            total_failures: inner.total_failures,
            rejected_calls: inner.rejected_calls,
        }
    }

    fn should_open(&self, inner: &BreakerInner) -> bool {
        if inner.consecutive_failures >= self.config.failure_threshold {
            return true;
        }
        let volume = inner.window.len() as u32;
        if volume < self.config.volume_threshold || volume == 0 {
            return false;
        }
        let failures = inner.window.iter().filter(|(_, failed)| *failed).count() as f64;
        failures / volume as f64 * 100.0 >= self.config.error_threshold_percentage
    }

    fn push_outcome(&self, inner: &mut BreakerInner, failed: bool) {
        let now = Instant::now();
        inner.window.push_back((now, failed));
        while let Some((at, _)) = inner.window.front() {
            if now.duration_since(*at) > self.config.rolling_window {
                inner.window.pop_front();
            } else {
                break;
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        // A panic while holding this lock cannot leave the counters inconsistent
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
