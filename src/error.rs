/// Error taxonomy for the execution engine
///
/// Module-level failures are classified exactly once (in the resilience layer) into an
/// `ErrorKind`. Everything upstream only asks two questions of a classified error:
/// is it retryable, and does it stop the run.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification of every failure the engine can surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Step references a module that is not in the registry (configuration error)
    ModuleNotFound,
    /// Step input is missing or malformed
    Validation,
    /// Timeouts, 5xx and rate-limit responses from the upstream platform
    TransientUpstream,
    /// Fail-fast rejection while the operation's circuit is open
    CircuitOpen,
    /// 4xx (other than 429) and application errors raised by the module
    PermanentUpstream,
    /// Queue backend unreachable; callers fall back to synchronous execution
    QueueUnavailable,
    /// Lock store unreachable; cron dispatch is suppressed for the tick
    LeaseUnavailable,
}

impl ErrorKind {
    /// Whether retrying the same call later can reasonably succeed
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::TransientUpstream | ErrorKind::CircuitOpen)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ModuleNotFound => "module_not_found",
            ErrorKind::Validation => "validation",
            ErrorKind::TransientUpstream => "transient_upstream",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::PermanentUpstream => "permanent_upstream",
            ErrorKind::QueueUnavailable => "queue_unavailable",
            ErrorKind::LeaseUnavailable => "lease_unavailable",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure of a single step invocation
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct StepError {
    pub kind: ErrorKind,
    pub message: String,
}

impl StepError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn module_not_found(module_ref: &str) -> Self {
        Self::new(ErrorKind::ModuleNotFound, format!("module not found: {}", module_ref))
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// Infrastructure-level failures of the engine components
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error("lease store unavailable: {0}")]
    LeaseUnavailable(String),

    #[error("dead-letter item not found: {0}")]
    DeadLetterNotFound(String),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl EngineError {
    /// Taxonomy kind for infrastructure errors that have one
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            EngineError::QueueUnavailable(_) => Some(ErrorKind::QueueUnavailable),
            EngineError::LeaseUnavailable(_) => Some(ErrorKind::LeaseUnavailable),
            _ => None,
        }
    }
}
