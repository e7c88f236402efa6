/// Core workflow type definitions
///
/// Defines workflow definitions, their steps and triggers, and the run records the
/// engine persists. These types are serialized as camelCase JSON, matching what the
/// authoring UI stores.

use crate::error::ErrorKind;
use crate::resilience::retry::RetryPolicy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// A complete workflow definition, immutable per version
///
/// Steps run strictly in array order; the authoring tool orders them so that each
/// step's template only references earlier aliases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    /// Unique workflow identifier (e.g., "wf-daily-digest")
    pub id: String,
    /// Human-readable workflow name
    pub name: String,
    /// Definition version, bumped by the authoring tool on every edit
    #[serde(default = "default_version")]
    pub version: u32,
    /// Owning organization; None means personal/admin scope
    #[serde(default)]
    pub organization_id: Option<String>,
    /// User that owns the workflow; dispatches without a caller run as this user
    #[serde(default)]
    pub owner_id: Option<String>,
    /// Ordered list of steps
    #[serde(default)]
    pub steps: Vec<Step>,
    /// What starts this workflow
    pub trigger: Trigger,
    /// Lifecycle status
    #[serde(default)]
    pub status: WorkflowStatus,
    /// Template path resolved against the final context to produce the run output
    #[serde(default)]
    pub return_value: Option<String>,
}

fn default_version() -> u32 {
    1
}

impl WorkflowDefinition {
    /// Cron schedule string when this is a cron-triggered workflow
    pub fn cron_schedule(&self) -> Option<&str> {
        if self.trigger.kind != TriggerKind::Cron {
            return None;
        }
        self.trigger.config.get("schedule").and_then(|s| s.as_str())
    }

    /// Webhook path declared in the trigger config, normalized with a leading slash
    pub fn webhook_path(&self) -> Option<String> {
        if self.trigger.kind != TriggerKind::Webhook {
            return None;
        }
        self.trigger.config.get("path").and_then(|p| p.as_str()).map(|p| {
            if p.starts_with('/') {
                p.to_string()
            } else {
                format!("/{}", p)
            }
        })
    }
}

/// One declared unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    /// Step identifier, unique within the workflow
    pub id: String,
    /// Module reference in `category.module.function` form
    pub module_ref: String,
    /// JSON structure whose `{{path}}` leaves are resolved against the run context
    #[serde(default)]
    pub input_template: Value,
    /// Key under which the step output is stored in the run context
    pub output_alias: String,
    /// Record a failure in the context and keep going instead of aborting the run
    #[serde(default)]
    pub continue_on_error: bool,
    /// Step-level retry policy for retryable failures
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    /// Dead-letter the invocation once its retry budget is exhausted
    #[serde(default)]
    pub dead_letter: bool,
}

/// Trigger declaration: kind plus kind-specific config
///
/// Expected config per kind:
/// - cron: { "schedule": "0 */5 * * * *" }
/// - webhook: { "path": "/orders" } (optional)
/// - everything else: free-form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub kind: TriggerKind,
    #[serde(default)]
    pub config: Value,
}

/// Event types that can start a workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TriggerKind {
    Manual,
    Cron,
    Webhook,
    Chat,
    ChatInput,
    MessagingPlatform,
}

impl TriggerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerKind::Manual => "manual",
            TriggerKind::Cron => "cron",
            TriggerKind::Webhook => "webhook",
            TriggerKind::Chat => "chat",
            TriggerKind::ChatInput => "chat-input",
            TriggerKind::MessagingPlatform => "messaging-platform",
        }
    }

    /// Triggers a person is waiting on; these must never be dropped
    pub fn is_user_initiated(self) -> bool {
        !matches!(self, TriggerKind::Cron)
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(TriggerKind::Manual),
            "cron" => Ok(TriggerKind::Cron),
            "webhook" => Ok(TriggerKind::Webhook),
            "chat" => Ok(TriggerKind::Chat),
            "chat-input" => Ok(TriggerKind::ChatInput),
            "messaging-platform" => Ok(TriggerKind::MessagingPlatform),
            other => Err(anyhow::anyhow!("unknown trigger kind: {}", other)),
        }
    }
}

/// Workflow lifecycle status; only `active` workflows are dispatched by triggers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    #[default]
    Draft,
    Active,
    Paused,
}

/// Run status state machine: queued -> running -> {success, error}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Running,
    Success,
    Error,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Error => "error",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Success | RunStatus::Error)
    }
}

impl FromStr for RunStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(RunStatus::Queued),
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "error" => Ok(RunStatus::Error),
            other => Err(anyhow::anyhow!("unknown run status: {}", other)),
        }
    }
}

/// One execution attempt of a workflow
///
/// Mutated only by the run engine (and the queue when it gives up on a job);
/// immutable once `completed_at` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRun {
    pub id: String,
    pub workflow_id: String,
    pub organization_id: Option<String>,
    pub user_id: String,
    pub trigger_kind: TriggerKind,
    pub trigger_payload: Value,
    pub status: RunStatus,
    /// 1-based execution attempt of the originating job
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub error_step_id: Option<String>,
}

impl WorkflowRun {
    /// New run row in the given initial status
    pub fn new(
        workflow_id: &str,
        organization_id: Option<String>,
        user_id: &str,
        trigger_kind: TriggerKind,
        trigger_payload: Value,
        status: RunStatus,
        attempt: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            workflow_id: workflow_id.to_string(),
            organization_id,
            user_id: user_id.to_string(),
            trigger_kind,
            trigger_payload,
            status,
            attempt,
            created_at: now,
            started_at: (status == RunStatus::Running).then_some(now),
            completed_at: None,
            duration_ms: None,
            output: None,
            error: None,
            error_step_id: None,
        }
    }

    /// Apply a partial update in place (used by the in-memory store)
    pub fn apply(&mut self, update: &RunUpdate) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if update.started_at.is_some() {
            self.started_at = update.started_at;
        }
        if update.completed_at.is_some() {
            self.completed_at = update.completed_at;
        }
        if update.duration_ms.is_some() {
            self.duration_ms = update.duration_ms;
        }
        if update.output.is_some() {
            self.output = update.output.clone();
        }
        if update.error.is_some() {
            self.error = update.error.clone();
        }
        if update.error_step_id.is_some() {
            self.error_step_id = update.error_step_id.clone();
        }
    }
}

/// Partial update of a run row; None fields are left untouched
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunUpdate {
    pub status: Option<RunStatus>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub error_step_id: Option<String>,
}

impl RunUpdate {
    /// Transition to running
    pub fn running() -> Self {
        Self {
            status: Some(RunStatus::Running),
            started_at: Some(Utc::now()),
            ..Self::default()
        }
    }

    /// Terminal error without step attribution (infrastructure or queue give-up)
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: Some(RunStatus::Error),
            completed_at: Some(Utc::now()),
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// Terminal projection of a run returned to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub run_id: String,
    pub success: bool,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub error_step: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub duration_ms: u64,
}

impl RunResult {
    /// Whether the failure is worth re-enqueueing
    pub fn is_retryable(&self) -> bool {
        !self.success && self.error_kind.map(|k| k.is_retryable()).unwrap_or(false)
    }
}

/// Basic workflow metadata for listing operations
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSummary {
    pub id: String,
    pub name: String,
    pub version: u32,
    pub organization_id: Option<String>,
    pub trigger_kind: TriggerKind,
    pub status: WorkflowStatus,
    pub updated_at: String,
}
