/// Workflow service
///
/// The entry point triggers and the HTTP layer talk to. Work goes through the queue;
/// when the queue backend is down, user-facing triggers run inline instead of being
/// dropped.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::error::EngineError;
use crate::resilience::dead_letter::ReplayOutcome;
use crate::resilience::{DeadLetterItem, DeadLetterQueue};
use crate::runtime::engine::{RunEngine, RunRequest};
use crate::runtime::executor::RunScope;
use crate::runtime::queue::{CapacityStatus, EnqueueRequest, QueueStats, WorkflowQueue, WORKFLOW_EXECUTE_OPERATION};
use crate::workflow::storage::WorkflowRepository;
use crate::workflow::types::{RunResult, TriggerKind};

/// What happened to a dispatch request
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "mode", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum QueueOutcome {
    Queued { job_id: String, run_id: String },
    /// Queue was unavailable and the run executed synchronously
    ExecutedInline(RunResult),
}

/// Payload recorded for whole-workflow dead letters
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WorkflowReplay {
    workflow_id: String,
    user_id: String,
    trigger_kind: TriggerKind,
    #[serde(default)]
    trigger_payload: Value,
    #[serde(default)]
    organization_id: Option<String>,
}

pub struct WorkflowService {
    repository: Arc<dyn WorkflowRepository>,
    engine: Arc<RunEngine>,
    queue: Arc<WorkflowQueue>,
    dead_letters: DeadLetterQueue,
}

impl WorkflowService {
    pub fn new(
        repository: Arc<dyn WorkflowRepository>,
        engine: Arc<RunEngine>,
        queue: Arc<WorkflowQueue>,
        dead_letters: DeadLetterQueue,
    ) -> Self {
        Self {
            repository,
            engine,
            queue,
            dead_letters,
        }
    }

    pub fn queue(&self) -> &Arc<WorkflowQueue> {
        &self.queue
    }

    pub fn engine(&self) -> &Arc<RunEngine> {
        &self.engine
    }

    /// Enqueue a run, falling back to inline execution when the queue is unavailable
    pub async fn queue_workflow_execution(
        &self,
        workflow_id: &str,
        user_id: &str,
        trigger_kind: TriggerKind,
        trigger_payload: Value,
        organization_id: Option<String>,
    ) -> Result<QueueOutcome, EngineError> {
        if self.repository.load_workflow(workflow_id).await?.is_none() {
            return Err(EngineError::WorkflowNotFound(workflow_id.to_string()));
        }

        let request = EnqueueRequest {
            workflow_id: workflow_id.to_string(),
            user_id: user_id.to_string(),
            trigger_kind,
            trigger_payload: trigger_payload.clone(),
            organization_id,
        };
        match self.queue.enqueue(request).await {
            Ok(enqueued) => Ok(QueueOutcome::Queued {
                job_id: enqueued.job_id,
                run_id: enqueued.run_id,
            }),
            Err(EngineError::QueueUnavailable(reason)) => {
                let fallbacks = self.queue.record_fallback();
                tracing::warn!(
                    "⚠️ Queue unavailable ({}), executing {} inline (fallback #{})",
                    reason,
                    workflow_id,
                    fallbacks
                );
                let result = self
                    .execute_workflow(workflow_id, user_id, trigger_kind, trigger_payload)
                    .await?;
                Ok(QueueOutcome::ExecutedInline(result))
            }
            Err(e) => Err(e),
        }
    }

    /// Run a workflow synchronously, bypassing the queue
    pub async fn execute_workflow(
        &self,
        workflow_id: &str,
        user_id: &str,
        trigger_kind: TriggerKind,
        trigger_payload: Value,
    ) -> Result<RunResult, EngineError> {
        self.engine
            .run(RunRequest::new(workflow_id, user_id, trigger_kind, trigger_payload))
            .await
    }

    pub async fn get_workflow_queue_stats(&self, organization_id: Option<&str>) -> Result<QueueStats, EngineError> {
        self.queue.stats(organization_id).await
    }

    pub async fn capacity_status(&self) -> CapacityStatus {
        self.queue.capacity_status().await
    }

    pub async fn list_dead_letters(&self) -> Result<Vec<DeadLetterItem>, EngineError> {
        Ok(self.dead_letters.get_dead_letter_queue().await?)
    }

    pub async fn remove_dead_letter(&self, id: &str) -> Result<bool, EngineError> {
        Ok(self.dead_letters.remove(id).await?)
    }

    /// Replay a dead-lettered workflow run or module call
    pub async fn retry_dead_letter(&self, id: &str) -> Result<ReplayOutcome, EngineError> {
        self.dead_letters
            .retry_dead_letter_item(id, |item| async move { self.replay(item).await })
            .await
    }

    async fn replay(&self, item: DeadLetterItem) -> Result<Value, String> {
        if item.operation == WORKFLOW_EXECUTE_OPERATION {
            let replay: WorkflowReplay = serde_json::from_value(item.payload)
                .map_err(|e| format!("unreadable workflow dead letter: {}", e))?;
            tracing::info!(
                "🔁 Replaying workflow {} for organization {:?}",
                replay.workflow_id,
                replay.organization_id
            );
            let result = self
                .execute_workflow(&replay.workflow_id, &replay.user_id, replay.trigger_kind, replay.trigger_payload)
                .await
                .map_err(|e| e.to_string())?;
            return if result.success {
                Ok(result.output.unwrap_or(Value::Null))
            } else {
                Err(result.error.unwrap_or_else(|| "run failed".to_string()))
            };
        }

        let organization_id = match &item.workflow_id {
            Some(workflow_id) => self
                .repository
                .load_workflow(workflow_id)
                .await
                .map_err(|e| e.to_string())?
                .and_then(|definition| definition.organization_id),
            None => None,
        };
        let scope = RunScope {
            workflow_id: item.workflow_id.clone().unwrap_or_default(),
            run_id: item.workflow_run_id.clone().unwrap_or_default(),
            organization_id,
        };
        self.engine
            .executor()
            .invoke_resolved(&item.operation, item.payload, &scope)
            .await
            .map_err(|e| e.to_string())
    }
}

impl std::fmt::Debug for WorkflowService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowService")
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}
