/// Workflow run engine
///
/// Drives one run through `queued -> running -> {success, error}`: steps execute
/// strictly in declared order, each seeing the context produced by the ones before it.
/// The first fatal step error stops the run. There is no whole-run retry here; the
/// queue decides whether a failed run is attempted again.

use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;

use crate::error::{EngineError, StepError};
use crate::runtime::context::{resolve_return_value, RunContext};
use crate::runtime::executor::{RunScope, StepExecutor};
use crate::workflow::storage::WorkflowRepository;
use crate::workflow::types::{RunResult, RunStatus, RunUpdate, TriggerKind, WorkflowRun};

/// Everything needed to execute one run
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub workflow_id: String,
    pub user_id: String,
    pub trigger_kind: TriggerKind,
    pub trigger_payload: Value,
    /// Pre-created queued run row; None for synchronous paths
    pub run_id: Option<String>,
    /// 1-based attempt number of the originating job
    pub attempt: u32,
}

impl RunRequest {
    pub fn new(workflow_id: &str, user_id: &str, trigger_kind: TriggerKind, trigger_payload: Value) -> Self {
        Self {
            workflow_id: workflow_id.to_string(),
            user_id: user_id.to_string(),
            trigger_kind,
            trigger_payload,
            run_id: None,
            attempt: 1,
        }
    }
}

pub struct RunEngine {
    repository: Arc<dyn WorkflowRepository>,
    executor: Arc<StepExecutor>,
}

impl RunEngine {
    pub fn new(repository: Arc<dyn WorkflowRepository>, executor: Arc<StepExecutor>) -> Self {
        Self { repository, executor }
    }

    pub fn repository(&self) -> &Arc<dyn WorkflowRepository> {
        &self.repository
    }

    pub fn executor(&self) -> &Arc<StepExecutor> {
        &self.executor
    }

    pub async fn run(&self, request: RunRequest) -> Result<RunResult, EngineError> {
        let started = Instant::now();

        let definition = self
            .repository
            .load_workflow(&request.workflow_id)
            .await?
            .ok_or_else(|| EngineError::WorkflowNotFound(request.workflow_id.clone()))?;

        let run_id = match self.start_run(&request, definition.organization_id.clone()).await? {
            RunStart::Started(run_id) => run_id,
            RunStart::AlreadyCompleted(result) => return Ok(result),
        };

        tracing::info!(
            "🚀 Starting workflow run {} for {} (trigger: {}, attempt {})",
            run_id,
            definition.id,
            request.trigger_kind,
            request.attempt
        );

        let scope = RunScope {
            workflow_id: definition.id.clone(),
            run_id: run_id.clone(),
            organization_id: definition.organization_id.clone(),
        };

        let mut context = RunContext::new(request.trigger_payload.clone());
        let mut failure: Option<(String, StepError)> = None;

        for step in &definition.steps {
            match self.executor.execute_step(step, &context, &scope).await {
                Ok(output) => {
                    context = context.with_value(&output.alias, output.value);
                }
                Err(err) if step.continue_on_error => {
                    tracing::warn!("⚠️ Step {} failed, continuing: {}", step.id, err);
                    context = context.with_error(&step.output_alias, &step.id, &err);
                }
                Err(err) => {
                    tracing::error!("❌ Step {} failed, stopping run {}: {}", step.id, run_id, err);
                    failure = Some((step.id.clone(), err));
                    break;
                }
            }
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        let result = match failure {
            None => RunResult {
                run_id: run_id.clone(),
                success: true,
                output: Some(resolve_return_value(definition.return_value.as_deref(), &context)),
                error: None,
                error_step: None,
                error_kind: None,
                duration_ms,
            },
            Some((step_id, err)) => RunResult {
                run_id: run_id.clone(),
                success: false,
                output: None,
                error: Some(err.message.clone()),
                error_step: Some(step_id),
                error_kind: Some(err.kind),
                duration_ms,
            },
        };

        let update = RunUpdate {
            status: Some(if result.success { RunStatus::Success } else { RunStatus::Error }),
            started_at: None,
            completed_at: Some(Utc::now()),
            duration_ms: Some(duration_ms),
            output: result.output.clone(),
            error: result.error.clone(),
            error_step_id: result.error_step.clone(),
        };
        if !self.repository.update_run(&run_id, &update).await? {
            tracing::warn!("⚠️ Run {} was already completed; terminal update ignored", run_id);
        }

        if result.success {
            tracing::info!("✅ Workflow run {} completed in {}ms", run_id, duration_ms);
        }
        Ok(result)
    }

    /// Move the pre-created row to running, or insert a running row for synchronous paths
    async fn start_run(&self, request: &RunRequest, organization_id: Option<String>) -> Result<RunStart, EngineError> {
        if let Some(run_id) = &request.run_id {
            if self.repository.update_run(run_id, &RunUpdate::running()).await? {
                return Ok(RunStart::Started(run_id.clone()));
            }
            if let Some(existing) = self.repository.get_run(run_id).await? {
                // Redelivered job whose run already finished
                tracing::info!("⏭️ Run {} already completed, not executing again", run_id);
                return Ok(RunStart::AlreadyCompleted(result_from_run(&existing)));
            }
        }

        let mut run = WorkflowRun::new(
            &request.workflow_id,
            organization_id,
            &request.user_id,
            request.trigger_kind,
            request.trigger_payload.clone(),
            RunStatus::Running,
            request.attempt,
        );
        if let Some(run_id) = &request.run_id {
            run.id = run_id.clone();
        }
        self.repository.insert_run(&run).await?;
        Ok(RunStart::Started(run.id))
    }
}

impl std::fmt::Debug for RunEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunEngine").field("executor", &self.executor).finish_non_exhaustive()
    }
}

enum RunStart {
    Started(String),
    AlreadyCompleted(RunResult),
}

fn result_from_run(run: &WorkflowRun) -> RunResult {
    RunResult {
        run_id: run.id.clone(),
        success: run.status == RunStatus::Success,
        output: run.output.clone(),
        error: run.error.clone(),
        error_step: run.error_step_id.clone(),
        error_kind: None,
        duration_ms: run.duration_ms.unwrap_or(0),
    }
}
