/// Job handlers
///
/// The dispatcher hands every claimed job to a `JobHandler` and only looks at the
/// outcome: did it finish, and if not, is another attempt worthwhile.

use async_trait::async_trait;

use crate::error::EngineError;
use crate::runtime::engine::{RunEngine, RunRequest};
use crate::runtime::queue::backend::QueueJob;

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed,
    Failed { retryable: bool, error: String },
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &QueueJob) -> JobOutcome;
}

#[async_trait]
impl JobHandler for RunEngine {
    async fn handle(&self, job: &QueueJob) -> JobOutcome {
        let request = RunRequest {
            workflow_id: job.workflow_id.clone(),
            user_id: job.user_id.clone(),
            trigger_kind: job.trigger_kind,
            trigger_payload: job.trigger_payload.clone(),
            run_id: Some(job.run_id.clone()),
            attempt: job.attempt,
        };

        match self.run(request).await {
            Ok(result) if result.success => JobOutcome::Completed,
            Ok(result) => JobOutcome::Failed {
                retryable: result.is_retryable(),
                error: result.error.unwrap_or_else(|| "run failed".to_string()),
            },
            Err(e @ EngineError::WorkflowNotFound(_)) => JobOutcome::Failed {
                retryable: false,
                error: e.to_string(),
            },
            // Storage hiccups are worth another attempt
            Err(e) => JobOutcome::Failed {
                retryable: true,
                error: e.to_string(),
            },
        }
    }
}
