/// Per-tenant workflow queue
///
/// Every trigger enqueues a job and gets back immediately. A dispatcher drains the
/// queue with a bounded global worker pool while capping how many jobs one
/// organization may have in flight, so a single noisy tenant cannot starve the rest.
/// Failed jobs are retried with exponential backoff and dead-lettered once their
/// attempts run out.

pub mod backend;
pub mod sqlite;
pub mod worker;

pub use backend::{MemoryQueueBackend, PartitionStats, QueueBackend, QueueJob, QueueStats};
pub use sqlite::SqliteQueueBackend;
pub use worker::{JobHandler, JobOutcome};

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;
use crate::resilience::{DeadLetterContext, DeadLetterQueue, RetryPolicy};
use crate::tenant::{organization_for_partition, partition_key};
use crate::workflow::storage::WorkflowRepository;
use crate::workflow::types::{RunStatus, RunUpdate, TriggerKind, WorkflowRun};

/// Dead-letter operation name for whole jobs the queue gave up on
pub const WORKFLOW_EXECUTE_OPERATION: &str = "workflow.execute";

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Jobs executing at once in this process
    pub global_concurrency: usize,
    /// Active jobs allowed per organization across all processes
    pub per_org_concurrency: usize,
    /// Executions per job, including the first
    pub max_attempts: u32,
    pub backoff_initial_ms: u64,
    pub backoff_multiplier: f64,
    /// How long a claim stays valid without being extended
    pub visibility_timeout: Duration,
    /// Idle wait between claim attempts when nothing is claimable
    pub poll_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            global_concurrency: 10,
            per_org_concurrency: 5,
            max_attempts: 3,
            backoff_initial_ms: 1000,
            backoff_multiplier: 2.0,
            visibility_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_millis(250),
        }
    }
}

impl QueueConfig {
    /// Delay before re-running a job whose attempt `attempt` (1-based) failed
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        RetryPolicy::new(0, self.backoff_initial_ms, self.backoff_multiplier).delay_for(attempt.saturating_sub(1))
    }

    fn sweep_interval(&self) -> Duration {
        (self.visibility_timeout / 3).max(Duration::from_millis(100))
    }
}

#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub workflow_id: String,
    pub user_id: String,
    pub trigger_kind: TriggerKind,
    pub trigger_payload: Value,
    pub organization_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Enqueued {
    pub job_id: String,
    pub run_id: String,
}

/// Queue health as seen by operators and the fallback path
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapacityStatus {
    pub queue_available: bool,
    pub degraded: bool,
    pub fallback_executions: u64,
    pub global_concurrency: usize,
    pub per_org_concurrency: usize,
    pub active: usize,
    pub waiting: usize,
}

pub struct WorkflowQueue {
    backend: Arc<dyn QueueBackend>,
    repository: Arc<dyn WorkflowRepository>,
    dead_letters: DeadLetterQueue,
    config: QueueConfig,
    permits: Arc<Semaphore>,
    /// Partition of the last claim, for round-robin
    cursor: Mutex<Option<String>>,
    in_flight: Mutex<HashSet<String>>,
    healthy: AtomicBool,
    fallback_executions: AtomicU64,
    work_ready: Notify,
}

impl WorkflowQueue {
    pub fn new(
        backend: Arc<dyn QueueBackend>,
        repository: Arc<dyn WorkflowRepository>,
        dead_letters: DeadLetterQueue,
        config: QueueConfig,
    ) -> Self {
        Self {
            backend,
            repository,
            dead_letters,
            permits: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            config,
            cursor: Mutex::new(None),
            in_flight: Mutex::new(HashSet::new()),
            healthy: AtomicBool::new(true),
            fallback_executions: AtomicU64::new(0),
            work_ready: Notify::new(),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Record a queued run and push its job
    ///
    /// When the backend rejects the push the run row is closed as failed, the queue is
    /// flagged degraded and the caller decides whether to run the workflow inline.
    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<Enqueued, EngineError> {
        let partition = partition_key(request.organization_id.as_deref());
        let organization_id = organization_for_partition(&partition);

        let run = WorkflowRun::new(
            &request.workflow_id,
            organization_id.clone(),
            &request.user_id,
            request.trigger_kind,
            request.trigger_payload.clone(),
            RunStatus::Queued,
            1,
        );
        self.repository.insert_run(&run).await?;

        let now = Utc::now();
        let job = QueueJob {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: run.id.clone(),
            workflow_id: request.workflow_id.clone(),
            user_id: request.user_id,
            organization_id,
            partition: partition.clone(),
            trigger_kind: request.trigger_kind,
            trigger_payload: request.trigger_payload,
            attempt: 1,
            enqueued_at: now,
            available_at: now,
        };
        let job_id = job.id.clone();

        if let Err(e) = self.backend.push(job).await {
            self.mark_degraded(&e);
            let update = RunUpdate::failed(format!("queue unavailable: {}", e));
            if let Err(update_err) = self.repository.update_run(&run.id, &update).await {
                tracing::warn!("⚠️ Could not close run {} after failed enqueue: {}", run.id, update_err);
            }
            return Err(EngineError::QueueUnavailable(e.to_string()));
        }

        self.mark_healthy();
        self.work_ready.notify_one();
        tracing::info!(
            "📥 Queued job {} for workflow {} (partition {})",
            job_id,
            request.workflow_id,
            partition
        );
        Ok(Enqueued { job_id, run_id: run.id })
    }

    /// Queue counts, for one organization or all of them
    pub async fn stats(&self, organization_id: Option<&str>) -> Result<QueueStats, EngineError> {
        let partition = organization_id.map(|org| partition_key(Some(org)));
        match self.backend.stats(partition.as_deref()).await {
            Ok(stats) => Ok(stats),
            Err(e) => {
                self.mark_degraded(&e);
                Err(EngineError::QueueUnavailable(e.to_string()))
            }
        }
    }

    pub async fn capacity_status(&self) -> CapacityStatus {
        let stats = self.stats(None).await;
        let (queue_available, active, waiting) = match &stats {
            Ok(stats) => (true, stats.active, stats.waiting),
            Err(_) => (false, 0, 0),
        };
        CapacityStatus {
            queue_available,
            degraded: self.is_degraded(),
            fallback_executions: self.fallback_executions.load(Ordering::Relaxed),
            global_concurrency: self.config.global_concurrency,
            per_org_concurrency: self.config.per_org_concurrency,
            active,
            waiting,
        }
    }

    pub fn is_degraded(&self) -> bool {
        !self.healthy.load(Ordering::Relaxed)
    }

    /// Count one run executed inline because the queue was unavailable
    pub fn record_fallback(&self) -> u64 {
        self.fallback_executions.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn mark_healthy(&self) {
        if !self.healthy.swap(true, Ordering::Relaxed) {
            tracing::info!("✅ Queue backend recovered");
        }
    }

    fn mark_degraded(&self, error: &anyhow::Error) {
        if self.healthy.swap(false, Ordering::Relaxed) {
            tracing::error!("🚨 Queue backend unavailable, switching to degraded mode: {}", error);
        }
    }

    /// Drain the queue until `shutdown` fires, then wait for in-flight jobs
    pub async fn run(self: Arc<Self>, handler: Arc<dyn JobHandler>, shutdown: CancellationToken) {
        tracing::info!(
            "👷 Queue dispatcher started (global {}, per-org {})",
            self.config.global_concurrency,
            self.config.per_org_concurrency
        );
        let sweeper = tokio::spawn(Arc::clone(&self).sweep_loop(shutdown.clone()));

        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match self.claim().await {
                Ok(Some(job)) => {
                    let queue = Arc::clone(&self);
                    let handler = Arc::clone(&handler);
                    tokio::spawn(async move {
                        let _permit = permit;
                        queue.process(job, handler).await;
                    });
                    continue;
                }
                Ok(None) => drop(permit),
                Err(e) => {
                    drop(permit);
                    tracing::error!("❌ Failed to claim next job: {}", e);
                    self.mark_degraded(&e);
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.work_ready.notified() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        sweeper.abort();
        let all = self.config.global_concurrency.max(1) as u32;
        if tokio::time::timeout(self.config.visibility_timeout, self.permits.acquire_many(all))
            .await
            .is_err()
        {
            tracing::warn!("⚠️ Shutting down with jobs still running; they will be redelivered");
        }
        tracing::info!("👋 Queue dispatcher stopped");
    }

    async fn claim(&self) -> anyhow::Result<Option<QueueJob>> {
        let mut cursor = self.cursor.lock().await;
        let now = Utc::now();
        let visible_until = now + chrono::Duration::from_std(self.config.visibility_timeout)?;
        let job = self
            .backend
            .claim_next(now, self.config.per_org_concurrency, cursor.as_deref(), visible_until)
            .await?;
        self.mark_healthy();
        if let Some(job) = &job {
            *cursor = Some(job.partition.clone());
        }
        Ok(job)
    }

    async fn process(&self, job: QueueJob, handler: Arc<dyn JobHandler>) {
        if !self.in_flight.lock().await.insert(job.id.clone()) {
            tracing::warn!("⚠️ Job {} is already executing here, skipping duplicate delivery", job.id);
            return;
        }

        tracing::debug!("▶️ Executing job {} (attempt {}, partition {})", job.id, job.attempt, job.partition);
        let task_job = job.clone();
        let outcome = match tokio::spawn(async move { handler.handle(&task_job).await }).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!("💥 Job {} aborted inside its handler: {}", job.id, e);
                JobOutcome::Failed {
                    retryable: false,
                    error: format!("job handler panicked: {}", e),
                }
            }
        };
        if let Err(e) = self.finish(&job, outcome).await {
            tracing::error!("❌ Failed to record outcome of job {}: {}", job.id, e);
        }

        self.in_flight.lock().await.remove(&job.id);
        self.work_ready.notify_one();
    }

    /// Apply a job outcome: remove, reschedule, or dead-letter
    pub async fn finish(&self, job: &QueueJob, outcome: JobOutcome) -> anyhow::Result<()> {
        match outcome {
            JobOutcome::Completed => {
                self.backend.complete(&job.id).await?;
                tracing::debug!("✅ Job {} completed", job.id);
            }
            JobOutcome::Failed { retryable: true, error } if job.attempt < self.config.max_attempts => {
                self.ensure_failed(&job.run_id, &error).await?;

                let next_attempt = job.attempt + 1;
                let run = WorkflowRun::new(
                    &job.workflow_id,
                    job.organization_id.clone(),
                    &job.user_id,
                    job.trigger_kind,
                    job.trigger_payload.clone(),
                    RunStatus::Queued,
                    next_attempt,
                );
                self.repository.insert_run(&run).await?;

                let delay = self.config.retry_delay(job.attempt);
                let available_at = Utc::now() + chrono::Duration::from_std(delay)?;
                self.backend.reschedule(&job.id, next_attempt, &run.id, available_at).await?;
                tracing::warn!(
                    "🔁 Job {} failed on attempt {}/{}, retrying in {}ms: {}",
                    job.id,
                    job.attempt,
                    self.config.max_attempts,
                    delay.as_millis(),
                    error
                );
            }
            JobOutcome::Failed { retryable: true, error } => {
                let payload = json!({
                    "workflowId": job.workflow_id,
                    "userId": job.user_id,
                    "triggerKind": job.trigger_kind,
                    "triggerPayload": job.trigger_payload,
                    "organizationId": job.organization_id,
                });
                let context = DeadLetterContext {
                    workflow_id: Some(job.workflow_id.clone()),
                    workflow_run_id: Some(job.run_id.clone()),
                    attempts: job.attempt,
                };
                self.dead_letters
                    .add_to_dead_letter_queue(WORKFLOW_EXECUTE_OPERATION, payload, &error, context)
                    .await?;
                self.ensure_failed(&job.run_id, &error).await?;
                self.backend.complete(&job.id).await?;
            }
            JobOutcome::Failed { retryable: false, error } => {
                self.ensure_failed(&job.run_id, &error).await?;
                self.backend.complete(&job.id).await?;
                tracing::info!("🛑 Job {} failed permanently: {}", job.id, error);
            }
        }
        Ok(())
    }

    /// Close the run as failed unless the engine already wrote a terminal state
    async fn ensure_failed(&self, run_id: &str, error: &str) -> anyhow::Result<()> {
        self.repository.update_run(run_id, &RunUpdate::failed(error)).await?;
        Ok(())
    }

    /// Extend claims held by this process, then return expired claims to the queue
    pub async fn sweep(&self) -> anyhow::Result<usize> {
        let now = Utc::now();
        let held: Vec<String> = self.in_flight.lock().await.iter().cloned().collect();
        if !held.is_empty() {
            let visible_until = now + chrono::Duration::from_std(self.config.visibility_timeout)?;
            self.backend.extend_visibility(&held, visible_until).await?;
        }

        let requeued = self.backend.requeue_expired(now).await?;
        if requeued > 0 {
            tracing::warn!("♻️ Requeued {} jobs whose visibility timeout expired", requeued);
            self.work_ready.notify_one();
        }
        Ok(requeued)
    }

    async fn sweep_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval());
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        tracing::warn!("⚠️ Queue sweep failed: {}", e);
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for WorkflowQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowQueue")
            .field("config", &self.config)
            .field("degraded", &self.is_degraded())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::memory::MemoryWorkflowStore;
    use async_trait::async_trait;
    use chrono::DateTime;

    struct Harness {
        queue: Arc<WorkflowQueue>,
        store: Arc<MemoryWorkflowStore>,
        dead_letters: DeadLetterQueue,
    }

    fn harness(config: QueueConfig) -> Harness {
        harness_with(Arc::new(MemoryQueueBackend::new()), config)
    }

    fn harness_with(backend: Arc<dyn QueueBackend>, config: QueueConfig) -> Harness {
        let store = Arc::new(MemoryWorkflowStore::new());
        let dead_letters = DeadLetterQueue::in_memory();
        let queue = Arc::new(WorkflowQueue::new(backend, store.clone(), dead_letters.clone(), config));
        Harness { queue, store, dead_letters }
    }

    fn request(org: Option<&str>) -> EnqueueRequest {
        EnqueueRequest {
            workflow_id: "wf".into(),
            user_id: "u1".into(),
            trigger_kind: TriggerKind::Webhook,
            trigger_payload: json!({ "order": 7 }),
            organization_id: org.map(String::from),
        }
    }

    #[derive(Default)]
    struct RecordingHandler {
        completed: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl JobHandler for RecordingHandler {
        async fn handle(&self, job: &QueueJob) -> JobOutcome {
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.completed.lock().await.push(job.partition.clone());
            JobOutcome::Completed
        }
    }

    struct PanickingHandler;

    #[async_trait]
    impl JobHandler for PanickingHandler {
        async fn handle(&self, _job: &QueueJob) -> JobOutcome {
            panic!("module blew up")
        }
    }

    struct UnreachableBackend;

    #[async_trait]
    impl QueueBackend for UnreachableBackend {
        async fn push(&self, _job: QueueJob) -> anyhow::Result<()> {
            anyhow::bail!("connection refused")
        }
        async fn claim_next(
            &self,
            _now: DateTime<Utc>,
            _cap: usize,
            _after: Option<&str>,
            _visible_until: DateTime<Utc>,
        ) -> anyhow::Result<Option<QueueJob>> {
            anyhow::bail!("connection refused")
        }
        async fn complete(&self, _job_id: &str) -> anyhow::Result<()> {
            anyhow::bail!("connection refused")
        }
        async fn reschedule(
            &self,
            _job_id: &str,
            _attempt: u32,
            _run_id: &str,
            _available_at: DateTime<Utc>,
        ) -> anyhow::Result<()> {
            anyhow::bail!("connection refused")
        }
        async fn extend_visibility(&self, _job_ids: &[String], _visible_until: DateTime<Utc>) -> anyhow::Result<()> {
            anyhow::bail!("connection refused")
        }
        async fn requeue_expired(&self, _now: DateTime<Utc>) -> anyhow::Result<usize> {
            anyhow::bail!("connection refused")
        }
        async fn stats(&self, _partition: Option<&str>) -> anyhow::Result<QueueStats> {
            anyhow::bail!("connection refused")
        }
    }

    #[tokio::test]
    async fn enqueue_records_queued_run() {
        let h = harness(QueueConfig::default());
        let enqueued = h.queue.enqueue(request(None)).await.unwrap();

        let run = h.store.get_run(&enqueued.run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Queued);
        assert_eq!(run.attempt, 1);
        assert_eq!(run.organization_id, None);

        let stats = h.queue.stats(Some("admin")).await.unwrap();
        assert_eq!((stats.waiting, stats.total), (1, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn busy_tenant_cannot_starve_another() {
        let h = harness(QueueConfig {
            global_concurrency: 8,
            per_org_concurrency: 4,
            ..QueueConfig::default()
        });
        for _ in 0..10 {
            h.queue.enqueue(request(Some("org-a"))).await.unwrap();
        }
        for _ in 0..10 {
            h.queue.enqueue(request(Some("org-b"))).await.unwrap();
        }

        let handler = Arc::new(RecordingHandler::default());
        let shutdown = CancellationToken::new();
        let dispatcher = tokio::spawn(
            Arc::clone(&h.queue).run(handler.clone() as Arc<dyn JobHandler>, shutdown.clone()),
        );

        while handler.completed.lock().await.len() < 20 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.cancel();
        dispatcher.await.unwrap();

        let completed = handler.completed.lock().await.clone();
        let org_a = completed[..8].iter().filter(|p| p.as_str() == "org-a").count();
        assert!((2..=6).contains(&org_a), "first 8 completions: {:?}", &completed[..8]);
        assert_eq!(h.queue.stats(None).await.unwrap().total, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn round_robin_alone_balances_tenants() {
        let h = harness(QueueConfig {
            global_concurrency: 4,
            per_org_concurrency: 100,
            ..QueueConfig::default()
        });
        for _ in 0..10 {
            h.queue.enqueue(request(Some("org-a"))).await.unwrap();
        }
        for _ in 0..10 {
            h.queue.enqueue(request(Some("org-b"))).await.unwrap();
        }

        let handler = Arc::new(RecordingHandler::default());
        let shutdown = CancellationToken::new();
        let dispatcher = tokio::spawn(
            Arc::clone(&h.queue).run(handler.clone() as Arc<dyn JobHandler>, shutdown.clone()),
        );

        while handler.completed.lock().await.len() < 20 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.cancel();
        dispatcher.await.unwrap();

        let completed = handler.completed.lock().await.clone();
        let org_a = completed[..8].iter().filter(|p| p.as_str() == "org-a").count();
        assert!((2..=6).contains(&org_a), "first 8 completions: {:?}", &completed[..8]);
        assert_eq!(h.queue.stats(None).await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn panicking_handler_fails_the_job_and_frees_its_slot() {
        let h = harness(QueueConfig::default());
        let enqueued = h.queue.enqueue(request(Some("org-a"))).await.unwrap();
        let job = h.queue.claim().await.unwrap().unwrap();

        h.queue.process(job, Arc::new(PanickingHandler)).await;

        assert!(h.queue.in_flight.lock().await.is_empty());
        assert_eq!(h.queue.stats(None).await.unwrap().total, 0);
        let run = h.store.get_run(&enqueued.run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Error);
        assert!(run.error.as_deref().unwrap_or_default().contains("panicked"));
        assert!(h.dead_letters.get_dead_letter_queue().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn retryable_failure_reschedules_with_fresh_run_row() {
        let h = harness(QueueConfig::default());
        let enqueued = h.queue.enqueue(request(Some("org-a"))).await.unwrap();
        let job = h.queue.claim().await.unwrap().unwrap();

        h.queue
            .finish(&job, JobOutcome::Failed { retryable: true, error: "upstream 503".into() })
            .await
            .unwrap();

        let first = h.store.get_run(&enqueued.run_id).await.unwrap().unwrap();
        assert_eq!(first.status, RunStatus::Error);
        let runs = h.store.all_runs().await;
        assert_eq!(runs.len(), 2);
        let retry = runs.iter().find(|r| r.attempt == 2).unwrap();
        assert_eq!(retry.status, RunStatus::Queued);

        // Backoff of one second keeps it out of reach for now
        assert!(h.queue.claim().await.unwrap().is_none());
        assert_eq!(h.queue.stats(None).await.unwrap().waiting, 1);
        assert!(h.dead_letters.get_dead_letter_queue().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn exhausted_job_is_dead_lettered() {
        let h = harness(QueueConfig::default());
        let enqueued = h.queue.enqueue(request(Some("org-a"))).await.unwrap();
        let mut job = h.queue.claim().await.unwrap().unwrap();
        job.attempt = 3;

        h.queue
            .finish(&job, JobOutcome::Failed { retryable: true, error: "upstream 503".into() })
            .await
            .unwrap();

        let items = h.dead_letters.get_dead_letter_queue().await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].operation, WORKFLOW_EXECUTE_OPERATION);
        assert_eq!(items[0].attempts, 3);
        assert_eq!(items[0].payload["triggerPayload"], json!({ "order": 7 }));
        assert_eq!(items[0].payload["organizationId"], json!("org-a"));
        assert_eq!(items[0].workflow_run_id.as_deref(), Some(enqueued.run_id.as_str()));

        let run = h.store.get_run(&enqueued.run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Error);
        assert_eq!(h.queue.stats(None).await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn permanent_failure_removes_job() {
        let h = harness(QueueConfig::default());
        h.queue.enqueue(request(None)).await.unwrap();
        let job = h.queue.claim().await.unwrap().unwrap();

        h.queue
            .finish(&job, JobOutcome::Failed { retryable: false, error: "bad input".into() })
            .await
            .unwrap();

        assert_eq!(h.store.all_runs().await.len(), 1);
        assert_eq!(h.queue.stats(None).await.unwrap().total, 0);
        assert!(h.dead_letters.get_dead_letter_queue().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unreachable_backend_degrades_queue() {
        let h = harness_with(Arc::new(UnreachableBackend), QueueConfig::default());
        let err = h.queue.enqueue(request(Some("org-a"))).await.unwrap_err();
        assert!(matches!(err, EngineError::QueueUnavailable(_)));

        let runs = h.store.all_runs().await;
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Error);

        h.queue.record_fallback();
        let capacity = h.queue.capacity_status().await;
        assert!(!capacity.queue_available);
        assert!(capacity.degraded);
        assert_eq!(capacity.fallback_executions, 1);
    }

    #[tokio::test]
    async fn sweep_requeues_abandoned_claims() {
        let h = harness(QueueConfig {
            visibility_timeout: Duration::ZERO,
            ..QueueConfig::default()
        });
        h.queue.enqueue(request(None)).await.unwrap();
        h.queue.claim().await.unwrap().unwrap();

        assert_eq!(h.queue.sweep().await.unwrap(), 1);
        assert!(h.queue.claim().await.unwrap().is_some());
    }

    #[test]
    fn retry_delay_grows_geometrically() {
        let config = QueueConfig::default();
        assert_eq!(config.retry_delay(1), Duration::from_millis(1000));
        assert_eq!(config.retry_delay(2), Duration::from_millis(2000));
        assert_eq!(config.retry_delay(3), Duration::from_millis(4000));
    }
}
