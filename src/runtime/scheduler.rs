/// Distributed cron scheduler
///
/// Every process ticks on the same interval, but only the holder of the leader lease
/// dispatches. Each cron workflow keeps its next fire time in the repository and a
/// fire only happens after a compare-and-set moves that time forward, so a fire is
/// enqueued at most once even if two processes briefly both believe they lead.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler};

use crate::error::EngineError;
use crate::runtime::lease::LockStore;
use crate::runtime::service::WorkflowService;
use crate::workflow::registry::WorkflowRegistry;
use crate::workflow::storage::WorkflowRepository;
use crate::workflow::types::{TriggerKind, WorkflowDefinition};

/// Lock-store key of the scheduler leader lease
pub const LEADER_LEASE_KEY: &str = "workflow-scheduler:leader";

/// User id recorded on cron runs of workflows without an owner
const SYSTEM_USER: &str = "system";

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub instance_id: String,
    pub lease_ttl: Duration,
    pub tick_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            instance_id: uuid::Uuid::new_v4().to_string(),
            lease_ttl: Duration::from_secs(90),
            tick_interval: Duration::from_secs(30),
        }
    }
}

/// Result of one scheduler tick
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Another live instance holds the lease
    Follower,
    /// Lock store unreachable; nothing dispatched
    LeaseUnavailable,
    Dispatched { count: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    pub leader_id: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub is_leader: bool,
    pub instance_id: String,
}

pub struct DistributedScheduler {
    config: SchedulerConfig,
    locks: Arc<dyn LockStore>,
    repository: Arc<dyn WorkflowRepository>,
    registry: Arc<WorkflowRegistry>,
    service: Arc<WorkflowService>,
    is_leader: AtomicBool,
}

impl DistributedScheduler {
    pub fn new(
        config: SchedulerConfig,
        locks: Arc<dyn LockStore>,
        repository: Arc<dyn WorkflowRepository>,
        registry: Arc<WorkflowRegistry>,
        service: Arc<WorkflowService>,
    ) -> Self {
        Self {
            config,
            locks,
            repository,
            registry,
            service,
            is_leader: AtomicBool::new(false),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.config.instance_id
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::Relaxed)
    }

    pub async fn tick(&self) -> Result<TickOutcome, EngineError> {
        self.tick_at(Utc::now()).await
    }

    /// One election round followed, on the leader, by a dispatch pass
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<TickOutcome, EngineError> {
        match self.acquire_leadership(now).await {
            Ok(true) => {}
            Ok(false) => return Ok(TickOutcome::Follower),
            Err(e) => {
                self.set_leader(false);
                tracing::warn!("⚠️ Lock store unavailable, skipping cron dispatch this tick: {}", e);
                return Ok(TickOutcome::LeaseUnavailable);
            }
        }

        let mut count = 0;
        for definition in self.repository.list_cron_workflows().await? {
            let workflow_id = definition.id.clone();
            match self.dispatch_if_due(definition, now).await {
                Ok(true) => count += 1,
                Ok(false) => {}
                Err(e) => tracing::error!("❌ Cron dispatch failed for {}: {}", workflow_id, e),
            }
        }
        if count > 0 {
            tracing::info!("⏰ Dispatched {} cron workflows", count);
        }
        Ok(TickOutcome::Dispatched { count })
    }

    async fn acquire_leadership(&self, now: DateTime<Utc>) -> Result<bool> {
        let ttl = chrono::Duration::from_std(self.config.lease_ttl)?;
        let id = self.config.instance_id.as_str();
        let leader = self.locks.renew_lease(LEADER_LEASE_KEY, id, ttl, now).await?
            || self.locks.try_set_lease(LEADER_LEASE_KEY, id, ttl, now).await?;
        self.set_leader(leader);
        Ok(leader)
    }

    fn set_leader(&self, leader: bool) {
        let was = self.is_leader.swap(leader, Ordering::Relaxed);
        if leader && !was {
            tracing::info!("👑 Instance {} became scheduler leader", self.config.instance_id);
        } else if !leader && was {
            tracing::info!("🔕 Instance {} is no longer scheduler leader", self.config.instance_id);
        }
    }

    /// Fire one workflow if its next fire time has passed; returns whether it fired
    async fn dispatch_if_due(&self, definition: WorkflowDefinition, now: DateTime<Utc>) -> Result<bool, EngineError> {
        let compiled = match self.registry.compiled_for(definition) {
            Ok(compiled) => compiled,
            Err(e) => {
                tracing::warn!("⚠️ Skipping cron workflow with invalid schedule: {}", e);
                return Ok(false);
            }
        };
        let Some(schedule) = &compiled.schedule else {
            return Ok(false);
        };
        let workflow = &compiled.definition;
        let Some(next) = schedule.next_after(now) else {
            return Ok(false);
        };

        let due = match self.repository.next_fire_at(&workflow.id).await? {
            None => {
                // First sighting: start the clock without firing
                if self.repository.advance_next_fire(&workflow.id, None, next).await? {
                    tracing::debug!("🗓️ Scheduled {} for {}", workflow.id, next);
                }
                return Ok(false);
            }
            Some(due) if due <= now => due,
            Some(_) => return Ok(false),
        };

        // Any missed occurrences collapse into this single fire
        if !self.repository.advance_next_fire(&workflow.id, Some(due), next).await? {
            tracing::debug!("⏭️ Fire of {} at {} already claimed", workflow.id, due);
            return Ok(false);
        }

        let payload = json!({
            "scheduledFor": due.to_rfc3339(),
            "firedAt": now.to_rfc3339(),
        });
        let user_id = workflow.owner_id.as_deref().unwrap_or(SYSTEM_USER);
        self.service
            .queue_workflow_execution(
                &workflow.id,
                user_id,
                TriggerKind::Cron,
                payload,
                workflow.organization_id.clone(),
            )
            .await?;
        tracing::info!("🔔 Cron fired {} (scheduled for {}, next {})", workflow.id, due, next);
        Ok(true)
    }

    pub async fn status(&self) -> Result<SchedulerStatus, EngineError> {
        let lease = self
            .locks
            .get_lease(LEADER_LEASE_KEY)
            .await
            .map_err(|e| EngineError::LeaseUnavailable(e.to_string()))?
            .filter(|lease| lease.is_live(Utc::now()));
        Ok(SchedulerStatus {
            is_leader: lease
                .as_ref()
                .is_some_and(|l| l.holder_id == self.config.instance_id),
            leader_id: lease.as_ref().map(|l| l.holder_id.clone()),
            lease_expires_at: lease.map(|l| l.expires_at),
            instance_id: self.config.instance_id.clone(),
        })
    }

    /// Give up the lease so another instance can take over without waiting for expiry
    pub async fn release(&self) -> Result<()> {
        if self
            .locks
            .release_lease(LEADER_LEASE_KEY, &self.config.instance_id)
            .await?
        {
            tracing::info!("🔓 Released scheduler lease held by {}", self.config.instance_id);
        }
        self.set_leader(false);
        Ok(())
    }
}

impl std::fmt::Debug for DistributedScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedScheduler")
            .field("config", &self.config)
            .field("is_leader", &self.is_leader())
            .finish_non_exhaustive()
    }
}

/// Drives `DistributedScheduler::tick` from a tokio-cron-scheduler repeated job
pub struct SchedulerService {
    scheduler: Arc<RwLock<JobScheduler>>,
    cron: Arc<DistributedScheduler>,
}

impl SchedulerService {
    pub async fn new(cron: Arc<DistributedScheduler>) -> Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            scheduler: Arc::new(RwLock::new(scheduler)),
            cron,
        })
    }

    pub async fn start(&self) -> Result<()> {
        tracing::info!(
            "⏰ Starting cron scheduler (instance {}, tick every {:?})",
            self.cron.instance_id(),
            self.cron.config.tick_interval
        );

        let cron = Arc::clone(&self.cron);
        let job = Job::new_repeated_async(self.cron.config.tick_interval, move |_uuid, _l| {
            let cron = Arc::clone(&cron);
            Box::pin(async move {
                match cron.tick().await {
                    Ok(outcome) => tracing::debug!("⏱️ Scheduler tick: {:?}", outcome),
                    Err(e) => tracing::error!("❌ Scheduler tick failed: {}", e),
                }
            })
        })?;

        let scheduler = self.scheduler.read().await;
        scheduler.add(job).await?;
        scheduler.start().await?;
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        tracing::info!("⏹️ Stopping cron scheduler");
        {
            let mut scheduler = self.scheduler.write().await;
            scheduler.shutdown().await?;
        }
        self.cron.release().await?;
        tracing::info!("✅ Cron scheduler stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::ModuleRegistry;
    use crate::runtime::lease::MemoryLockStore;
    use crate::runtime::queue::MemoryQueueBackend;
    use crate::runtime::service::tests::{echo_workflow, fixture, Fixture};
    use crate::workflow::types::{RunStatus, Trigger};
    use chrono::TimeZone;

    struct Cluster {
        fixture: Fixture,
        locks: Arc<MemoryLockStore>,
        registry: Arc<WorkflowRegistry>,
    }

    fn cluster() -> Cluster {
        Cluster {
            fixture: fixture(Arc::new(MemoryQueueBackend::new())),
            locks: Arc::new(MemoryLockStore::new()),
            registry: Arc::new(WorkflowRegistry::new(Arc::new(ModuleRegistry::with_builtins()))),
        }
    }

    fn instance(cluster: &Cluster, id: &str) -> Arc<DistributedScheduler> {
        Arc::new(DistributedScheduler::new(
            SchedulerConfig {
                instance_id: id.into(),
                lease_ttl: Duration::from_secs(90),
                tick_interval: Duration::from_secs(30),
            },
            cluster.locks.clone(),
            cluster.fixture.store.clone(),
            cluster.registry.clone(),
            cluster.fixture.service.clone(),
        ))
    }

    async fn save_cron_workflow(cluster: &Cluster, schedule: &str) {
        let mut workflow = echo_workflow("wf-cron", Some("org-1"));
        workflow.trigger = Trigger { kind: TriggerKind::Cron, config: json!({ "schedule": schedule }) };
        cluster.fixture.store.save_workflow(&workflow).await.unwrap();
    }

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, h, m, s).unwrap()
    }

    #[tokio::test]
    async fn first_tick_schedules_without_firing() {
        let c = cluster();
        save_cron_workflow(&c, "every 5 minutes").await;
        let leader = instance(&c, "a");

        assert_eq!(leader.tick_at(at(10, 1, 0)).await.unwrap(), TickOutcome::Dispatched { count: 0 });
        assert_eq!(c.fixture.store.next_fire_at("wf-cron").await.unwrap(), Some(at(10, 5, 0)));
        assert!(c.fixture.store.all_runs().await.is_empty());
    }

    #[tokio::test]
    async fn concurrent_schedulers_fire_exactly_once() {
        let c = cluster();
        save_cron_workflow(&c, "every 5 minutes").await;
        let schedulers: Vec<_> = ["a", "b", "c"].iter().map(|id| instance(&c, id)).collect();

        schedulers[0].tick_at(at(10, 1, 0)).await.unwrap();

        let mut handles = Vec::new();
        for scheduler in &schedulers {
            let scheduler = Arc::clone(scheduler);
            handles.push(tokio::spawn(async move { scheduler.tick_at(at(10, 5, 1)).await.unwrap() }));
        }
        let mut fired = 0;
        for handle in handles {
            if let TickOutcome::Dispatched { count } = handle.await.unwrap() {
                fired += count;
            }
        }
        assert_eq!(fired, 1);

        let runs = c.fixture.store.all_runs().await;
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].trigger_kind, TriggerKind::Cron);
        assert_eq!(runs[0].status, RunStatus::Queued);
        assert_eq!(runs[0].trigger_payload["scheduledFor"], json!(at(10, 5, 0).to_rfc3339()));
        assert_eq!(c.fixture.store.next_fire_at("wf-cron").await.unwrap(), Some(at(10, 10, 0)));
    }

    #[tokio::test]
    async fn missed_occurrences_collapse_into_one_fire() {
        let c = cluster();
        save_cron_workflow(&c, "every 5 minutes").await;
        let leader = instance(&c, "a");

        leader.tick_at(at(10, 1, 0)).await.unwrap();
        assert_eq!(leader.tick_at(at(11, 2, 0)).await.unwrap(), TickOutcome::Dispatched { count: 1 });
        assert_eq!(leader.tick_at(at(11, 3, 0)).await.unwrap(), TickOutcome::Dispatched { count: 0 });
        assert_eq!(c.fixture.store.all_runs().await.len(), 1);
    }

    #[tokio::test]
    async fn only_one_leader_until_lease_expires() {
        let c = cluster();
        let a = instance(&c, "a");
        let b = instance(&c, "b");

        assert!(matches!(a.tick_at(at(10, 0, 0)).await.unwrap(), TickOutcome::Dispatched { .. }));
        assert_eq!(b.tick_at(at(10, 0, 30)).await.unwrap(), TickOutcome::Follower);
        assert!(a.is_leader());
        assert!(!b.is_leader());

        // a stops ticking; its lease lapses 90s after the last renewal
        assert_eq!(b.tick_at(at(10, 1, 29)).await.unwrap(), TickOutcome::Follower);
        assert!(matches!(b.tick_at(at(10, 1, 31)).await.unwrap(), TickOutcome::Dispatched { .. }));
        assert_eq!(a.tick_at(at(10, 1, 40)).await.unwrap(), TickOutcome::Follower);
        assert!(!a.is_leader());
    }

    #[tokio::test]
    async fn release_hands_over_immediately() {
        let c = cluster();
        let a = instance(&c, "a");
        let b = instance(&c, "b");
        let now = Utc::now();

        a.tick_at(now).await.unwrap();
        let status = b.status().await.unwrap();
        assert_eq!(status.leader_id.as_deref(), Some("a"));
        assert!(!status.is_leader);

        a.release().await.unwrap();
        assert!(b.status().await.unwrap().leader_id.is_none());
        assert!(matches!(b.tick_at(now).await.unwrap(), TickOutcome::Dispatched { .. }));
        assert!(b.status().await.unwrap().is_leader);
    }
}
