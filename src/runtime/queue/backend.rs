/// Queue storage contract and the in-memory backend
///
/// A job is either `waiting` (claimable once `available_at` has passed) or `active`
/// (claimed by a worker until `visible_until`). Claims pick partitions round-robin and
/// never push a partition past its active cap.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tokio::sync::Mutex;

use crate::tenant::organization_for_partition;
use crate::workflow::types::TriggerKind;

/// Unit of queued work: one attempt of one workflow run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueJob {
    pub id: String,
    /// Queued run row this attempt executes
    pub run_id: String,
    pub workflow_id: String,
    pub user_id: String,
    pub organization_id: Option<String>,
    /// Fairness key; "admin" when there is no organization
    pub partition: String,
    pub trigger_kind: TriggerKind,
    pub trigger_payload: Value,
    /// 1-based
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
    pub available_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Waiting,
    Active,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionStats {
    pub organization_id: Option<String>,
    pub partition: String,
    pub active: usize,
    pub waiting: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub active: usize,
    pub waiting: usize,
    pub total: usize,
    pub per_org: Vec<PartitionStats>,
}

impl QueueStats {
    /// Aggregate per-partition counts, sorted by partition key
    pub fn from_partitions(counts: BTreeMap<String, (usize, usize)>) -> Self {
        let per_org: Vec<PartitionStats> = counts
            .into_iter()
            .map(|(partition, (active, waiting))| PartitionStats {
                organization_id: organization_for_partition(&partition),
                partition,
                active,
                waiting,
            })
            .collect();
        let active: usize = per_org.iter().map(|p| p.active).sum();
        let waiting: usize = per_org.iter().map(|p| p.waiting).sum();
        Self {
            active,
            waiting,
            total: active + waiting,
            per_org,
        }
    }
}

/// Shared, durable job storage used by every worker process
#[async_trait]
pub trait QueueBackend: Send + Sync {
    async fn push(&self, job: QueueJob) -> Result<()>;

    /// Atomically claim the next job
    ///
    /// Partitions with an available job and fewer than `per_partition_cap` active jobs
    /// are visited in key order starting after `after`, wrapping around. The oldest
    /// available job of the chosen partition becomes active until `visible_until`.
    async fn claim_next(
        &self,
        now: DateTime<Utc>,
        per_partition_cap: usize,
        after: Option<&str>,
        visible_until: DateTime<Utc>,
    ) -> Result<Option<QueueJob>>;

    /// Remove a finished job
    async fn complete(&self, job_id: &str) -> Result<()>;

    /// Return an active job to `waiting` for another attempt
    async fn reschedule(&self, job_id: &str, attempt: u32, run_id: &str, available_at: DateTime<Utc>) -> Result<()>;

    async fn extend_visibility(&self, job_ids: &[String], visible_until: DateTime<Utc>) -> Result<()>;

    /// Return active jobs whose visibility expired to `waiting`; returns how many
    async fn requeue_expired(&self, now: DateTime<Utc>) -> Result<usize>;

    /// Counts for one partition, or for all of them
    async fn stats(&self, partition: Option<&str>) -> Result<QueueStats>;
}

/// Round-robin pick: first candidate after the cursor, else the first overall
pub(crate) fn next_partition<'a>(candidates: &'a BTreeSet<String>, after: Option<&str>) -> Option<&'a String> {
    match after {
        Some(cursor) => candidates
            .iter()
            .find(|p| p.as_str() > cursor)
            .or_else(|| candidates.iter().next()),
        None => candidates.iter().next(),
    }
}

#[derive(Debug, Clone)]
struct Entry {
    job: QueueJob,
    state: JobState,
    visible_until: Option<DateTime<Utc>>,
}

/// Single-process backend, also the test double
#[derive(Debug, Default)]
pub struct MemoryQueueBackend {
    jobs: Mutex<HashMap<String, Entry>>,
}

impl MemoryQueueBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueBackend for MemoryQueueBackend {
    async fn push(&self, job: QueueJob) -> Result<()> {
        self.jobs.lock().await.insert(
            job.id.clone(),
            Entry {
                job,
                state: JobState::Waiting,
                visible_until: None,
            },
        );
        Ok(())
    }

    async fn claim_next(
        &self,
        now: DateTime<Utc>,
        per_partition_cap: usize,
        after: Option<&str>,
        visible_until: DateTime<Utc>,
    ) -> Result<Option<QueueJob>> {
        let mut jobs = self.jobs.lock().await;

        let mut active: HashMap<&str, usize> = HashMap::new();
        for entry in jobs.values().filter(|e| e.state == JobState::Active) {
            *active.entry(entry.job.partition.as_str()).or_default() += 1;
        }
        let candidates: BTreeSet<String> = jobs
            .values()
            .filter(|e| e.state == JobState::Waiting && e.job.available_at <= now)
            .filter(|e| active.get(e.job.partition.as_str()).copied().unwrap_or(0) < per_partition_cap)
            .map(|e| e.job.partition.clone())
            .collect();

        let Some(partition) = next_partition(&candidates, after) else {
            return Ok(None);
        };
        let chosen = jobs
            .values()
            .filter(|e| e.state == JobState::Waiting && e.job.available_at <= now && &e.job.partition == partition)
            .min_by(|a, b| {
                (a.job.available_at, a.job.enqueued_at).cmp(&(b.job.available_at, b.job.enqueued_at))
            })
            .map(|e| e.job.id.clone());

        Ok(chosen.and_then(|id| {
            let entry = jobs.get_mut(&id)?;
            entry.state = JobState::Active;
            entry.visible_until = Some(visible_until);
            Some(entry.job.clone())
        }))
    }

    async fn complete(&self, job_id: &str) -> Result<()> {
        self.jobs.lock().await.remove(job_id);
        Ok(())
    }

    async fn reschedule(&self, job_id: &str, attempt: u32, run_id: &str, available_at: DateTime<Utc>) -> Result<()> {
        if let Some(entry) = self.jobs.lock().await.get_mut(job_id) {
            entry.state = JobState::Waiting;
            entry.visible_until = None;
            entry.job.attempt = attempt;
            entry.job.run_id = run_id.to_string();
            entry.job.available_at = available_at;
        }
        Ok(())
    }

    async fn extend_visibility(&self, job_ids: &[String], visible_until: DateTime<Utc>) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        for id in job_ids {
            if let Some(entry) = jobs.get_mut(id) {
                if entry.state == JobState::Active {
                    entry.visible_until = Some(visible_until);
                }
            }
        }
        Ok(())
    }

    async fn requeue_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut requeued = 0;
        for entry in self.jobs.lock().await.values_mut() {
            if entry.state == JobState::Active && entry.visible_until.is_some_and(|until| until <= now) {
                entry.state = JobState::Waiting;
                entry.visible_until = None;
                requeued += 1;
            }
        }
        Ok(requeued)
    }

    async fn stats(&self, partition: Option<&str>) -> Result<QueueStats> {
        let jobs = self.jobs.lock().await;
        let mut counts: BTreeMap<String, (usize, usize)> = BTreeMap::new();
        for entry in jobs.values() {
            if partition.is_some_and(|p| p != entry.job.partition) {
                continue;
            }
            let slot = counts.entry(entry.job.partition.clone()).or_default();
            match entry.state {
                JobState::Active => slot.0 += 1,
                JobState::Waiting => slot.1 += 1,
            }
        }
        Ok(QueueStats::from_partitions(counts))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    pub(crate) fn job(id: &str, partition: &str, enqueued_at: DateTime<Utc>) -> QueueJob {
        QueueJob {
            id: id.into(),
            run_id: format!("run-{}", id),
            workflow_id: "wf".into(),
            user_id: "u1".into(),
            organization_id: organization_for_partition(partition),
            partition: partition.into(),
            trigger_kind: TriggerKind::Manual,
            trigger_payload: json!({}),
            attempt: 1,
            enqueued_at,
            available_at: enqueued_at,
        }
    }

    #[tokio::test]
    async fn claims_rotate_across_partitions() {
        let backend = MemoryQueueBackend::new();
        let t0 = Utc::now() - Duration::seconds(10);
        for i in 0..3 {
            backend.push(job(&format!("a{}", i), "org-a", t0 + Duration::milliseconds(i))).await.unwrap();
            backend.push(job(&format!("b{}", i), "org-b", t0 + Duration::milliseconds(i))).await.unwrap();
        }

        let now = Utc::now();
        let until = now + Duration::seconds(60);
        let mut cursor: Option<String> = None;
        let mut order = Vec::new();
        for _ in 0..4 {
            let claimed = backend.claim_next(now, 10, cursor.as_deref(), until).await.unwrap().unwrap();
            cursor = Some(claimed.partition.clone());
            order.push(claimed.id);
        }
        assert_eq!(order, vec!["a0", "b0", "a1", "b1"]);
    }

    #[tokio::test]
    async fn partition_cap_blocks_further_claims() {
        let backend = MemoryQueueBackend::new();
        let t0 = Utc::now() - Duration::seconds(1);
        backend.push(job("a0", "org-a", t0)).await.unwrap();
        backend.push(job("a1", "org-a", t0)).await.unwrap();

        let now = Utc::now();
        let until = now + Duration::seconds(60);
        assert!(backend.claim_next(now, 1, None, until).await.unwrap().is_some());
        assert!(backend.claim_next(now, 1, None, until).await.unwrap().is_none());

        backend.complete("a0").await.unwrap();
        assert_eq!(backend.claim_next(now, 1, None, until).await.unwrap().unwrap().id, "a1");
    }

    #[tokio::test]
    async fn delayed_jobs_wait_until_available() {
        let backend = MemoryQueueBackend::new();
        let now = Utc::now();
        let mut delayed = job("a0", "org-a", now);
        delayed.available_at = now + Duration::seconds(30);
        backend.push(delayed).await.unwrap();

        let until = now + Duration::seconds(60);
        assert!(backend.claim_next(now, 5, None, until).await.unwrap().is_none());
        assert!(backend
            .claim_next(now + Duration::seconds(31), 5, None, until)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn expired_claims_return_to_waiting() {
        let backend = MemoryQueueBackend::new();
        let now = Utc::now();
        backend.push(job("a0", "org-a", now)).await.unwrap();
        backend.claim_next(now, 5, None, now + Duration::seconds(5)).await.unwrap().unwrap();

        assert_eq!(backend.requeue_expired(now + Duration::seconds(1)).await.unwrap(), 0);
        backend.extend_visibility(&["a0".to_string()], now + Duration::seconds(20)).await.unwrap();
        assert_eq!(backend.requeue_expired(now + Duration::seconds(10)).await.unwrap(), 0);
        assert_eq!(backend.requeue_expired(now + Duration::seconds(21)).await.unwrap(), 1);

        let stats = backend.stats(None).await.unwrap();
        assert_eq!((stats.active, stats.waiting), (0, 1));
    }

    #[tokio::test]
    async fn stats_are_grouped_by_partition() {
        let backend = MemoryQueueBackend::new();
        let now = Utc::now();
        backend.push(job("a0", "org-a", now)).await.unwrap();
        backend.push(job("a1", "org-a", now)).await.unwrap();
        backend.push(job("x0", "admin", now)).await.unwrap();
        backend.claim_next(now, 5, Some("admin"), now + Duration::seconds(5)).await.unwrap();

        let all = backend.stats(None).await.unwrap();
        assert_eq!(all.total, 3);
        assert_eq!(all.active, 1);
        assert_eq!(all.per_org.len(), 2);
        assert_eq!(all.per_org[0].partition, "admin");
        assert_eq!(all.per_org[0].organization_id, None);

        let org_a = backend.stats(Some("org-a")).await.unwrap();
        assert_eq!(org_a.per_org, vec![PartitionStats {
            organization_id: Some("org-a".into()),
            partition: "org-a".into(),
            active: 1,
            waiting: 1,
        }]);
    }
}
