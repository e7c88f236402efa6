/// SQLite queue backend
///
/// Jobs live in the shared database so several worker processes can drain the same
/// queue. A claim is a single conditional `UPDATE ... RETURNING`: it only succeeds if
/// the job is still waiting and its partition is still under the cap, so two workers
/// racing for the same row cannot both win.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePool, Row};
use std::collections::{BTreeMap, BTreeSet};

use crate::runtime::queue::backend::{next_partition, JobState, QueueBackend, QueueJob, QueueStats};
use crate::workflow::storage::{from_millis, to_millis};

#[derive(Debug, Clone)]
pub struct SqliteQueueBackend {
    pool: SqlitePool,
}

impl SqliteQueueBackend {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS queue_jobs (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                workflow_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                organization_id TEXT,
                partition_key TEXT NOT NULL,
                trigger_kind TEXT NOT NULL,
                trigger_payload JSON NOT NULL,
                attempt INTEGER NOT NULL,
                state TEXT NOT NULL,
                enqueued_at INTEGER NOT NULL,
                available_at INTEGER NOT NULL,
                visible_until INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_queue_jobs_claim ON queue_jobs (state, partition_key, available_at)",
        )
        .execute(&self.pool)
        .await?;

        tracing::debug!("🗄️ Queue schema ready");
        Ok(())
    }

    fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> Result<QueueJob> {
        let trigger_kind: String = row.get("trigger_kind");
        let trigger_payload: String = row.get("trigger_payload");
        let attempt: i64 = row.get("attempt");
        Ok(QueueJob {
            id: row.get("id"),
            run_id: row.get("run_id"),
            workflow_id: row.get("workflow_id"),
            user_id: row.get("user_id"),
            organization_id: row.get("organization_id"),
            partition: row.get("partition_key"),
            trigger_kind: trigger_kind.parse()?,
            trigger_payload: serde_json::from_str(&trigger_payload)?,
            attempt: attempt as u32,
            enqueued_at: from_millis(row.get("enqueued_at"))?,
            available_at: from_millis(row.get("available_at"))?,
        })
    }

    /// Partitions that currently have claimable work and spare capacity
    async fn eligible_partitions(&self, now: DateTime<Utc>, cap: usize) -> Result<BTreeSet<String>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT j.partition_key
            FROM queue_jobs j
            WHERE j.state = 'waiting' AND j.available_at <= ?
              AND (SELECT COUNT(*) FROM queue_jobs a
                   WHERE a.partition_key = j.partition_key AND a.state = 'active') < ?
            "#,
        )
        .bind(to_millis(now))
        .bind(cap as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(|row| row.get::<String, _>("partition_key")).collect())
    }

    async fn claim_in_partition(
        &self,
        partition: &str,
        now: DateTime<Utc>,
        cap: usize,
        visible_until: DateTime<Utc>,
    ) -> Result<Option<QueueJob>> {
        let row = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET state = 'active', visible_until = ?1
            WHERE id = (
                SELECT id FROM queue_jobs
                WHERE partition_key = ?2 AND state = 'waiting' AND available_at <= ?3
                ORDER BY available_at, enqueued_at
                LIMIT 1
            )
              AND state = 'waiting'
              AND (SELECT COUNT(*) FROM queue_jobs WHERE partition_key = ?2 AND state = 'active') < ?4
            RETURNING *
            "#,
        )
        .bind(to_millis(visible_until))
        .bind(partition)
        .bind(to_millis(now))
        .bind(cap as i64)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_job).transpose()
    }
}

#[async_trait]
impl QueueBackend for SqliteQueueBackend {
    async fn push(&self, job: QueueJob) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO queue_jobs (id, run_id, workflow_id, user_id, organization_id, partition_key,
                                    trigger_kind, trigger_payload, attempt, state, enqueued_at, available_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(&job.run_id)
        .bind(&job.workflow_id)
        .bind(&job.user_id)
        .bind(&job.organization_id)
        .bind(&job.partition)
        .bind(job.trigger_kind.as_str())
        .bind(serde_json::to_string(&job.trigger_payload)?)
        .bind(job.attempt as i64)
        .bind(JobState::Waiting.as_str())
        .bind(to_millis(job.enqueued_at))
        .bind(to_millis(job.available_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn claim_next(
        &self,
        now: DateTime<Utc>,
        per_partition_cap: usize,
        after: Option<&str>,
        visible_until: DateTime<Utc>,
    ) -> Result<Option<QueueJob>> {
        let mut candidates = self.eligible_partitions(now, per_partition_cap).await?;

        // Another worker may win the row between listing and claiming; move on to the
        // next partition in rotation when that happens
        let mut cursor = after.map(str::to_string);
        while let Some(partition) = next_partition(&candidates, cursor.as_deref()).cloned() {
            if let Some(job) = self.claim_in_partition(&partition, now, per_partition_cap, visible_until).await? {
                return Ok(Some(job));
            }
            candidates.remove(&partition);
            cursor = Some(partition);
        }
        Ok(None)
    }

    async fn complete(&self, job_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM queue_jobs WHERE id = ?")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn reschedule(&self, job_id: &str, attempt: u32, run_id: &str, available_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE queue_jobs
            SET state = 'waiting', visible_until = NULL, attempt = ?, run_id = ?, available_at = ?
            WHERE id = ?
            "#,
        )
        .bind(attempt as i64)
        .bind(run_id)
        .bind(to_millis(available_at))
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn extend_visibility(&self, job_ids: &[String], visible_until: DateTime<Utc>) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for id in job_ids {
            sqlx::query("UPDATE queue_jobs SET visible_until = ? WHERE id = ? AND state = 'active'")
                .bind(to_millis(visible_until))
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn requeue_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let result = sqlx::query(
            "UPDATE queue_jobs SET state = 'waiting', visible_until = NULL WHERE state = 'active' AND visible_until <= ?",
        )
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn stats(&self, partition: Option<&str>) -> Result<QueueStats> {
        let rows = sqlx::query(
            r#"
            SELECT partition_key, state, COUNT(*) AS jobs
            FROM queue_jobs
            WHERE ?1 IS NULL OR partition_key = ?1
            GROUP BY partition_key, state
            "#,
        )
        .bind(partition)
        .fetch_all(&self.pool)
        .await?;

        let mut counts: BTreeMap<String, (usize, usize)> = BTreeMap::new();
        for row in &rows {
            let jobs: i64 = row.get("jobs");
            let state: String = row.get("state");
            let slot = counts.entry(row.get("partition_key")).or_default();
            if state == JobState::Active.as_str() {
                slot.0 += jobs as usize;
            } else {
                slot.1 += jobs as usize;
            }
        }
        Ok(QueueStats::from_partitions(counts))
    }
}
