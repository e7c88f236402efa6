/// Workflow persistence
///
/// `WorkflowRepository` is the engine's view of storage: workflow definitions, run
/// rows and per-workflow cron state. `SqliteWorkflowStore` keeps definitions as JSON
/// alongside indexed lookup columns; run timestamps are epoch milliseconds so they
/// compare and sort correctly in SQL.

use crate::workflow::types::{
    RunStatus, RunUpdate, TriggerKind, WorkflowDefinition, WorkflowRun, WorkflowStatus, WorkflowSummary,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePool, Row};

/// Storage operations the engine depends on
#[async_trait]
pub trait WorkflowRepository: Send + Sync {
    async fn save_workflow(&self, workflow: &WorkflowDefinition) -> Result<()>;

    async fn load_workflow(&self, id: &str) -> Result<Option<WorkflowDefinition>>;

    async fn load_all_workflows(&self) -> Result<Vec<WorkflowDefinition>>;

    async fn list_workflows(&self) -> Result<Vec<WorkflowSummary>>;

    async fn delete_workflow(&self, id: &str) -> Result<bool>;

    /// Active workflows with a cron trigger
    async fn list_cron_workflows(&self) -> Result<Vec<WorkflowDefinition>>;

    async fn insert_run(&self, run: &WorkflowRun) -> Result<()>;

    /// Apply a partial update; returns false when the run is missing or already completed
    async fn update_run(&self, run_id: &str, update: &RunUpdate) -> Result<bool>;

    async fn get_run(&self, run_id: &str) -> Result<Option<WorkflowRun>>;

    /// Most recent runs of a workflow, newest first
    async fn list_runs(&self, workflow_id: &str, limit: u32) -> Result<Vec<WorkflowRun>>;

    async fn next_fire_at(&self, workflow_id: &str) -> Result<Option<DateTime<Utc>>>;

    /// Compare-and-set the next fire time
    ///
    /// Succeeds only if the stored value still equals `expected` (None = no row yet).
    async fn advance_next_fire(
        &self,
        workflow_id: &str,
        expected: Option<DateTime<Utc>>,
        next: DateTime<Utc>,
    ) -> Result<bool>;
}

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| anyhow::anyhow!("timestamp out of range: {}", ms))
}

/// SQLite-backed workflow store
#[derive(Debug, Clone)]
pub struct SqliteWorkflowStore {
    pool: SqlitePool,
}

impl SqliteWorkflowStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create tables and indexes; safe to call repeatedly
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflows (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                version INTEGER NOT NULL,
                organization_id TEXT,
                trigger_kind TEXT NOT NULL,
                status TEXT NOT NULL,
                definition JSON NOT NULL,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflow_runs (
                id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                organization_id TEXT,
                user_id TEXT NOT NULL,
                trigger_kind TEXT NOT NULL,
                trigger_payload JSON NOT NULL,
                status TEXT NOT NULL,
                attempt INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                started_at INTEGER,
                completed_at INTEGER,
                duration_ms INTEGER,
                output JSON,
                error TEXT,
                error_step_id TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cron_state (
                workflow_id TEXT PRIMARY KEY,
                next_fire_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_workflows_trigger ON workflows(trigger_kind, status)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_runs_workflow ON workflow_runs(workflow_id, created_at)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    fn row_to_run(row: &sqlx::sqlite::SqliteRow) -> Result<WorkflowRun> {
        let trigger_kind: String = row.get("trigger_kind");
        let status: String = row.get("status");
        let payload: String = row.get("trigger_payload");
        let output: Option<String> = row.get("output");
        let attempt: i64 = row.get("attempt");
        let started_at: Option<i64> = row.get("started_at");
        let completed_at: Option<i64> = row.get("completed_at");
        let duration_ms: Option<i64> = row.get("duration_ms");

        Ok(WorkflowRun {
            id: row.get("id"),
            workflow_id: row.get("workflow_id"),
            organization_id: row.get("organization_id"),
            user_id: row.get("user_id"),
            trigger_kind: trigger_kind.parse()?,
            trigger_payload: serde_json::from_str(&payload)?,
            status: status.parse()?,
            attempt: attempt as u32,
            created_at: from_millis(row.get("created_at"))?,
            started_at: started_at.map(from_millis).transpose()?,
            completed_at: completed_at.map(from_millis).transpose()?,
            duration_ms: duration_ms.map(|d| d as u64),
            output: output.map(|o| serde_json::from_str(&o)).transpose()?,
            error: row.get("error"),
            error_step_id: row.get("error_step_id"),
        })
    }
}

fn status_str(status: WorkflowStatus) -> &'static str {
    match status {
        WorkflowStatus::Draft => "draft",
        WorkflowStatus::Active => "active",
        WorkflowStatus::Paused => "paused",
    }
}

#[async_trait]
impl WorkflowRepository for SqliteWorkflowStore {
    async fn save_workflow(&self, workflow: &WorkflowDefinition) -> Result<()> {
        let definition_json = serde_json::to_string(workflow)?;

        sqlx::query(
            r#"
            INSERT INTO workflows (id, name, version, organization_id, trigger_kind, status, definition, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                version = excluded.version,
                organization_id = excluded.organization_id,
                trigger_kind = excluded.trigger_kind,
                status = excluded.status,
                definition = excluded.definition,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(&workflow.id)
        .bind(&workflow.name)
        .bind(workflow.version as i64)
        .bind(&workflow.organization_id)
        .bind(workflow.trigger.kind.as_str())
        .bind(status_str(workflow.status))
        .bind(&definition_json)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_workflow(&self, id: &str) -> Result<Option<WorkflowDefinition>> {
        let row = sqlx::query("SELECT definition FROM workflows WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let definition_json: String = row.get("definition");
                Ok(Some(serde_json::from_str(&definition_json)?))
            }
            None => Ok(None),
        }
    }

    async fn load_all_workflows(&self) -> Result<Vec<WorkflowDefinition>> {
        let rows = sqlx::query("SELECT definition FROM workflows").fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| {
                let definition_json: String = row.get("definition");
                Ok(serde_json::from_str(&definition_json)?)
            })
            .collect()
    }

    async fn list_workflows(&self) -> Result<Vec<WorkflowSummary>> {
        let rows = sqlx::query(
            "SELECT id, name, version, organization_id, trigger_kind, definition, updated_at FROM workflows ORDER BY updated_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut workflows = Vec::with_capacity(rows.len());
        for row in rows {
            let version: i64 = row.get("version");
            let trigger_kind: String = row.get("trigger_kind");
            let definition_json: String = row.get("definition");
            let definition: WorkflowDefinition = serde_json::from_str(&definition_json)?;
            workflows.push(WorkflowSummary {
                id: row.get("id"),
                name: row.get("name"),
                version: version as u32,
                organization_id: row.get("organization_id"),
                trigger_kind: trigger_kind.parse::<TriggerKind>()?,
                status: definition.status,
                updated_at: row.get("updated_at"),
            });
        }
        Ok(workflows)
    }

    async fn delete_workflow(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM workflows WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM cron_state WHERE workflow_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_cron_workflows(&self) -> Result<Vec<WorkflowDefinition>> {
        let rows = sqlx::query("SELECT definition FROM workflows WHERE trigger_kind = 'cron' AND status = 'active'")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                let definition_json: String = row.get("definition");
                Ok(serde_json::from_str(&definition_json)?)
            })
            .collect()
    }

    async fn insert_run(&self, run: &WorkflowRun) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO workflow_runs (
                id, workflow_id, organization_id, user_id, trigger_kind, trigger_payload, status, attempt,
                created_at, started_at, completed_at, duration_ms, output, error, error_step_id
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run.id)
        .bind(&run.workflow_id)
        .bind(&run.organization_id)
        .bind(&run.user_id)
        .bind(run.trigger_kind.as_str())
        .bind(serde_json::to_string(&run.trigger_payload)?)
        .bind(run.status.as_str())
        .bind(run.attempt as i64)
        .bind(to_millis(run.created_at))
        .bind(run.started_at.map(to_millis))
        .bind(run.completed_at.map(to_millis))
        .bind(run.duration_ms.map(|d| d as i64))
        .bind(run.output.as_ref().map(serde_json::to_string).transpose()?)
        .bind(&run.error)
        .bind(&run.error_step_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_run(&self, run_id: &str, update: &RunUpdate) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_runs SET
                status = COALESCE(?, status),
                started_at = COALESCE(?, started_at),
                completed_at = COALESCE(?, completed_at),
                duration_ms = COALESCE(?, duration_ms),
                output = COALESCE(?, output),
                error = COALESCE(?, error),
                error_step_id = COALESCE(?, error_step_id)
            WHERE id = ? AND completed_at IS NULL
            "#,
        )
        .bind(update.status.map(RunStatus::as_str))
        .bind(update.started_at.map(to_millis))
        .bind(update.completed_at.map(to_millis))
        .bind(update.duration_ms.map(|d| d as i64))
        .bind(update.output.as_ref().map(serde_json::to_string).transpose()?)
        .bind(&update.error)
        .bind(&update.error_step_id)
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<WorkflowRun>> {
        let row = sqlx::query("SELECT * FROM workflow_runs WHERE id = ?")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_run).transpose()
    }

    async fn list_runs(&self, workflow_id: &str, limit: u32) -> Result<Vec<WorkflowRun>> {
        let rows = sqlx::query("SELECT * FROM workflow_runs WHERE workflow_id = ? ORDER BY created_at DESC LIMIT ?")
            .bind(workflow_id)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_run).collect()
    }

    async fn next_fire_at(&self, workflow_id: &str) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT next_fire_at FROM cron_state WHERE workflow_id = ?")
            .bind(workflow_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| from_millis(r.get("next_fire_at"))).transpose()
    }

    async fn advance_next_fire(
        &self,
        workflow_id: &str,
        expected: Option<DateTime<Utc>>,
        next: DateTime<Utc>,
    ) -> Result<bool> {
        let result = match expected {
            Some(expected) => {
                sqlx::query("UPDATE cron_state SET next_fire_at = ? WHERE workflow_id = ? AND next_fire_at = ?")
                    .bind(to_millis(next))
                    .bind(workflow_id)
                    .bind(to_millis(expected))
                    .execute(&self.pool)
                    .await?
            }
            None => {
                sqlx::query(
                    "INSERT INTO cron_state (workflow_id, next_fire_at) VALUES (?, ?) ON CONFLICT(workflow_id) DO NOTHING",
                )
                .bind(workflow_id)
                .bind(to_millis(next))
                .execute(&self.pool)
                .await?
            }
        };
        Ok(result.rows_affected() == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::types::{Trigger, TriggerKind};
    use chrono::TimeZone;
    use serde_json::json;

    async fn store() -> SqliteWorkflowStore {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = SqliteWorkflowStore::new(pool);
        store.init_schema().await.unwrap();
        store
    }

    fn cron_workflow(id: &str, status: WorkflowStatus) -> WorkflowDefinition {
        WorkflowDefinition {
            id: id.into(),
            name: format!("Workflow {}", id),
            version: 2,
            organization_id: Some("org-1".into()),
            owner_id: Some("user-1".into()),
            steps: vec![],
            trigger: Trigger { kind: TriggerKind::Cron, config: json!({ "schedule": "every minute" }) },
            status,
            return_value: None,
        }
    }

    #[tokio::test]
    async fn saves_and_lists_cron_workflows() {
        let store = store().await;
        store.save_workflow(&cron_workflow("wf-a", WorkflowStatus::Active)).await.unwrap();
        store.save_workflow(&cron_workflow("wf-b", WorkflowStatus::Paused)).await.unwrap();

        let loaded = store.load_workflow("wf-a").await.unwrap().unwrap();
        assert_eq!(loaded.version, 2);

        let cron: Vec<String> = store.list_cron_workflows().await.unwrap().into_iter().map(|w| w.id).collect();
        assert_eq!(cron, vec!["wf-a".to_string()]);
        assert_eq!(store.list_workflows().await.unwrap().len(), 2);

        assert!(store.delete_workflow("wf-a").await.unwrap());
        assert!(store.load_workflow("wf-a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn completed_runs_reject_updates() {
        let store = store().await;
        let run = WorkflowRun::new("wf-a", None, "u1", TriggerKind::Manual, json!({"x": 1}), RunStatus::Queued, 1);
        store.insert_run(&run).await.unwrap();

        assert!(store.update_run(&run.id, &RunUpdate::running()).await.unwrap());
        let finished = RunUpdate {
            status: Some(RunStatus::Success),
            completed_at: Some(Utc::now()),
            duration_ms: Some(12),
            output: Some(json!({"ok": true})),
            ..RunUpdate::default()
        };
        assert!(store.update_run(&run.id, &finished).await.unwrap());
        assert!(!store.update_run(&run.id, &RunUpdate::failed("late")).await.unwrap());

        let stored = store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Success);
        assert_eq!(stored.output, Some(json!({"ok": true})));
        assert!(stored.error.is_none());
        assert_eq!(stored.trigger_payload, json!({"x": 1}));
        assert_eq!(store.list_runs("wf-a", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn next_fire_compare_and_set() {
        let store = store().await;
        let t1 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 1, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 2, 0).unwrap();

        assert!(store.advance_next_fire("wf", None, t1).await.unwrap());
        assert!(!store.advance_next_fire("wf", None, t2).await.unwrap());
        assert_eq!(store.next_fire_at("wf").await.unwrap(), Some(t1));

        assert!(store.advance_next_fire("wf", Some(t1), t2).await.unwrap());
        assert!(!store.advance_next_fire("wf", Some(t1), t2).await.unwrap());
        assert_eq!(store.next_fire_at("wf").await.unwrap(), Some(t2));
    }
}
