/// Dead-letter store for permanently failed operations
///
/// Items never expire on their own. They leave the store only when an operator
/// removes them or a replay succeeds.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{sqlite::SqlitePool, Row};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::EngineError;

/// A recorded failure with enough context to replay it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterItem {
    pub id: String,
    pub workflow_id: Option<String>,
    pub workflow_run_id: Option<String>,
    /// Module reference, or "workflow.execute" for whole jobs the queue gave up on
    pub operation: String,
    pub payload: Value,
    pub error: String,
    pub attempts: u32,
    pub timestamp: DateTime<Utc>,
}

/// Where a dead-lettered failure came from
#[derive(Debug, Clone, Default)]
pub struct DeadLetterContext {
    pub workflow_id: Option<String>,
    pub workflow_run_id: Option<String>,
    pub attempts: u32,
}

/// Persistence for dead-letter items
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    async fn add(&self, item: DeadLetterItem) -> Result<()>;
    async fn list(&self) -> Result<Vec<DeadLetterItem>>;
    async fn get(&self, id: &str) -> Result<Option<DeadLetterItem>>;
    async fn remove(&self, id: &str) -> Result<bool>;
    async fn record_failed_retry(&self, id: &str, error: &str) -> Result<()>;
}

/// Single-node store, also the test double
#[derive(Debug, Default)]
pub struct MemoryDeadLetterStore {
    items: RwLock<HashMap<String, DeadLetterItem>>,
}

impl MemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeadLetterStore for MemoryDeadLetterStore {
    async fn add(&self, item: DeadLetterItem) -> Result<()> {
        self.items.write().await.insert(item.id.clone(), item);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<DeadLetterItem>> {
        let mut items: Vec<_> = self.items.read().await.values().cloned().collect();
        items.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(items)
    }

    async fn get(&self, id: &str) -> Result<Option<DeadLetterItem>> {
        Ok(self.items.read().await.get(id).cloned())
    }

    async fn remove(&self, id: &str) -> Result<bool> {
        Ok(self.items.write().await.remove(id).is_some())
    }

    async fn record_failed_retry(&self, id: &str, error: &str) -> Result<()> {
        if let Some(item) = self.items.write().await.get_mut(id) {
            item.attempts += 1;
            item.error = error.to_string();
        }
        Ok(())
    }
}

/// Durable store backed by the shared SQLite database
#[derive(Debug, Clone)]
pub struct SqliteDeadLetterStore {
    pool: SqlitePool,
}

impl SqliteDeadLetterStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS dead_letters (
                id TEXT PRIMARY KEY,
                workflow_id TEXT,
                workflow_run_id TEXT,
                operation TEXT NOT NULL,
                payload TEXT NOT NULL,
                error TEXT NOT NULL,
                attempts INTEGER NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn row_to_item(row: &sqlx::sqlite::SqliteRow) -> Result<DeadLetterItem> {
        let payload: String = row.get("payload");
        let created_at: String = row.get("created_at");
        let attempts: i64 = row.get("attempts");
        Ok(DeadLetterItem {
            id: row.get("id"),
            workflow_id: row.get("workflow_id"),
            workflow_run_id: row.get("workflow_run_id"),
            operation: row.get("operation"),
            payload: serde_json::from_str(&payload)?,
            error: row.get("error"),
            attempts: attempts as u32,
            timestamp: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
        })
    }
}

#[async_trait]
impl DeadLetterStore for SqliteDeadLetterStore {
    async fn add(&self, item: DeadLetterItem) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO dead_letters (id, workflow_id, workflow_run_id, operation, payload, error, attempts, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&item.id)
        .bind(&item.workflow_id)
        .bind(&item.workflow_run_id)
        .bind(&item.operation)
        .bind(serde_json::to_string(&item.payload)?)
        .bind(&item.error)
        .bind(item.attempts as i64)
        .bind(item.timestamp.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<DeadLetterItem>> {
        let rows = sqlx::query("SELECT * FROM dead_letters ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_item).collect()
    }

    async fn get(&self, id: &str) -> Result<Option<DeadLetterItem>> {
        let row = sqlx::query("SELECT * FROM dead_letters WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_item).transpose()
    }

    async fn remove(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM dead_letters WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_failed_retry(&self, id: &str, error: &str) -> Result<()> {
        sqlx::query("UPDATE dead_letters SET attempts = attempts + 1, error = ? WHERE id = ?")
            .bind(error)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Outcome of replaying one dead-letter item
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayOutcome {
    pub id: String,
    pub success: bool,
    /// Present when the item stays in the store
    pub item: Option<DeadLetterItem>,
}

/// Operations over a dead-letter store
#[derive(Clone)]
pub struct DeadLetterQueue {
    store: Arc<dyn DeadLetterStore>,
}

impl DeadLetterQueue {
    pub fn new(store: Arc<dyn DeadLetterStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryDeadLetterStore::new()))
    }

    pub async fn add_to_dead_letter_queue(
        &self,
        operation: &str,
        payload: Value,
        error: &str,
        context: DeadLetterContext,
    ) -> Result<DeadLetterItem> {
        let item = DeadLetterItem {
            id: uuid::Uuid::new_v4().to_string(),
            workflow_id: context.workflow_id,
            workflow_run_id: context.workflow_run_id,
            operation: operation.to_string(),
            payload,
            error: error.to_string(),
            attempts: context.attempts,
            timestamp: Utc::now(),
        };
        self.store.add(item.clone()).await?;
        tracing::warn!("📮 Dead-lettered {} after {} attempts: {}", operation, item.attempts, error);
        Ok(item)
    }

    /// All items, newest first
    pub async fn get_dead_letter_queue(&self) -> Result<Vec<DeadLetterItem>> {
        self.store.list().await
    }

    pub async fn get(&self, id: &str) -> Result<Option<DeadLetterItem>> {
        self.store.get(id).await
    }

    pub async fn remove(&self, id: &str) -> Result<bool> {
        self.store.remove(id).await
    }

    /// Replay an item through `retry_fn`
    ///
    /// Success removes the item. Failure bumps `attempts`, stores the new error and
    /// keeps the item.
    pub async fn retry_dead_letter_item<F, Fut, T, E>(
        &self,
        id: &str,
        retry_fn: F,
    ) -> Result<ReplayOutcome, EngineError>
    where
        F: FnOnce(DeadLetterItem) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let item = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| EngineError::DeadLetterNotFound(id.to_string()))?;

        match retry_fn(item).await {
            Ok(_) => {
                self.store.remove(id).await?;
                tracing::info!("✅ Dead-letter item {} replayed successfully", id);
                Ok(ReplayOutcome { id: id.to_string(), success: true, item: None })
            }
            Err(e) => {
                let message = e.to_string();
                self.store.record_failed_retry(id, &message).await?;
                tracing::warn!("❌ Dead-letter replay {} failed: {}", id, message);
                Ok(ReplayOutcome {
                    id: id.to_string(),
                    success: false,
                    item: self.store.get(id).await?,
                })
            }
        }
    }
}

impl std::fmt::Debug for DeadLetterQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterQueue").finish_non_exhaustive()
    }
}
