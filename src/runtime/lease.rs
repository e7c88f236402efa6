/// Lease-based leader election storage
///
/// A lease is a named key owned by one holder until it expires. Setting it succeeds
/// only when the key is free or expired, and only the current holder can renew or
/// release it. Callers pass `now` so every process agrees on expiry through the store
/// rather than through local timers.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::{sqlite::SqlitePool, Row};
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::workflow::storage::{from_millis, to_millis};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    pub key: String,
    pub holder_id: String,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

#[async_trait]
pub trait LockStore: Send + Sync {
    /// Take the lease if it is absent or expired
    async fn try_set_lease(&self, key: &str, holder_id: &str, ttl: Duration, now: DateTime<Utc>) -> Result<bool>;

    /// Extend a live lease held by `holder_id`
    async fn renew_lease(&self, key: &str, holder_id: &str, ttl: Duration, now: DateTime<Utc>) -> Result<bool>;

    async fn get_lease(&self, key: &str) -> Result<Option<Lease>>;

    /// Drop the lease if `holder_id` still holds it
    async fn release_lease(&self, key: &str, holder_id: &str) -> Result<bool>;
}

#[derive(Debug, Default)]
pub struct MemoryLockStore {
    leases: Mutex<HashMap<String, Lease>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn try_set_lease(&self, key: &str, holder_id: &str, ttl: Duration, now: DateTime<Utc>) -> Result<bool> {
        let mut leases = self.leases.lock().await;
        if leases.get(key).is_some_and(|lease| lease.is_live(now)) {
            return Ok(false);
        }
        leases.insert(
            key.to_string(),
            Lease {
                key: key.to_string(),
                holder_id: holder_id.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn renew_lease(&self, key: &str, holder_id: &str, ttl: Duration, now: DateTime<Utc>) -> Result<bool> {
        let mut leases = self.leases.lock().await;
        match leases.get_mut(key) {
            Some(lease) if lease.holder_id == holder_id && lease.is_live(now) => {
                lease.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_lease(&self, key: &str) -> Result<Option<Lease>> {
        Ok(self.leases.lock().await.get(key).cloned())
    }

    async fn release_lease(&self, key: &str, holder_id: &str) -> Result<bool> {
        let mut leases = self.leases.lock().await;
        if leases.get(key).is_some_and(|lease| lease.holder_id == holder_id) {
            leases.remove(key);
            return Ok(true);
        }
        Ok(false)
    }
}

/// Lease table in the shared SQLite database
#[derive(Debug, Clone)]
pub struct SqliteLockStore {
    pool: SqlitePool,
}

impl SqliteLockStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS scheduler_leases (
                key TEXT PRIMARY KEY,
                holder_id TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl LockStore for SqliteLockStore {
    async fn try_set_lease(&self, key: &str, holder_id: &str, ttl: Duration, now: DateTime<Utc>) -> Result<bool> {
        // The upsert only overwrites an expired row, so exactly one contender wins
        let result = sqlx::query(
            r#"
            INSERT INTO scheduler_leases (key, holder_id, expires_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE
                SET holder_id = excluded.holder_id, expires_at = excluded.expires_at
                WHERE scheduler_leases.expires_at <= ?4
            "#,
        )
        .bind(key)
        .bind(holder_id)
        .bind(to_millis(now + ttl))
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn renew_lease(&self, key: &str, holder_id: &str, ttl: Duration, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE scheduler_leases SET expires_at = ? WHERE key = ? AND holder_id = ? AND expires_at > ?",
        )
        .bind(to_millis(now + ttl))
        .bind(key)
        .bind(holder_id)
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_lease(&self, key: &str) -> Result<Option<Lease>> {
        let row = sqlx::query("SELECT key, holder_id, expires_at FROM scheduler_leases WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(Lease {
            key: row.get("key"),
            holder_id: row.get("holder_id"),
            expires_at: from_millis(row.get("expires_at"))?,
        }))
    }

    async fn release_lease(&self, key: &str, holder_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM scheduler_leases WHERE key = ? AND holder_id = ?")
            .bind(key)
            .bind(holder_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn sqlite_store() -> SqliteLockStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = SqliteLockStore::new(pool);
        store.init_schema().await.unwrap();
        store
    }

    async fn exercise(store: &dyn LockStore) {
        let ttl = Duration::seconds(30);
        let t0 = Utc::now();

        assert!(store.try_set_lease("leader", "a", ttl, t0).await.unwrap());
        assert!(!store.try_set_lease("leader", "b", ttl, t0 + Duration::seconds(10)).await.unwrap());
        assert!(!store.renew_lease("leader", "b", ttl, t0).await.unwrap());
        assert!(store.renew_lease("leader", "a", ttl, t0 + Duration::seconds(20)).await.unwrap());

        // Renewed at t0+20, so still held at t0+40
        assert!(!store.try_set_lease("leader", "b", ttl, t0 + Duration::seconds(40)).await.unwrap());
        assert!(store.try_set_lease("leader", "b", ttl, t0 + Duration::seconds(51)).await.unwrap());
        assert_eq!(store.get_lease("leader").await.unwrap().unwrap().holder_id, "b");

        assert!(!store.release_lease("leader", "a").await.unwrap());
        assert!(store.release_lease("leader", "b").await.unwrap());
        assert!(store.get_lease("leader").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn memory_lease_lifecycle() {
        exercise(&MemoryLockStore::new()).await;
    }

    #[tokio::test]
    async fn sqlite_lease_lifecycle() {
        exercise(&sqlite_store().await).await;
    }
}
