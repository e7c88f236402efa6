/// Credential lookup per (organization, platform)
///
/// Values are stored already decrypted by the credential service that owns them; the
/// engine only reads them to inject into module inputs and never logs or persists them
/// anywhere else.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{sqlite::SqlitePool, Row};
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::partition_key;

#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Decrypted credential for a platform, if the organization configured one
    async fn get_decrypted_credential(
        &self,
        organization_id: Option<&str>,
        platform: &str,
    ) -> Result<Option<String>>;
}

/// In-memory store for tests and single-node setups
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    values: RwLock<HashMap<(String, String), String>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, organization_id: Option<&str>, platform: &str, value: &str) {
        self.values
            .write()
            .await
            .insert((partition_key(organization_id), platform.to_string()), value.to_string());
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get_decrypted_credential(
        &self,
        organization_id: Option<&str>,
        platform: &str,
    ) -> Result<Option<String>> {
        Ok(self
            .values
            .read()
            .await
            .get(&(partition_key(organization_id), platform.to_string()))
            .cloned())
    }
}

/// SQLite-backed credential table
#[derive(Debug, Clone)]
pub struct SqliteCredentialStore {
    pool: SqlitePool,
}

impl SqliteCredentialStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS credentials (
                organization_id TEXT NOT NULL,
                platform TEXT NOT NULL,
                value TEXT NOT NULL,
                updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (organization_id, platform)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set(&self, organization_id: Option<&str>, platform: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO credentials (organization_id, platform, value, updated_at)
            VALUES (?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(organization_id, platform) DO UPDATE SET
                value = excluded.value,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(partition_key(organization_id))
        .bind(platform)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for SqliteCredentialStore {
    async fn get_decrypted_credential(
        &self,
        organization_id: Option<&str>,
        platform: &str,
    ) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM credentials WHERE organization_id = ? AND platform = ?")
            .bind(partition_key(organization_id))
            .bind(platform)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("value")))
    }
}
