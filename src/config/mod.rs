/// Configuration management for the Conveyor engine
///
/// Every setting has a default and can be overridden through a `CONVEYOR_*`
/// environment variable, which is how container deployments configure it.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::runtime::{QueueConfig, SchedulerConfig};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub queue: QueueSettings,
    pub scheduler: SchedulerSettings,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address (e.g., "0.0.0.0")
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite URL; the file and its directory are created on first start
    pub url: String,
}

/// Dispatcher limits and job retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    pub global_concurrency: usize,
    pub per_org_concurrency: usize,
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub visibility_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    pub instance_id: String,
    pub tick_secs: u64,
    pub lease_ttl_secs: u64,
}

/// Environment variable parsed as `T`, or `default` when unset or unparsable
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!("⚠️ Ignoring invalid {}={}", key, raw);
            default
        }),
        Err(_) => default,
    }
}

impl Default for Config {
    fn default() -> Self {
        let queue = QueueConfig::default();
        let scheduler = SchedulerConfig::default();
        Self {
            server: ServerConfig {
                host: env_or("CONVEYOR_HOST", "0.0.0.0".to_string()),
                port: env_or("CONVEYOR_PORT", 3004),
            },
            database: DatabaseConfig {
                url: env_or("CONVEYOR_DATABASE_URL", "sqlite://data/conveyor.db".to_string()),
            },
            queue: QueueSettings {
                global_concurrency: env_or("CONVEYOR_GLOBAL_CONCURRENCY", queue.global_concurrency),
                per_org_concurrency: env_or("CONVEYOR_PER_ORG_CONCURRENCY", queue.per_org_concurrency),
                max_attempts: env_or("CONVEYOR_MAX_JOB_ATTEMPTS", queue.max_attempts),
                backoff_ms: env_or("CONVEYOR_JOB_BACKOFF_MS", queue.backoff_initial_ms),
                visibility_timeout_secs: env_or(
                    "CONVEYOR_VISIBILITY_TIMEOUT_SECS",
                    queue.visibility_timeout.as_secs(),
                ),
            },
            scheduler: SchedulerSettings {
                instance_id: env_or("CONVEYOR_INSTANCE_ID", scheduler.instance_id),
                tick_secs: env_or("CONVEYOR_SCHEDULER_TICK_SECS", scheduler.tick_interval.as_secs()),
                lease_ttl_secs: env_or("CONVEYOR_LEASE_TTL_SECS", scheduler.lease_ttl.as_secs()),
            },
        }
    }
}

impl Config {
    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            global_concurrency: self.queue.global_concurrency.max(1),
            per_org_concurrency: self.queue.per_org_concurrency.max(1),
            max_attempts: self.queue.max_attempts.max(1),
            backoff_initial_ms: self.queue.backoff_ms,
            visibility_timeout: Duration::from_secs(self.queue.visibility_timeout_secs),
            ..QueueConfig::default()
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            instance_id: self.scheduler.instance_id.clone(),
            tick_interval: Duration::from_secs(self.scheduler.tick_secs.max(1)),
            lease_ttl: Duration::from_secs(self.scheduler.lease_ttl_secs.max(1)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unparsable_values_fall_back() {
        assert_eq!(env_or("CONVEYOR_TEST_UNSET_VALUE", 7u32), 7);
        std::env::set_var("CONVEYOR_TEST_BAD_PORT", "not-a-port");
        assert_eq!(env_or("CONVEYOR_TEST_BAD_PORT", 3004u16), 3004);
        std::env::set_var("CONVEYOR_TEST_GOOD_PORT", "8080");
        assert_eq!(env_or("CONVEYOR_TEST_GOOD_PORT", 3004u16), 8080);
    }

    #[test]
    fn settings_convert_to_component_configs() {
        let mut config = Config::default();
        config.queue.global_concurrency = 0;
        config.queue.visibility_timeout_secs = 60;
        config.scheduler.lease_ttl_secs = 45;

        let queue = config.queue_config();
        assert_eq!(queue.global_concurrency, 1);
        assert_eq!(queue.visibility_timeout, Duration::from_secs(60));

        let scheduler = config.scheduler_config();
        assert_eq!(scheduler.lease_ttl, Duration::from_secs(45));
        assert_eq!(scheduler.instance_id, config.scheduler.instance_id);
    }
}
