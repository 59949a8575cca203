//! Engine configuration.
//!
//! Loaded from an optional JSON file named by `NOTIFYD_CONFIG`, then overridden
//! by environment variables:
//!
//! | Variable | Field |
//! |---|---|
//! | `DATABASE_URL` | `database_url` |
//! | `NOTIFYD_REDIS_URL` | `queue` (switches to the Redis backend) |
//! | `NOTIFYD_MAX_RETRIES` | `retry.max_retries` |
//! | `NOTIFYD_WORKERS` | `workers.parallelism` |
//! | `NOTIFYD_POLL_INTERVAL_MS` | `workers.poll_interval_ms` |
//! | `NOTIFYD_ADAPTER_TIMEOUT_MS` | `workers.adapter_timeout_ms` |
//! | `NOTIFYD_RETENTION_DAYS` | `recovery.retention_days` |
//! | `NOTIFYD_LOG_DIR` | `log_dir` |

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::channels::{ChannelConfig, LogConfig};
use crate::dispatch::{CoordinatorConfig, RecoveryConfig, SchedulerConfig, WorkerConfig};
use crate::domain::RetryPolicy;
use crate::queue::RedisQueueConfig;
use crate::{Error, Result};

/// `database_url` value selecting the in-memory record store.
pub const MEMORY_DATABASE_URL: &str = "memory";

/// Queue store backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum QueueBackend {
    #[default]
    Memory,
    Redis(RedisQueueConfig),
}

/// Top-level configuration of the engine binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// sqlx SQLite URL, or `memory`.
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default)]
    pub queue: QueueBackend,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub workers: WorkerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default = "default_shutdown_drain_timeout_ms")]
    pub shutdown_drain_timeout_ms: u64,
    /// Adapter configs. Empty means every channel gets the dry-run log adapter.
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

fn default_database_url() -> String {
    "sqlite:notifyd.db?mode=rwc".to_string()
}

fn default_shutdown_drain_timeout_ms() -> u64 {
    CoordinatorConfig::default().shutdown_drain_timeout_ms
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            queue: QueueBackend::default(),
            retry: RetryPolicy::default(),
            workers: WorkerConfig::default(),
            scheduler: SchedulerConfig::default(),
            recovery: RecoveryConfig::default(),
            shutdown_drain_timeout_ms: default_shutdown_drain_timeout_ms(),
            channels: Vec::new(),
            log_dir: None,
        }
    }
}

impl EngineConfig {
    /// Load from `NOTIFYD_CONFIG` (if set) and apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var("NOTIFYD_CONFIG") {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            Error::config(format!("Invalid config file {}: {}", path.display(), e))
        })
    }

    /// Apply overrides from `lookup`, usually the process environment.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("DATABASE_URL") {
            self.database_url = url;
        }
        if let Some(url) = lookup("NOTIFYD_REDIS_URL") {
            let key_prefix = match &self.queue {
                QueueBackend::Redis(redis) => redis.key_prefix.clone(),
                QueueBackend::Memory => None,
            };
            self.queue = QueueBackend::Redis(RedisQueueConfig { url, key_prefix });
        }
        if let Some(v) = parse_var(&lookup, "NOTIFYD_MAX_RETRIES")? {
            self.retry.max_retries = v;
        }
        if let Some(v) = parse_var(&lookup, "NOTIFYD_WORKERS")? {
            self.workers.parallelism = v;
        }
        if let Some(v) = parse_var(&lookup, "NOTIFYD_POLL_INTERVAL_MS")? {
            self.workers.poll_interval_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "NOTIFYD_ADAPTER_TIMEOUT_MS")? {
            self.workers.adapter_timeout_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "NOTIFYD_RETENTION_DAYS")? {
            self.recovery.retention_days = v;
        }
        if let Some(dir) = lookup("NOTIFYD_LOG_DIR") {
            self.log_dir = (!dir.is_empty()).then(|| PathBuf::from(dir));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.database_url.trim().is_empty() {
            return Err(Error::config("database_url must not be empty"));
        }
        self.retry.validate()?;
        self.coordinator_config().validate()?;
        for channel in &self.channels {
            channel.validate()?;
        }
        Ok(())
    }

    pub fn uses_memory_database(&self) -> bool {
        self.database_url == MEMORY_DATABASE_URL
    }

    /// Adapter configs, defaulting to the dry-run adapter for every channel.
    pub fn channel_configs(&self) -> Vec<ChannelConfig> {
        if self.channels.is_empty() {
            vec![ChannelConfig::Log(LogConfig::default())]
        } else {
            self.channels.clone()
        }
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            workers: self.workers.clone(),
            scheduler: self.scheduler.clone(),
            recovery: self.recovery.clone(),
            shutdown_drain_timeout_ms: self.shutdown_drain_timeout_ms,
        }
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| Error::config(format!("Invalid value for {}: {}", key, e)))
        })
        .transpose()
}
