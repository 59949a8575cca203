//! Redis-backed queue store.
//!
//! Lists are written with LPUSH and consumed with RPOP, which makes every key a
//! FIFO shared by all engine instances pointing at the same Redis.

use std::future::Future;

use async_trait::async_trait;
use redis::{AsyncCommands, Client, aio::ConnectionManager};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{QueueRef, QueueStore};
use crate::{Error, Result};

/// Connection settings for the Redis queue backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedisQueueConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
    /// Prefix prepended to every queue key, e.g. `notifyd` gives `notifyd:queue:email:high`.
    #[serde(default)]
    pub key_prefix: Option<String>,
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/0".to_string()
}

impl Default for RedisQueueConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            key_prefix: None,
        }
    }
}

pub struct RedisQueueStore {
    conn: ConnectionManager,
    key_prefix: Option<String>,
}

impl RedisQueueStore {
    /// Connect to Redis. The connection manager reconnects on its own after
    /// transient failures.
    pub async fn connect(config: &RedisQueueConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str())
            .map_err(|e| Error::config(format!("Invalid Redis URL {}: {}", config.url, e)))?;
        let conn = ConnectionManager::new(client).await?;
        info!(url = %config.url, "Connected to Redis queue store");
        Ok(Self {
            conn,
            key_prefix: config.key_prefix.clone(),
        })
    }

    fn full_key(&self, key: &str) -> String {
        match &self.key_prefix {
            Some(prefix) => format!("{}:{}", prefix, key),
            None => key.to_string(),
        }
    }
}

#[async_trait]
impl QueueStore for RedisQueueStore {
    async fn push(&self, key: &str, item: &QueueRef) -> Result<()> {
        let payload = serde_json::to_string(item)?;
        let mut conn = self.conn.clone();
        let _: () = conn.lpush(self.full_key(key), payload).await?;
        Ok(())
    }

    async fn pop(&self, key: &str) -> Result<Option<QueueRef>> {
        let full_key = self.full_key(key);
        pop_decoded(key, || {
            let mut conn = self.conn.clone();
            let full_key = full_key.clone();
            async move {
                let payload: Option<String> = conn.rpop(full_key, None).await?;
                Ok(payload)
            }
        })
        .await
    }

    async fn len(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let len: u64 = conn.llen(self.full_key(key)).await?;
        Ok(len)
    }
}

/// Pop raw entries until one decodes or the list is empty.
///
/// Malformed entries are dropped and popping continues on the same key, so a
/// corrupt entry never makes a non-empty key look empty.
async fn pop_decoded<F, Fut>(key: &str, mut pop_raw: F) -> Result<Option<QueueRef>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<String>>>,
{
    while let Some(raw) = pop_raw().await? {
        match serde_json::from_str(&raw) {
            Ok(item) => return Ok(Some(item)),
            Err(e) => warn!(key = %key, error = %e, "Dropping malformed queue entry"),
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::domain::Priority;
    use std::collections::VecDeque;

    fn raw_entries(entries: &[&str]) -> VecDeque<String> {
        entries.iter().map(|e| e.to_string()).collect()
    }

    #[tokio::test]
    async fn test_malformed_entry_does_not_end_the_key() {
        let valid = serde_json::to_string(&QueueRef::new("n-2", Priority::Urgent)).unwrap();
        let mut entries = raw_entries(&["{not json", "", &valid]);

        let item = pop_decoded("queue:email:urgent", || {
            let next = entries.pop_front();
            async move { Ok(next) }
        })
        .await
        .unwrap()
        .unwrap();

        assert_eq!(item.notification_id, "n-2");
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn test_only_malformed_entries_is_empty() {
        let mut entries = raw_entries(&["garbage", "[1,2]"]);
        let item = pop_decoded("queue:sms:high", || {
            let next = entries.pop_front();
            async move { Ok(next) }
        })
        .await
        .unwrap();
        assert!(item.is_none());
    }

    #[tokio::test]
    async fn test_pop_error_propagates() {
        let result = pop_decoded("queue:push:low", || async {
            Err(Error::store_unavailable("connection refused"))
        })
        .await;
        assert!(matches!(result, Err(Error::StoreUnavailable(_))));
    }

    #[test]
    fn test_config_defaults() {
        let config: RedisQueueConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.url, "redis://127.0.0.1:6379/0");
        assert!(config.key_prefix.is_none());
    }
}
