//! Per-channel priority queues of notification references.
//!
//! Each channel owns four FIFO lists, one per priority level, stored under
//! `queue:<channel>:<priority>` in a [`QueueStore`]. Only lightweight
//! references live in the queue; the record store stays authoritative.

mod memory;
mod priority;
mod redis_store;

pub use memory::MemoryQueueStore;
pub use priority::PriorityQueue;
pub use redis_store::{RedisQueueConfig, RedisQueueStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::domain::{Channel, Priority};

/// A queued pointer to a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueRef {
    pub notification_id: String,
    pub priority: Priority,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueRef {
    pub fn new(notification_id: impl Into<String>, priority: Priority) -> Self {
        Self {
            notification_id: notification_id.into(),
            priority,
            enqueued_at: Utc::now(),
        }
    }
}

/// Key of the sub-queue for a channel and priority level.
pub fn queue_key(channel: Channel, priority: Priority) -> String {
    format!(
        "queue:{}:{}",
        channel.key_part(),
        priority.as_str().to_ascii_lowercase()
    )
}

/// Shared list store holding the sub-queues.
///
/// `push` appends to the tail of a list and `pop` removes from its head, so
/// each key behaves as a FIFO. Implementations must be safe for concurrent use
/// by every worker of every channel.
#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn push(&self, key: &str, item: &QueueRef) -> Result<()>;

    /// Remove and return the oldest entry, or `None` when the list is empty.
    async fn pop(&self, key: &str) -> Result<Option<QueueRef>>;

    async fn len(&self, key: &str) -> Result<u64>;
}
