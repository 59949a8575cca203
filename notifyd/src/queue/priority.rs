//! Priority discipline over a [`QueueStore`].

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Notify;
use tracing::trace;

use super::{QueueRef, QueueStore, queue_key};
use crate::Result;
use crate::domain::{Channel, Priority};

/// Per-channel priority queue.
///
/// Dequeue scans the sub-queues from URGENT down to LOW and pops the first
/// non-empty one, so a lower priority entry is only served when every higher
/// sub-queue of the same channel is empty. Enqueue wakes one idle worker of the
/// target channel.
pub struct PriorityQueue {
    store: Arc<dyn QueueStore>,
    notifiers: HashMap<Channel, Arc<Notify>>,
}

impl PriorityQueue {
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        let notifiers = Channel::ALL
            .into_iter()
            .map(|channel| (channel, Arc::new(Notify::new())))
            .collect();
        Self { store, notifiers }
    }

    /// Append a reference to the tail of its channel/priority sub-queue.
    pub async fn enqueue(&self, channel: Channel, priority: Priority, item: QueueRef) -> Result<()> {
        self.store.push(&queue_key(channel, priority), &item).await?;
        trace!(
            notification_id = %item.notification_id,
            channel = %channel,
            priority = %priority,
            "Enqueued notification"
        );
        self.notifier(channel).notify_one();
        Ok(())
    }

    /// Next reference for `channel`, or `None` when all of its sub-queues are empty.
    pub async fn dequeue(&self, channel: Channel) -> Result<Option<QueueRef>> {
        for priority in Priority::DESCENDING {
            if let Some(item) = self.store.pop(&queue_key(channel, priority)).await? {
                return Ok(Some(item));
            }
        }
        Ok(None)
    }

    /// Total number of queued references for `channel`.
    pub async fn depth(&self, channel: Channel) -> Result<u64> {
        let mut total = 0;
        for priority in Priority::DESCENDING {
            total += self.store.len(&queue_key(channel, priority)).await?;
        }
        Ok(total)
    }

    /// Wake-up handle signalled on every enqueue to `channel`.
    pub fn notifier(&self, channel: Channel) -> Arc<Notify> {
        self.notifiers
            .get(&channel)
            .cloned()
            .unwrap_or_else(|| Arc::new(Notify::new()))
    }
}
