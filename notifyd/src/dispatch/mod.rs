//! Dispatch engine.
//!
//! - [`ChannelWorkerPool`]: one worker group per channel, pulling from the
//!   priority queue and invoking the channel adapter
//! - [`Scheduler`]: promotes due scheduled notifications and releases due retries
//! - [`StaleSweeper`]: recovers notifications stuck in PROCESSING
//! - [`DispatchCoordinator`]: owns the lifecycle of all of the above
//! - [`NotificationService`]: submission, cancellation and queries

mod coordinator;
mod events;
mod outcome;
mod recovery;
mod scheduler;
mod service;
mod worker_pool;

pub use coordinator::{CoordinatorConfig, DispatchCoordinator};
pub use events::{EventBus, StatusChange};
pub use outcome::{FailureOutcome, apply_failure, apply_permanent_failure};
pub use recovery::{RecoveryConfig, StaleSweeper, SweepReport};
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerReport};
pub use service::{BatchReceipt, NotificationService};
pub use worker_pool::{ChannelWorker, ChannelWorkerPool, DispatchOutcome, WorkerConfig};

use std::sync::Arc;

use chrono::Utc;
use tracing::warn;

use crate::Result;
use crate::database::repositories::NotificationRepository;
use crate::domain::{Notification, NotificationStatus, RetryPolicy};
use crate::queue::{PriorityQueue, QueueRef};

/// Collaborators shared by every dispatch component.
pub struct DispatchContext {
    pub repository: Arc<dyn NotificationRepository>,
    pub queue: Arc<PriorityQueue>,
    pub events: EventBus,
    pub retry_policy: RetryPolicy,
}

impl DispatchContext {
    pub fn new(
        repository: Arc<dyn NotificationRepository>,
        queue: Arc<PriorityQueue>,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            repository,
            queue,
            events: EventBus::new(),
            retry_policy,
        }
    }

    /// Persist with compare-and-set, then publish the walked status path.
    pub async fn commit(
        &self,
        notification: &mut Notification,
        path: &[NotificationStatus],
    ) -> Result<()> {
        self.repository.persist(notification).await?;
        self.events.publish_path(notification, path);
        Ok(())
    }

    /// Push a reference to a queueable notification onto its channel queue.
    pub async fn enqueue(&self, notification: &Notification) -> Result<()> {
        self.queue
            .enqueue(
                notification.channel,
                notification.priority,
                QueueRef::new(&notification.id, notification.priority),
            )
            .await
    }

    /// Enqueue, or when the queue store is unreachable, mark the notification
    /// due now so the next scheduler pass enqueues it.
    pub async fn enqueue_or_defer(&self, notification: &mut Notification) -> Result<()> {
        let Err(err) = self.enqueue(notification).await else {
            return Ok(());
        };
        if !err.is_infrastructure() {
            return Err(err);
        }

        warn!(
            notification_id = %notification.id,
            channel = %notification.channel,
            error = %err,
            "Queue store unavailable, deferring enqueue to the scheduler"
        );
        notification.defer_until(Utc::now())?;
        self.repository.persist(notification).await
    }
}
