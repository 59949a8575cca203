//! Submission, cancellation and queries.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::DispatchContext;
use super::events::StatusChange;
use crate::database::repositories::StatusCounts;
use crate::domain::{NewNotification, Notification, NotificationStatus};
use crate::{Error, Result};

/// Result of a batch submission.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReceipt {
    pub batch_id: String,
    pub notifications: Vec<Notification>,
}

/// Entry point for callers of the engine.
pub struct NotificationService {
    ctx: Arc<DispatchContext>,
}

impl NotificationService {
    pub fn new(ctx: Arc<DispatchContext>) -> Self {
        Self { ctx }
    }

    /// Validate, persist and queue (or schedule) one notification.
    pub async fn submit(&self, request: NewNotification) -> Result<Notification> {
        let notification = Notification::create(request, Utc::now())?;
        self.accept(notification).await
    }

    /// Submit several notifications under one batch id.
    ///
    /// Every request is validated before anything is stored, so an invalid
    /// entry rejects the whole batch.
    pub async fn submit_batch(&self, requests: Vec<NewNotification>) -> Result<BatchReceipt> {
        if requests.is_empty() {
            return Err(Error::validation("Batch must contain at least one notification"));
        }

        let now = Utc::now();
        let batch_id = uuid::Uuid::new_v4().to_string();
        let pending = requests
            .into_iter()
            .enumerate()
            .map(|(index, request)| {
                Notification::create(request, now)
                    .map(|n| n.with_batch(batch_id.clone()))
                    .map_err(|e| Error::validation(format!("Batch entry {}: {}", index, e)))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut notifications = Vec::with_capacity(pending.len());
        for notification in pending {
            notifications.push(self.accept(notification).await?);
        }

        info!(
            batch_id = %batch_id,
            count = notifications.len(),
            "Accepted notification batch"
        );
        Ok(BatchReceipt {
            batch_id,
            notifications,
        })
    }

    async fn accept(&self, mut notification: Notification) -> Result<Notification> {
        self.ctx.repository.create(&notification).await?;

        if notification.status == NotificationStatus::Pending {
            self.ctx.enqueue_or_defer(&mut notification).await?;
        }

        debug!(
            notification_id = %notification.id,
            channel = %notification.channel,
            priority = %notification.priority,
            status = %notification.status,
            "Accepted notification"
        );
        Ok(notification)
    }

    /// Cancel a PENDING or SCHEDULED notification.
    ///
    /// A queued reference may remain; workers skip it on dequeue.
    pub async fn cancel(&self, id: &str) -> Result<Notification> {
        let mut notification = self.ctx.repository.load(id).await?;
        let old = notification.status;
        notification.cancel()?;
        self.ctx
            .commit(&mut notification, &[old, NotificationStatus::Cancelled])
            .await?;
        info!(notification_id = %id, "Cancelled notification");
        Ok(notification)
    }

    pub async fn get(&self, id: &str) -> Result<Notification> {
        self.ctx.repository.load(id).await
    }

    pub async fn stats(&self) -> Result<StatusCounts> {
        self.ctx.repository.count_by_status().await
    }

    pub async fn batch_stats(&self, batch_id: &str) -> Result<StatusCounts> {
        self.ctx.repository.batch_stats(batch_id).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.ctx.events.subscribe()
    }
}
