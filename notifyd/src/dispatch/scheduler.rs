//! Scheduled delivery and retry release.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::DispatchContext;
use crate::domain::{Notification, NotificationStatus};
use crate::{Error, Result};

/// Scheduler settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Time between passes in milliseconds.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Maximum notifications handled per pass.
    #[serde(default = "default_batch_limit")]
    pub batch_limit: u32,
}

fn default_tick_interval_ms() -> u64 {
    1000
}

fn default_batch_limit() -> u32 {
    100
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            batch_limit: default_batch_limit(),
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tick_interval_ms == 0 || self.batch_limit == 0 {
            return Err(Error::config(
                "scheduler tick_interval_ms and batch_limit must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Counts from one scheduler pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerReport {
    /// SCHEDULED notifications moved to PENDING and queued.
    pub promoted: usize,
    /// Due retries queued again.
    pub retried: usize,
    /// Due notifications another instance got to first.
    pub skipped: usize,
}

impl SchedulerReport {
    pub fn is_empty(&self) -> bool {
        self.promoted == 0 && self.retried == 0
    }
}

/// Moves due notifications into their channel queues.
///
/// Each pass claims a due notification by persisting its new state with
/// compare-and-set before enqueueing it, so concurrent schedulers never queue
/// the same notification twice for one due time.
pub struct Scheduler {
    ctx: Arc<DispatchContext>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(ctx: Arc<DispatchContext>, config: SchedulerConfig) -> Self {
        Self { ctx, config }
    }

    /// Run a single pass over everything due at `now`.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<SchedulerReport> {
        let due = self
            .ctx
            .repository
            .find_due(now, self.config.batch_limit)
            .await?;

        let mut report = SchedulerReport::default();
        for notification in due {
            let id = notification.id.clone();
            match self.release(notification).await {
                Ok(Released::Promoted) => report.promoted += 1,
                Ok(Released::Retried) => report.retried += 1,
                Err(Error::ConcurrentModification { .. } | Error::NotFound { .. }) => {
                    debug!(notification_id = %id, "Due notification already claimed");
                    report.skipped += 1;
                }
                Err(Error::InvalidStateTransition { from, .. }) => {
                    debug!(notification_id = %id, status = %from, "Due notification changed state");
                    report.skipped += 1;
                }
                Err(err) => return Err(err),
            }
        }

        if !report.is_empty() {
            info!(
                promoted = report.promoted,
                retried = report.retried,
                skipped = report.skipped,
                "Scheduler pass queued due notifications"
            );
        }
        Ok(report)
    }

    async fn release(&self, mut notification: Notification) -> Result<Released> {
        let released = match notification.status {
            NotificationStatus::Scheduled => {
                notification.promote()?;
                self.ctx
                    .commit(
                        &mut notification,
                        &[NotificationStatus::Scheduled, NotificationStatus::Pending],
                    )
                    .await?;
                Released::Promoted
            }
            _ => {
                notification.release_retry()?;
                self.ctx.repository.persist(&mut notification).await?;
                Released::Retried
            }
        };

        self.ctx.enqueue_or_defer(&mut notification).await?;
        Ok(released)
    }

    /// Run passes every tick until cancelled.
    pub async fn run(&self, cancellation_token: CancellationToken) {
        info!(
            "Scheduler started (tick: {:?}, batch: {})",
            self.config.tick_interval(),
            self.config.batch_limit
        );

        let mut interval = tokio::time::interval(self.config.tick_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => break,
                _ = interval.tick() => {}
            }

            match self.run_once(Utc::now()).await {
                Ok(_) => {}
                Err(e) if e.is_infrastructure() => {
                    warn!("Scheduler pass skipped, store unavailable: {}", e);
                }
                Err(e) => error!("Scheduler pass failed: {}", e),
            }
        }

        info!("Scheduler stopped");
    }
}

enum Released {
    Promoted,
    Retried,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::repositories::{MemoryNotificationRepository, NotificationRepository};
    use crate::domain::{Channel, NewNotification, Priority, Recipient, RetryPolicy};
    use crate::queue::{MemoryQueueStore, PriorityQueue};
    use chrono::Duration as ChronoDuration;

    fn context() -> Arc<DispatchContext> {
        Arc::new(DispatchContext::new(
            Arc::new(MemoryNotificationRepository::new()),
            Arc::new(PriorityQueue::new(Arc::new(MemoryQueueStore::new()))),
            RetryPolicy::default(),
        ))
    }

    fn request() -> NewNotification {
        NewNotification::new(
            "Reminder",
            "Standup in 5 minutes",
            Channel::Chat,
            Recipient::ChatRoom("#team".to_string()),
        )
    }

    #[tokio::test]
    async fn test_promotes_due_scheduled() {
        let ctx = context();
        let now = Utc::now();
        let n = Notification::create(request().scheduled_at(now + ChronoDuration::seconds(30)), now)
            .unwrap();
        ctx.repository.create(&n).await.unwrap();

        let scheduler = Scheduler::new(ctx.clone(), SchedulerConfig::default());

        // Not yet due.
        assert_eq!(scheduler.run_once(now).await.unwrap(), SchedulerReport::default());
        assert_eq!(ctx.queue.depth(Channel::Chat).await.unwrap(), 0);

        let report = scheduler
            .run_once(now + ChronoDuration::seconds(31))
            .await
            .unwrap();
        assert_eq!(report.promoted, 1);

        let stored = ctx.repository.load(&n.id).await.unwrap();
        assert_eq!(stored.status, NotificationStatus::Pending);
        assert!(stored.is_queueable());
        assert_eq!(ctx.queue.depth(Channel::Chat).await.unwrap(), 1);

        // A later pass finds nothing.
        let report = scheduler
            .run_once(now + ChronoDuration::seconds(60))
            .await
            .unwrap();
        assert_eq!(report, SchedulerReport::default());
        assert_eq!(ctx.queue.depth(Channel::Chat).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_releases_due_retry_at_tail() {
        let ctx = context();
        let now = Utc::now();

        let mut retried = Notification::create(request().with_priority(Priority::High), now).unwrap();
        ctx.repository.create(&retried).await.unwrap();
        retried.mark_processing().unwrap();
        retried.mark_failed("chat api 502").unwrap();
        retried.mark_for_retry(&RetryPolicy::default()).unwrap();
        ctx.repository.persist(&mut retried).await.unwrap();

        let fresh = Notification::create(request().with_priority(Priority::High), now).unwrap();
        ctx.repository.create(&fresh).await.unwrap();
        ctx.enqueue(&fresh).await.unwrap();

        let scheduler = Scheduler::new(ctx.clone(), SchedulerConfig::default());
        let due = retried.retry_at.unwrap();
        let report = scheduler.run_once(due).await.unwrap();
        assert_eq!(report.retried, 1);

        let first = ctx.queue.dequeue(Channel::Chat).await.unwrap().unwrap();
        let second = ctx.queue.dequeue(Channel::Chat).await.unwrap().unwrap();
        assert_eq!(first.notification_id, fresh.id);
        assert_eq!(second.notification_id, retried.id);

        let stored = ctx.repository.load(&retried.id).await.unwrap();
        assert!(stored.retry_at.is_none());
        assert_eq!(stored.retry_count, 1);
    }

    #[tokio::test]
    async fn test_concurrent_schedulers_enqueue_once() {
        let ctx = context();
        let now = Utc::now();
        for _ in 0..10 {
            let n = Notification::create(request().scheduled_at(now + ChronoDuration::seconds(1)), now)
                .unwrap();
            ctx.repository.create(&n).await.unwrap();
        }

        let a = Scheduler::new(ctx.clone(), SchedulerConfig::default());
        let b = Scheduler::new(ctx.clone(), SchedulerConfig::default());
        let at = now + ChronoDuration::seconds(2);
        let (ra, rb) = tokio::join!(a.run_once(at), b.run_once(at));
        let (ra, rb) = (ra.unwrap(), rb.unwrap());

        assert_eq!(ra.promoted + rb.promoted, 10);
        assert_eq!(ctx.queue.depth(Channel::Chat).await.unwrap(), 10);
    }

    #[test]
    fn test_config_validation() {
        assert!(SchedulerConfig::default().validate().is_ok());
        let config = SchedulerConfig {
            batch_limit: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
