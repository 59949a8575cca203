//! Recovery of notifications abandoned in PROCESSING, and retention cleanup.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::DispatchContext;
use super::outcome::{FailureOutcome, apply_failure};
use crate::domain::Notification;
use crate::{Error, Result};

/// Staleness sweep and retention settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// A PROCESSING notification untouched for this long is considered abandoned.
    #[serde(default = "default_stale_threshold_secs")]
    pub stale_threshold_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_batch_limit")]
    pub batch_limit: u32,
    /// Days to keep SENT, FAILED and CANCELLED notifications. 0 keeps them forever.
    #[serde(default)]
    pub retention_days: u32,
}

fn default_stale_threshold_secs() -> u64 {
    300
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_batch_limit() -> u32 {
    100
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            stale_threshold_secs: default_stale_threshold_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            batch_limit: default_batch_limit(),
            retention_days: 0,
        }
    }
}

impl RecoveryConfig {
    pub fn stale_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_threshold_secs.min(i64::MAX as u64) as i64)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.stale_threshold_secs == 0 || self.sweep_interval_secs == 0 || self.batch_limit == 0
        {
            return Err(Error::config(
                "stale_threshold_secs, sweep_interval_secs and batch_limit must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Moved back to PENDING with a retry scheduled.
    pub recovered: usize,
    /// Left FAILED because the retry policy was exhausted.
    pub exhausted: usize,
    /// Finished by their worker between the scan and the update.
    pub skipped: usize,
}

/// Finds notifications whose worker died mid-dispatch and routes them through
/// the retry policy as a failed attempt.
pub struct StaleSweeper {
    ctx: Arc<DispatchContext>,
    config: RecoveryConfig,
}

impl StaleSweeper {
    pub fn new(ctx: Arc<DispatchContext>, config: RecoveryConfig) -> Self {
        Self { ctx, config }
    }

    /// Sweep PROCESSING notifications last updated before `now - threshold`.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let threshold = now - self.config.stale_threshold();
        let stale = self
            .ctx
            .repository
            .find_stale_processing(threshold, self.config.batch_limit)
            .await?;

        let mut report = SweepReport::default();
        for notification in stale {
            let id = notification.id.clone();
            match self.recover(notification).await {
                Ok(FailureOutcome::Retrying { .. }) => report.recovered += 1,
                Ok(FailureOutcome::Exhausted { .. }) => report.exhausted += 1,
                Err(Error::ConcurrentModification { .. } | Error::NotFound { .. }) => {
                    debug!(notification_id = %id, "Stale notification finished concurrently");
                    report.skipped += 1;
                }
                Err(err) => return Err(err),
            }
        }

        if report.recovered + report.exhausted > 0 {
            warn!(
                recovered = report.recovered,
                exhausted = report.exhausted,
                "Recovered notifications abandoned in PROCESSING"
            );
        }
        Ok(report)
    }

    async fn recover(&self, mut notification: Notification) -> Result<FailureOutcome> {
        let reason = format!(
            "Dispatch abandoned: stuck in PROCESSING since {}",
            notification.updated_at.to_rfc3339()
        );
        let (outcome, path) = apply_failure(&mut notification, &reason, &self.ctx.retry_policy)?;
        self.ctx.commit(&mut notification, &path).await?;
        Ok(outcome)
    }

    /// Enqueue every PENDING notification waiting for a queue slot.
    ///
    /// Run at startup: queue references do not survive a restart of the
    /// in-memory queue store, nor a crash between a record write and its
    /// enqueue. References that did survive become duplicates, which workers
    /// drop because a notification can only be claimed once.
    pub async fn requeue_pending(&self) -> Result<usize> {
        let mut requeued = 0;
        let mut after = None;

        loop {
            let page = self
                .ctx
                .repository
                .find_queueable(after.take(), self.config.batch_limit)
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            after = Some((last.created_at, last.id.clone()));
            let full_page = page.len() as u32 >= self.config.batch_limit;

            for mut notification in page {
                match self.ctx.enqueue_or_defer(&mut notification).await {
                    Ok(()) => requeued += 1,
                    Err(Error::ConcurrentModification { .. } | Error::NotFound { .. }) => {
                        debug!(
                            notification_id = %notification.id,
                            "Pending notification changed during requeue"
                        );
                    }
                    Err(err) => return Err(err),
                }
            }

            if !full_page {
                break;
            }
        }

        if requeued > 0 {
            info!(count = requeued, "Requeued pending notifications");
        }
        Ok(requeued)
    }

    /// Delete terminal notifications older than the retention period.
    ///
    /// Returns the number of deleted notifications; does nothing when
    /// retention is disabled.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        if self.config.retention_days == 0 {
            return Ok(0);
        }
        let cutoff = now - chrono::Duration::days(i64::from(self.config.retention_days));
        let deleted = self.ctx.repository.delete_terminal_before(cutoff).await?;
        if deleted > 0 {
            info!(
                "Deleted {} terminal notifications older than {} days",
                deleted, self.config.retention_days
            );
        }
        Ok(deleted)
    }

    /// Sweep and purge every interval until cancelled.
    pub async fn run(&self, cancellation_token: CancellationToken) {
        info!(
            "Staleness sweeper started (threshold: {}s, interval: {:?})",
            self.config.stale_threshold_secs,
            self.config.sweep_interval()
        );

        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => break,
                _ = tokio::time::sleep(self.config.sweep_interval()) => {}
            }

            let now = Utc::now();
            if let Err(e) = self.run_once(now).await {
                error!("Staleness sweep failed: {}", e);
            }
            if let Err(e) = self.purge_expired(now).await {
                error!("Retention cleanup failed: {}", e);
            }
        }

        info!("Staleness sweeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::repositories::{MemoryNotificationRepository, NotificationRepository};
    use crate::domain::{Channel, NewNotification, NotificationStatus, Recipient, RetryPolicy};
    use crate::queue::{MemoryQueueStore, PriorityQueue};

    fn context(policy: RetryPolicy) -> Arc<DispatchContext> {
        Arc::new(DispatchContext::new(
            Arc::new(MemoryNotificationRepository::new()),
            Arc::new(PriorityQueue::new(Arc::new(MemoryQueueStore::new()))),
            policy,
        ))
    }

    async fn processing(ctx: &DispatchContext, retry_count: u32) -> Notification {
        let mut n = Notification::create(
            NewNotification::new(
                "Alert",
                "Disk almost full",
                Channel::Sms,
                Recipient::Phone("+15551234567".to_string()),
            ),
            Utc::now(),
        )
        .unwrap();
        n.retry_count = retry_count;
        ctx.repository.create(&n).await.unwrap();
        n.mark_processing().unwrap();
        ctx.repository.persist(&mut n).await.unwrap();
        n
    }

    #[tokio::test]
    async fn test_recovers_stale_processing() {
        let ctx = context(RetryPolicy::default());
        let n = processing(&ctx, 0).await;
        let sweeper = StaleSweeper::new(ctx.clone(), RecoveryConfig::default());

        // Fresh PROCESSING entries are left alone.
        assert_eq!(sweeper.run_once(Utc::now()).await.unwrap(), SweepReport::default());

        let later = Utc::now() + chrono::Duration::seconds(301);
        let report = sweeper.run_once(later).await.unwrap();
        assert_eq!(report.recovered, 1);

        let stored = ctx.repository.load(&n.id).await.unwrap();
        assert_eq!(stored.status, NotificationStatus::Pending);
        assert_eq!(stored.retry_count, 1);
        assert!(stored.retry_at.is_some());
        assert!(stored.last_error.unwrap().starts_with("Dispatch abandoned"));
    }

    #[tokio::test]
    async fn test_exhausted_stale_stays_failed() {
        let ctx = context(RetryPolicy::with_max_retries(3));
        let n = processing(&ctx, 3).await;
        let sweeper = StaleSweeper::new(ctx.clone(), RecoveryConfig::default());

        let report = sweeper
            .run_once(Utc::now() + chrono::Duration::minutes(10))
            .await
            .unwrap();
        assert_eq!(report.exhausted, 1);

        let stored = ctx.repository.load(&n.id).await.unwrap();
        assert_eq!(stored.status, NotificationStatus::Failed);
        assert_eq!(stored.retry_count, 3);
    }

    #[tokio::test]
    async fn test_requeue_pending_pages_through_every_record() {
        let ctx = context(RetryPolicy::default());
        for _ in 0..5 {
            let n = Notification::create(
                NewNotification::new(
                    "Alert",
                    "Queue me",
                    Channel::Sms,
                    Recipient::Phone("+15551234567".to_string()),
                ),
                Utc::now(),
            )
            .unwrap();
            ctx.repository.create(&n).await.unwrap();
        }
        // Waiting for its retry time, so the scheduler owns it.
        let mut waiting = processing(&ctx, 0).await;
        apply_failure(&mut waiting, "gateway 502", &ctx.retry_policy).unwrap();
        ctx.repository.persist(&mut waiting).await.unwrap();

        let config = RecoveryConfig {
            batch_limit: 2,
            ..Default::default()
        };
        let sweeper = StaleSweeper::new(ctx.clone(), config);
        assert_eq!(sweeper.requeue_pending().await.unwrap(), 5);
        assert_eq!(ctx.queue.depth(Channel::Sms).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_purge_respects_retention() {
        let ctx = context(RetryPolicy::default());
        let mut n = processing(&ctx, 0).await;
        n.mark_sent().unwrap();
        ctx.repository.persist(&mut n).await.unwrap();

        let keep_forever = StaleSweeper::new(ctx.clone(), RecoveryConfig::default());
        assert_eq!(
            keep_forever
                .purge_expired(Utc::now() + chrono::Duration::days(365))
                .await
                .unwrap(),
            0
        );

        let config = RecoveryConfig {
            retention_days: 7,
            ..Default::default()
        };
        let sweeper = StaleSweeper::new(ctx.clone(), config);
        assert_eq!(sweeper.purge_expired(Utc::now()).await.unwrap(), 0);
        assert_eq!(
            sweeper
                .purge_expired(Utc::now() + chrono::Duration::days(8))
                .await
                .unwrap(),
            1
        );
        assert!(ctx.repository.load(&n.id).await.is_err());
    }
}
