//! Notification repository.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;

use crate::database::models::NotificationDbModel;
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::datetime_to_ms;
use crate::domain::{Notification, NotificationStatus};
use crate::{Error, Result};

/// Notification counts grouped by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub total: u64,
    pub by_status: HashMap<NotificationStatus, u64>,
}

impl StatusCounts {
    pub fn get(&self, status: NotificationStatus) -> u64 {
        self.by_status.get(&status).copied().unwrap_or(0)
    }

    pub fn add(&mut self, status: NotificationStatus, count: u64) {
        *self.by_status.entry(status).or_insert(0) += count;
        self.total += count;
    }

    fn from_rows(rows: Vec<(String, i64)>) -> Result<Self> {
        let mut counts = Self::default();
        for (status, count) in rows {
            let status = NotificationStatus::parse(&status)
                .ok_or_else(|| Error::Other(format!("Unknown notification status '{}'", status)))?;
            counts.add(status, count.max(0) as u64);
        }
        Ok(counts)
    }
}

/// Record store for notifications.
///
/// `persist` is a compare-and-set on `version`: it succeeds only when the stored
/// row still has the version the caller loaded, and bumps the version on the
/// caller's copy. A lost race returns [`Error::ConcurrentModification`].
#[async_trait]
pub trait NotificationRepository: Send + Sync {
    /// Insert a new notification.
    async fn create(&self, notification: &Notification) -> Result<()>;

    /// Load a notification by id.
    async fn load(&self, id: &str) -> Result<Notification>;

    /// Write back a modified notification (compare-and-set on version).
    async fn persist(&self, notification: &mut Notification) -> Result<()>;

    /// SCHEDULED notifications with `scheduled_time <= before` and PENDING ones
    /// with `retry_at <= before`, highest priority first, then earliest due time.
    async fn find_due(&self, before: DateTime<Utc>, limit: u32) -> Result<Vec<Notification>>;

    /// PENDING notifications waiting for a queue slot (no retry due time),
    /// oldest first. `after` is the `(created_at, id)` of the last row of the
    /// previous page.
    async fn find_queueable(
        &self,
        after: Option<(DateTime<Utc>, String)>,
        limit: u32,
    ) -> Result<Vec<Notification>>;

    /// PROCESSING notifications last updated at or before `threshold`.
    async fn find_stale_processing(
        &self,
        threshold: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Notification>>;

    /// Counts by status across all notifications.
    async fn count_by_status(&self) -> Result<StatusCounts>;

    /// Counts by status within a batch. `NotFound` for an unknown batch.
    async fn batch_stats(&self, batch_id: &str) -> Result<StatusCounts>;

    /// Delete SENT, FAILED and CANCELLED notifications last updated before `cutoff`.
    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// SQLx implementation of NotificationRepository.
pub struct SqlxNotificationRepository {
    pool: SqlitePool,
}

impl SqlxNotificationRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn exists(&self, id: &str) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM notifications WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }
}

#[async_trait]
impl NotificationRepository for SqlxNotificationRepository {
    async fn create(&self, notification: &Notification) -> Result<()> {
        let model = NotificationDbModel::from_domain(notification)?;
        retry_on_sqlite_busy("create_notification", || async {
            sqlx::query(
                r#"
                INSERT INTO notifications (
                    id, title, body, channel, priority, status, recipient_kind, recipient,
                    template_id, template_data, attachments, scheduled_time, retry_at,
                    created_at, updated_at, sent_at, retry_count, last_error, batch_id, version
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&model.id)
            .bind(&model.title)
            .bind(&model.body)
            .bind(&model.channel)
            .bind(model.priority)
            .bind(&model.status)
            .bind(&model.recipient_kind)
            .bind(&model.recipient)
            .bind(&model.template_id)
            .bind(&model.template_data)
            .bind(&model.attachments)
            .bind(model.scheduled_time)
            .bind(model.retry_at)
            .bind(model.created_at)
            .bind(model.updated_at)
            .bind(model.sent_at)
            .bind(model.retry_count)
            .bind(&model.last_error)
            .bind(&model.batch_id)
            .bind(model.version)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn load(&self, id: &str) -> Result<Notification> {
        sqlx::query_as::<_, NotificationDbModel>("SELECT * FROM notifications WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Notification", id))?
            .into_domain()
    }

    async fn persist(&self, notification: &mut Notification) -> Result<()> {
        let model = NotificationDbModel::from_domain(notification)?;
        let affected = retry_on_sqlite_busy("persist_notification", || async {
            let result = sqlx::query(
                r#"
                UPDATE notifications SET
                    priority = ?,
                    status = ?,
                    scheduled_time = ?,
                    retry_at = ?,
                    updated_at = ?,
                    sent_at = ?,
                    retry_count = ?,
                    last_error = ?,
                    version = version + 1
                WHERE id = ? AND version = ?
                "#,
            )
            .bind(model.priority)
            .bind(&model.status)
            .bind(model.scheduled_time)
            .bind(model.retry_at)
            .bind(model.updated_at)
            .bind(model.sent_at)
            .bind(model.retry_count)
            .bind(&model.last_error)
            .bind(&model.id)
            .bind(model.version)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await?;

        if affected == 0 {
            if self.exists(&notification.id).await? {
                return Err(Error::ConcurrentModification {
                    id: notification.id.clone(),
                });
            }
            return Err(Error::not_found("Notification", &notification.id));
        }

        notification.version += 1;
        Ok(())
    }

    async fn find_due(&self, before: DateTime<Utc>, limit: u32) -> Result<Vec<Notification>> {
        let before_ms = datetime_to_ms(before);
        let rows = sqlx::query_as::<_, NotificationDbModel>(
            r#"
            SELECT * FROM notifications
            WHERE (status = 'SCHEDULED' AND scheduled_time <= ?)
               OR (status = 'PENDING' AND retry_at IS NOT NULL AND retry_at <= ?)
            ORDER BY priority DESC,
                     CASE WHEN status = 'SCHEDULED' THEN scheduled_time ELSE retry_at END ASC,
                     created_at ASC
            LIMIT ?
            "#,
        )
        .bind(before_ms)
        .bind(before_ms)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(NotificationDbModel::into_domain).collect()
    }

    async fn find_queueable(
        &self,
        after: Option<(DateTime<Utc>, String)>,
        limit: u32,
    ) -> Result<Vec<Notification>> {
        let (after_ms, after_id) = match after {
            Some((created_at, id)) => (Some(datetime_to_ms(created_at)), Some(id)),
            None => (None, None),
        };
        let rows = sqlx::query_as::<_, NotificationDbModel>(
            r#"
            SELECT * FROM notifications
            WHERE status = 'PENDING' AND retry_at IS NULL
              AND (? IS NULL OR created_at > ? OR (created_at = ? AND id > ?))
            ORDER BY created_at ASC, id ASC
            LIMIT ?
            "#,
        )
        .bind(after_ms)
        .bind(after_ms)
        .bind(after_ms)
        .bind(after_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(NotificationDbModel::into_domain).collect()
    }

    async fn find_stale_processing(
        &self,
        threshold: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Notification>> {
        let rows = sqlx::query_as::<_, NotificationDbModel>(
            r#"
            SELECT * FROM notifications
            WHERE status = 'PROCESSING' AND updated_at <= ?
            ORDER BY updated_at ASC
            LIMIT ?
            "#,
        )
        .bind(datetime_to_ms(threshold))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(NotificationDbModel::into_domain).collect()
    }

    async fn count_by_status(&self) -> Result<StatusCounts> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM notifications GROUP BY status")
                .fetch_all(&self.pool)
                .await?;
        StatusCounts::from_rows(rows)
    }

    async fn batch_stats(&self, batch_id: &str) -> Result<StatusCounts> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM notifications WHERE batch_id = ? GROUP BY status",
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Err(Error::not_found("Batch", batch_id));
        }
        StatusCounts::from_rows(rows)
    }

    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let cutoff_ms = datetime_to_ms(cutoff);
        retry_on_sqlite_busy("delete_terminal_notifications", || async {
            let result = sqlx::query(
                r#"
                DELETE FROM notifications
                WHERE status IN ('SENT', 'FAILED', 'CANCELLED') AND updated_at < ?
                "#,
            )
            .bind(cutoff_ms)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await
    }
}
