//! In-memory notification repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::notification::{NotificationRepository, StatusCounts};
use crate::domain::{Notification, NotificationStatus};
use crate::{Error, Result};

/// DashMap-backed record store with the same compare-and-set semantics as the
/// SQLite repository. Used for tests and the dry-run mode of the binary.
#[derive(Default)]
pub struct MemoryNotificationRepository {
    records: DashMap<String, Notification>,
}

impl MemoryNotificationRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl NotificationRepository for MemoryNotificationRepository {
    async fn create(&self, notification: &Notification) -> Result<()> {
        match self.records.entry(notification.id.clone()) {
            Entry::Occupied(_) => Err(Error::validation(format!(
                "Notification {} already exists",
                notification.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(notification.clone());
                Ok(())
            }
        }
    }

    async fn load(&self, id: &str) -> Result<Notification> {
        self.records
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::not_found("Notification", id))
    }

    async fn persist(&self, notification: &mut Notification) -> Result<()> {
        let mut stored = self
            .records
            .get_mut(&notification.id)
            .ok_or_else(|| Error::not_found("Notification", &notification.id))?;

        if stored.version != notification.version {
            return Err(Error::ConcurrentModification {
                id: notification.id.clone(),
            });
        }

        notification.version += 1;
        *stored = notification.clone();
        Ok(())
    }

    async fn find_due(&self, before: DateTime<Utc>, limit: u32) -> Result<Vec<Notification>> {
        let mut due: Vec<(DateTime<Utc>, Notification)> = self
            .records
            .iter()
            .filter_map(|entry| {
                let n = entry.value();
                n.due_at()
                    .filter(|at| *at <= before)
                    .map(|at| (at, n.clone()))
            })
            .collect();

        due.sort_by(|(a_at, a), (b_at, b)| {
            b.priority
                .cmp(&a.priority)
                .then(a_at.cmp(b_at))
                .then(a.created_at.cmp(&b.created_at))
        });

        Ok(due
            .into_iter()
            .take(limit as usize)
            .map(|(_, n)| n)
            .collect())
    }

    async fn find_queueable(
        &self,
        after: Option<(DateTime<Utc>, String)>,
        limit: u32,
    ) -> Result<Vec<Notification>> {
        let mut queueable: Vec<Notification> = self
            .records
            .iter()
            .filter(|entry| entry.is_queueable())
            .filter(|entry| match &after {
                Some((created_at, id)) => {
                    (entry.created_at, entry.id.as_str()) > (*created_at, id.as_str())
                }
                None => true,
            })
            .map(|entry| entry.value().clone())
            .collect();

        queueable.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        queueable.truncate(limit as usize);
        Ok(queueable)
    }

    async fn find_stale_processing(
        &self,
        threshold: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Notification>> {
        let mut stale: Vec<Notification> = self
            .records
            .iter()
            .filter(|entry| {
                entry.status == NotificationStatus::Processing && entry.updated_at <= threshold
            })
            .map(|entry| entry.value().clone())
            .collect();

        stale.sort_by_key(|n| n.updated_at);
        stale.truncate(limit as usize);
        Ok(stale)
    }

    async fn count_by_status(&self) -> Result<StatusCounts> {
        let mut counts = StatusCounts::default();
        for entry in self.records.iter() {
            counts.add(entry.status, 1);
        }
        Ok(counts)
    }

    async fn batch_stats(&self, batch_id: &str) -> Result<StatusCounts> {
        let mut counts = StatusCounts::default();
        for entry in self.records.iter() {
            if entry.batch_id.as_deref() == Some(batch_id) {
                counts.add(entry.status, 1);
            }
        }

        if counts.total == 0 {
            return Err(Error::not_found("Batch", batch_id));
        }
        Ok(counts)
    }

    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let before = self.records.len();
        self.records.retain(|_, n| {
            let terminal = matches!(
                n.status,
                NotificationStatus::Sent | NotificationStatus::Failed | NotificationStatus::Cancelled
            );
            !(terminal && n.updated_at < cutoff)
        });
        Ok(before.saturating_sub(self.records.len()) as u64)
    }
}
