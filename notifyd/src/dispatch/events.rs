//! Status-change events.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::domain::{Channel, Notification, NotificationStatus};

/// Default capacity of the event channel.
const DEFAULT_CAPACITY: usize = 1024;

/// A notification moved from one status to another.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusChange {
    pub notification_id: String,
    pub channel: Channel,
    pub old_status: NotificationStatus,
    pub new_status: NotificationStatus,
    pub timestamp: DateTime<Utc>,
}

impl StatusChange {
    pub fn new(notification: &Notification, old_status: NotificationStatus) -> Self {
        Self {
            notification_id: notification.id.clone(),
            channel: notification.channel,
            old_status,
            new_status: notification.status,
            timestamp: notification.updated_at,
        }
    }
}

/// Broadcast fan-out of [`StatusChange`] events.
///
/// Publishing never blocks and never fails; slow subscribers observe
/// `RecvError::Lagged`.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<StatusChange>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: StatusChange) {
        trace!(
            notification_id = %event.notification_id,
            from = %event.old_status,
            to = %event.new_status,
            "Status change"
        );
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    /// Publish one event per consecutive pair in `path`, e.g.
    /// `[PROCESSING, FAILED, PENDING]` yields two events.
    pub fn publish_path(&self, notification: &Notification, path: &[NotificationStatus]) {
        for pair in path.windows(2) {
            self.publish(StatusChange {
                notification_id: notification.id.clone(),
                channel: notification.channel,
                old_status: pair[0],
                new_status: pair[1],
                timestamp: notification.updated_at,
            });
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NewNotification, Recipient};

    #[tokio::test]
    async fn test_publish_path() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let n = Notification::create(
            NewNotification::new(
                "t",
                "b",
                Channel::Email,
                Recipient::Email("a@example.com".to_string()),
            ),
            Utc::now(),
        )
        .unwrap();

        bus.publish_path(
            &n,
            &[
                NotificationStatus::Processing,
                NotificationStatus::Failed,
                NotificationStatus::Pending,
            ],
        );

        let first = rx.recv().await.unwrap();
        assert_eq!(first.old_status, NotificationStatus::Processing);
        assert_eq!(first.new_status, NotificationStatus::Failed);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.new_status, NotificationStatus::Pending);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::with_capacity(0);
        let n = Notification::create(
            NewNotification::new(
                "t",
                "b",
                Channel::Push,
                Recipient::DeviceToken("tok".to_string()),
            ),
            Utc::now(),
        )
        .unwrap();
        bus.publish(StatusChange::new(&n, NotificationStatus::Scheduled));
    }
}
