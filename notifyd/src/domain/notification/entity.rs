//! Notification entity.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::NotificationStatus;
use crate::domain::{Channel, Priority, Recipient, RetryPolicy};
use crate::{Error, Result};

/// Maximum title length in characters.
pub const MAX_TITLE_LEN: usize = 255;

/// Maximum body length in characters.
pub const MAX_BODY_LEN: usize = 5000;

/// A notification request as submitted by a caller, before it has an identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewNotification {
    pub title: String,
    pub body: String,
    pub channel: Channel,
    #[serde(default)]
    pub priority: Priority,
    pub recipient: Recipient,
    #[serde(default)]
    pub template_id: Option<String>,
    #[serde(default)]
    pub template_data: BTreeMap<String, String>,
    #[serde(default)]
    pub attachments: Vec<String>,
    #[serde(default)]
    pub scheduled_time: Option<DateTime<Utc>>,
}

impl NewNotification {
    pub fn new(
        title: impl Into<String>,
        body: impl Into<String>,
        channel: Channel,
        recipient: Recipient,
    ) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            channel,
            priority: Priority::default(),
            recipient,
            template_id: None,
            template_data: BTreeMap::new(),
            attachments: Vec::new(),
            scheduled_time: None,
        }
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Delay delivery until `at`.
    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_time = Some(at);
        self
    }

    pub fn with_template(
        mut self,
        template_id: impl Into<String>,
        data: BTreeMap<String, String>,
    ) -> Self {
        self.template_id = Some(template_id.into());
        self.template_data = data;
        self
    }

    pub fn with_attachment(mut self, reference: impl Into<String>) -> Self {
        self.attachments.push(reference.into());
        self
    }

    /// Validate the request as of `now`.
    pub fn validate(&self, now: DateTime<Utc>) -> Result<()> {
        let title_len = self.title.trim().chars().count();
        if title_len == 0 {
            return Err(Error::validation("Title is required"));
        }
        if self.title.chars().count() > MAX_TITLE_LEN {
            return Err(Error::validation(format!(
                "Title must not exceed {} characters",
                MAX_TITLE_LEN
            )));
        }

        if self.body.trim().is_empty() {
            return Err(Error::validation("Message body is required"));
        }
        if self.body.chars().count() > MAX_BODY_LEN {
            return Err(Error::validation(format!(
                "Message body must not exceed {} characters",
                MAX_BODY_LEN
            )));
        }

        self.recipient.validate_for(self.channel)?;

        if let Some(at) = self.scheduled_time
            && at <= now
        {
            return Err(Error::validation(format!(
                "Scheduled time {} is not in the future",
                at.to_rfc3339()
            )));
        }

        Ok(())
    }
}

/// Notification entity: one message to one recipient on one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub title: String,
    pub body: String,
    pub channel: Channel,
    pub priority: Priority,
    pub status: NotificationStatus,
    pub recipient: Recipient,
    pub template_id: Option<String>,
    pub template_data: BTreeMap<String, String>,
    pub attachments: Vec<String>,
    pub scheduled_time: Option<DateTime<Utc>>,
    /// When a pending retry becomes due. Set only between a retry re-queue and
    /// the scheduler pass that enqueues it.
    pub retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub batch_id: Option<String>,
    /// Row version for compare-and-set persistence.
    pub version: i64,
}

impl Notification {
    /// Build a notification from a validated request.
    ///
    /// Starts SCHEDULED when a scheduled time is given, otherwise PENDING.
    pub fn create(request: NewNotification, now: DateTime<Utc>) -> Result<Self> {
        request.validate(now)?;

        let status = if request.scheduled_time.is_some() {
            NotificationStatus::Scheduled
        } else {
            NotificationStatus::Pending
        };

        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: request.title,
            body: request.body,
            channel: request.channel,
            priority: request.priority,
            status,
            recipient: request.recipient,
            template_id: request.template_id,
            template_data: request.template_data,
            attachments: request.attachments,
            scheduled_time: request.scheduled_time,
            retry_at: None,
            created_at: now,
            updated_at: now,
            sent_at: None,
            retry_count: 0,
            last_error: None,
            batch_id: None,
            version: 0,
        })
    }

    /// Attach the notification to a batch.
    pub fn with_batch(mut self, batch_id: impl Into<String>) -> Self {
        self.batch_id = Some(batch_id.into());
        self
    }

    fn transition(&mut self, target: NotificationStatus) -> Result<NotificationStatus> {
        let old = self.status;
        self.status = self.status.transition_to(target)?;
        self.updated_at = Utc::now();
        Ok(old)
    }

    /// PENDING -> PROCESSING.
    pub fn mark_processing(&mut self) -> Result<()> {
        self.transition(NotificationStatus::Processing)?;
        Ok(())
    }

    /// PROCESSING -> SENT.
    pub fn mark_sent(&mut self) -> Result<()> {
        self.transition(NotificationStatus::Sent)?;
        self.sent_at = Some(self.updated_at);
        self.last_error = None;
        Ok(())
    }

    /// PROCESSING -> FAILED, recording the reason.
    pub fn mark_failed(&mut self, reason: impl Into<String>) -> Result<()> {
        self.transition(NotificationStatus::Failed)?;
        self.last_error = Some(reason.into());
        Ok(())
    }

    /// FAILED -> PENDING for another attempt.
    ///
    /// Increments the retry count and records when the retry becomes due. A
    /// FAILED notification the policy no longer allows to retry is terminal, so
    /// this returns [`Error::InvalidStateTransition`] and leaves it FAILED.
    pub fn mark_for_retry(&mut self, policy: &RetryPolicy) -> Result<()> {
        if self.status != NotificationStatus::Failed
            || !policy.is_retry_eligible(self.retry_count)
        {
            return Err(Error::InvalidStateTransition {
                from: self.status.as_str().to_string(),
                to: NotificationStatus::Pending.as_str().to_string(),
            });
        }

        let delay_ms = policy.next_delay(self.retry_count).as_millis() as i64;
        self.transition(NotificationStatus::Pending)?;
        self.retry_count += 1;
        self.retry_at = Some(self.updated_at + chrono::Duration::milliseconds(delay_ms));
        Ok(())
    }

    /// SCHEDULED -> PENDING.
    pub fn promote(&mut self) -> Result<()> {
        if self.status != NotificationStatus::Scheduled {
            return Err(Error::InvalidStateTransition {
                from: self.status.as_str().to_string(),
                to: NotificationStatus::Pending.as_str().to_string(),
            });
        }
        self.transition(NotificationStatus::Pending)?;
        Ok(())
    }

    /// Clear the retry due time of a PENDING notification so it can be queued.
    pub fn release_retry(&mut self) -> Result<()> {
        if self.status != NotificationStatus::Pending || self.retry_at.is_none() {
            return Err(Error::InvalidStateTransition {
                from: self.status.as_str().to_string(),
                to: NotificationStatus::Pending.as_str().to_string(),
            });
        }
        self.retry_at = None;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Hold a PENDING notification back until `at`; the scheduler enqueues it then.
    pub fn defer_until(&mut self, at: DateTime<Utc>) -> Result<()> {
        if self.status != NotificationStatus::Pending {
            return Err(Error::InvalidStateTransition {
                from: self.status.as_str().to_string(),
                to: NotificationStatus::Pending.as_str().to_string(),
            });
        }
        self.retry_at = Some(at);
        self.updated_at = Utc::now();
        Ok(())
    }

    /// PENDING or SCHEDULED -> CANCELLED.
    pub fn cancel(&mut self) -> Result<()> {
        if !self.status.is_cancellable() {
            return Err(Error::InvalidStateTransition {
                from: self.status.as_str().to_string(),
                to: NotificationStatus::Cancelled.as_str().to_string(),
            });
        }
        self.transition(NotificationStatus::Cancelled)?;
        self.retry_at = None;
        Ok(())
    }

    /// Whether the notification is waiting in (or for) its channel queue.
    pub fn is_queueable(&self) -> bool {
        self.status == NotificationStatus::Pending && self.retry_at.is_none()
    }

    /// Whether no further transition will ever be applied under `policy`.
    pub fn is_terminal(&self, policy: &RetryPolicy) -> bool {
        match self.status {
            NotificationStatus::Failed => !policy.is_retry_eligible(self.retry_count),
            status => status.is_final(),
        }
    }

    /// The time at which the scheduler should pick this notification up.
    pub fn due_at(&self) -> Option<DateTime<Utc>> {
        match self.status {
            NotificationStatus::Scheduled => self.scheduled_time,
            NotificationStatus::Pending => self.retry_at,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use proptest::prelude::*;

    fn email_request() -> NewNotification {
        NewNotification::new(
            "Deploy finished",
            "Build 42 is live",
            Channel::Email,
            Recipient::Email("ops@example.com".to_string()),
        )
    }

    fn pending() -> Notification {
        Notification::create(email_request(), Utc::now()).unwrap()
    }

    #[test]
    fn test_create_initial_status() {
        let now = Utc::now();
        let n = Notification::create(email_request(), now).unwrap();
        assert_eq!(n.status, NotificationStatus::Pending);
        assert_eq!(n.retry_count, 0);
        assert_eq!(n.version, 0);
        assert!(n.sent_at.is_none());

        let scheduled =
            Notification::create(email_request().scheduled_at(now + Duration::hours(1)), now)
                .unwrap();
        assert_eq!(scheduled.status, NotificationStatus::Scheduled);
        assert_eq!(scheduled.due_at(), scheduled.scheduled_time);
    }

    #[test]
    fn test_create_rejects_past_schedule() {
        let now = Utc::now();
        let err = Notification::create(email_request().scheduled_at(now - Duration::seconds(1)), now)
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_validation_limits() {
        let now = Utc::now();
        let mut request = email_request();
        request.title = "x".repeat(MAX_TITLE_LEN);
        assert!(request.validate(now).is_ok());
        request.title.push('x');
        assert!(request.validate(now).is_err());

        let mut request = email_request();
        request.body = "   ".to_string();
        assert!(request.validate(now).is_err());

        let mut request = email_request();
        request.body = "y".repeat(MAX_BODY_LEN + 1);
        assert!(request.validate(now).is_err());

        let mut request = email_request();
        request.recipient = Recipient::Phone("+15550000000".to_string());
        assert!(request.validate(now).is_err());
    }

    #[test]
    fn test_happy_path() {
        let mut n = pending();
        n.mark_processing().unwrap();
        n.mark_sent().unwrap();
        assert_eq!(n.status, NotificationStatus::Sent);
        assert!(n.sent_at.is_some());
        assert!(n.is_terminal(&RetryPolicy::default()));
    }

    #[test]
    fn test_failure_and_retry() {
        let policy = RetryPolicy::default();
        let mut n = pending();
        n.mark_processing().unwrap();
        n.mark_failed("smtp 451").unwrap();
        assert_eq!(n.last_error.as_deref(), Some("smtp 451"));
        assert!(!n.is_terminal(&policy));

        n.mark_for_retry(&policy).unwrap();
        assert_eq!(n.status, NotificationStatus::Pending);
        assert_eq!(n.retry_count, 1);
        let retry_at = n.retry_at.unwrap();
        assert_eq!(retry_at - n.updated_at, Duration::milliseconds(1000));
        assert!(!n.is_queueable());

        n.release_retry().unwrap();
        assert!(n.is_queueable());
        assert!(n.release_retry().is_err());
    }

    #[test]
    fn test_defer_until() {
        let mut n = pending();
        let at = Utc::now();
        n.defer_until(at).unwrap();
        assert_eq!(n.due_at(), Some(at));
        assert!(!n.is_queueable());

        n.release_retry().unwrap();
        n.mark_processing().unwrap();
        assert!(n.defer_until(at).is_err());
    }

    #[test]
    fn test_retry_exhausted_stays_failed() {
        let policy = RetryPolicy::with_max_retries(3);
        let mut n = pending();
        n.retry_count = 3;
        n.mark_processing().unwrap();
        n.mark_failed("gateway 503").unwrap();

        let err = n.mark_for_retry(&policy).unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));
        assert_eq!(n.status, NotificationStatus::Failed);
        assert_eq!(n.retry_count, 3);
        assert!(n.is_terminal(&policy));

        // Every other transition out of an exhausted FAILED is rejected too.
        assert!(matches!(n.mark_processing(), Err(Error::InvalidStateTransition { .. })));
        assert!(matches!(n.mark_sent(), Err(Error::InvalidStateTransition { .. })));
        assert!(matches!(n.cancel(), Err(Error::InvalidStateTransition { .. })));
        assert!(matches!(n.promote(), Err(Error::InvalidStateTransition { .. })));
    }

    #[test]
    fn test_retry_requires_failed() {
        let mut n = pending();
        assert!(matches!(
            n.mark_for_retry(&RetryPolicy::default()),
            Err(Error::InvalidStateTransition { .. })
        ));
        assert_eq!(n.retry_count, 0);
    }

    #[test]
    fn test_cancel() {
        let mut n = pending();
        n.cancel().unwrap();
        assert_eq!(n.status, NotificationStatus::Cancelled);
        assert!(n.cancel().is_err());

        let mut n = pending();
        n.mark_processing().unwrap();
        assert!(n.cancel().is_err());
        assert_eq!(n.status, NotificationStatus::Processing);
    }

    #[test]
    fn test_promote() {
        let now = Utc::now();
        let mut n =
            Notification::create(email_request().scheduled_at(now + Duration::minutes(5)), now)
                .unwrap();
        n.promote().unwrap();
        assert_eq!(n.status, NotificationStatus::Pending);
        assert!(n.updated_at >= now);
        assert!(n.promote().is_err());
    }

    #[derive(Debug, Clone, Copy)]
    enum Op {
        Processing,
        Sent,
        Failed,
        Retry,
        Promote,
        Cancel,
    }

    fn apply(n: &mut Notification, op: Op, policy: &RetryPolicy) -> Result<()> {
        match op {
            Op::Processing => n.mark_processing(),
            Op::Sent => n.mark_sent(),
            Op::Failed => n.mark_failed("boom"),
            Op::Retry => n.mark_for_retry(policy),
            Op::Promote => n.promote(),
            Op::Cancel => n.cancel(),
        }
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Processing),
            Just(Op::Sent),
            Just(Op::Failed),
            Just(Op::Retry),
            Just(Op::Promote),
            Just(Op::Cancel),
        ]
    }

    proptest! {
        #[test]
        fn prop_lifecycle_invariants(
            scheduled in any::<bool>(),
            max_retries in 0u32..4,
            ops in prop::collection::vec(op_strategy(), 0..40),
        ) {
            let now = Utc::now();
            let mut request = email_request();
            if scheduled {
                request = request.scheduled_at(now + Duration::hours(1));
            }
            let mut n = Notification::create(request, now).unwrap();
            let policy = RetryPolicy::with_max_retries(max_retries);

            for op in ops {
                let was_terminal = n.is_terminal(&policy);
                let before = n.clone();
                let previous_retries = n.retry_count;
                let result = apply(&mut n, op, &policy);

                if was_terminal {
                    prop_assert!(matches!(result, Err(Error::InvalidStateTransition { .. })), "expected InvalidStateTransition");
                    prop_assert_eq!(n.status, before.status);
                }
                if result.is_err() {
                    prop_assert_eq!(&n, &before);
                }
                prop_assert_eq!(n.sent_at.is_some(), n.status == NotificationStatus::Sent);
                prop_assert!(n.retry_count >= previous_retries);
                prop_assert!(n.retry_count <= max_retries);
            }
        }
    }
}
