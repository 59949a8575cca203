//! Applying a dispatch outcome to a notification.

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::domain::{Notification, NotificationStatus, RetryPolicy};
use crate::{Error, Result};

/// What the retry policy decided for a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Back to PENDING; the scheduler re-enqueues it at `retry_at`.
    Retrying {
        retry_at: DateTime<Utc>,
        retry_count: u32,
    },
    /// Left FAILED for good.
    Exhausted { attempts: u32 },
}

/// Record a failed attempt on a PROCESSING notification.
///
/// Moves it to FAILED with `reason` as the last error, then asks the retry
/// policy whether it goes back to PENDING. Returns the decision and the status
/// path walked, starting at PROCESSING.
pub fn apply_failure(
    notification: &mut Notification,
    reason: &str,
    policy: &RetryPolicy,
) -> Result<(FailureOutcome, Vec<NotificationStatus>)> {
    notification.mark_failed(reason)?;

    if !policy.is_retry_eligible(notification.retry_count) {
        return Ok(exhausted(notification, reason));
    }

    notification.mark_for_retry(policy)?;
    let retry_at = notification.retry_at.unwrap_or(notification.updated_at);
    Ok((
        FailureOutcome::Retrying {
            retry_at,
            retry_count: notification.retry_count,
        },
        vec![
            NotificationStatus::Processing,
            NotificationStatus::Failed,
            NotificationStatus::Pending,
        ],
    ))
}

/// Record a failure that no retry can fix, leaving the notification FAILED
/// without consulting the retry policy.
pub fn apply_permanent_failure(
    notification: &mut Notification,
    err: &Error,
) -> Result<(FailureOutcome, Vec<NotificationStatus>)> {
    let reason = err.to_string();
    notification.mark_failed(&reason)?;
    Ok(exhausted(notification, &reason))
}

fn exhausted(notification: &Notification, reason: &str) -> (FailureOutcome, Vec<NotificationStatus>) {
    let attempts = notification.retry_count + 1;
    let err = Error::RetryExhausted {
        id: notification.id.clone(),
        attempts,
    };
    warn!(
        notification_id = %notification.id,
        channel = %notification.channel,
        last_error = %reason,
        "{}",
        err
    );
    (
        FailureOutcome::Exhausted { attempts },
        vec![NotificationStatus::Processing, NotificationStatus::Failed],
    )
}
