//! Notification status state machine.

use serde::{Deserialize, Serialize};

use crate::Error;

/// Lifecycle status of a notification.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, strum::EnumIter,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationStatus {
    /// Waiting in (or about to enter) its channel queue.
    #[default]
    Pending,
    /// Handed to a dispatch worker; the adapter call is in flight.
    Processing,
    /// Delivered by the channel adapter.
    Sent,
    /// The last attempt failed. Terminal once retries are exhausted.
    Failed,
    /// Cancelled before dispatch.
    Cancelled,
    /// Waiting for its scheduled time.
    Scheduled,
}

impl NotificationStatus {
    /// Convert to database string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Sent => "SENT",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Scheduled => "SCHEDULED",
        }
    }

    /// Parse from database string representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "PROCESSING" => Some(Self::Processing),
            "SENT" => Some(Self::Sent),
            "FAILED" => Some(Self::Failed),
            "CANCELLED" => Some(Self::Cancelled),
            "SCHEDULED" => Some(Self::Scheduled),
            _ => None,
        }
    }

    /// Statuses no transition ever leaves.
    ///
    /// FAILED is not listed: it is terminal only once the retry policy says so,
    /// which the entity decides.
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Sent | Self::Cancelled)
    }

    /// Statuses a user may still cancel.
    pub fn is_cancellable(&self) -> bool {
        matches!(self, Self::Pending | Self::Scheduled)
    }

    /// Validate a state transition.
    pub fn can_transition_to(&self, target: NotificationStatus) -> bool {
        use NotificationStatus::*;

        matches!(
            (self, target),
            (Pending, Processing)
                | (Processing, Sent | Failed)
                | (Scheduled, Pending)
                | (Failed, Pending)
                | (Pending | Scheduled, Cancelled)
        )
    }

    /// Attempt to transition to a new state.
    pub fn transition_to(&self, target: NotificationStatus) -> Result<NotificationStatus, Error> {
        if self.can_transition_to(target) {
            Ok(target)
        } else {
            Err(Error::InvalidStateTransition {
                from: self.as_str().to_string(),
                to: target.as_str().to_string(),
            })
        }
    }
}

impl std::fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_status_from_str() {
        assert_eq!(NotificationStatus::parse("SENT"), Some(NotificationStatus::Sent));
        assert_eq!(
            NotificationStatus::parse("SCHEDULED"),
            Some(NotificationStatus::Scheduled)
        );
        assert_eq!(NotificationStatus::parse("sent"), None);
        for status in NotificationStatus::iter() {
            assert_eq!(NotificationStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn test_valid_transitions() {
        use NotificationStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Sent));
        assert!(Processing.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Pending));
        assert!(Scheduled.can_transition_to(Pending));
        assert!(Scheduled.can_transition_to(Cancelled));
        assert!(Pending.can_transition_to(Cancelled));
    }

    #[test]
    fn test_invalid_transitions() {
        use NotificationStatus::*;
        assert!(!Pending.can_transition_to(Sent));
        assert!(!Processing.can_transition_to(Cancelled));
        assert!(!Scheduled.can_transition_to(Processing));
        assert!(!Failed.can_transition_to(Sent));
        assert!(!Pending.can_transition_to(Pending));

        let err = Processing.transition_to(Cancelled).unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));
    }

    #[test]
    fn test_final_states_reject_everything() {
        for from in [NotificationStatus::Sent, NotificationStatus::Cancelled] {
            assert!(from.is_final());
            for to in NotificationStatus::iter() {
                assert!(!from.can_transition_to(to), "{} -> {}", from, to);
            }
        }
    }
}
