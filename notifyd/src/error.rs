//! Application-wide error types.

use std::time::Duration;

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    DatabaseSqlx(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Channel adapter failed: {0}")]
    AdapterFailure(String),

    #[error("Channel adapter timed out after {0:?}")]
    AdapterTimeout(Duration),

    #[error("Retries exhausted for notification {id} after {attempts} attempts")]
    RetryExhausted { id: String, attempts: u32 },

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Concurrent modification of notification {id}")]
    ConcurrentModification { id: String },

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn adapter(msg: impl Into<String>) -> Self {
        Self::AdapterFailure(msg.into())
    }

    pub fn store_unavailable(msg: impl Into<String>) -> Self {
        Self::StoreUnavailable(msg.into())
    }

    /// Whether the error comes from the record store or queue store being unreachable.
    ///
    /// Workers retry the infrastructure call itself on these errors instead of
    /// charging the notification a retry.
    pub fn is_infrastructure(&self) -> bool {
        match self {
            Self::StoreUnavailable(_) => true,
            Self::DatabaseSqlx(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            _ => false,
        }
    }

    /// Whether the error is a channel send outcome that feeds the retry policy.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::AdapterFailure(_) | Self::AdapterTimeout(_))
    }
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Self::StoreUnavailable(format!("redis: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infrastructure_classification() {
        assert!(Error::store_unavailable("redis down").is_infrastructure());
        assert!(Error::DatabaseSqlx(sqlx::Error::PoolTimedOut).is_infrastructure());
        assert!(!Error::DatabaseSqlx(sqlx::Error::RowNotFound).is_infrastructure());
        assert!(!Error::adapter("smtp 550").is_infrastructure());
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(Error::adapter("connection refused").is_recoverable());
        assert!(Error::AdapterTimeout(Duration::from_secs(5)).is_recoverable());
        assert!(
            !Error::InvalidStateTransition {
                from: "SENT".to_string(),
                to: "PENDING".to_string(),
            }
            .is_recoverable()
        );
    }

    #[test]
    fn test_display_messages() {
        let err = Error::RetryExhausted {
            id: "abc".to_string(),
            attempts: 3,
        };
        assert_eq!(
            err.to_string(),
            "Retries exhausted for notification abc after 3 attempts"
        );
    }
}
