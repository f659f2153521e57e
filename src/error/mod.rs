//! Error types shared by the stores, the codec and the queue facade.

use thiserror::Error;

use crate::codec::DecodeError;

/// PostgreSQL SQLSTATE codes that indicate a transient condition.
///
/// - `40001` serialization_failure
/// - `40P01` deadlock_detected
/// - `55P03` lock_not_available
/// - `57P03` cannot_connect_now
const RETRYABLE_SQLSTATES: &[&str] = &["40001", "40P01", "55P03", "57P03"];

/// Errors raised by a `MessageStore` implementation.
#[derive(Debug, Error)]
pub enum StorageError {
    /// PostgreSQL operation failed
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] sqlx::Error),

    /// Redis operation failed
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// A stored record could not be mapped back to a `MessageRecord`
    #[error("Corrupt record {id}: {reason}")]
    CorruptRecord { id: String, reason: String },

    /// Backend is temporarily unavailable (connection lost, pool exhausted)
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

impl StorageError {
    /// Whether the failure is transient and the operation may succeed when retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Postgres(e) => is_retryable_sqlx(e),
            Self::Redis(e) => {
                e.is_timeout() || e.is_connection_dropped() || e.is_io_error() || e.is_connection_refusal()
            }
            Self::CorruptRecord { .. } => false,
            Self::Unavailable(_) => true,
        }
    }

    pub(crate) fn corrupt(id: impl ToString, reason: impl ToString) -> Self {
        Self::CorruptRecord {
            id: id.to_string(),
            reason: reason.to_string(),
        }
    }
}

fn is_retryable_sqlx(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => db
            .code()
            .map(|code| RETRYABLE_SQLSTATES.iter().any(|state| *state == code))
            .unwrap_or(false),
        _ => false,
    }
}

/// Errors surfaced by the queue facade, sender and receiver.
#[derive(Debug, Error)]
pub enum QueueError {
    /// A stored record could not be decoded into an envelope
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// A message could not be encoded
    #[error("Encode error: {0}")]
    Encode(#[from] serde_json::Error),

    /// Storage operation failed (send, ack, reject, listing)
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Claim path failed in a way the consumer should not absorb
    #[error("Transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: StorageError,
    },

    /// Invalid or incomplete connection configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// The envelope carries no transport message id stamp
    #[error("Envelope has no transport message id")]
    MissingMessageId,

    /// A message id could not be parsed
    #[error("Invalid message id: {0}")]
    InvalidMessageId(String),
}

impl QueueError {
    pub(crate) fn transport(source: StorageError) -> Self {
        Self::Transport {
            message: source.to_string(),
            source,
        }
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_is_retryable() {
        let err = StorageError::Unavailable("connection reset".to_string());
        assert!(err.is_retryable());
    }

    #[test]
    fn test_corrupt_record_is_not_retryable() {
        let err = StorageError::corrupt("abc", "bad headers");
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("abc"));
        assert!(err.to_string().contains("bad headers"));
    }

    #[test]
    fn test_sqlx_classification() {
        assert!(StorageError::Postgres(sqlx::Error::PoolTimedOut).is_retryable());
        assert!(!StorageError::Postgres(sqlx::Error::RowNotFound).is_retryable());
        assert!(!StorageError::Postgres(sqlx::Error::PoolClosed).is_retryable());
    }

    #[test]
    fn test_transport_error_wraps_source() {
        let err = QueueError::transport(StorageError::Unavailable("down".to_string()));
        assert!(err.to_string().contains("down"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
