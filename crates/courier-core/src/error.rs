//! Error types for Courier

use thiserror::Error;

/// Main error type for Courier operations
#[derive(Error, Debug)]
pub enum CourierError {
    /// Error during storage operations (redb or a foreign repository)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Encrypt/decrypt capability failed
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// The discovery round did not complete within the bounded wait
    #[error("Network timeout after {0} seconds")]
    NetworkTimeout(u64),

    /// The connection dropped while a round was in progress
    #[error("Connection lost")]
    ConnectionLost,

    /// An event correlated to no known request id
    #[error("Protocol mismatch: {0}")]
    ProtocolMismatch(String),

    /// Cooperative cancellation was requested
    #[error("Operation cancelled")]
    Cancelled,

    /// Message was not found in the repository
    #[error("Message not found: {0}")]
    MessageNotFound(i64),

    /// Group was not found in the repository
    #[error("Group not found: {0}")]
    GroupNotFound(String),

    /// Invalid operation for current state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// The serialized queue worker is no longer running
    #[error("Message queue worker stopped")]
    WorkerStopped,
}

impl CourierError {
    /// Whether this error belongs to the local storage family.
    ///
    /// Storage failures on user-invoked operations are surfaced to the caller;
    /// everything else raised inside event handlers is logged and swallowed.
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            CourierError::Storage(_)
                | CourierError::Database(_)
                | CourierError::Transaction(_)
                | CourierError::Table(_)
                | CourierError::StorageOp(_)
                | CourierError::Commit(_)
                | CourierError::Io(_)
                | CourierError::Serialization(_)
        )
    }
}

/// Result type alias using CourierError
pub type CourierResult<T> = Result<T, CourierError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CourierError::MessageNotFound(42);
        assert_eq!(format!("{}", err), "Message not found: 42");

        let err = CourierError::NetworkTimeout(60);
        assert_eq!(format!("{}", err), "Network timeout after 60 seconds");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: CourierError = io_err.into();
        assert!(matches!(err, CourierError::Io(_)));
        assert!(err.is_storage());
    }

    #[test]
    fn test_non_storage_errors() {
        assert!(!CourierError::Cancelled.is_storage());
        assert!(!CourierError::ConnectionLost.is_storage());
        assert!(!CourierError::ProtocolMismatch("abc".into()).is_storage());
    }
}
