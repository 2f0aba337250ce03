//! Error taxonomy for queue operations.
//!
//! All errors are explicit, typed, and recoverable - no panics allowed.
//! A duplicate inbound transaction is not an error; the store reports it as
//! `IncomingOutcome::Duplicate`.

use thiserror::Error;

/// Core error type for Quay operations.
#[derive(Debug, Error)]
pub enum Error {
    // Local persistence
    #[error("storage operation '{operation}' failed: {reason}")]
    StorageFailure { operation: String, reason: String },

    // Network delivery
    #[error("connection to {endpoint} failed: {reason}")]
    ConnectionFailure { endpoint: String, reason: String },

    #[error("protocol violation: {reason}")]
    ProtocolViolation { reason: String },

    // Caller errors
    #[error("scope {scope} misused: {reason}")]
    ScopeMisuse { scope: String, reason: String },

    #[error("queue '{queue}' does not exist")]
    QueueNotFound { queue: String },

    #[error("invalid queue name '{name}': {reason}")]
    InvalidQueueName { name: String, reason: String },

    #[error("invalid address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("configuration error: {reason}")]
    Config { reason: String },

    // Ambient transaction
    #[error("transaction aborted: {reason}")]
    TransactionAborted { reason: String },

    #[error("queue manager is shut down")]
    ShutDown,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a storage failure error.
    pub fn storage(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::StorageFailure {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a connection failure error.
    pub fn connection(endpoint: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConnectionFailure {
            endpoint: endpoint.into(),
            reason: reason.into(),
        }
    }

    /// Create a protocol violation error.
    pub fn protocol_violation(reason: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            reason: reason.into(),
        }
    }

    /// Create a scope misuse error.
    pub fn scope_misuse(scope: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ScopeMisuse {
            scope: scope.into(),
            reason: reason.into(),
        }
    }

    /// Create a queue not found error.
    pub fn queue_not_found(queue: impl Into<String>) -> Self {
        Self::QueueNotFound {
            queue: queue.into(),
        }
    }

    /// Create an invalid queue name error.
    pub fn invalid_queue_name(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidQueueName {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid address error.
    pub fn invalid_address(address: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidAddress {
            address: address.into(),
            reason: reason.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Create a transaction aborted error.
    pub fn transaction_aborted(reason: impl Into<String>) -> Self {
        Self::TransactionAborted {
            reason: reason.into(),
        }
    }

    /// Whether an outbound delivery hitting this error should be retried.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailure { .. } | Self::ProtocolViolation { .. } | Self::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::storage("append", "disk full");
        assert!(err.to_string().contains("append"));
        assert!(err.to_string().contains("disk full"));

        let err = Error::connection("localhost:2200", "refused");
        assert_eq!(
            err.to_string(),
            "connection to localhost:2200 failed: refused"
        );
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::connection("a:1", "reset").is_retryable());
        assert!(Error::protocol_violation("short frame").is_retryable());
        assert!(!Error::storage("commit", "io").is_retryable());
        assert!(!Error::scope_misuse("01H", "already committed").is_retryable());
        assert!(!Error::ShutDown.is_retryable());
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.is_retryable());
    }
}
