//! Unified error handling for the backpack-replicator crate
//!
//! This module provides a unified error type that consolidates all domain-specific
//! errors into a single `Error` enum, while maintaining the ability to use
//! domain-specific errors when needed.
//!
//! # Architecture
//!
//! - [`BackpackErrorTrait`] - Common interface implemented by all error types
//! - [`ErrorCategory`] - Classification of errors for handling strategies
//! - [`Error`] - Unified error enum wrapping all domain-specific errors
//!
//! # Usage
//!
//! ```rust,ignore
//! use backpack_replicator::error::{BackpackErrorTrait, Error};
//!
//! fn handle_error(err: Error) {
//!     if err.is_recoverable() {
//!         tracing::warn!(category = ?err.category(), "Retrying: {err}");
//!     } else {
//!         tracing::error!("Fatal error: {err}");
//!     }
//! }
//! ```

use thiserror::Error;

// Re-export domain-specific errors for convenience
pub use crate::config::ConfigError;
pub use crate::coordination::{CoordinationError, WatchError};
pub use crate::models::NodeMapError;
pub use crate::queue::QueueError;
pub use crate::replicator::ReplicatorError;
pub use crate::supervisor::SupervisorError;
pub use crate::transfer::TransferError;

/// Common trait for all backpack error types
pub trait BackpackErrorTrait: std::error::Error {
    /// Check if this error is recoverable (can be retried)
    fn is_recoverable(&self) -> bool;

    /// Get the error category for handling strategies
    fn category(&self) -> ErrorCategory;
}

/// Classification of errors for handling strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Coordination session and config reads
    Coordination,
    /// Work queue transport and leases
    Queue,
    /// Content transfer between nodes
    Transfer,
    /// Job validation against the node map
    Validation,
    /// Malformed documents and payloads
    Parsing,
    /// Local configuration
    Config,
    /// Lifecycle misuse, such as a closed supervisor
    Lifecycle,
}

impl BackpackErrorTrait for CoordinationError {
    fn is_recoverable(&self) -> bool {
        CoordinationError::is_recoverable(self)
    }

    fn category(&self) -> ErrorCategory {
        ErrorCategory::Coordination
    }
}

impl BackpackErrorTrait for WatchError {
    fn is_recoverable(&self) -> bool {
        match self {
            Self::Read { source, .. } => source.is_recoverable(),
            Self::Parse { .. } => true,
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Read { .. } => ErrorCategory::Coordination,
            Self::Parse { .. } => ErrorCategory::Parsing,
        }
    }
}

impl BackpackErrorTrait for QueueError {
    fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Closed)
    }

    fn category(&self) -> ErrorCategory {
        ErrorCategory::Queue
    }
}

impl BackpackErrorTrait for TransferError {
    fn is_recoverable(&self) -> bool {
        // 4xx from a node will not fix itself on retry
        !matches!(self.status(), Some(status) if (400..500).contains(&status))
    }

    fn category(&self) -> ErrorCategory {
        ErrorCategory::Transfer
    }
}

impl BackpackErrorTrait for NodeMapError {
    fn is_recoverable(&self) -> bool {
        false
    }

    fn category(&self) -> ErrorCategory {
        ErrorCategory::Validation
    }
}

impl BackpackErrorTrait for ReplicatorError {
    fn is_recoverable(&self) -> bool {
        match self {
            Self::Queue(e) => e.is_recoverable(),
            Self::Transfer(e) => BackpackErrorTrait::is_recoverable(e),
            Self::Node(_) | Self::EmptySources | Self::Payload(_) | Self::InvalidConcurrency => {
                false
            }
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Node(_) | Self::EmptySources => ErrorCategory::Validation,
            Self::Payload(_) => ErrorCategory::Parsing,
            Self::Queue(_) => ErrorCategory::Queue,
            Self::Transfer(_) => ErrorCategory::Transfer,
            Self::InvalidConcurrency => ErrorCategory::Config,
        }
    }
}

impl BackpackErrorTrait for SupervisorError {
    fn is_recoverable(&self) -> bool {
        match self {
            Self::Closed => false,
            Self::Coordination(e) => e.is_recoverable(),
            Self::Watch(e) => e.is_recoverable(),
            Self::Queue(e) => e.is_recoverable(),
            Self::Replicator(e) => e.is_recoverable(),
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Closed => ErrorCategory::Lifecycle,
            Self::Coordination(e) => e.category(),
            Self::Watch(e) => e.category(),
            Self::Queue(e) => e.category(),
            Self::Replicator(e) => e.category(),
        }
    }
}

impl BackpackErrorTrait for ConfigError {
    fn is_recoverable(&self) -> bool {
        false
    }

    fn category(&self) -> ErrorCategory {
        ErrorCategory::Config
    }
}

/// Unified error type for the backpack-replicator crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Coordination error: {0}")]
    Coordination(#[from] CoordinationError),

    #[error("Watch error: {0}")]
    Watch(#[from] WatchError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("Replicator error: {0}")]
    Replicator(#[from] ReplicatorError),

    #[error("Supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl BackpackErrorTrait for Error {
    fn is_recoverable(&self) -> bool {
        match self {
            Self::Coordination(e) => e.is_recoverable(),
            Self::Watch(e) => e.is_recoverable(),
            Self::Queue(e) => e.is_recoverable(),
            Self::Transfer(e) => BackpackErrorTrait::is_recoverable(e),
            Self::Replicator(e) => e.is_recoverable(),
            Self::Supervisor(e) => e.is_recoverable(),
            Self::Config(e) => e.is_recoverable(),
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Coordination(e) => e.category(),
            Self::Watch(e) => e.category(),
            Self::Queue(e) => e.category(),
            Self::Transfer(e) => e.category(),
            Self::Replicator(e) => e.category(),
            Self::Supervisor(e) => e.category(),
            Self::Config(e) => e.category(),
        }
    }
}

/// Result type alias using the unified Error type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NodeId;

    #[test]
    fn test_error_category() {
        let err = Error::Queue(QueueError::NotReady);
        assert_eq!(err.category(), ErrorCategory::Queue);

        let err: Error = ReplicatorError::from(NodeMapError::UnknownNode(NodeId::from(3))).into();
        assert_eq!(err.category(), ErrorCategory::Validation);
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_is_recoverable() {
        let err = Error::Coordination(CoordinationError::Network("reset".to_string()));
        assert!(err.is_recoverable());

        let err = Error::Supervisor(SupervisorError::Closed);
        assert!(!err.is_recoverable());
        assert_eq!(err.category(), ErrorCategory::Lifecycle);
    }

    #[test]
    fn test_transfer_client_errors_not_recoverable() {
        let url = url::Url::parse("http://node-1:80/a").unwrap();
        let not_found = TransferError::SourceStatus {
            url: url.clone(),
            status: 404,
        };
        let unavailable = TransferError::DestinationStatus { url, status: 503 };

        assert!(!BackpackErrorTrait::is_recoverable(&not_found));
        assert!(BackpackErrorTrait::is_recoverable(&unavailable));
    }

    #[test]
    fn test_question_mark_converts_domain_errors() {
        fn read_map(raw: &[u8]) -> Result<usize> {
            let map = crate::models::NodeMap::from_json(raw)
                .map_err(|source| WatchError::Parse {
                    path: "/servers-map".to_string(),
                    source,
                })?;
            if map.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "servers-map".to_string(),
                    reason: "no nodes".to_string(),
                }
                .into());
            }
            Ok(map.len())
        }

        assert_eq!(read_map(br#"{"1": {"host": "a", "port": 1}}"#).unwrap(), 1);
        assert_eq!(read_map(b"nope").unwrap_err().category(), ErrorCategory::Parsing);
        assert!(matches!(read_map(b"{}").unwrap_err(), Error::Config(_)));
    }

    #[test]
    fn test_nested_category() {
        let err = SupervisorError::Queue(QueueError::Connection("refused".to_string()));
        assert_eq!(err.category(), ErrorCategory::Queue);
        assert!(err.is_recoverable());
    }
}
