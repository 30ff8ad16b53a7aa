//! Error types for the cache exchange

use std::fmt;

use cachex_transport::TransportError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for exchange operations
pub type ExchangeResult<T> = Result<T, Error>;

/// Main error type for the exchange
#[derive(Debug, Error)]
pub struct Error {
    /// Error kind
    kind: ErrorKind,
    /// Error context
    context: ErrorContext,
}

impl Error {
    /// Create a new error
    pub fn new(kind: ErrorKind, context: ErrorContext) -> Self {
        Self { kind, context }
    }

    /// Create error with string context
    pub fn with_context(kind: ErrorKind, context: impl Into<String>) -> Self {
        Self {
            kind,
            context: ErrorContext::Message(context.into()),
        }
    }

    /// Get error kind
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// Get error context
    pub fn context(&self) -> &ErrorContext {
        &self.context
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::Validation, msg)
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::Timeout, msg)
    }

    /// Create a shutdown error
    pub fn shutdown(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::Shutdown, msg)
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::Protocol, msg)
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::Storage, msg)
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::Configuration, msg)
    }

    /// Check if the node has shut down
    pub fn is_shutdown(&self) -> bool {
        matches!(self.kind, ErrorKind::Shutdown)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.context {
            ErrorContext::Message(msg) => write!(f, "{}: {}", self.kind, msg),
            ErrorContext::Chain { message, source } => {
                write!(f, "{}: {} (caused by: {})", self.kind, message, source)
            }
        }
    }
}

/// Error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Request or configuration failed validation
    Validation,
    /// Operation timed out
    Timeout,
    /// The exchange service has stopped
    Shutdown,
    /// Structural protocol error (bad round, undecodable message)
    Protocol,
    /// Transport error
    Transport,
    /// Serialization error
    Serialization,
    /// Checkpoint storage error
    Storage,
    /// Configuration error
    Configuration,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Validation => write!(f, "Validation error"),
            ErrorKind::Timeout => write!(f, "Timeout"),
            ErrorKind::Shutdown => write!(f, "Shut down"),
            ErrorKind::Protocol => write!(f, "Protocol error"),
            ErrorKind::Transport => write!(f, "Transport error"),
            ErrorKind::Serialization => write!(f, "Serialization error"),
            ErrorKind::Storage => write!(f, "Storage error"),
            ErrorKind::Configuration => write!(f, "Configuration error"),
        }
    }
}

/// Error context
#[derive(Debug)]
pub enum ErrorContext {
    /// Simple message
    Message(String),
    /// Error chain with source
    Chain {
        /// Error message
        message: String,
        /// Source error
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        Self::new(
            ErrorKind::Transport,
            ErrorContext::Chain {
                message: "Transport failure".to_string(),
                source: Box::new(err),
            },
        )
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for Error {
    fn from(err: ciborium::ser::Error<std::io::Error>) -> Self {
        Self::new(
            ErrorKind::Serialization,
            ErrorContext::Chain {
                message: "CBOR encoding failed".to_string(),
                source: Box::new(err),
            },
        )
    }
}

impl From<ciborium::de::Error<std::io::Error>> for Error {
    fn from(err: ciborium::de::Error<std::io::Error>) -> Self {
        Self::new(
            ErrorKind::Serialization,
            ErrorContext::Chain {
                message: "CBOR decoding failed".to_string(),
                source: Box::new(err),
            },
        )
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::new(
            ErrorKind::Configuration,
            ErrorContext::Chain {
                message: "Invalid configuration".to_string(),
                source: Box::new(err),
            },
        )
    }
}

/// Failure of a decision applied to the local registry.
///
/// `NameConflict` and `NotFound` are normally caught while voting; seeing
/// them here means this node's view diverged. The remaining variants are
/// local partial failures of a cluster-accepted decision.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ApplyError {
    /// A non-stopped resource with this name already exists
    #[error("Resource '{0}' already exists")]
    NameConflict(String),

    /// The target resource does not exist
    #[error("Resource '{0}' not found")]
    NotFound(String),

    /// The storage engine failed to create the resource
    #[error("Initialization of '{name}' failed: {reason}")]
    InitializationFailed {
        /// Resource name
        name: String,
        /// Hook error message
        reason: String,
    },

    /// The storage engine failed to destroy the resource
    #[error("Destruction of '{name}' failed: {reason}")]
    DestroyFailed {
        /// Resource name
        name: String,
        /// Hook error message
        reason: String,
    },

    /// The storage engine failed to create the client projection
    #[error("Client attach to '{name}' failed: {reason}")]
    AttachFailed {
        /// Resource name
        name: String,
        /// Hook error message
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_kind_and_source() {
        let err: Error = TransportError::ConnectionClosed.into();

        assert_eq!(err.kind(), &ErrorKind::Transport);
        assert_eq!(
            err.to_string(),
            "Transport error: Transport failure (caused by: Connection closed)"
        );
    }

    #[test]
    fn test_shutdown_predicate() {
        assert!(Error::shutdown("gone").is_shutdown());
        assert!(!Error::timeout("slow").is_shutdown());
    }
}
