//! Error types for the coordination core.

use crate::types::{Address, CacheName};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type alias for coordination operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the coordination core.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// No terminal event before the request deadline.
    #[error("request {request_id} timed out waiting for {missing:?}")]
    Timeout {
        request_id: u64,
        missing: Vec<Address>,
    },

    /// The target left the cluster before it could respond.
    #[error("target {0} left the cluster")]
    Suspect(Address),

    /// A remote member failed to execute the command.
    #[error("remote error: {0}")]
    Remote(RemoteError),

    /// The transport or a collector broke the response protocol.
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    /// All targets answered but none with a usable response.
    #[error("no valid response received")]
    NoValidResponse,

    /// Adding the edge would close a cycle.
    #[error("cyclic dependency: {from} -> {to}")]
    CyclicDependency { from: String, to: String },

    /// Cache is not known to this component.
    #[error("cache not found: {0}")]
    CacheNotFound(CacheName),

    /// This node cannot answer a coordinator-only request.
    #[error("not coordinator, coordinator is: {coordinator:?}")]
    NotCoordinator { coordinator: Option<Address> },

    /// The in-flight rebalance was abandoned.
    #[error("rebalance of {cache} aborted: {reason}")]
    RebalanceAborted { cache: CacheName, reason: String },

    /// Optimistic-concurrency conflict reported by the storage layer.
    #[error("write skew detected on key {key}")]
    WriteSkew { key: String },

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Innermost remote failure, if this error carries one.
    pub fn root_cause(&self) -> Option<&RemoteError> {
        match self {
            Error::Remote(remote) => Some(remote.root_cause()),
            _ => None,
        }
    }

    /// Whether retrying on a newer topology may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Suspect(_) | Error::Timeout { .. })
    }
}

/// Response protocol violations. Fatal to the request they occur in.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The same sender answered twice.
    #[error("duplicate response from {sender} for request {request_id}")]
    DuplicateResponse { request_id: u64, sender: Address },

    /// A sender that was never targeted answered.
    #[error("unexpected response from {sender} for request {request_id}")]
    UnexpectedSender { request_id: u64, sender: Address },

    /// A collector was asked to finish after it already produced a result.
    #[error("collector finished twice")]
    FinishedTwice,
}

/// Failure raised on a remote member, possibly wrapping the failure it
/// observed further down the call chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    /// Member that raised the failure.
    pub origin: Option<Address>,
    /// Description of the failure.
    pub message: String,
    /// Wrapped failure.
    pub cause: Option<Box<RemoteError>>,
}

impl RemoteError {
    /// Create a remote error without a cause.
    pub fn new(origin: Option<Address>, message: impl Into<String>) -> Self {
        Self {
            origin,
            message: message.into(),
            cause: None,
        }
    }

    /// Wrap another remote error.
    pub fn wrapping(origin: Option<Address>, message: impl Into<String>, cause: RemoteError) -> Self {
        Self {
            origin,
            message: message.into(),
            cause: Some(Box::new(cause)),
        }
    }

    /// Follow `cause` links to the innermost failure.
    pub fn root_cause(&self) -> &RemoteError {
        let mut current = self;
        while let Some(cause) = current.cause.as_deref() {
            current = cause;
        }
        current
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.origin {
            Some(origin) => write!(f, "{} (from {})", self.message, origin)?,
            None => f.write_str(&self.message)?,
        }
        if let Some(cause) = &self.cause {
            write!(f, ": caused by {}", cause)?;
        }
        Ok(())
    }
}

impl std::error::Error for RemoteError {}

impl From<RemoteError> for Error {
    fn from(e: RemoteError) -> Self {
        Error::Remote(e)
    }
}

impl From<&Error> for RemoteError {
    fn from(e: &Error) -> Self {
        match e {
            Error::Remote(remote) => remote.clone(),
            other => RemoteError::new(None, other.to_string()),
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_cause_unwraps_nested_remote_errors() {
        let inner = RemoteError::new(Some(Address::new(3)), "write skew on k1");
        let middle = RemoteError::wrapping(Some(Address::new(2)), "forward failed", inner.clone());
        let outer = Error::Remote(RemoteError::wrapping(
            Some(Address::new(1)),
            "invocation failed",
            middle,
        ));

        assert_eq!(outer.root_cause(), Some(&inner));
        assert!(outer.to_string().contains("caused by"));
    }

    #[test]
    fn test_non_remote_error_has_no_root_cause() {
        assert!(Error::Cancelled.root_cause().is_none());
        assert!(Error::Suspect(Address::new(1)).is_retryable());
        assert!(!Error::NoValidResponse.is_retryable());
    }

    #[test]
    fn test_protocol_error_conversion() {
        let err: Error = ProtocolError::DuplicateResponse {
            request_id: 9,
            sender: Address::new(2),
        }
        .into();
        assert!(matches!(err, Error::Protocol(ProtocolError::DuplicateResponse { .. })));
    }
}
