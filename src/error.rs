//! Error types for the canopy crate

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CanopyError>;

/// Errors surfaced by the framework and the wire client.
///
/// Three categories matter to callers:
///
/// - **Programmer misuse** ([`CanopyError::Lifecycle`], [`CanopyError::InvalidPath`]):
///   calling into the framework outside its contract. Never retried.
/// - **Terminal operational** (`NoNode`, `NodeExists`, `BadVersion`, ...):
///   the service answered, the answer is no. Returned verbatim, never retried.
/// - **Retriable transport/session** (`ConnectionLoss`, `OperationTimeout`,
///   `SessionExpired`, `SessionMoved`): retried per the active
///   [`RetryPolicy`](canopy_retry::RetryPolicy); exhaustion yields
///   [`CanopyError::RetriesExhausted`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CanopyError {
    #[error("lifecycle misuse: {0}")]
    Lifecycle(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("no node: {0}")]
    NoNode(String),

    #[error("node already exists: {0}")]
    NodeExists(String),

    #[error("version mismatch for {0}")]
    BadVersion(String),

    #[error("node has children: {0}")]
    NotEmpty(String),

    #[error("invalid ACL for {0}")]
    InvalidAcl(String),

    #[error("authentication failed")]
    AuthFailed,

    #[error("connection lost")]
    ConnectionLoss,

    #[error("operation timed out")]
    OperationTimeout,

    #[error("session expired")]
    SessionExpired,

    #[error("session moved to another server")]
    SessionMoved,

    #[error("gave up after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: usize,
        #[source]
        source: Box<CanopyError>,
    },

    #[error("transaction aborted at operation {index}: {source}")]
    TransactionAborted {
        index: usize,
        #[source]
        source: Box<CanopyError>,
    },

    #[error("failed to delete {} descendant path(s)", failures.len())]
    PartialDelete { failures: Vec<(String, String)> },

    #[error("timed out waiting for connection")]
    ConnectionWaitTimeout,

    #[error("wire error: {0}")]
    Wire(String),
}

impl CanopyError {
    /// True for transport/session failures that are safe to retry.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            CanopyError::ConnectionLoss
                | CanopyError::OperationTimeout
                | CanopyError::SessionExpired
                | CanopyError::SessionMoved
        )
    }

    /// True for misuse of the framework API, as opposed to operational
    /// failures. These indicate a bug in the calling code.
    pub fn is_programmer_error(&self) -> bool {
        matches!(self, CanopyError::Lifecycle(_) | CanopyError::InvalidPath(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_classification() {
        assert!(CanopyError::ConnectionLoss.is_retriable());
        assert!(CanopyError::OperationTimeout.is_retriable());
        assert!(CanopyError::SessionExpired.is_retriable());
        assert!(CanopyError::SessionMoved.is_retriable());

        assert!(!CanopyError::NoNode("/a".into()).is_retriable());
        assert!(!CanopyError::NodeExists("/a".into()).is_retriable());
        assert!(!CanopyError::BadVersion("/a".into()).is_retriable());
        assert!(!CanopyError::AuthFailed.is_retriable());
        assert!(!CanopyError::Lifecycle("not started".into()).is_retriable());
    }

    #[test]
    fn test_programmer_error_is_distinct_from_operational() {
        assert!(CanopyError::Lifecycle("closed".into()).is_programmer_error());
        assert!(CanopyError::InvalidPath("a/b".into()).is_programmer_error());
        assert!(!CanopyError::NoNode("/a".into()).is_programmer_error());
        assert!(!CanopyError::ConnectionLoss.is_programmer_error());
    }

    #[test]
    fn test_exhaustion_wraps_last_error() {
        let err = CanopyError::RetriesExhausted {
            attempts: 3,
            source: Box::new(CanopyError::ConnectionLoss),
        };
        let msg = err.to_string();
        assert!(msg.contains("3 attempts"));
        assert!(!err.is_retriable());
    }
}
