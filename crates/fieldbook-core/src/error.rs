//! Error types for Fieldbook.
//!
//! This module provides a unified error type for all Fieldbook operations,
//! with specific error variants for different failure modes.

use std::io;

use thiserror::Error;

/// A specialized `Result` type for Fieldbook operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for Fieldbook.
#[derive(Error, Debug)]
pub enum Error {
    /// Operation requires connectivity but the app is offline
    #[error("cannot {0} while offline")]
    Offline(&'static str),

    /// HTTP transport failure
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Login rejected by the server
    #[error("login failed with status {0}")]
    LoginRejected(u16),

    /// Server answered with a non-success status
    #[error("server rejected request with status {status}: {message}")]
    ServerRejected {
        /// HTTP status code
        status: u16,
        /// Server-provided message, if any
        message: String,
    },

    /// Token refresh failed; the session can no longer be trusted
    #[error("token refresh failed: {0}")]
    RefreshFailed(String),

    /// Server response was missing required fields
    #[error("malformed server response: {0}")]
    MalformedResponse(&'static str),

    /// Request rejected with 401/403
    #[error("unauthorized")]
    Unauthorized,

    /// No session record is available
    #[error("no session available")]
    SessionMissing,

    /// Required storage backend is unavailable
    #[error("storage backend unavailable: {0}")]
    StorageUnavailable(String),

    /// A storage read or write failed
    #[error("storage operation failed: {0}")]
    StorageFailed(String),

    /// Remote store binding could not be constructed
    #[error("remote store binding failed: {0}")]
    RemoteBindingFailed(String),

    /// Replication session failure
    #[error("replication error: {0}")]
    ReplicationFailed(String),

    /// Configuration file error
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Internal error (should not happen)
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns whether this error is transient and worth retrying.
    ///
    /// Transient connectivity failures are reflected as state and retried
    /// with backoff; everything else is terminal to the operation that
    /// produced it.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Offline(_) => true,
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }

    /// Returns whether this error is an authentication-class failure
    /// (credential rejection rather than transport trouble).
    #[must_use]
    pub fn is_auth_error(&self) -> bool {
        match self {
            Self::Unauthorized | Self::RefreshFailed(_) => true,
            Self::LoginRejected(status) | Self::ServerRejected { status, .. } => {
                *status == 401 || *status == 403
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offline_is_recoverable() {
        assert!(Error::Offline("login").is_recoverable());
        assert!(!Error::MalformedResponse("missing data").is_recoverable());
        assert!(!Error::Unauthorized.is_recoverable());
    }

    #[test]
    fn test_auth_error_classification() {
        assert!(Error::Unauthorized.is_auth_error());
        assert!(Error::LoginRejected(401).is_auth_error());
        assert!(Error::RefreshFailed("expired".into()).is_auth_error());
        assert!(!Error::LoginRejected(500).is_auth_error());
        assert!(!Error::Offline("sync").is_auth_error());
    }

    #[test]
    fn test_error_display() {
        let err = Error::Offline("login");
        assert_eq!(err.to_string(), "cannot login while offline");

        let err = Error::LoginRejected(403);
        assert_eq!(err.to_string(), "login failed with status 403");
    }
}
