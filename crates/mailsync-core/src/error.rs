//! Error types for the synchronization engine.

use thiserror::Error;

use crate::model::AccountId;
use crate::transport::TransportError;

/// Errors that can occur in engine operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Mail transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Account not found.
    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    /// Folder not found in the local store.
    #[error("Folder not found: {0}")]
    FolderNotFound(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The connection was cancelled by a failure elsewhere in the account.
    #[error("Unrecoverable: {0}")]
    Unrecoverable(String),

    /// The supervisor is no longer running.
    #[error("Supervisor stopped")]
    Stopped,

    /// Work was captured on a connection that has since been replaced.
    #[error("Stale connection serial {captured} (current {current})")]
    Stale {
        /// Serial captured at dispatch time.
        captured: u64,
        /// Serial of the live connection.
        current: u64,
    },
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Closed classification of every failure the engine handles.
///
/// The worker and scheduler decide between retry, alert and skip by matching
/// on this kind, never on messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Network drop or timeout; retried through backoff, never surfaced.
    Transient,
    /// Credentials rejected; long backoff and one persistent alert.
    Authentication,
    /// Missing or malformed mailbox state; the offending folder is skipped.
    Structural,
    /// Cancellation raised by failing operations; forces a reconnect.
    Unrecoverable,
    /// Stale serial or already-closed session; ignored.
    Consistency,
}

impl Error {
    /// Classify this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Database(_) | Self::Serde(_) | Self::Io(_) => ErrorKind::Transient,
            Self::Transport(e) => e.kind(),
            Self::FolderNotFound(_) | Self::Config(_) => ErrorKind::Structural,
            Self::Unrecoverable(_) => ErrorKind::Unrecoverable,
            Self::AccountNotFound(_) | Self::Stale { .. } | Self::Stopped => {
                ErrorKind::Consistency
            }
        }
    }

    /// Whether this error means a folder no longer exists.
    #[must_use]
    pub const fn is_folder_not_found(&self) -> bool {
        matches!(
            self,
            Self::FolderNotFound(_) | Self::Transport(TransportError::FolderNotFound(_))
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_keep_their_kind() {
        let auth = Error::from(TransportError::Authentication("bad password".into()));
        assert_eq!(auth.kind(), ErrorKind::Authentication);

        let io = Error::from(TransportError::Io("reset by peer".into()));
        assert_eq!(io.kind(), ErrorKind::Transient);

        let closed = Error::from(TransportError::Closed);
        assert_eq!(closed.kind(), ErrorKind::Consistency);
    }

    #[test]
    fn folder_not_found_is_structural() {
        let local = Error::FolderNotFound("Archive".into());
        let remote = Error::from(TransportError::FolderNotFound("Archive".into()));
        assert!(local.is_folder_not_found());
        assert!(remote.is_folder_not_found());
        assert_eq!(remote.kind(), ErrorKind::Structural);
        assert!(!Error::Unrecoverable("x".into()).is_folder_not_found());
    }

    #[test]
    fn stale_serial_is_consistency() {
        let err = Error::Stale {
            captured: 1,
            current: 2,
        };
        assert_eq!(err.kind(), ErrorKind::Consistency);
        assert_eq!(err.to_string(), "Stale connection serial 1 (current 2)");
    }
}
