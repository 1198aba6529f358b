//! Mail transport interface.
//!
//! The engine drives connections exclusively through these traits. Every
//! call returns a [`TransportError`] the state machine can classify without
//! inspecting messages. Server pushes arrive as [`TransportEvent`]s on a
//! bounded channel handed to [`Connector::connect`].

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::ErrorKind;
use crate::model::{AccountState, FetchedMessage, Operation, Quota};

/// Errors raised by a transport implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Credentials were rejected.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Network failure or timeout.
    #[error("Connection failed: {0}")]
    Io(String),

    /// The folder does not exist on the server.
    #[error("Folder not found: {0}")]
    FolderNotFound(String),

    /// The folder cannot be opened read-write.
    #[error("Folder is read-only: {0}")]
    ReadOnlyFolder(String),

    /// The session or folder was already closed.
    #[error("Connection closed")]
    Closed,

    /// The server answered something unexpected.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Classify this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Authentication(_) => ErrorKind::Authentication,
            Self::Io(_) => ErrorKind::Transient,
            Self::FolderNotFound(_) | Self::ReadOnlyFolder(_) | Self::Protocol(_) => {
                ErrorKind::Structural
            }
            Self::Closed => ErrorKind::Consistency,
        }
    }
}

/// Result type for transport calls.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// How to open a folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Read-write.
    ReadWrite,
    /// Read-only.
    ReadOnly,
}

/// Server-side changes and notices pushed while a session is open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Messages were added to a folder.
    Added {
        /// Folder name.
        folder: String,
        /// New UIDs.
        uids: Vec<u32>,
    },
    /// Messages were expunged from a folder.
    Removed {
        /// Folder name.
        folder: String,
        /// Expunged UIDs.
        uids: Vec<u32>,
    },
    /// Message flags changed.
    Changed {
        /// Folder name.
        folder: String,
        /// Changed UIDs.
        uids: Vec<u32>,
    },
    /// Informational server notice.
    Notice(String),
    /// Server alert meant for the user.
    Alert(String),
}

/// Opens sessions for accounts.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect and authenticate. Server pushes for the session's lifetime are
    /// delivered on `events`.
    async fn connect(
        &self,
        account: &AccountState,
        events: mpsc::Sender<TransportEvent>,
    ) -> TransportResult<Arc<dyn Session>>;
}

/// An authenticated connection to a mail server.
#[async_trait]
pub trait Session: Send + Sync {
    /// Capabilities announced by the server.
    fn capabilities(&self) -> Vec<String>;

    /// Check for a capability, ignoring case.
    fn has_capability(&self, name: &str) -> bool {
        self.capabilities()
            .iter()
            .any(|c| c.eq_ignore_ascii_case(name))
    }

    /// Lightweight liveness check.
    async fn noop(&self) -> TransportResult<()>;

    /// Open a folder.
    async fn open_folder(&self, name: &str, mode: OpenMode) -> TransportResult<Arc<dyn MailFolder>>;

    /// Storage quota, if the server reports one.
    async fn quota(&self) -> TransportResult<Option<Quota>>;

    /// Close idle pooled connections.
    async fn empty_pool(&self) -> TransportResult<()>;

    /// Close the session.
    async fn close(&self) -> TransportResult<()>;
}

/// An open folder.
#[async_trait]
pub trait MailFolder: Send + Sync {
    /// Folder name.
    fn name(&self) -> &str;

    /// Whether the folder is still open.
    fn is_open(&self) -> bool;

    /// Whether the folder was opened read-only.
    fn read_only(&self) -> bool;

    /// Block until the server reports a change or the idle period ends.
    async fn idle_wait(&self) -> TransportResult<()>;

    /// All UIDs currently in the folder.
    async fn uids(&self) -> TransportResult<Vec<u32>>;

    /// Fetch headers of the given UIDs. Missing UIDs are left out.
    async fn fetch_messages(&self, uids: &[u32]) -> TransportResult<Vec<FetchedMessage>>;

    /// Apply a flag, move, delete, send or exists operation.
    async fn apply(&self, operation: &Operation) -> TransportResult<()>;

    /// Close the folder.
    async fn close(&self) -> TransportResult<()>;
}
