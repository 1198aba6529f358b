//! Queued mailbox operations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::account::AccountId;
use super::folder::FolderId;

/// Unique identifier for an operation. Ids grow with insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationId(pub i64);

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    /// Reconcile the local message list with the server.
    Sync,
    /// Fetch (or drop) a single message.
    Fetch,
    /// Change the seen flag.
    Seen,
    /// Change the flagged flag.
    Flag,
    /// Move messages to another folder.
    Move,
    /// Delete messages on the server.
    Delete,
    /// Append an outgoing message.
    Send,
    /// Check that a message still exists.
    Exists,
}

impl OperationKind {
    /// Default priority class; lower runs first.
    #[must_use]
    pub const fn priority(self) -> u8 {
        match self {
            Self::Send => 0,
            Self::Seen | Self::Flag | Self::Exists => 1,
            Self::Move | Self::Delete => 2,
            Self::Fetch => 3,
            Self::Sync => 4,
        }
    }

    /// Storage representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Fetch => "fetch",
            Self::Seen => "seen",
            Self::Flag => "flag",
            Self::Move => "move",
            Self::Delete => "delete",
            Self::Send => "send",
            Self::Exists => "exists",
        }
    }

    /// Parse the storage representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "sync" => Self::Sync,
            "fetch" => Self::Fetch,
            "seen" => Self::Seen,
            "flag" => Self::Flag,
            "move" => Self::Move,
            "delete" => Self::Delete,
            "send" => Self::Send,
            "exists" => Self::Exists,
            _ => return None,
        })
    }
}

/// Payload of a fetch operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchTarget {
    /// Server UID.
    pub uid: u32,
    /// The message was expunged on the server.
    #[serde(default)]
    pub removed: bool,
}

/// Scheduling unit: operations sharing a key execute together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey {
    /// Folder the operations act on.
    pub folder: FolderId,
    /// Priority class.
    pub priority: u8,
    /// The folder is not held open by a watcher.
    pub offline: bool,
}

impl std::fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.folder,
            self.priority,
            if self.offline { "offline" } else { "online" }
        )
    }
}

/// A pending operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    /// Unique identifier; also the insertion order.
    pub id: OperationId,
    /// Owning account.
    pub account: AccountId,
    /// Target folder.
    pub folder: FolderId,
    /// Operation kind.
    pub kind: OperationKind,
    /// Priority class.
    pub priority: u8,
    /// Kind specific arguments.
    pub payload: serde_json::Value,
    /// Creation time.
    pub created: DateTime<Utc>,
    /// Failed attempts.
    pub tries: u32,
    /// Last failure.
    pub error: Option<String>,
}

impl Operation {
    /// Insertion order.
    #[must_use]
    pub const fn order(&self) -> i64 {
        self.id.0
    }

    /// Partition this operation belongs to.
    #[must_use]
    pub const fn partition_key(&self, offline: bool) -> PartitionKey {
        PartitionKey {
            folder: self.folder,
            priority: self.priority,
            offline,
        }
    }

    /// Decode the payload of a fetch operation.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload does not describe a fetch target.
    pub fn fetch_target(&self) -> serde_json::Result<FetchTarget> {
        serde_json::from_value(self.payload.clone())
    }
}

/// An operation to be queued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOperation {
    /// Owning account.
    pub account: AccountId,
    /// Target folder.
    pub folder: FolderId,
    /// Operation kind.
    pub kind: OperationKind,
    /// Priority class.
    pub priority: u8,
    /// Kind specific arguments.
    pub payload: serde_json::Value,
}

impl NewOperation {
    /// Operation with the kind's default priority.
    #[must_use]
    pub const fn new(
        account: AccountId,
        folder: FolderId,
        kind: OperationKind,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            account,
            folder,
            kind,
            priority: kind.priority(),
            payload,
        }
    }

    /// Folder synchronization.
    #[must_use]
    pub fn sync(account: AccountId, folder: FolderId) -> Self {
        Self::new(account, folder, OperationKind::Sync, json!({}))
    }

    /// Fetch of one message, or removal when `removed` is set.
    #[must_use]
    pub fn fetch(account: AccountId, folder: FolderId, uid: u32, removed: bool) -> Self {
        Self::new(
            account,
            folder,
            OperationKind::Fetch,
            json!({ "uid": uid, "removed": removed }),
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn priorities_order_kinds() {
        assert!(OperationKind::Send.priority() < OperationKind::Seen.priority());
        assert!(OperationKind::Seen.priority() < OperationKind::Move.priority());
        assert!(OperationKind::Fetch.priority() < OperationKind::Sync.priority());
    }

    #[test]
    fn kind_names() {
        assert_eq!(OperationKind::parse("fetch"), Some(OperationKind::Fetch));
        assert_eq!(OperationKind::parse(OperationKind::Exists.as_str()), Some(OperationKind::Exists));
        assert_eq!(OperationKind::parse("noop"), None);
    }

    #[test]
    fn fetch_payload() {
        let new = NewOperation::fetch(AccountId::new(1), FolderId::new(2), 42, false);
        assert_eq!(new.priority, 3);

        let op = Operation {
            id: OperationId(9),
            account: new.account,
            folder: new.folder,
            kind: new.kind,
            priority: new.priority,
            payload: new.payload,
            created: Utc::now(),
            tries: 0,
            error: None,
        };
        let target = op.fetch_target().unwrap();
        assert_eq!(target, FetchTarget { uid: 42, removed: false });

        let key = op.partition_key(true);
        assert_eq!(key.to_string(), "2:3:offline");
    }
}
