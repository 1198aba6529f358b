//! Folder model types.

use serde::{Deserialize, Serialize};

use super::account::{AccountId, ConnectionState};

/// Unique identifier for a folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FolderId(pub i64);

impl FolderId {
    /// Create a new folder ID.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for FolderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Type of folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FolderType {
    /// Inbox folder.
    Inbox,
    /// Drafts folder.
    Drafts,
    /// Sent mail folder.
    Sent,
    /// Archive folder.
    Archive,
    /// Trash folder.
    Trash,
    /// Spam/junk folder.
    Spam,
    /// Regular folder.
    Regular,
}

impl FolderType {
    /// Detect folder type from its name.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        let lower = name.to_lowercase();
        if lower == "inbox" {
            Self::Inbox
        } else if lower.contains("sent") {
            Self::Sent
        } else if lower.contains("draft") {
            Self::Drafts
        } else if lower.contains("trash") || lower.contains("deleted") {
            Self::Trash
        } else if lower.contains("spam") || lower.contains("junk") {
            Self::Spam
        } else if lower.contains("archive") {
            Self::Archive
        } else {
            Self::Regular
        }
    }

    /// Storage representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Inbox => "inbox",
            Self::Drafts => "drafts",
            Self::Sent => "sent",
            Self::Archive => "archive",
            Self::Trash => "trash",
            Self::Spam => "spam",
            Self::Regular => "regular",
        }
    }

    /// Parse the storage representation.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "inbox" => Self::Inbox,
            "drafts" => Self::Drafts,
            "sent" => Self::Sent,
            "archive" => Self::Archive,
            "trash" => Self::Trash,
            "spam" => Self::Spam,
            _ => Self::Regular,
        }
    }
}

/// A folder of an account and its synchronization state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct FolderState {
    /// Unique identifier.
    pub id: FolderId,
    /// Owning account.
    pub account: AccountId,
    /// Full server name.
    pub name: String,
    /// Folder type.
    pub folder_type: FolderType,
    /// Folder can be opened.
    pub selectable: bool,
    /// Folder is kept in sync.
    pub synchronize: bool,
    /// Folder is polled instead of watched.
    pub poll: bool,
    /// Poll every this many keep-alive cycles.
    pub poll_factor: u32,
    /// Keep-alive cycles since the last poll.
    pub poll_count: u32,
    /// Connection state; only set while the account is connected.
    pub state: Option<ConnectionState>,
    /// Folder was opened read-only.
    pub read_only: bool,
    /// Last error.
    pub error: Option<String>,
}

impl FolderState {
    /// Create an unsaved, synchronizing folder.
    #[must_use]
    pub fn new(account: AccountId, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: FolderId::new(0),
            account,
            folder_type: FolderType::from_name(&name),
            name,
            selectable: true,
            synchronize: true,
            poll: false,
            poll_factor: 1,
            poll_count: 0,
            state: None,
            read_only: false,
            error: None,
        }
    }

    /// Whether this is the primary inbox.
    #[must_use]
    pub fn is_inbox(&self) -> bool {
        self.folder_type == FolderType::Inbox
    }

    /// Whether the folder takes part in synchronization.
    #[must_use]
    pub const fn is_synchronized(&self) -> bool {
        self.selectable && self.synchronize
    }
}

/// Sort folders into opening order: by type (inbox first), then name.
pub fn sort_folders(folders: &mut [FolderState]) {
    folders.sort_by(|a, b| {
        a.folder_type
            .cmp(&b.folder_type)
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
    });
}
