//! Domain model shared by the engine components.

mod account;
mod folder;
mod message;
mod network;
mod operation;

pub use account::{
    AccountId, AccountIdentity, AccountState, Capabilities, ConnectionState, ImapConfig,
    KeepAlive, Quota, RunPolicy, Security,
};
pub use folder::{FolderId, FolderState, FolderType, sort_folders};
pub use message::{
    FetchedMessage, MessageId, NewMessage, ThreadInfo, ThreadMerge, content_hash,
    normalize_references, normalize_subject,
};
pub use network::{Connectivity, NetworkState};
pub use operation::{
    FetchTarget, NewOperation, Operation, OperationId, OperationKind, PartitionKey,
};
