//! Persistent store for accounts, folders, operations and messages.
//!
//! The store is the only resource shared between account workers. Operation
//! dequeue/dedup and thread-id merges are check-then-act sequences, so both
//! run inside a single transaction in every implementation.

mod memory;
mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::Result;
use crate::display::EngineStatus;
use crate::model::{
    AccountId, AccountState, Capabilities, ConnectionState, FolderId, FolderState, KeepAlive,
    MessageId, NewMessage, NewOperation, Operation, OperationId, OperationKind, Quota, ThreadInfo,
    ThreadMerge,
};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Transactional storage consumed by the engine.
///
/// [`Store::watch_accounts`] ticks whenever the account list or anything
/// deciding whether an account runs changes: account configuration, folder
/// synchronization flags and the pending operation count. Runtime state
/// setters (connection state, backoff, errors) do not tick it.
#[async_trait]
pub trait Store: Send + Sync {
    /// All accounts with their folder and pending operation counts.
    async fn accounts(&self) -> Result<Vec<AccountState>>;

    /// One account with its counts.
    async fn account(&self, id: AccountId) -> Result<Option<AccountState>>;

    /// Insert an account, returning its id.
    async fn add_account(&self, account: &AccountState) -> Result<AccountId>;

    /// Update configuration fields of an account.
    async fn update_account(&self, account: &AccountState) -> Result<()>;

    /// Flag an account for deletion by the supervisor.
    async fn mark_account_deleted(&self, id: AccountId) -> Result<()>;

    /// Remove an account and everything it owns.
    async fn delete_account(&self, id: AccountId) -> Result<()>;

    /// Clear transient runtime state left over from a previous run.
    async fn reset_account(&self, id: AccountId) -> Result<()>;

    /// Set the connection state.
    async fn set_account_state(&self, id: AccountId, state: Option<ConnectionState>)
    -> Result<()>;

    /// Record a confirmed live connection.
    async fn set_account_connected(&self, id: AccountId, at: DateTime<Utc>) -> Result<()>;

    /// Set or clear the backoff deadline.
    async fn set_account_backoff(&self, id: AccountId, until: Option<DateTime<Utc>>)
    -> Result<()>;

    /// Set or clear the persistent error.
    async fn set_account_error(&self, id: AccountId, error: Option<&str>) -> Result<()>;

    /// Set or clear the persistent warning.
    async fn set_account_warning(&self, id: AccountId, warning: Option<&str>) -> Result<()>;

    /// Record server capabilities.
    async fn set_account_capabilities(&self, id: AccountId, capabilities: Capabilities)
    -> Result<()>;

    /// Persist keep-alive interval and tuning counters.
    async fn set_account_keep_alive(&self, id: AccountId, keep_alive: KeepAlive) -> Result<()>;

    /// Record the storage quota.
    async fn set_account_quota(&self, id: AccountId, quota: Option<Quota>) -> Result<()>;

    /// Folders of an account.
    async fn folders(&self, account: AccountId) -> Result<Vec<FolderState>>;

    /// One folder.
    async fn folder(&self, id: FolderId) -> Result<Option<FolderState>>;

    /// Insert a folder, returning its id.
    async fn add_folder(&self, folder: &FolderState) -> Result<FolderId>;

    /// Set a folder's connection state.
    async fn set_folder_state(&self, id: FolderId, state: Option<ConnectionState>) -> Result<()>;

    /// Set the connection state of all folders of an account.
    async fn set_folder_states(
        &self,
        account: AccountId,
        state: Option<ConnectionState>,
    ) -> Result<()>;

    /// Record whether a folder opened read-only.
    async fn set_folder_read_only(&self, id: FolderId, read_only: bool) -> Result<()>;

    /// Set or clear a folder's error.
    async fn set_folder_error(&self, id: FolderId, error: Option<&str>) -> Result<()>;

    /// Switch a folder between watching and polling.
    async fn set_folder_poll(&self, id: FolderId, poll: bool) -> Result<()>;

    /// Persist a folder's poll counter.
    async fn set_folder_poll_count(&self, id: FolderId, count: u32) -> Result<()>;

    /// Enable or disable synchronization of a folder.
    async fn set_folder_synchronize(&self, id: FolderId, synchronize: bool) -> Result<()>;

    /// Queue an operation. Unless `force` is set, an identical pending
    /// operation (same folder, kind and payload) suppresses the insert and
    /// `None` is returned.
    async fn enqueue_operation(
        &self,
        operation: &NewOperation,
        force: bool,
    ) -> Result<Option<OperationId>>;

    /// Pending operations of an account in insertion order.
    async fn pending_operations(&self, account: AccountId) -> Result<Vec<Operation>>;

    /// Pending operations of a folder, optionally of one kind.
    async fn operations(
        &self,
        folder: FolderId,
        kind: Option<OperationKind>,
    ) -> Result<Vec<Operation>>;

    /// Pending operations of an account of one kind.
    async fn account_operations(
        &self,
        account: AccountId,
        kind: OperationKind,
    ) -> Result<Vec<Operation>>;

    /// Remove a completed or cancelled operation.
    async fn delete_operation(&self, id: OperationId) -> Result<bool>;

    /// Record a failed attempt.
    async fn set_operation_error(&self, id: OperationId, error: &str) -> Result<()>;

    /// Version counter ticking on every operation change.
    fn watch_operations(&self) -> watch::Receiver<u64>;

    /// Version counter ticking on account-list relevant changes.
    fn watch_accounts(&self) -> watch::Receiver<u64>;

    /// Messages with any of the given message ids.
    async fn messages_by_msgid(
        &self,
        account: AccountId,
        msgids: &[String],
    ) -> Result<Vec<ThreadInfo>>;

    /// Messages whose references or in-reply-to name `msgid`.
    async fn messages_referencing(&self, account: AccountId, msgid: &str)
    -> Result<Vec<ThreadInfo>>;

    /// Messages from `sender` with normalized subject `subject` received at or
    /// after `since`.
    async fn messages_by_subject(
        &self,
        account: AccountId,
        sender: &str,
        subject: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ThreadInfo>>;

    /// The message stored for a folder UID.
    async fn message(&self, folder: FolderId, uid: u32) -> Result<Option<ThreadInfo>>;

    /// UIDs stored for a folder.
    async fn message_uids(&self, folder: FolderId) -> Result<Vec<u32>>;

    /// Insert or replace a message and apply thread merges atomically.
    async fn store_message(&self, message: &NewMessage, merges: &[ThreadMerge])
    -> Result<MessageId>;

    /// Rewrite the thread id of every message of an account on thread `old`,
    /// optionally only those received since a time. Returns rows changed.
    async fn update_message_thread(
        &self,
        account: AccountId,
        old: &str,
        new: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<u64>;

    /// Remove a stored message.
    async fn delete_message(&self, folder: FolderId, uid: u32) -> Result<bool>;

    /// Persist the last reported engine status.
    async fn save_status(&self, status: EngineStatus) -> Result<()>;

    /// Last persisted engine status.
    async fn status(&self) -> Result<EngineStatus>;
}
