//! In-memory store.
//!
//! Holds everything behind one mutex, which makes every method trivially
//! transactional. Suited to embedding and to tests running on paused time.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;

use super::Store;
use crate::display::EngineStatus;
use crate::model::{
    AccountId, AccountState, Capabilities, ConnectionState, FolderId, FolderState, KeepAlive,
    MessageId, NewMessage, NewOperation, Operation, OperationId, OperationKind, Quota, ThreadInfo,
    ThreadMerge, normalize_subject,
};
use crate::{Error, Result};

#[derive(Default)]
struct Inner {
    next_id: i64,
    accounts: BTreeMap<AccountId, AccountState>,
    folders: BTreeMap<FolderId, FolderState>,
    operations: BTreeMap<OperationId, Operation>,
    messages: BTreeMap<MessageId, ThreadInfo>,
    status: EngineStatus,
    enqueued: HashMap<OperationKind, usize>,
}

impl Inner {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn with_counts(&self, account: &AccountState) -> AccountState {
        let mut account = account.clone();
        account.folders = count(
            self.folders
                .values()
                .filter(|f| f.account == account.id && f.is_synchronized()),
        );
        account.operations = count(
            self.operations
                .values()
                .filter(|op| op.account == account.id),
        );
        account
    }

    fn account_mut(&mut self, id: AccountId) -> Result<&mut AccountState> {
        self.accounts.get_mut(&id).ok_or(Error::AccountNotFound(id))
    }

    fn folder_mut(&mut self, id: FolderId) -> Result<&mut FolderState> {
        self.folders
            .get_mut(&id)
            .ok_or_else(|| Error::FolderNotFound(id.to_string()))
    }

    fn rethread(
        &mut self,
        account: AccountId,
        old: &str,
        new: &str,
        since: Option<DateTime<Utc>>,
    ) -> u64 {
        let mut changed = 0;
        for message in self.messages.values_mut().filter(|m| {
            m.account == account && m.thread == old && since.is_none_or(|s| m.received >= s)
        }) {
            message.thread = new.to_string();
            changed += 1;
        }
        changed
    }
}

fn count<T>(items: impl Iterator<Item = T>) -> u32 {
    u32::try_from(items.count()).unwrap_or(u32::MAX)
}

/// Store keeping all data in process memory.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    accounts_tx: watch::Sender<u64>,
    operations_tx: watch::Sender<u64>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            accounts_tx: watch::channel(0).0,
            operations_tx: watch::channel(0).0,
        }
    }

    /// Total operations of `kind` ever inserted (deduplicated enqueues are not
    /// counted).
    #[must_use]
    pub fn enqueued(&self, kind: OperationKind) -> usize {
        self.lock().enqueued.get(&kind).copied().unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn accounts_changed(&self) {
        self.accounts_tx.send_modify(|v| *v += 1);
    }

    fn operations_changed(&self) {
        self.operations_tx.send_modify(|v| *v += 1);
        self.accounts_changed();
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn accounts(&self) -> Result<Vec<AccountState>> {
        let inner = self.lock();
        Ok(inner
            .accounts
            .values()
            .map(|a| inner.with_counts(a))
            .collect())
    }

    async fn account(&self, id: AccountId) -> Result<Option<AccountState>> {
        let inner = self.lock();
        Ok(inner.accounts.get(&id).map(|a| inner.with_counts(a)))
    }

    async fn add_account(&self, account: &AccountState) -> Result<AccountId> {
        let id = {
            let mut inner = self.lock();
            let id = AccountId::new(inner.next_id());
            let mut account = account.clone();
            account.id = id;
            inner.accounts.insert(id, account);
            id
        };
        self.accounts_changed();
        Ok(id)
    }

    async fn update_account(&self, account: &AccountState) -> Result<()> {
        {
            let mut inner = self.lock();
            let stored = inner.account_mut(account.id)?;
            stored.name.clone_from(&account.name);
            stored.email.clone_from(&account.email);
            stored.imap = account.imap.clone();
            stored.synchronize = account.synchronize;
            stored.ondemand = account.ondemand;
            stored.poll_exempted = account.poll_exempted;
            stored.keep_alive = account.keep_alive;
        }
        self.accounts_changed();
        Ok(())
    }

    async fn mark_account_deleted(&self, id: AccountId) -> Result<()> {
        self.lock().account_mut(id)?.tbd = true;
        self.accounts_changed();
        Ok(())
    }

    async fn delete_account(&self, id: AccountId) -> Result<()> {
        {
            let mut inner = self.lock();
            inner.accounts.remove(&id);
            inner.folders.retain(|_, f| f.account != id);
            inner.operations.retain(|_, op| op.account != id);
            inner.messages.retain(|_, m| m.account != id);
        }
        self.operations_changed();
        Ok(())
    }

    async fn reset_account(&self, id: AccountId) -> Result<()> {
        {
            let mut inner = self.lock();
            let account = inner.account_mut(id)?;
            account.state = None;
            account.backoff_until = None;
            for folder in inner.folders.values_mut().filter(|f| f.account == id) {
                folder.state = None;
                folder.poll_count = 0;
            }
            for op in inner.operations.values_mut().filter(|op| op.account == id) {
                op.error = None;
            }
        }
        self.accounts_changed();
        Ok(())
    }

    async fn set_account_state(
        &self,
        id: AccountId,
        state: Option<ConnectionState>,
    ) -> Result<()> {
        self.lock().account_mut(id)?.state = state;
        Ok(())
    }

    async fn set_account_connected(&self, id: AccountId, at: DateTime<Utc>) -> Result<()> {
        self.lock().account_mut(id)?.last_connected = Some(at);
        Ok(())
    }

    async fn set_account_backoff(
        &self,
        id: AccountId,
        until: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.lock().account_mut(id)?.backoff_until = until;
        Ok(())
    }

    async fn set_account_error(&self, id: AccountId, error: Option<&str>) -> Result<()> {
        self.lock().account_mut(id)?.error = error.map(str::to_string);
        Ok(())
    }

    async fn set_account_warning(&self, id: AccountId, warning: Option<&str>) -> Result<()> {
        self.lock().account_mut(id)?.warning = warning.map(str::to_string);
        Ok(())
    }

    async fn set_account_capabilities(
        &self,
        id: AccountId,
        capabilities: Capabilities,
    ) -> Result<()> {
        self.lock().account_mut(id)?.capabilities = capabilities;
        Ok(())
    }

    async fn set_account_keep_alive(&self, id: AccountId, keep_alive: KeepAlive) -> Result<()> {
        self.lock().account_mut(id)?.keep_alive = keep_alive;
        Ok(())
    }

    async fn set_account_quota(&self, id: AccountId, quota: Option<Quota>) -> Result<()> {
        self.lock().account_mut(id)?.quota = quota;
        Ok(())
    }

    async fn folders(&self, account: AccountId) -> Result<Vec<FolderState>> {
        Ok(self
            .lock()
            .folders
            .values()
            .filter(|f| f.account == account)
            .cloned()
            .collect())
    }

    async fn folder(&self, id: FolderId) -> Result<Option<FolderState>> {
        Ok(self.lock().folders.get(&id).cloned())
    }

    async fn add_folder(&self, folder: &FolderState) -> Result<FolderId> {
        let id = {
            let mut inner = self.lock();
            if !inner.accounts.contains_key(&folder.account) {
                return Err(Error::AccountNotFound(folder.account));
            }
            let id = FolderId::new(inner.next_id());
            let mut folder = folder.clone();
            folder.id = id;
            inner.folders.insert(id, folder);
            id
        };
        self.accounts_changed();
        Ok(id)
    }

    async fn set_folder_state(&self, id: FolderId, state: Option<ConnectionState>) -> Result<()> {
        self.lock().folder_mut(id)?.state = state;
        Ok(())
    }

    async fn set_folder_states(
        &self,
        account: AccountId,
        state: Option<ConnectionState>,
    ) -> Result<()> {
        for folder in self
            .lock()
            .folders
            .values_mut()
            .filter(|f| f.account == account)
        {
            folder.state = state;
        }
        Ok(())
    }

    async fn set_folder_read_only(&self, id: FolderId, read_only: bool) -> Result<()> {
        self.lock().folder_mut(id)?.read_only = read_only;
        Ok(())
    }

    async fn set_folder_error(&self, id: FolderId, error: Option<&str>) -> Result<()> {
        self.lock().folder_mut(id)?.error = error.map(str::to_string);
        Ok(())
    }

    async fn set_folder_poll(&self, id: FolderId, poll: bool) -> Result<()> {
        self.lock().folder_mut(id)?.poll = poll;
        Ok(())
    }

    async fn set_folder_poll_count(&self, id: FolderId, count: u32) -> Result<()> {
        self.lock().folder_mut(id)?.poll_count = count;
        Ok(())
    }

    async fn set_folder_synchronize(&self, id: FolderId, synchronize: bool) -> Result<()> {
        self.lock().folder_mut(id)?.synchronize = synchronize;
        self.accounts_changed();
        Ok(())
    }

    async fn enqueue_operation(
        &self,
        operation: &NewOperation,
        force: bool,
    ) -> Result<Option<OperationId>> {
        let id = {
            let mut inner = self.lock();
            let duplicate = inner.operations.values().any(|op| {
                op.folder == operation.folder
                    && op.kind == operation.kind
                    && op.payload == operation.payload
            });
            if duplicate && !force {
                return Ok(None);
            }

            let id = OperationId(inner.next_id());
            inner.operations.insert(
                id,
                Operation {
                    id,
                    account: operation.account,
                    folder: operation.folder,
                    kind: operation.kind,
                    priority: operation.priority,
                    payload: operation.payload.clone(),
                    created: Utc::now(),
                    tries: 0,
                    error: None,
                },
            );
            *inner.enqueued.entry(operation.kind).or_default() += 1;
            id
        };
        self.operations_changed();
        Ok(Some(id))
    }

    async fn pending_operations(&self, account: AccountId) -> Result<Vec<Operation>> {
        Ok(self
            .lock()
            .operations
            .values()
            .filter(|op| op.account == account)
            .cloned()
            .collect())
    }

    async fn operations(
        &self,
        folder: FolderId,
        kind: Option<OperationKind>,
    ) -> Result<Vec<Operation>> {
        Ok(self
            .lock()
            .operations
            .values()
            .filter(|op| op.folder == folder && kind.is_none_or(|k| op.kind == k))
            .cloned()
            .collect())
    }

    async fn account_operations(
        &self,
        account: AccountId,
        kind: OperationKind,
    ) -> Result<Vec<Operation>> {
        Ok(self
            .lock()
            .operations
            .values()
            .filter(|op| op.account == account && op.kind == kind)
            .cloned()
            .collect())
    }

    async fn delete_operation(&self, id: OperationId) -> Result<bool> {
        let removed = self.lock().operations.remove(&id).is_some();
        if removed {
            self.operations_changed();
        }
        Ok(removed)
    }

    async fn set_operation_error(&self, id: OperationId, error: &str) -> Result<()> {
        if let Some(op) = self.lock().operations.get_mut(&id) {
            op.tries += 1;
            op.error = Some(error.to_string());
        }
        Ok(())
    }

    fn watch_operations(&self) -> watch::Receiver<u64> {
        self.operations_tx.subscribe()
    }

    fn watch_accounts(&self) -> watch::Receiver<u64> {
        self.accounts_tx.subscribe()
    }

    async fn messages_by_msgid(
        &self,
        account: AccountId,
        msgids: &[String],
    ) -> Result<Vec<ThreadInfo>> {
        Ok(self
            .lock()
            .messages
            .values()
            .filter(|m| m.account == account && msgids.contains(&m.msgid))
            .cloned()
            .collect())
    }

    async fn messages_referencing(
        &self,
        account: AccountId,
        msgid: &str,
    ) -> Result<Vec<ThreadInfo>> {
        Ok(self
            .lock()
            .messages
            .values()
            .filter(|m| {
                m.account == account
                    && (m.in_reply_to.as_deref() == Some(msgid)
                        || m.references.iter().any(|r| r == msgid))
            })
            .cloned()
            .collect())
    }

    async fn messages_by_subject(
        &self,
        account: AccountId,
        sender: &str,
        subject: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ThreadInfo>> {
        Ok(self
            .lock()
            .messages
            .values()
            .filter(|m| {
                m.account == account
                    && m.received >= since
                    && m.sender.as_deref() == Some(sender)
                    && m.subject.as_deref().map(normalize_subject).as_deref() == Some(subject)
            })
            .cloned()
            .collect())
    }

    async fn message(&self, folder: FolderId, uid: u32) -> Result<Option<ThreadInfo>> {
        Ok(self
            .lock()
            .messages
            .values()
            .find(|m| m.folder == folder && m.uid == uid)
            .cloned())
    }

    async fn message_uids(&self, folder: FolderId) -> Result<Vec<u32>> {
        Ok(self
            .lock()
            .messages
            .values()
            .filter(|m| m.folder == folder)
            .map(|m| m.uid)
            .collect())
    }

    async fn store_message(
        &self,
        message: &NewMessage,
        merges: &[ThreadMerge],
    ) -> Result<MessageId> {
        let mut inner = self.lock();
        let existing = inner
            .messages
            .values()
            .find(|m| m.folder == message.folder && m.uid == message.uid)
            .map(|m| m.id);
        let id = match existing {
            Some(id) => id,
            None => MessageId(inner.next_id()),
        };
        inner.messages.insert(
            id,
            ThreadInfo {
                id,
                account: message.account,
                folder: message.folder,
                uid: message.uid,
                msgid: message.msgid.clone(),
                references: message.references.clone(),
                in_reply_to: message.in_reply_to.clone(),
                hash: message.hash.clone(),
                thread: message.thread.clone(),
                sender: message.sender.clone(),
                subject: message.subject.clone(),
                received: message.received,
            },
        );
        for merge in merges {
            inner.rethread(message.account, &merge.from, &merge.to, merge.since);
        }
        Ok(id)
    }

    async fn update_message_thread(
        &self,
        account: AccountId,
        old: &str,
        new: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<u64> {
        Ok(self.lock().rethread(account, old, new, since))
    }

    async fn delete_message(&self, folder: FolderId, uid: u32) -> Result<bool> {
        let mut inner = self.lock();
        let before = inner.messages.len();
        inner
            .messages
            .retain(|_, m| !(m.folder == folder && m.uid == uid));
        Ok(inner.messages.len() != before)
    }

    async fn save_status(&self, status: EngineStatus) -> Result<()> {
        self.lock().status = status;
        Ok(())
    }

    async fn status(&self) -> Result<EngineStatus> {
        Ok(self.lock().status)
    }
}
