//! Per-account operation scheduling.
//!
//! The dispatcher follows the store's operation feed. Every pending operation
//! not yet handled is offered to a [`PartitionQueue`]; partitions are handed to
//! a bounded pool ordered by priority and insertion. Executions capture the
//! connection serial at dispatch and become no-ops once it moves on.
//! Operations a partition did not finish are released when it completes and
//! offered again on the next pass.

mod queue;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::context::EngineContext;
use crate::model::{
    AccountId, FolderId, NewOperation, Operation, OperationId, OperationKind, PartitionKey,
};
use crate::threading::ThreadResolver;
use crate::transport::{MailFolder, OpenMode, Session, TransportError};
use crate::worker::WorkerState;
use crate::{Error, Result};

pub use queue::PartitionQueue;

/// Folders held open by watchers, keyed by folder id.
pub type OpenFolders = Arc<RwLock<HashMap<FolderId, Arc<dyn MailFolder>>>>;

/// Executes the queued operations of one connected account.
pub struct OperationScheduler {
    ctx: EngineContext,
    account: AccountId,
    session: Arc<dyn Session>,
    folders: OpenFolders,
    state: Arc<WorkerState>,
    resolver: Arc<ThreadResolver>,
}

/// Running scheduler; stop it before closing the session.
#[derive(Debug)]
pub struct SchedulerHandle {
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stop dispatching and wait for the dispatcher to exit. Partitions
    /// already executing finish on their own against a stale serial.
    pub async fn stop(self) {
        let _ = self.cancel.send(true);
        if let Err(e) = self.task.await {
            warn!("Scheduler task failed: {e}");
        }
    }
}

impl OperationScheduler {
    /// Create a scheduler for a connected session.
    #[must_use]
    pub fn new(
        ctx: EngineContext,
        session: Arc<dyn Session>,
        folders: OpenFolders,
        state: Arc<WorkerState>,
        resolver: Arc<ThreadResolver>,
    ) -> Self {
        Self {
            ctx,
            account: state.account(),
            session,
            folders,
            state,
            resolver,
        }
    }

    /// Spawn the dispatcher.
    #[must_use]
    pub fn start(self) -> SchedulerHandle {
        let (cancel, cancelled) = watch::channel(false);
        let task = tokio::spawn(Arc::new(self).run(cancelled));
        SchedulerHandle { cancel, task }
    }

    async fn run(self: Arc<Self>, mut cancelled: watch::Receiver<bool>) {
        let config = self.ctx.config.scheduler;
        let mut feed = self.ctx.store.watch_operations();
        let pool = Arc::new(Semaphore::new(config.pool_size.max(1)));
        let mut running: JoinSet<(PartitionKey, Vec<OperationId>)> = JoinSet::new();
        let mut queue = PartitionQueue::new();
        let mut handling: HashSet<_> = HashSet::new();
        let mut purge_at: Option<Instant> = None;
        let mut purged = false;
        let mut changed = true;

        debug!(account = %self.account, "Scheduler started");
        loop {
            if changed {
                changed = false;
                feed.mark_unchanged();
                match self.ctx.store.pending_operations(self.account).await {
                    Ok(pending) => {
                        let ids: HashSet<_> = pending.iter().map(|op| op.id).collect();
                        handling.retain(|id| ids.contains(id));
                        let open = self.folders.read().await;
                        for op in pending {
                            if handling.insert(op.id) {
                                let offline = !open.contains_key(&op.folder);
                                queue.offer(op, offline);
                            }
                        }
                    }
                    Err(e) => warn!(account = %self.account, "Failed to load operations: {e}"),
                }
            }

            while let Ok(permit) = Arc::clone(&pool).try_acquire_owned() {
                let Some((key, operations)) = queue.next() else {
                    break;
                };
                let serial = self.state.serial();
                let this = Arc::clone(&self);
                running.spawn(async move {
                    let unfinished = this.execute(key, operations, serial).await;
                    drop(permit);
                    (key, unfinished)
                });
            }

            if handling.is_empty() && queue.is_idle() {
                if purge_at.is_none() && !purged && config.empty_pool {
                    purge_at = Some(Instant::now() + Duration::from_secs(config.purge_delay));
                }
            } else {
                purge_at = None;
                purged = false;
            }

            tokio::select! {
                _ = cancelled.changed() => break,
                result = feed.changed() => {
                    if result.is_err() {
                        break;
                    }
                    changed = true;
                }
                Some(done) = running.join_next() => match done {
                    Ok((key, unfinished)) => {
                        queue.complete(key);
                        for id in &unfinished {
                            handling.remove(id);
                        }
                    }
                    Err(e) => warn!(account = %self.account, "Partition task failed: {e}"),
                },
                () = sleep_until(purge_at), if purge_at.is_some() => {
                    purge_at = None;
                    purged = true;
                    debug!(account = %self.account, "Emptying connection pool");
                    if let Err(e) = self.session.empty_pool().await {
                        debug!(account = %self.account, "Emptying pool failed: {e}");
                    }
                }
            }
        }

        running.detach_all();
        debug!(account = %self.account, "Scheduler stopped");
    }

    /// Execute one partition, returning the operations left queued.
    async fn execute(
        &self,
        key: PartitionKey,
        operations: Vec<Operation>,
        serial: u64,
    ) -> Vec<OperationId> {
        let all = || -> Vec<OperationId> { operations.iter().map(|op| op.id).collect() };
        if let Err(e) = self.state.ensure_current(serial) {
            debug!(account = %self.account, partition = %key, "Skipping partition: {e}");
            return all();
        }

        let (folder, transient) = match self.folder_for(key).await {
            Ok(Some(found)) => found,
            Ok(None) => return all(),
            Err(e) => {
                if let Some(first) = operations.first() {
                    self.failed(first, &e).await;
                }
                return all();
            }
        };

        debug!(
            account = %self.account,
            partition = %key,
            count = operations.len(),
            "Executing partition"
        );
        let mut done = 0;
        for op in &operations {
            if self.state.ensure_current(serial).is_err() {
                break;
            }
            match self.process(op, folder.as_ref()).await {
                Ok(()) => {
                    if let Err(e) = self.ctx.store.delete_operation(op.id).await {
                        warn!(operation = %op.id, "Failed to delete operation: {e}");
                    }
                    done += 1;
                }
                Err(e) => {
                    self.failed(op, &e).await;
                    break;
                }
            }
        }

        if transient && let Err(e) = folder.close().await {
            debug!(account = %self.account, folder = folder.name(), "Close failed: {e}");
        }
        operations[done..].iter().map(|op| op.id).collect()
    }

    /// The folder to run a partition against, opening it when it is not
    /// watched. `None` when there is nothing left to do.
    async fn folder_for(&self, key: PartitionKey) -> Result<Option<(Arc<dyn MailFolder>, bool)>> {
        if !key.offline
            && let Some(open) = self.folders.read().await.get(&key.folder)
        {
            return Ok(Some((Arc::clone(open), false)));
        }

        if self.ctx.store.operations(key.folder, None).await?.is_empty() {
            return Ok(None);
        }
        let folder = self
            .ctx
            .store
            .folder(key.folder)
            .await?
            .ok_or_else(|| Error::FolderNotFound(key.folder.to_string()))?;

        let opened = match self
            .session
            .open_folder(&folder.name, OpenMode::ReadWrite)
            .await
        {
            Err(TransportError::ReadOnlyFolder(_)) => {
                self.ctx.store.set_folder_read_only(folder.id, true).await?;
                self.session
                    .open_folder(&folder.name, OpenMode::ReadOnly)
                    .await?
            }
            other => other?,
        };
        Ok(Some((opened, true)))
    }

    async fn process(&self, op: &Operation, folder: &dyn MailFolder) -> Result<()> {
        match op.kind {
            OperationKind::Fetch => self.fetch(op, folder).await,
            OperationKind::Sync => self.sync(op, folder).await,
            _ => Ok(folder.apply(op).await?),
        }
    }

    async fn fetch(&self, op: &Operation, folder: &dyn MailFolder) -> Result<()> {
        let target = op.fetch_target()?;
        if target.removed {
            self.ctx.store.delete_message(op.folder, target.uid).await?;
            return Ok(());
        }

        let messages = folder.fetch_messages(&[target.uid]).await?;
        if messages.is_empty() {
            debug!(folder = folder.name(), uid = target.uid, "Message gone before fetch");
            self.ctx.store.delete_message(op.folder, target.uid).await?;
        }
        for message in &messages {
            self.resolver.store(self.account, op.folder, message).await?;
        }
        Ok(())
    }

    async fn sync(&self, op: &Operation, folder: &dyn MailFolder) -> Result<()> {
        let remote: HashSet<u32> = folder.uids().await?.into_iter().collect();
        let local: HashSet<u32> = self
            .ctx
            .store
            .message_uids(op.folder)
            .await?
            .into_iter()
            .collect();

        let mut added: Vec<_> = remote.difference(&local).copied().collect();
        added.sort_unstable();
        for uid in &added {
            self.ctx
                .store
                .enqueue_operation(&NewOperation::fetch(self.account, op.folder, *uid, false), false)
                .await?;
        }
        let mut removed = 0;
        for uid in local.difference(&remote) {
            if self.ctx.store.delete_message(op.folder, *uid).await? {
                removed += 1;
            }
        }

        info!(
            account = %self.account,
            folder = folder.name(),
            added = added.len(),
            removed,
            "Folder synchronized"
        );
        Ok(())
    }

    async fn failed(&self, op: &Operation, error: &Error) {
        warn!(
            account = %self.account,
            operation = %op.id,
            kind = op.kind.as_str(),
            tries = op.tries + 1,
            "Operation failed: {error}"
        );
        if let Err(e) = self
            .ctx
            .store
            .set_operation_error(op.id, &error.to_string())
            .await
        {
            warn!(operation = %op.id, "Failed to record operation error: {e}");
        }

        if error.is_folder_not_found() {
            if let Err(e) = self.ctx.store.delete_operation(op.id).await {
                warn!(operation = %op.id, "Failed to delete operation: {e}");
            }
            if let Err(e) = self.ctx.store.set_folder_synchronize(op.folder, false).await {
                debug!(folder = %op.folder, "Failed to disable folder: {e}");
            }
        } else {
            self.state.error(error);
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
