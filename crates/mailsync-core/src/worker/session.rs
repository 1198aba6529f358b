//! The connected phase of an account worker: folder watchers, operation
//! scheduling and the keep-alive loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{AccountWorker, Progress, WorkerPhase, WorkerState, events};
use crate::keepalive::KeepAliveTuner;
use crate::model::{
    AccountState, Capabilities, ConnectionState, FolderState, NewOperation, sort_folders,
};
use crate::scheduler::{OpenFolders, OperationScheduler, SchedulerHandle};
use crate::transport::{MailFolder, OpenMode, Session, TransportError, TransportEvent};
use crate::{Error, Result};

/// Warning shown while the server cannot push changes.
const NO_IDLE: &str = "Server does not support IDLE, polling instead";

/// Everything a live session owns. Released by [`AccountWorker::teardown`].
pub(super) struct Connection {
    session: Arc<dyn Session>,
    open: OpenFolders,
    watched: Vec<FolderState>,
    polled: Vec<FolderState>,
    tasks: JoinSet<()>,
    dispatcher: Option<JoinHandle<()>>,
    scheduler: Option<SchedulerHandle>,
    cancel: watch::Sender<bool>,
}

impl Connection {
    fn new(session: Arc<dyn Session>) -> Self {
        Self {
            session,
            open: OpenFolders::default(),
            watched: Vec::new(),
            polled: Vec::new(),
            tasks: JoinSet::new(),
            dispatcher: None,
            scheduler: None,
            cancel: watch::channel(false).0,
        }
    }
}

impl AccountWorker {
    /// Connect, serve until stopped or failed, and tear down. `Ok` means the
    /// worker was stopped.
    pub(super) async fn connection(
        &self,
        account: &mut AccountState,
        progress: &mut Progress,
    ) -> Result<()> {
        let id = account.id;
        self.state.set_phase(WorkerPhase::Connecting);
        self.ctx.store.set_folder_states(id, None).await?;
        self.ctx
            .store
            .set_account_state(id, Some(ConnectionState::Connecting))
            .await?;
        info!(account = %id, host = %account.imap.host, "Connecting");

        let (events_tx, events_rx) = mpsc::channel(self.ctx.config.scheduler.event_capacity);
        let session = self.ctx.connector.connect(account, events_tx).await?;

        let mut connection = Connection::new(session);
        let result = self
            .serve(account, progress, &mut connection, events_rx)
            .await;
        self.teardown(account, connection).await;
        result
    }

    async fn serve(
        &self,
        account: &mut AccountState,
        progress: &mut Progress,
        connection: &mut Connection,
        events: mpsc::Receiver<TransportEvent>,
    ) -> Result<()> {
        let id = account.id;
        let store = &self.ctx.store;
        let session = Arc::clone(&connection.session);

        let capabilities = Capabilities {
            idle: session.has_capability("IDLE"),
            utf8: session.has_capability("UTF8=ACCEPT") || session.has_capability("UTF8=ONLY"),
        };
        let tuner = KeepAliveTuner::new(self.ctx.config.keep_alive);
        if tuner.optimize(&mut account.keep_alive, capabilities.idle) {
            store.set_account_keep_alive(id, account.keep_alive).await?;
        }

        self.state.set_phase(WorkerPhase::Connected);
        store
            .set_account_state(id, Some(ConnectionState::Connected))
            .await?;
        store.set_account_capabilities(id, capabilities).await?;
        store.set_account_error(id, None).await?;
        store.set_account_warning(id, None).await?;
        info!(account = %id, idle = capabilities.idle, utf8 = capabilities.utf8, "Connected");

        match session.quota().await {
            Ok(quota) => store.set_account_quota(id, quota).await?,
            Err(e) => debug!(account = %id, "Quota unavailable: {e}"),
        }

        let sync = self.options.sync;
        let mut folders = store.folders(id).await?;
        sort_folders(&mut folders);
        let names: HashMap<_, _> = folders.iter().map(|f| (f.name.clone(), f.id)).collect();

        for mut folder in folders.into_iter().filter(FolderState::is_synchronized) {
            if !folder.poll && capabilities.idle && sync {
                let Some(opened) = self.open_watched(&session, &mut folder).await? else {
                    continue;
                };
                connection.open.write().await.insert(folder.id, Arc::clone(&opened));
                connection.tasks.spawn(watch_folder(
                    Arc::clone(&self.state),
                    opened,
                    connection.cancel.subscribe(),
                ));
                store
                    .enqueue_operation(&NewOperation::sync(id, folder.id), progress.force)
                    .await?;
                connection.watched.push(folder);
            } else {
                store.set_folder_state(folder.id, None).await?;
                if !capabilities.idle && !folder.poll {
                    folder.poll = true;
                    store.set_folder_poll(folder.id, true).await?;
                }
                connection.polled.push(folder);
            }
        }
        progress.force = false;

        connection.dispatcher = Some(tokio::spawn(events::dispatch(
            self.ctx.clone(),
            Arc::clone(&self.state),
            names,
            events,
            connection.cancel.subscribe(),
        )));
        connection.scheduler = Some(
            OperationScheduler::new(
                self.ctx.clone(),
                Arc::clone(&session),
                Arc::clone(&connection.open),
                Arc::clone(&self.state),
                Arc::clone(&self.resolver),
            )
            .start(),
        );

        let mut first = true;
        while self.state.is_running() {
            let idle_time = self.state.idle_time();
            let tune = tuner.should_tune(&account.keep_alive, first, idle_time);
            debug!(
                account = %id,
                interval = account.keep_alive.interval,
                idle = idle_time.as_secs(),
                tune,
                "Keep-alive"
            );

            if let Err(e) = self.check(connection, sync, capabilities.idle).await {
                if tune {
                    tuner.record_failure(&mut account.keep_alive);
                    store.set_account_keep_alive(id, account.keep_alive).await?;
                }
                return Err(e);
            }
            if tune {
                tuner.record_success(&mut account.keep_alive);
                store.set_account_keep_alive(id, account.keep_alive).await?;
            }

            progress.backoff.reset();
            progress.connected_at = Some(Instant::now());
            let now = Utc::now();
            progress.last_connected = Some(now);
            store.set_account_connected(id, now).await?;
            store
                .set_account_warning(id, (!capabilities.idle).then_some(NO_IDLE))
                .await?;
            self.clear_alerts();

            let interval = Duration::from_secs(u64::from(account.keep_alive.interval) * 60);
            let _alarm = self
                .ctx
                .alarms
                .schedule(Instant::now() + interval, self.state.wake_signal());
            self.state.wait(interval * 2).await;
            first = false;
        }
        Ok(())
    }

    /// Open a folder for watching. `None` when the folder is skipped.
    async fn open_watched(
        &self,
        session: &Arc<dyn Session>,
        folder: &mut FolderState,
    ) -> Result<Option<Arc<dyn MailFolder>>> {
        let store = &self.ctx.store;
        store
            .set_folder_state(folder.id, Some(ConnectionState::Connecting))
            .await?;

        let opened = match session.open_folder(&folder.name, OpenMode::ReadWrite).await {
            Ok(opened) => Ok(opened),
            Err(TransportError::ReadOnlyFolder(_)) => {
                warn!(folder = %folder.name, "Folder is read-only");
                session.open_folder(&folder.name, OpenMode::ReadOnly).await
            }
            Err(e) => Err(e),
        };

        match opened {
            Ok(opened) => {
                folder.read_only = opened.read_only();
                folder.state = Some(ConnectionState::Connected);
                store.set_folder_read_only(folder.id, folder.read_only).await?;
                store
                    .set_folder_state(folder.id, Some(ConnectionState::Connected))
                    .await?;
                store.set_folder_error(folder.id, None).await?;
                debug!(folder = %folder.name, read_only = folder.read_only, "Folder opened");
                Ok(Some(opened))
            }
            Err(e) => {
                store.set_folder_state(folder.id, None).await?;
                store.set_folder_error(folder.id, Some(&e.to_string())).await?;
                if matches!(e, TransportError::FolderNotFound(_)) {
                    warn!(folder = %folder.name, "Folder not found, disabling");
                    store.set_folder_synchronize(folder.id, false).await?;
                    Ok(None)
                } else if folder.is_inbox() {
                    Err(e.into())
                } else {
                    warn!(folder = %folder.name, "Skipping folder: {e}");
                    Ok(None)
                }
            }
        }
    }

    /// Verify the session and its folders, queueing polls that are due.
    async fn check(&self, connection: &mut Connection, sync: bool, idle: bool) -> Result<()> {
        if let Some(cause) = self.state.unrecoverable() {
            return Err(Error::Unrecoverable(cause));
        }
        connection.session.noop().await?;
        if !sync {
            return Ok(());
        }

        if idle {
            let open = connection.open.read().await;
            for folder in &connection.watched {
                if !open.get(&folder.id).is_some_and(|f| f.is_open()) {
                    return Err(Error::Unrecoverable(format!("Folder closed: {}", folder.name)));
                }
            }
        }

        for folder in &mut connection.polled {
            if !folder.is_synchronized() {
                continue;
            }
            if folder.poll_count == 0 {
                debug!(folder = %folder.name, "Queueing poll");
                self.ctx
                    .store
                    .enqueue_operation(&NewOperation::sync(folder.account, folder.id), false)
                    .await?;
            }
            folder.poll_count = (folder.poll_count + 1) % folder.poll_factor.max(1);
            self.ctx
                .store
                .set_folder_poll_count(folder.id, folder.poll_count)
                .await?;
        }
        Ok(())
    }

    /// Stop everything the session started and close it.
    async fn teardown(&self, account: &AccountState, mut connection: Connection) {
        let id = account.id;
        let store = &self.ctx.store;
        debug!(account = %id, "Closing");

        let _ = connection.cancel.send(true);
        if let Some(scheduler) = connection.scheduler.take() {
            scheduler.stop().await;
        }
        self.state.next_serial();
        self.state.set_phase(WorkerPhase::Closing);

        if let Err(e) = store
            .set_account_state(id, Some(ConnectionState::Closing))
            .await
        {
            debug!(account = %id, "Failed to record closing: {e}");
        }
        for folder in &connection.watched {
            if let Err(e) = store
                .set_folder_state(folder.id, Some(ConnectionState::Closing))
                .await
            {
                debug!(folder = %folder.name, "Failed to record closing: {e}");
            }
        }
        if let Err(e) = connection.session.close().await {
            debug!(account = %id, "Close failed: {e}");
        }
        if let Err(e) = store.set_account_state(id, None).await {
            warn!(account = %id, "Failed to clear account state: {e}");
        }
        if let Err(e) = store.set_folder_states(id, None).await {
            warn!(account = %id, "Failed to clear folder states: {e}");
        }
        connection.open.write().await.clear();

        if let Some(dispatcher) = connection.dispatcher.take() {
            connection.tasks.spawn(async move {
                let _ = dispatcher.await;
            });
        }
        let timeout = Duration::from_secs(self.ctx.config.supervisor.join_timeout);
        let joined = tokio::time::timeout(timeout, async {
            while connection.tasks.join_next().await.is_some() {}
        })
        .await;
        if joined.is_err() {
            warn!(account = %id, "Watchers did not stop in time");
            connection.tasks.detach_all();
        }
        info!(account = %id, "Closed");
    }
}

/// Re-enter IDLE on a folder until it closes, the account stops or fails, or
/// the session is torn down.
async fn watch_folder(
    state: Arc<WorkerState>,
    folder: Arc<dyn MailFolder>,
    mut cancelled: watch::Receiver<bool>,
) {
    debug!(folder = folder.name(), "Watching");
    while folder.is_open() && state.is_running() && state.is_recoverable() {
        tokio::select! {
            _ = cancelled.changed() => break,
            result = folder.idle_wait() => {
                if let Err(e) = result {
                    if !*cancelled.borrow() {
                        state.error(&Error::Unrecoverable(format!("IDLE {}: {e}", folder.name())));
                    }
                    break;
                }
            }
        }
    }
    debug!(folder = folder.name(), "Watcher stopped");
}
