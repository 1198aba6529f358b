//! Account supervision.
//!
//! A single control task owns every [`WorkerHandle`]. Account-list changes,
//! network changes, commands and timer ticks are folded through the
//! [`Reducer`] in arrival order, and the resulting decisions are applied
//! before the next input is read.

mod reducer;

use std::collections::HashMap;
use std::time::Duration;

use chrono::Local;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::context::EngineContext;
use crate::display::EngineStatus;
use crate::model::{AccountId, NetworkState, NewOperation};
use crate::worker::{AccountWorker, WorkerHandle, WorkerPhase};
use crate::{Error, Result};

pub use reducer::{Command, Decision, Evaluation, Reducer, SupervisorEvent};

const TICK: Duration = Duration::from_secs(60);
const REFRESH: Duration = Duration::from_secs(1);

/// Handle to the supervisor task.
#[derive(Debug)]
pub struct AccountSupervisor {
    events: mpsc::Sender<SupervisorEvent>,
    quiescent: watch::Receiver<bool>,
    task: JoinHandle<()>,
}

impl AccountSupervisor {
    /// Start supervising the accounts in `ctx.store`.
    #[must_use]
    pub fn spawn(ctx: EngineContext, network: NetworkState) -> Self {
        let (events_tx, events_rx) = mpsc::channel(ctx.config.supervisor.command_capacity);
        let (quiescent_tx, quiescent_rx) = watch::channel(false);
        let control = Control {
            reducer: Reducer::new(&ctx.config, network),
            ctx,
            workers: HashMap::new(),
            status: None,
            operations: 0,
            quit_at: None,
            quiescent: quiescent_tx,
        };
        let task = tokio::spawn(control.run(events_rx));
        Self {
            events: events_tx,
            quiescent: quiescent_rx,
            task,
        }
    }

    /// Submit a command.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Stopped`] once the supervisor has exited.
    pub async fn send(&self, command: Command) -> Result<()> {
        self.submit(SupervisorEvent::Command(command)).await
    }

    /// Report a new network snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Stopped`] once the supervisor has exited.
    pub async fn set_network(&self, network: NetworkState) -> Result<()> {
        self.submit(SupervisorEvent::NetworkChanged(network)).await
    }

    async fn submit(&self, event: SupervisorEvent) -> Result<()> {
        self.events.send(event).await.map_err(|_| Error::Stopped)
    }

    /// Flips to `true` once nothing has run for the quiescence delay, and
    /// back to `false` when a worker starts again.
    #[must_use]
    pub fn quiescent(&self) -> watch::Receiver<bool> {
        self.quiescent.clone()
    }

    /// Stop every worker and wait for the control task to exit.
    pub async fn shutdown(self) {
        drop(self.events);
        if let Err(e) = self.task.await {
            warn!("Supervisor task failed: {e}");
        }
    }
}

struct Control {
    ctx: EngineContext,
    reducer: Reducer,
    workers: HashMap<AccountId, WorkerHandle>,
    status: Option<EngineStatus>,
    operations: u32,
    quit_at: Option<Instant>,
    quiescent: watch::Sender<bool>,
}

impl Control {
    async fn run(mut self, mut events: mpsc::Receiver<SupervisorEvent>) {
        info!("Supervisor started");
        let mut accounts = self.ctx.store.watch_accounts();
        accounts.mark_changed();

        let mut minute = every(TICK);
        let mut refresh = every(REFRESH);
        let mut poll = (self.ctx.config.poll_interval > 0).then(|| {
            every(Duration::from_secs(
                u64::from(self.ctx.config.poll_interval) * 60,
            ))
        });

        loop {
            let event = tokio::select! {
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
                Ok(()) = accounts.changed() => {
                    accounts.mark_unchanged();
                    match self.ctx.store.accounts().await {
                        Ok(accounts) => SupervisorEvent::AccountsChanged(accounts),
                        Err(e) => {
                            warn!("Failed to load accounts: {e}");
                            continue;
                        }
                    }
                }
                _ = minute.tick() => SupervisorEvent::Tick,
                _ = refresh.tick() => {
                    self.publish().await;
                    continue;
                }
                () = next_tick(poll.as_mut()) => {
                    self.poll().await;
                    continue;
                }
                () = sleep_until(self.quit_at) => {
                    self.quit_at = None;
                    info!("Nothing to run, quiescent");
                    self.quiescent.send_replace(true);
                    continue;
                }
            };
            self.handle(event).await;
        }

        self.stop_all().await;
        info!("Supervisor stopped");
    }

    async fn handle(&mut self, event: SupervisorEvent) {
        let network_changed = matches!(event, SupervisorEvent::NetworkChanged(_));
        let evaluation = self.reducer.apply(event, Local::now().time());

        for decision in evaluation.decisions {
            self.apply(decision).await;
        }
        if network_changed {
            for handle in self.workers.values() {
                handle.set_network(self.reducer.network().clone());
            }
        }

        if evaluation.changed {
            if self.quit_at.take().is_some() {
                debug!("Shutdown cancelled");
            }
            self.quiescent.send_if_modified(|quiescent| {
                std::mem::replace(quiescent, false)
            });
        }
        if evaluation.quit {
            let delay = Duration::from_secs(self.ctx.config.supervisor.quit_delay);
            debug!(delay = delay.as_secs(), "Scheduling shutdown");
            self.quit_at = Some(Instant::now() + delay);
        }

        self.operations = evaluation.operations;
        self.publish().await;
    }

    async fn apply(&mut self, decision: Decision) {
        match decision {
            Decision::Init(id) => {
                if let Err(e) = self.ctx.store.reset_account(id).await {
                    warn!(account = %id, "Failed to reset account: {e}");
                }
            }
            Decision::Start { account, options } => {
                if let Some(previous) = self.workers.remove(&account.id) {
                    previous.stop(self.join_timeout()).await;
                }
                info!(
                    account = %account.id,
                    sync = options.sync,
                    force = options.force,
                    "Starting"
                );
                let handle = AccountWorker::spawn(
                    self.ctx.clone(),
                    &account,
                    self.reducer.network().clone(),
                    options,
                );
                self.workers.insert(account.id, handle);
            }
            Decision::Stop(id) => self.stop(id).await,
            Decision::Reconnect(id) => {
                if let Some(handle) = self.workers.get(&id) {
                    info!(account = %id, "Active network changed, reconnecting");
                    handle.reconnect("Active network changed");
                }
            }
            Decision::Wake(id) => {
                if let Some(handle) = self.workers.get(&id) {
                    handle.wake();
                }
            }
            Decision::Delete(id) => {
                self.stop(id).await;
                info!(account = %id, "Deleting account");
                if let Err(e) = self.ctx.store.delete_account(id).await {
                    warn!(account = %id, "Failed to delete account: {e}");
                }
            }
        }
    }

    async fn stop(&mut self, id: AccountId) {
        if let Some(handle) = self.workers.remove(&id) {
            info!(account = %id, "Stopping");
            handle.stop(self.join_timeout()).await;
        }
    }

    async fn stop_all(&mut self) {
        let timeout = self.join_timeout();
        let mut stopping = JoinSet::new();
        for (_, handle) in self.workers.drain() {
            stopping.spawn(handle.stop(timeout));
        }
        while stopping.join_next().await.is_some() {}
    }

    fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.ctx.config.supervisor.join_timeout)
    }

    /// Queue a sync of every synchronizing folder of accounts that poll.
    async fn poll(&self) {
        let policy = self.reducer.policy();
        if !policy.enabled || !self.reducer.network().is_suitable() {
            return;
        }
        for account in self
            .reducer
            .accounts()
            .iter()
            .filter(|a| a.synchronize && !a.tbd && !a.is_exempted(policy))
        {
            let folders = match self.ctx.store.folders(account.id).await {
                Ok(folders) => folders,
                Err(e) => {
                    warn!(account = %account.id, "Failed to load folders: {e}");
                    continue;
                }
            };
            let mut queued = 0;
            for folder in folders.iter().filter(|f| f.is_synchronized()) {
                match self
                    .ctx
                    .store
                    .enqueue_operation(&NewOperation::sync(account.id, folder.id), false)
                    .await
                {
                    Ok(Some(_)) => queued += 1,
                    Ok(None) => {}
                    Err(e) => warn!(folder = %folder.name, "Failed to queue poll: {e}"),
                }
            }
            debug!(account = %account.id, queued, "Poll");
        }
    }

    /// Report running accounts and pending operations when they changed.
    ///
    /// Workers change phase on their own, so this also runs on a short
    /// refresh timer.
    async fn publish(&mut self) {
        let running_accounts = self
            .workers
            .iter()
            .filter(|(id, handle)| {
                self.reducer.is_persistent(**id)
                    && matches!(
                        handle.state().phase(),
                        WorkerPhase::Connected | WorkerPhase::Backoff
                    )
            })
            .count();
        let status = EngineStatus {
            running_accounts,
            pending_operations: self.operations,
        };
        if self.status == Some(status) {
            return;
        }
        self.status = Some(status);
        self.ctx.sink.status_changed(status);
        if let Err(e) = self.ctx.store.save_status(status).await {
            debug!("Failed to save status: {e}");
        }
    }
}

fn every(period: Duration) -> Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn next_tick(interval: Option<&mut Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
