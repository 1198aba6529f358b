//! Per-account connection state machine.
//!
//! An [`AccountWorker`] runs as one task per running account:
//! `Idle → Connecting → Connected → Backoff → Connecting → … → Closing → Idle`.
//! It only exits when stopped through its [`WorkerHandle`].

mod events;
mod session;
mod state;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backoff::{BackoffState, BackoffWait};
use crate::context::EngineContext;
use crate::display::AlertLevel;
use crate::error::{Error, ErrorKind};
use crate::model::{AccountId, AccountState, NetworkState, OperationKind, RunPolicy};
use crate::threading::ThreadResolver;

pub use state::{WorkerPhase, WorkerState};

/// Owner's side of a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    state: Arc<WorkerState>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Account served by the worker.
    #[must_use]
    pub fn account(&self) -> AccountId {
        self.state.account()
    }

    /// Shared state of the worker.
    #[must_use]
    pub const fn state(&self) -> &Arc<WorkerState> {
        &self.state
    }

    /// Interrupt the current keep-alive or backoff wait.
    pub fn wake(&self) {
        self.state.wake();
    }

    /// Pass on a network change.
    pub fn set_network(&self, network: NetworkState) {
        self.state.set_network(network);
    }

    /// Drop the current connection and connect again.
    pub fn reconnect(&self, reason: &str) {
        self.state.error(&Error::Unrecoverable(reason.to_owned()));
    }

    /// Whether the worker task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the worker and wait up to `timeout` for it to finish. Returns
    /// `false` if it had to be left running detached.
    pub async fn stop(self, timeout: Duration) -> bool {
        let account = self.state.account();
        self.state.stop();
        match tokio::time::timeout(timeout, self.task).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(%account, "Worker task failed: {e}");
                true
            }
            Err(_) => {
                warn!(%account, "Worker did not stop in time");
                false
            }
        }
    }
}

/// How a worker runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerOptions {
    /// Global run policy when the worker was started.
    pub policy: RunPolicy,
    /// Watch and poll folders; otherwise only drain queued operations.
    pub sync: bool,
    /// Initial folder syncs bypass deduplication.
    pub force: bool,
}

/// Connection history carried across attempts.
pub(crate) struct Progress {
    backoff: BackoffState,
    connected_at: Option<Instant>,
    last_connected: Option<DateTime<Utc>>,
    force: bool,
}

/// One account's connection loop.
pub struct AccountWorker {
    ctx: EngineContext,
    state: Arc<WorkerState>,
    resolver: Arc<ThreadResolver>,
    options: WorkerOptions,
}

impl AccountWorker {
    /// Start a worker for `account`.
    #[must_use]
    pub fn spawn(
        ctx: EngineContext,
        account: &AccountState,
        network: NetworkState,
        options: WorkerOptions,
    ) -> WorkerHandle {
        let state = Arc::new(WorkerState::new(account.id, network));
        let resolver = Arc::new(ThreadResolver::new(
            Arc::clone(&ctx.store),
            ctx.config.threading,
        ));
        let progress = Progress {
            backoff: BackoffState::new(ctx.config.backoff),
            connected_at: None,
            last_connected: account.last_connected,
            force: options.force,
        };
        let worker = Self {
            ctx,
            state: Arc::clone(&state),
            resolver,
            options,
        };
        let task = tokio::spawn(worker.run(progress));
        WorkerHandle { state, task }
    }

    async fn run(self, mut progress: Progress) {
        let id = self.state.account();
        info!(account = %id, "Worker started");
        if let Err(e) = self.ctx.store.set_account_backoff(id, None).await {
            debug!(account = %id, "Failed to clear backoff: {e}");
        }

        while self.state.is_running() {
            self.state.clear_unrecoverable();
            let mut account = match self.ctx.store.account(id).await {
                Ok(Some(account)) => account,
                Ok(None) => {
                    warn!(account = %id, "Account no longer exists");
                    break;
                }
                Err(e) => {
                    warn!(account = %id, "Failed to load account: {e}");
                    let wait = progress.backoff.next_wait(false);
                    self.state.wait(wait.duration()).await;
                    continue;
                }
            };

            let result = self.connection(&mut account, &mut progress).await;
            if !self.state.is_running() {
                break;
            }
            let error = match result {
                Ok(()) => Error::Unrecoverable("Connection ended".into()),
                Err(e) => e,
            };
            self.failed(&account, &mut progress, &error).await;
        }

        self.state.set_phase(WorkerPhase::Idle);
        self.state.set_backoff(0);
        if let Err(e) = self.ctx.store.set_account_state(id, None).await {
            debug!(account = %id, "Failed to clear state: {e}");
        }
        info!(account = %id, "Worker stopped");
    }

    /// Record a failed connection and wait out the backoff.
    async fn failed(&self, account: &AccountState, progress: &mut Progress, error: &Error) {
        let id = account.id;
        let config = &self.ctx.config;
        warn!(account = %id, kind = ?error.kind(), "Connection failed: {error}");
        if let Err(e) = self
            .ctx
            .store
            .set_account_error(id, Some(&error.to_string()))
            .await
        {
            debug!(account = %id, "Failed to record error: {e}");
        }

        if error.kind() == ErrorKind::Authentication {
            progress.backoff.authentication_failed();
            raise_alert(&self.ctx, &self.state, AlertLevel::Error, &error.to_string());
        }

        let was_connected = progress.connected_at.map(|at| at.elapsed());
        progress
            .backoff
            .record_failure(was_connected, account.keep_alive.interval, Instant::now());
        self.missed_sync(account, progress);

        let lost = self
            .state
            .lost_recently(Duration::from_secs(config.backoff.lost_recently));
        let wait = progress.backoff.next_wait(lost);
        self.wait_out(account, wait).await;
    }

    /// Warn once when a failing account has not synchronized for a long time.
    fn missed_sync(&self, account: &AccountState, progress: &Progress) {
        let Some(last) = progress.last_connected else {
            return;
        };
        if !progress.backoff.is_alarm_range() {
            return;
        }

        let keep_alive = &self.ctx.config.keep_alive;
        let policy = self.options.policy;
        let max_delay = if policy.poll_interval > 0 && !account.is_exempted(policy) {
            policy.poll_interval * keep_alive.error_after_polls
        } else {
            keep_alive.error_after
        };
        let delayed = Utc::now() - last - TimeDelta::minutes(i64::from(account.keep_alive.interval));
        if delayed > TimeDelta::minutes(i64::from(max_delay)) {
            let message = format!("Not synchronized since {}", last.format("%Y-%m-%d %H:%M"));
            raise_alert(&self.ctx, &self.state, AlertLevel::Warning, &message);
        }
    }

    async fn wait_out(&self, account: &AccountState, wait: BackoffWait) {
        let id = account.id;
        let store = &self.ctx.store;
        self.state.set_phase(WorkerPhase::Backoff);
        self.state.set_backoff(wait.duration().as_secs());

        if let BackoffWait::Long(_) = wait
            && account.is_transient(self.options.policy)
        {
            match store.account_operations(id, OperationKind::Sync).await {
                Ok(syncs) => {
                    let mut count = 0;
                    for op in &syncs {
                        match store.delete_operation(op.id).await {
                            Ok(true) => count += 1,
                            Ok(false) => {}
                            Err(e) => warn!(operation = %op.id, "Failed to cancel sync: {e}"),
                        }
                    }
                    info!(account = %id, count, "Cancelled syncs");
                }
                Err(e) => warn!(account = %id, "Failed to cancel syncs: {e}"),
            }
        }

        let duration = wait.duration();
        let until = Utc::now() + TimeDelta::from_std(duration).unwrap_or_else(|_| TimeDelta::zero());
        if let Err(e) = store.set_account_backoff(id, Some(until)).await {
            debug!(account = %id, "Failed to record backoff: {e}");
        }
        info!(account = %id, backoff = duration.as_secs(), "Backing off");

        match wait {
            BackoffWait::Short(duration) => {
                self.state.wait(duration).await;
            }
            BackoffWait::Long(duration) => {
                let _alarm = self
                    .ctx
                    .alarms
                    .schedule(Instant::now() + duration, self.state.wake_signal());
                self.state.wait(duration * 2).await;
            }
        }

        if let Err(e) = store.set_account_backoff(id, None).await {
            debug!(account = %id, "Failed to clear backoff: {e}");
        }
        self.state.set_backoff(0);
    }

    fn clear_alerts(&self) {
        for level in self.state.clear_alerts() {
            self.ctx
                .sink
                .clear_account_alert(self.state.account(), level);
        }
    }
}

/// Show an alert unless the same one is already showing.
pub(crate) fn raise_alert(
    ctx: &EngineContext,
    state: &WorkerState,
    level: AlertLevel,
    message: &str,
) {
    if state.raise_alert(level, message) {
        ctx.sink.account_alert(state.account(), level, message);
    }
}
