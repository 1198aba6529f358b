//! State shared between an account worker, its folder watchers and its
//! operation scheduler.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::display::AlertLevel;
use crate::error::{Error, ErrorKind};
use crate::model::{AccountId, NetworkState};

/// Coarse phase of a worker's connection loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerPhase {
    /// Not started, or stopped.
    Idle,
    /// Opening a session.
    Connecting,
    /// Session open; watching folders and keeping alive.
    Connected,
    /// Waiting before the next attempt.
    Backoff,
    /// Tearing the session down.
    Closing,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Running flag, connection serial, wake signal and failure cause of one
/// account worker.
#[derive(Debug)]
pub struct WorkerState {
    account: AccountId,
    running: AtomicBool,
    serial: AtomicU64,
    backoff: AtomicU64,
    unrecoverable: Mutex<Option<String>>,
    wake: Arc<Notify>,
    network: Mutex<NetworkState>,
    last_lost: Mutex<Option<Instant>>,
    idle_time: Mutex<Duration>,
    alerts: Mutex<HashMap<AlertLevel, String>>,
    phase: watch::Sender<WorkerPhase>,
}

impl WorkerState {
    /// Fresh, running state.
    #[must_use]
    pub fn new(account: AccountId, network: NetworkState) -> Self {
        Self {
            account,
            running: AtomicBool::new(true),
            serial: AtomicU64::new(0),
            backoff: AtomicU64::new(0),
            unrecoverable: Mutex::new(None),
            wake: Arc::new(Notify::new()),
            network: Mutex::new(network),
            last_lost: Mutex::new(None),
            idle_time: Mutex::new(Duration::ZERO),
            alerts: Mutex::new(HashMap::new()),
            phase: watch::channel(WorkerPhase::Idle).0,
        }
    }

    /// Account this state belongs to.
    #[must_use]
    pub const fn account(&self) -> AccountId {
        self.account
    }

    /// Whether the worker should keep going.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Ask the worker to stop and interrupt its current wait.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.wake();
    }

    /// Serial of the current connection.
    #[must_use]
    pub fn serial(&self) -> u64 {
        self.serial.load(Ordering::SeqCst)
    }

    /// Invalidate work captured on the current connection.
    pub fn next_serial(&self) -> u64 {
        self.serial.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Check that work captured at `captured` is still current.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Stale`] once the connection has been replaced.
    pub fn ensure_current(&self, captured: u64) -> crate::Result<()> {
        let current = self.serial();
        if captured == current {
            Ok(())
        } else {
            Err(Error::Stale { captured, current })
        }
    }

    /// Report a failure that should force a reconnect. The first cause
    /// sticks until [`WorkerState::clear_unrecoverable`].
    pub fn error(&self, error: &Error) {
        if error.kind() == ErrorKind::Consistency {
            debug!(account = %self.account, %error, "Ignoring stale failure");
            return;
        }
        {
            let mut cause = lock(&self.unrecoverable);
            if cause.is_none() {
                warn!(account = %self.account, %error, "Connection unrecoverable");
                *cause = Some(error.to_string());
            }
        }
        self.wake();
    }

    /// Whether no unrecoverable failure was reported.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        lock(&self.unrecoverable).is_none()
    }

    /// The reported unrecoverable failure, if any.
    #[must_use]
    pub fn unrecoverable(&self) -> Option<String> {
        lock(&self.unrecoverable).clone()
    }

    /// Forget the failure cause before a new connection attempt.
    pub fn clear_unrecoverable(&self) {
        *lock(&self.unrecoverable) = None;
    }

    /// Signal shared with alarms.
    #[must_use]
    pub fn wake_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    /// Interrupt the current wait.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Block until woken or `timeout` elapses. Returns the time waited, also
    /// kept as [`WorkerState::idle_time`].
    pub async fn wait(&self, timeout: Duration) -> Duration {
        let notified = self.wake.notified();
        if !self.is_running() {
            return Duration::ZERO;
        }

        let start = Instant::now();
        let _ = tokio::time::timeout(timeout, notified).await;
        let idle = start.elapsed();
        *lock(&self.idle_time) = idle;
        idle
    }

    /// Length of the last completed wait.
    #[must_use]
    pub fn idle_time(&self) -> Duration {
        *lock(&self.idle_time)
    }

    /// Replace the network snapshot, remembering when it was lost.
    pub fn set_network(&self, network: NetworkState) {
        let mut current = lock(&self.network);
        if current.is_suitable() && !network.is_suitable() {
            *lock(&self.last_lost) = Some(Instant::now());
        }
        *current = network;
    }

    /// Current network snapshot.
    #[must_use]
    pub fn network(&self) -> NetworkState {
        lock(&self.network).clone()
    }

    /// Whether the network was lost within `window`.
    #[must_use]
    pub fn lost_recently(&self, window: Duration) -> bool {
        lock(&self.last_lost).is_some_and(|at| at.elapsed() < window)
    }

    /// Current backoff in seconds, as published by the worker.
    #[must_use]
    pub fn backoff(&self) -> u64 {
        self.backoff.load(Ordering::SeqCst)
    }

    pub(crate) fn set_backoff(&self, secs: u64) {
        self.backoff.store(secs, Ordering::SeqCst);
    }

    /// Remember a raised alert. Returns `false` when the same message is
    /// already showing at that level.
    pub(crate) fn raise_alert(&self, level: AlertLevel, message: &str) -> bool {
        let mut alerts = lock(&self.alerts);
        if alerts.get(&level).is_some_and(|shown| shown == message) {
            return false;
        }
        alerts.insert(level, message.to_owned());
        true
    }

    /// Forget all raised alerts, returning their levels.
    pub(crate) fn clear_alerts(&self) -> Vec<AlertLevel> {
        lock(&self.alerts).drain().map(|(level, _)| level).collect()
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> WorkerPhase {
        *self.phase.borrow()
    }

    /// Follow phase changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<WorkerPhase> {
        self.phase.subscribe()
    }

    pub(crate) fn set_phase(&self, phase: WorkerPhase) {
        self.phase.send_if_modified(|current| {
            let changed = *current != phase;
            *current = phase;
            changed
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::transport::TransportError;

    fn state() -> WorkerState {
        WorkerState::new(AccountId::new(1), NetworkState::default())
    }

    fn online() -> NetworkState {
        NetworkState {
            connected: true,
            suitable: true,
            ..NetworkState::default()
        }
    }

    #[test]
    fn first_cause_sticks() {
        let state = state();
        assert!(state.is_recoverable());
        state.error(&Error::Unrecoverable("first".into()));
        state.error(&Error::Unrecoverable("second".into()));
        assert_eq!(state.unrecoverable().unwrap(), "Unrecoverable: first");

        state.clear_unrecoverable();
        assert!(state.is_recoverable());
    }

    #[test]
    fn consistency_errors_are_ignored() {
        let state = state();
        state.error(&Error::from(TransportError::Closed));
        state.error(&Error::Stale {
            captured: 1,
            current: 2,
        });
        assert!(state.is_recoverable());
    }

    #[test]
    fn serial_invalidates_captured_work() {
        let state = state();
        let captured = state.serial();
        assert!(state.ensure_current(captured).is_ok());
        state.next_serial();
        assert!(matches!(
            state.ensure_current(captured),
            Err(Error::Stale { .. })
        ));
    }

    #[test]
    fn alerts_are_deduplicated_until_cleared() {
        let state = state();
        assert!(state.raise_alert(AlertLevel::Error, "bad password"));
        assert!(!state.raise_alert(AlertLevel::Error, "bad password"));
        assert!(state.raise_alert(AlertLevel::Error, "account locked"));
        assert!(state.raise_alert(AlertLevel::Warning, "bad password"));

        let mut cleared = state.clear_alerts();
        cleared.sort_by_key(|level| *level == AlertLevel::Warning);
        assert_eq!(cleared, vec![AlertLevel::Error, AlertLevel::Warning]);
        assert!(state.raise_alert(AlertLevel::Error, "bad password"));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out_and_records_idle() {
        let state = state();
        let idle = state.wait(Duration::from_secs(60)).await;
        assert_eq!(idle, Duration::from_secs(60));
        assert_eq!(state.idle_time(), idle);
    }

    #[tokio::test(start_paused = true)]
    async fn wake_interrupts_wait() {
        let state = Arc::new(state());
        let waiter = {
            let state = Arc::clone(&state);
            tokio::spawn(async move { state.wait(Duration::from_secs(3600)).await })
        };
        tokio::time::sleep(Duration::from_secs(5)).await;
        state.wake();
        let idle = waiter.await.unwrap();
        assert!(idle < Duration::from_secs(3600));
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_state_does_not_wait() {
        let state = state();
        state.stop();
        assert!(!state.is_running());
        assert_eq!(state.wait(Duration::from_secs(60)).await, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn network_loss_is_remembered() {
        let state = state();
        state.set_network(online());
        assert!(!state.lost_recently(Duration::from_secs(150)));

        state.set_network(NetworkState::offline());
        assert!(state.lost_recently(Duration::from_secs(150)));
        tokio::time::advance(Duration::from_secs(200)).await;
        assert!(!state.lost_recently(Duration::from_secs(150)));
    }
}
