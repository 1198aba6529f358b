//! One-shot wake-ups at an absolute time.
//!
//! Used for keep-alive cycles and long backoff periods so a sleeping worker
//! holds nothing but a pending alarm.

use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tokio::time::Instant;

/// Requests one-shot wake-ups.
pub trait AlarmScheduler: Send + Sync {
    /// Notify `wake` once `at` is reached. Dropping the handle cancels.
    fn schedule(&self, at: Instant, wake: Arc<Notify>) -> AlarmHandle;
}

/// Pending alarm; cancelled on drop.
pub struct AlarmHandle {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl AlarmHandle {
    /// Create a handle running `cancel` when dropped.
    #[must_use]
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Create a handle that aborts a task when dropped.
    #[must_use]
    pub fn from_abort(handle: AbortHandle) -> Self {
        Self::new(move || handle.abort())
    }

    /// Create a handle with nothing to cancel.
    #[must_use]
    pub const fn detached() -> Self {
        Self { cancel: None }
    }
}

impl Drop for AlarmHandle {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for AlarmHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlarmHandle")
            .field("pending", &self.cancel.is_some())
            .finish()
    }
}

/// Alarms backed by tokio timers.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioAlarms;

impl AlarmScheduler for TokioAlarms {
    fn schedule(&self, at: Instant, wake: Arc<Notify>) -> AlarmHandle {
        let task = tokio::spawn(async move {
            tokio::time::sleep_until(at).await;
            wake.notify_one();
        });
        AlarmHandle::from_abort(task.abort_handle())
    }
}
