//! Status reporting towards the user-facing layer.
//!
//! The engine never renders anything. It pushes coarse counts and
//! per-account alert strings into a [`StatusSink`] and is never called back.

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::model::AccountId;

/// Coarse engine status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStatus {
    /// Accounts connected or waiting out a backoff.
    pub running_accounts: usize,
    /// Operations queued for synchronizing accounts.
    pub pending_operations: u32,
}

/// Severity of an account alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlertLevel {
    /// The account cannot synchronize (e.g. rejected credentials).
    Error,
    /// The account synchronizes in a degraded way.
    Warning,
}

/// Receiver of status updates.
pub trait StatusSink: Send + Sync {
    /// The running-account or pending-operation count changed.
    fn status_changed(&self, status: EngineStatus);

    /// Raise or replace the persistent alert of an account.
    fn account_alert(&self, account: AccountId, level: AlertLevel, message: &str);

    /// Clear a previously raised alert.
    fn clear_account_alert(&self, account: AccountId, level: AlertLevel);
}

/// Sink that only logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl StatusSink for LogSink {
    fn status_changed(&self, status: EngineStatus) {
        info!(
            accounts = status.running_accounts,
            operations = status.pending_operations,
            "Status changed"
        );
    }

    fn account_alert(&self, account: AccountId, level: AlertLevel, message: &str) {
        match level {
            AlertLevel::Error => error!(%account, "Account error: {message}"),
            AlertLevel::Warning => warn!(%account, "Account warning: {message}"),
        }
    }

    fn clear_account_alert(&self, account: AccountId, level: AlertLevel) {
        info!(%account, ?level, "Account alert cleared");
    }
}
