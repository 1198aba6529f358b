//! Account model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountId(pub i64);

impl AccountId {
    /// Create a new account ID.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for AccountId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Security/encryption mode for connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Security {
    /// No encryption (not recommended).
    None,
    /// Implicit TLS (connect directly with TLS).
    #[default]
    Tls,
    /// STARTTLS upgrade after plaintext connect.
    StartTls,
}

impl Security {
    /// Storage representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Tls => "tls",
            Self::StartTls => "starttls",
        }
    }

    /// Parse the storage representation, defaulting to TLS.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "none" => Self::None,
            "starttls" => Self::StartTls,
            _ => Self::Tls,
        }
    }
}

/// IMAP server configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImapConfig {
    /// Server hostname.
    pub host: String,
    /// Server port (default: 993 for TLS, 143 for STARTTLS).
    pub port: u16,
    /// Security mode.
    pub security: Security,
    /// Username for authentication.
    pub username: String,
    /// Password for authentication.
    pub password: String,
}

/// Connection state of an account or folder. `None` means idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Session being established.
    Connecting,
    /// Session established.
    Connected,
    /// Session being torn down.
    Closing,
}

impl ConnectionState {
    /// Storage representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Closing => "closing",
        }
    }

    /// Parse the storage representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "connecting" => Some(Self::Connecting),
            "connected" => Some(Self::Connected),
            "closing" => Some(Self::Closing),
            _ => None,
        }
    }
}

/// Keep-alive interval and its tuning counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepAlive {
    /// Current interval in minutes.
    pub interval: u32,
    /// Interval confirmed as tolerated by the server.
    pub ok: bool,
    /// Consecutive failed cycles at the current interval.
    pub failed: u32,
    /// Consecutive clean cycles at the current interval.
    pub succeeded: u32,
}

impl KeepAlive {
    /// Untuned keep-alive at the given interval.
    #[must_use]
    pub const fn with_interval(interval: u32) -> Self {
        Self {
            interval,
            ok: false,
            failed: 0,
            succeeded: 0,
        }
    }
}

impl Default for KeepAlive {
    fn default() -> Self {
        Self::with_interval(15)
    }
}

/// Server capabilities recorded on connect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Server supports IDLE.
    pub idle: bool,
    /// Server accepts UTF-8.
    pub utf8: bool,
}

/// Storage quota in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quota {
    /// Bytes in use.
    pub usage: u64,
    /// Bytes allowed.
    pub limit: u64,
}

/// Global inputs deciding whether accounts should synchronize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunPolicy {
    /// Global switch, already combined with the active-hours schedule.
    pub enabled: bool,
    /// Global poll interval in minutes; `0` for push.
    pub poll_interval: u32,
}

/// An account together with its runtime synchronization state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct AccountState {
    /// Unique identifier.
    pub id: AccountId,
    /// Display name.
    pub name: String,
    /// Email address.
    pub email: String,
    /// IMAP configuration.
    pub imap: ImapConfig,
    /// Desired-enabled flag.
    pub synchronize: bool,
    /// Connect only while operations are pending.
    pub ondemand: bool,
    /// Keep a push connection even in global poll mode.
    pub poll_exempted: bool,
    /// Marked to be deleted.
    pub tbd: bool,
    /// Keep-alive interval and tuning.
    pub keep_alive: KeepAlive,
    /// Connection state.
    pub state: Option<ConnectionState>,
    /// Last confirmed live connection.
    pub last_connected: Option<DateTime<Utc>>,
    /// End of the current backoff wait.
    pub backoff_until: Option<DateTime<Utc>>,
    /// Capabilities of the last session.
    pub capabilities: Capabilities,
    /// Last known quota.
    pub quota: Option<Quota>,
    /// Persistent error text.
    pub error: Option<String>,
    /// Persistent warning text.
    pub warning: Option<String>,
    /// Number of selectable, synchronizing folders.
    pub folders: u32,
    /// Number of pending operations.
    pub operations: u32,
}

/// Fields whose change requires restarting the account's worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountIdentity {
    imap: ImapConfig,
    synchronize: bool,
    ondemand: bool,
    poll_exempted: bool,
    folders: u32,
}

impl AccountState {
    /// Create an unsaved account with default keep-alive.
    #[must_use]
    pub fn new(name: impl Into<String>, email: impl Into<String>, imap: ImapConfig) -> Self {
        Self {
            id: AccountId::new(0),
            name: name.into(),
            email: email.into(),
            imap,
            synchronize: true,
            ondemand: false,
            poll_exempted: false,
            tbd: false,
            keep_alive: KeepAlive::default(),
            state: None,
            last_connected: None,
            backoff_until: None,
            capabilities: Capabilities::default(),
            quota: None,
            error: None,
            warning: None,
            folders: 0,
            operations: 0,
        }
    }

    /// Restart-relevant view of this account.
    #[must_use]
    pub fn identity(&self) -> AccountIdentity {
        AccountIdentity {
            imap: self.imap.clone(),
            synchronize: self.synchronize,
            ondemand: self.ondemand,
            poll_exempted: self.poll_exempted,
            folders: self.folders,
        }
    }

    /// Exempted accounts keep push connections in poll mode.
    #[must_use]
    pub const fn is_exempted(&self, policy: RunPolicy) -> bool {
        policy.poll_interval == 0 || self.poll_exempted
    }

    /// Whether the account should hold a persistent connection.
    #[must_use]
    pub const fn is_enabled(&self, policy: RunPolicy) -> bool {
        policy.enabled && self.synchronize && !self.ondemand && self.is_exempted(policy)
    }

    /// Whether a worker should run, for a persistent connection or to drain
    /// pending operations.
    #[must_use]
    pub const fn should_run(&self, policy: RunPolicy) -> bool {
        (self.is_enabled(policy) || (self.synchronize && self.operations > 0)) && !self.tbd
    }

    /// Whether the account only connects on demand.
    #[must_use]
    pub const fn is_transient(&self, policy: RunPolicy) -> bool {
        !self.is_enabled(policy) || self.ondemand || !self.is_exempted(policy)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::redundant_clone)]
mod tests {
    use super::*;

    const PUSH: RunPolicy = RunPolicy {
        enabled: true,
        poll_interval: 0,
    };
    const POLL: RunPolicy = RunPolicy {
        enabled: true,
        poll_interval: 30,
    };

    fn account() -> AccountState {
        AccountState::new("Work", "me@example.com", ImapConfig::default())
    }

    mod account_id_tests {
        use super::*;

        #[test]
        fn display() {
            assert_eq!(format!("{}", AccountId::new(123)), "123");
        }
    }

    mod storage_names_tests {
        use super::*;

        #[test]
        fn connection_state_round_trip() {
            for state in [
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Closing,
            ] {
                assert_eq!(ConnectionState::parse(state.as_str()), Some(state));
            }
            assert_eq!(ConnectionState::parse("bogus"), None);
        }

        #[test]
        fn unknown_security_is_tls() {
            assert_eq!(Security::parse("starttls"), Security::StartTls);
            assert_eq!(Security::parse("?"), Security::Tls);
        }
    }

    mod run_policy_tests {
        use super::*;

        #[test]
        fn push_account_runs() {
            let a = account();
            assert!(a.is_enabled(PUSH));
            assert!(a.should_run(PUSH));
            assert!(!a.is_transient(PUSH));
        }

        #[test]
        fn disabled_globally() {
            let a = account();
            let off = RunPolicy {
                enabled: false,
                ..PUSH
            };
            assert!(!a.should_run(off));
            assert!(a.is_transient(off));
        }

        #[test]
        fn poll_mode_runs_only_with_operations() {
            let mut a = account();
            assert!(!a.should_run(POLL));
            a.operations = 2;
            assert!(a.should_run(POLL));
            assert!(a.is_transient(POLL));
        }

        #[test]
        fn exempted_account_ignores_poll_mode() {
            let mut a = account();
            a.poll_exempted = true;
            assert!(a.should_run(POLL));
            assert!(!a.is_transient(POLL));
        }

        #[test]
        fn ondemand_is_transient() {
            let mut a = account();
            a.ondemand = true;
            assert!(!a.should_run(PUSH));
            a.operations = 1;
            assert!(a.should_run(PUSH));
            assert!(a.is_transient(PUSH));
        }

        #[test]
        fn to_be_deleted_never_runs() {
            let mut a = account();
            a.tbd = true;
            a.operations = 5;
            assert!(!a.should_run(PUSH));
        }
    }

    mod identity_tests {
        use super::*;

        #[test]
        fn runtime_fields_do_not_change_identity() {
            let a = account();
            let mut b = a.clone();
            b.state = Some(ConnectionState::Connected);
            b.operations = 7;
            b.keep_alive.interval = 9;
            b.error = Some("x".into());
            assert_eq!(a.identity(), b.identity());
        }

        #[test]
        fn credentials_change_identity() {
            let a = account();
            let mut b = a.clone();
            b.imap.password = "new".into();
            assert_ne!(a.identity(), b.identity());
        }
    }
}
