//! Pure state reduction behind the account supervisor.
//!
//! Every input becomes a [`SupervisorEvent`]; [`Reducer::apply`] diffs the
//! desired state of each account against the previous evaluation and returns
//! the start/stop decisions to carry out.

use std::collections::{HashMap, HashSet};

use chrono::NaiveTime;
use tracing::debug;

use crate::config::{ActiveHours, EngineConfig};
use crate::model::{AccountId, AccountIdentity, AccountState, NetworkState, RunPolicy};
use crate::worker::WorkerOptions;

/// Commands accepted by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Recompute the desired state and wake waiting workers.
    Eval,
    /// Reconnect all accounts, or one.
    Reload {
        /// Limit to this account.
        account: Option<AccountId>,
    },
    /// Synchronize all accounts, or one, bypassing operation deduplication.
    ForceSync {
        /// Limit to this account.
        account: Option<AccountId>,
    },
    /// Global synchronization switch.
    Enable(bool),
}

impl Command {
    const fn target(self) -> Option<AccountId> {
        match self {
            Self::Reload { account } | Self::ForceSync { account } => account,
            Self::Eval | Self::Enable(_) => None,
        }
    }
}

/// Input of the supervisor.
#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    /// New snapshot of all accounts.
    AccountsChanged(Vec<AccountState>),
    /// New network snapshot.
    NetworkChanged(NetworkState),
    /// Explicit command.
    Command(Command),
    /// Time passed; re-checks the active-hours schedule.
    Tick,
}

/// Action decided by an evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Clear leftover runtime state of an account seen for the first time.
    Init(AccountId),
    /// Start a worker.
    Start {
        /// Account to run.
        account: Box<AccountState>,
        /// How to run it.
        options: WorkerOptions,
    },
    /// Stop the account's worker.
    Stop(AccountId),
    /// Force the running worker to reconnect.
    Reconnect(AccountId),
    /// Interrupt the running worker's wait.
    Wake(AccountId),
    /// Purge the account.
    Delete(AccountId),
}

/// Result of one evaluation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Evaluation {
    /// Actions in the order they must be applied.
    pub decisions: Vec<Decision>,
    /// Pending operations of synchronizing accounts.
    pub operations: u32,
    /// A worker was started, stopped or deleted.
    pub changed: bool,
    /// Nothing should run; schedule a shutdown.
    pub quit: bool,
}

impl Evaluation {
    fn start(&mut self, account: &AccountState, options: WorkerOptions) {
        self.decisions.push(Decision::Start {
            account: Box::new(account.clone()),
            options,
        });
        self.changed = true;
    }

    fn stop(&mut self, account: AccountId) {
        self.decisions.push(Decision::Stop(account));
        self.changed = true;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Snapshot {
    identity: AccountIdentity,
    can_run: bool,
    active: Option<String>,
}

/// Desired-state bookkeeping of the supervisor.
#[derive(Debug)]
pub struct Reducer {
    enabled: bool,
    poll_interval: u32,
    schedule: Option<ActiveHours>,
    network: NetworkState,
    accounts: Vec<AccountState>,
    known: HashMap<AccountId, Snapshot>,
    initialized: HashSet<AccountId>,
    event_id: u64,
    quit_id: Option<u64>,
    active: bool,
}

impl Reducer {
    /// Create a reducer with nothing running.
    #[must_use]
    pub fn new(config: &EngineConfig, network: NetworkState) -> Self {
        Self {
            enabled: config.enabled,
            poll_interval: config.poll_interval,
            schedule: config.schedule,
            network,
            accounts: Vec::new(),
            known: HashMap::new(),
            initialized: HashSet::new(),
            event_id: 0,
            quit_id: None,
            active: true,
        }
    }

    /// Current network snapshot.
    #[must_use]
    pub const fn network(&self) -> &NetworkState {
        &self.network
    }

    /// Policy accounts are evaluated against.
    #[must_use]
    pub const fn policy(&self) -> RunPolicy {
        RunPolicy {
            enabled: self.enabled && self.active,
            poll_interval: self.poll_interval,
        }
    }

    /// Last account snapshot.
    #[must_use]
    pub fn accounts(&self) -> &[AccountState] {
        &self.accounts
    }

    /// Whether an account holds a persistent connection under the current
    /// policy.
    #[must_use]
    pub fn is_persistent(&self, id: AccountId) -> bool {
        let policy = self.policy();
        self.accounts
            .iter()
            .any(|a| a.id == id && !a.is_transient(policy))
    }

    /// Fold one event into the state and decide what to start and stop.
    /// `now` is the local time of day for the active-hours schedule.
    pub fn apply(&mut self, event: SupervisorEvent, now: NaiveTime) -> Evaluation {
        let command = match event {
            SupervisorEvent::AccountsChanged(accounts) => {
                self.accounts = accounts;
                None
            }
            SupervisorEvent::NetworkChanged(network) => {
                self.network = network;
                None
            }
            SupervisorEvent::Command(command) => {
                if let Command::Enable(enabled) = command {
                    self.enabled = enabled;
                }
                Some(command)
            }
            SupervisorEvent::Tick => None,
        };
        self.active = self.schedule.is_none_or(|hours| hours.contains(now));

        let policy = self.policy();
        let target = command.and_then(Command::target);
        let reload = matches!(command, Some(Command::Reload { .. }));
        let force = matches!(command, Some(Command::ForceSync { .. }));
        let wake = matches!(command, Some(Command::Eval));

        let mut evaluation = Evaluation::default();
        let mut should_run = false;
        let mut seen = HashSet::new();
        let accounts = std::mem::take(&mut self.accounts);

        for account in &accounts {
            let id = account.id;
            seen.insert(id);
            if !account.tbd && self.initialized.insert(id) {
                evaluation.decisions.push(Decision::Init(id));
            }
            should_run |= account.should_run(policy);
            if account.synchronize {
                evaluation.operations += account.operations;
            }
            if target.is_some_and(|t| t != id) {
                continue;
            }

            let mut account = account.clone();
            if force {
                account.operations += 1;
            }
            let current = Snapshot {
                identity: account.identity(),
                can_run: self.network.is_suitable() && account.should_run(policy),
                active: self.network.active.clone(),
            };
            let options = WorkerOptions {
                policy,
                sync: account.is_enabled(policy) || force,
                force,
            };

            match self.known.remove(&id) {
                None => {
                    if current.can_run {
                        debug!(account = %id, force, "Starting new account");
                        evaluation.start(&account, options);
                    }
                }
                Some(prev)
                    if reload
                        || force
                        || prev.can_run != current.can_run
                        || prev.identity != current.identity =>
                {
                    debug!(
                        account = %id,
                        reload,
                        force,
                        stop = prev.can_run,
                        start = current.can_run,
                        "Account changed"
                    );
                    if prev.can_run {
                        evaluation.stop(id);
                    }
                    if current.can_run {
                        evaluation.start(&account, options);
                    }
                }
                Some(prev) => {
                    if prev.can_run && prev.active.is_some() && prev.active != current.active {
                        debug!(account = %id, "Active network changed");
                        evaluation.decisions.push(Decision::Reconnect(id));
                    } else if wake && prev.can_run {
                        evaluation.decisions.push(Decision::Wake(id));
                    }
                }
            }

            if account.tbd {
                evaluation.decisions.push(Decision::Delete(id));
                evaluation.changed = true;
                self.initialized.remove(&id);
            } else {
                self.known.insert(id, current);
            }
        }
        self.accounts = accounts;

        if target.is_none() {
            let gone: Vec<_> = self
                .known
                .keys()
                .filter(|id| !seen.contains(id))
                .copied()
                .collect();
            for id in gone {
                if self.known.remove(&id).is_some_and(|prev| prev.can_run) {
                    evaluation.stop(id);
                }
                self.initialized.remove(&id);
            }
        }

        if evaluation.changed {
            self.event_id += 1;
        }
        if !should_run && self.quit_id != Some(self.event_id) {
            self.quit_id = Some(self.event_id);
            evaluation.quit = true;
        }
        evaluation
    }
}
