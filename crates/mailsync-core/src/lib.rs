//! # mailsync-core
//!
//! Mail account synchronization engine.
//!
//! This crate provides:
//! - **Account supervision** - diffing account, network and command input into
//!   start/stop decisions for per-account workers
//! - **Account workers** - connection state machine with adaptive backoff and
//!   keep-alive tuning, one IDLE watcher per synchronized folder
//! - **Operation scheduling** - partitioned, prioritized execution of queued
//!   mailbox operations
//! - **Thread resolution** - conversation threading with back-propagating merges
//! - **Storage** - `SQLite` and in-memory implementations of the persistent store
//!
//! The wire protocol is consumed through the [`transport`] traits; hosts supply
//! a [`Connector`].

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod alarm;
pub mod backoff;
pub mod config;
mod context;
pub mod display;
mod error;
pub mod keepalive;
pub mod model;
pub mod scheduler;
pub mod store;
pub mod supervisor;
pub mod telemetry;
pub mod threading;
pub mod transport;
pub mod worker;

pub use alarm::{AlarmHandle, AlarmScheduler, TokioAlarms};
pub use backoff::{BackoffState, BackoffWait};
pub use config::EngineConfig;
pub use context::EngineContext;
pub use display::{AlertLevel, EngineStatus, LogSink, StatusSink};
pub use error::{Error, ErrorKind, Result};
pub use keepalive::KeepAliveTuner;
pub use model::{
    AccountId, AccountState, ConnectionState, FolderId, FolderState, FolderType, NetworkState,
    Operation, OperationId, OperationKind, ThreadInfo,
};
pub use scheduler::{OperationScheduler, PartitionQueue};
pub use store::{MemoryStore, SqliteStore, Store};
pub use supervisor::{AccountSupervisor, Command, Decision, Reducer, SupervisorEvent};
pub use threading::ThreadResolver;
pub use transport::{Connector, MailFolder, Session, TransportError, TransportEvent};
pub use worker::{AccountWorker, WorkerHandle, WorkerOptions, WorkerPhase, WorkerState};
