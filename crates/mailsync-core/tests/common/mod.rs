//! In-process fake mail server shared by the integration tests.

#![allow(dead_code, clippy::unwrap_used)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;

use mailsync_core::model::{FetchedMessage, ImapConfig, Quota, RunPolicy};
use mailsync_core::transport::{OpenMode, TransportResult};
use mailsync_core::{
    AccountId, AccountState, AlertLevel, Connector, EngineContext, EngineStatus, FolderId,
    FolderState, MailFolder, MemoryStore, NetworkState, Operation, Session, StatusSink, Store,
    TransportError, TransportEvent, WorkerOptions,
};

/// A folder on the fake server.
#[derive(Default)]
pub struct MockFolder {
    name: String,
    uids: Mutex<Vec<u32>>,
    fetched: Mutex<Vec<u32>>,
    listed: AtomicUsize,
    idle_fails_after: Option<Duration>,
}

impl MockFolder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            ..Self::default()
        }
    }

    /// IDLE breaks with a connection reset after `after`.
    pub fn dropping_after(name: &str, after: Duration) -> Self {
        Self {
            idle_fails_after: Some(after),
            ..Self::new(name)
        }
    }

    pub fn deliver(&self, uid: u32) {
        self.uids.lock().unwrap().push(uid);
    }

    pub fn fetched(&self) -> Vec<u32> {
        self.fetched.lock().unwrap().clone()
    }

    pub fn listed(&self) -> usize {
        self.listed.load(Ordering::SeqCst)
    }
}

struct OpenFolder {
    folder: Arc<MockFolder>,
    read_only: bool,
}

#[async_trait]
impl MailFolder for OpenFolder {
    fn name(&self) -> &str {
        &self.folder.name
    }

    fn is_open(&self) -> bool {
        true
    }

    fn read_only(&self) -> bool {
        self.read_only
    }

    async fn idle_wait(&self) -> TransportResult<()> {
        match self.folder.idle_fails_after {
            Some(after) => {
                tokio::time::sleep(after).await;
                Err(TransportError::Io("Connection reset".into()))
            }
            None => std::future::pending().await,
        }
    }

    async fn uids(&self) -> TransportResult<Vec<u32>> {
        self.folder.listed.fetch_add(1, Ordering::SeqCst);
        Ok(self.folder.uids.lock().unwrap().clone())
    }

    async fn fetch_messages(&self, uids: &[u32]) -> TransportResult<Vec<FetchedMessage>> {
        let present = self.folder.uids.lock().unwrap().clone();
        let mut fetched = self.folder.fetched.lock().unwrap();
        Ok(uids
            .iter()
            .filter(|uid| present.contains(uid))
            .map(|&uid| {
                fetched.push(uid);
                FetchedMessage {
                    uid,
                    msgid: Some(format!("<{uid}@example.com>")),
                    references: Vec::new(),
                    in_reply_to: None,
                    native_thread_id: None,
                    from: Some("sender@example.com".into()),
                    subject: Some(format!("Message {uid}")),
                    received: Utc::now(),
                    headers: format!("Message-ID: <{uid}@example.com>"),
                }
            })
            .collect())
    }

    async fn apply(&self, _: &Operation) -> TransportResult<()> {
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        Ok(())
    }
}

/// Fake server: counts connections and hands out [`MockFolder`]s.
#[derive(Default)]
pub struct MockServer {
    capabilities: Vec<String>,
    folders: HashMap<String, Arc<MockFolder>>,
    reject_login: AtomicBool,
    connects: AtomicUsize,
    closes: Arc<AtomicUsize>,
    events: Mutex<Option<mpsc::Sender<TransportEvent>>>,
}

impl MockServer {
    pub fn new(capabilities: &[&str]) -> Self {
        Self {
            capabilities: capabilities.iter().map(|&c| c.to_owned()).collect(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_folder(mut self, folder: MockFolder) -> Self {
        self.folders.insert(folder.name.clone(), Arc::new(folder));
        self
    }

    pub fn reject_login(&self, reject: bool) {
        self.reject_login.store(reject, Ordering::SeqCst);
    }

    pub fn folder(&self, name: &str) -> Arc<MockFolder> {
        Arc::clone(&self.folders[name])
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Push an event on the most recent session.
    pub async fn push(&self, event: TransportEvent) {
        let events = self.events.lock().unwrap().clone().unwrap();
        events.send(event).await.unwrap();
    }
}

struct MockSession {
    capabilities: Vec<String>,
    folders: HashMap<String, Arc<MockFolder>>,
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl Connector for MockServer {
    async fn connect(
        &self,
        _: &AccountState,
        events: mpsc::Sender<TransportEvent>,
    ) -> TransportResult<Arc<dyn Session>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.reject_login.load(Ordering::SeqCst) {
            return Err(TransportError::Authentication("Invalid credentials".into()));
        }
        *self.events.lock().unwrap() = Some(events);
        Ok(Arc::new(MockSession {
            capabilities: self.capabilities.clone(),
            folders: self.folders.clone(),
            closes: Arc::clone(&self.closes),
        }))
    }
}

#[async_trait]
impl Session for MockSession {
    fn capabilities(&self) -> Vec<String> {
        self.capabilities.clone()
    }

    async fn noop(&self) -> TransportResult<()> {
        Ok(())
    }

    async fn open_folder(&self, name: &str, mode: OpenMode) -> TransportResult<Arc<dyn MailFolder>> {
        let folder = self
            .folders
            .get(name)
            .ok_or_else(|| TransportError::FolderNotFound(name.to_owned()))?;
        Ok(Arc::new(OpenFolder {
            folder: Arc::clone(folder),
            read_only: mode == OpenMode::ReadOnly,
        }))
    }

    async fn quota(&self) -> TransportResult<Option<Quota>> {
        Ok(Some(Quota {
            usage: 1024,
            limit: 1024 * 1024,
        }))
    }

    async fn empty_pool(&self) -> TransportResult<()> {
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Status sink that records everything it is told.
#[derive(Default)]
pub struct RecordingSink {
    statuses: Mutex<Vec<EngineStatus>>,
    alerts: Mutex<Vec<(AccountId, AlertLevel, String)>>,
    cleared: Mutex<Vec<(AccountId, AlertLevel)>>,
}

impl RecordingSink {
    pub fn statuses(&self) -> Vec<EngineStatus> {
        self.statuses.lock().unwrap().clone()
    }

    pub fn alerts(&self) -> Vec<(AccountId, AlertLevel, String)> {
        self.alerts.lock().unwrap().clone()
    }

    pub fn cleared(&self) -> Vec<(AccountId, AlertLevel)> {
        self.cleared.lock().unwrap().clone()
    }
}

impl StatusSink for RecordingSink {
    fn status_changed(&self, status: EngineStatus) {
        self.statuses.lock().unwrap().push(status);
    }

    fn account_alert(&self, account: AccountId, level: AlertLevel, message: &str) {
        self.alerts
            .lock()
            .unwrap()
            .push((account, level, message.to_owned()));
    }

    fn clear_account_alert(&self, account: AccountId, level: AlertLevel) {
        self.cleared.lock().unwrap().push((account, level));
    }
}

/// Engine wired to a [`MemoryStore`], a [`MockServer`] and a
/// [`RecordingSink`], with one account and its inbox.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub server: Arc<MockServer>,
    pub sink: Arc<RecordingSink>,
    pub ctx: EngineContext,
    pub account: AccountId,
    pub inbox: FolderId,
}

impl Harness {
    pub async fn new(server: MockServer) -> Self {
        let store = Arc::new(MemoryStore::new());
        let account = store
            .add_account(&AccountState::new(
                "Work",
                "me@example.com",
                ImapConfig {
                    host: "imap.example.com".into(),
                    port: 993,
                    username: "me@example.com".into(),
                    password: "secret".into(),
                    ..ImapConfig::default()
                },
            ))
            .await
            .unwrap();
        let inbox = store
            .add_folder(&FolderState::new(account, "INBOX"))
            .await
            .unwrap();

        let server = Arc::new(server);
        let sink = Arc::new(RecordingSink::default());
        let ctx = EngineContext::new(
            Arc::clone(&store) as Arc<dyn Store>,
            Arc::clone(&server) as Arc<dyn Connector>,
        )
        .with_sink(Arc::clone(&sink) as Arc<dyn StatusSink>);

        Self {
            store,
            server,
            sink,
            ctx,
            account,
            inbox,
        }
    }

    /// Server with only an `INBOX` and the given capabilities.
    pub async fn inbox_only(capabilities: &[&str]) -> Self {
        Self::new(MockServer::new(capabilities).with_folder(MockFolder::new("INBOX"))).await
    }

    pub async fn account(&self) -> AccountState {
        self.store.account(self.account).await.unwrap().unwrap()
    }
}

pub fn online() -> NetworkState {
    NetworkState {
        connected: true,
        suitable: true,
        unmetered: true,
        roaming: false,
        active: Some("wlan0".into()),
    }
}

pub fn spawn(engine: &Harness, account: &AccountState) -> mailsync_core::WorkerHandle {
    mailsync_core::AccountWorker::spawn(engine.ctx.clone(), account, online(), PUSH)
}

pub const PUSH: WorkerOptions = WorkerOptions {
    policy: RunPolicy {
        enabled: true,
        poll_interval: 0,
    },
    sync: true,
    force: false,
};

/// Poll a condition (which may `.await`) until it holds, failing the test
/// after a while.
macro_rules! eventually {
    ($what:expr, $check:expr) => {{
        let mut held = false;
        for _ in 0..1000 {
            if $check {
                held = true;
                break;
            }
            ::tokio::time::sleep(::std::time::Duration::from_millis(10)).await;
        }
        assert!(held, "timed out waiting for {}", $what);
    }};
}
