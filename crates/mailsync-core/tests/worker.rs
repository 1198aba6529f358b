//! End-to-end tests of a single account worker against the fake server.

#![allow(clippy::unwrap_used)]

#[macro_use]
mod common;

use std::time::Duration;

use tokio_test::assert_ok;

use common::{Harness, MockFolder, MockServer, spawn};
use mailsync_core::{
    AlertLevel, ConnectionState, FolderState, OperationKind, Store, TransportEvent, WorkerPhase,
};

const STOP: Duration = Duration::from_secs(5);

#[tokio::test]
async fn pushed_message_is_fetched_once_and_dequeued() {
    let engine = Harness::inbox_only(&["IMAP4rev1", "IDLE"]).await;
    let inbox = engine.server.folder("INBOX");

    let handle = spawn(&engine, &engine.account().await);
    let mut phase = handle.state().subscribe();
    assert_ok!(phase.wait_for(|p| *p == WorkerPhase::Connected).await);

    eventually!("initial sync", inbox.listed() > 0);
    eventually!(
        "idle queue",
        engine.store.pending_operations(engine.account).await.unwrap().is_empty()
    );

    let account = engine.account().await;
    assert_eq!(account.state, Some(ConnectionState::Connected));
    assert!(account.capabilities.idle);
    assert!(account.quota.is_some());
    assert_eq!(account.warning, None);

    inbox.deliver(42);
    engine
        .server
        .push(TransportEvent::Added {
            folder: "INBOX".into(),
            uids: vec![42],
        })
        .await;

    eventually!(
        "message 42 stored",
        engine.store.message(engine.inbox, 42).await.unwrap().is_some()
    );
    eventually!(
        "fetch dequeued",
        engine.store.pending_operations(engine.account).await.unwrap().is_empty()
    );
    assert_eq!(inbox.fetched(), vec![42]);
    assert_eq!(engine.store.enqueued(OperationKind::Fetch), 1);

    assert!(handle.stop(STOP).await);
    assert_eq!(engine.server.closes(), 1);
    assert_eq!(engine.account().await.state, None);
}

#[tokio::test]
async fn server_without_idle_polls_folders() {
    let engine = Harness::inbox_only(&["IMAP4rev1"]).await;
    let inbox = engine.server.folder("INBOX");
    inbox.deliver(7);

    let handle = spawn(&engine, &engine.account().await);
    eventually!("polled message", engine.store.message(engine.inbox, 7).await.unwrap().is_some());

    let folder = engine.store.folder(engine.inbox).await.unwrap().unwrap();
    assert!(folder.poll);
    assert!(!engine.account().await.capabilities.idle);
    eventually!("no-idle warning", engine.account().await.warning.is_some());

    assert!(handle.stop(STOP).await);
}

#[tokio::test(start_paused = true)]
async fn rejected_credentials_back_off_with_one_alert() {
    let engine = Harness::inbox_only(&["IDLE"]).await;
    engine.server.reject_login(true);

    let handle = spawn(&engine, &engine.account().await);
    let state = handle.state().clone();
    for _ in 0..200 {
        if engine.server.connects() >= 3 && state.backoff() > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_secs(600)).await;
    }

    assert_eq!(engine.server.connects(), 3);
    assert_eq!(state.backoff(), engine.ctx.config.backoff.auth);
    assert_eq!(state.phase(), WorkerPhase::Backoff);

    let alerts = engine.sink.alerts();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].1, AlertLevel::Error);
    assert!(alerts[0].2.contains("Invalid credentials"));

    let account = engine.account().await;
    assert!(account.error.unwrap().contains("Authentication failed"));
    assert!(account.backoff_until.is_some());

    assert!(handle.stop(STOP).await);
}

#[tokio::test(start_paused = true)]
async fn repeated_quick_drops_are_compensated_on_the_second() {
    let engine = Harness::new(
        MockServer::new(&["IDLE"])
            .with_folder(MockFolder::dropping_after("INBOX", Duration::from_secs(5))),
    )
    .await;
    let config = engine.ctx.config.backoff;

    let handle = spawn(&engine, &engine.account().await);
    let state = handle.state().clone();

    eventually!("first backoff", state.backoff() > 0);
    assert_eq!(engine.server.connects(), 1);
    assert_eq!(state.backoff(), config.start);

    eventually!("second connection", engine.server.connects() == 2);
    eventually!("second backoff", state.backoff() > 0);
    assert!(state.backoff() > config.alarm_start);
    assert!(state.backoff() <= config.alarm_max);

    assert!(handle.stop(STOP).await);
    assert_eq!(engine.server.connects(), 2);
}

#[tokio::test]
async fn missing_folder_is_disabled_without_failing_the_account() {
    let engine = Harness::inbox_only(&["IDLE"]).await;
    let archive = engine
        .store
        .add_folder(&FolderState::new(engine.account, "Archive"))
        .await
        .unwrap();

    let handle = spawn(&engine, &engine.account().await);
    eventually!(
        "archive disabled",
        !engine.store.folder(archive).await.unwrap().unwrap().synchronize
    );

    let folder = engine.store.folder(archive).await.unwrap().unwrap();
    assert!(folder.error.unwrap().contains("Archive"));
    assert_eq!(handle.state().phase(), WorkerPhase::Connected);
    assert_eq!(engine.server.connects(), 1);

    assert!(handle.stop(STOP).await);
}
