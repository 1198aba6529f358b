//! Transport event dispatcher.
//!
//! Server pushes for one session arrive on a bounded channel and are turned
//! into queued operations in arrival order by a single task.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::{WorkerState, raise_alert};
use crate::context::EngineContext;
use crate::display::AlertLevel;
use crate::model::{AccountId, FolderId, NewOperation};
use crate::transport::TransportEvent;

/// Operations implied by a message event on a folder.
pub(super) fn operations_for(
    account: AccountId,
    folder: FolderId,
    event: &TransportEvent,
) -> Vec<NewOperation> {
    let (uids, removed) = match event {
        TransportEvent::Added { uids, .. } | TransportEvent::Changed { uids, .. } => (uids, false),
        TransportEvent::Removed { uids, .. } => (uids, true),
        TransportEvent::Notice(_) | TransportEvent::Alert(_) => return Vec::new(),
    };
    uids.iter()
        .map(|uid| NewOperation::fetch(account, folder, *uid, removed))
        .collect()
}

const fn folder_of(event: &TransportEvent) -> Option<&String> {
    match event {
        TransportEvent::Added { folder, .. }
        | TransportEvent::Removed { folder, .. }
        | TransportEvent::Changed { folder, .. } => Some(folder),
        TransportEvent::Notice(_) | TransportEvent::Alert(_) => None,
    }
}

/// Consume events until the session ends or `cancelled` flips.
pub(super) async fn dispatch(
    ctx: EngineContext,
    state: Arc<WorkerState>,
    folders: HashMap<String, FolderId>,
    mut events: mpsc::Receiver<TransportEvent>,
    mut cancelled: watch::Receiver<bool>,
) {
    let account = state.account();
    loop {
        let event = tokio::select! {
            _ = cancelled.changed() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match &event {
            TransportEvent::Notice(message) => {
                debug!(%account, "Server notice: {message}");
                continue;
            }
            TransportEvent::Alert(message) => {
                info!(%account, "Server alert: {message}");
                raise_alert(&ctx, &state, AlertLevel::Warning, message);
                continue;
            }
            _ => {}
        }

        let Some(name) = folder_of(&event) else {
            continue;
        };
        let Some(&folder) = folders.get(name) else {
            debug!(%account, folder = %name, "Event for unknown folder");
            continue;
        };

        let operations = operations_for(account, folder, &event);
        debug!(%account, folder = %name, count = operations.len(), "Queueing fetches");
        for operation in &operations {
            if let Err(e) = ctx.store.enqueue_operation(operation, false).await {
                warn!(%account, folder = %name, "Failed to queue fetch, syncing folder: {e}");
                if let Err(e) = ctx
                    .store
                    .enqueue_operation(&NewOperation::sync(account, folder), false)
                    .await
                {
                    warn!(%account, folder = %name, "Failed to queue sync: {e}");
                }
                break;
            }
        }
    }
    debug!(%account, "Event dispatcher stopped");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::OperationKind;

    #[test]
    fn added_and_changed_fetch_each_uid() {
        let account = AccountId::new(1);
        let folder = FolderId::new(2);
        let added = TransportEvent::Added {
            folder: "INBOX".into(),
            uids: vec![42, 43],
        };
        let ops = operations_for(account, folder, &added);
        assert_eq!(ops.len(), 2);
        assert!(ops.iter().all(|op| op.kind == OperationKind::Fetch));
        assert_eq!(ops[0].payload["uid"], 42);
        assert_eq!(ops[0].payload["removed"], false);
    }

    #[test]
    fn removed_marks_fetch_as_removal() {
        let removed = TransportEvent::Removed {
            folder: "INBOX".into(),
            uids: vec![7],
        };
        let ops = operations_for(AccountId::new(1), FolderId::new(2), &removed);
        assert_eq!(ops[0].payload["removed"], true);
    }

    #[test]
    fn notices_queue_nothing() {
        let ops = operations_for(
            AccountId::new(1),
            FolderId::new(2),
            &TransportEvent::Notice("Still here".into()),
        );
        assert!(ops.is_empty());
    }
}
