//! Partition bookkeeping for the operation scheduler.

use std::collections::{BTreeMap, HashSet};

use crate::model::{Operation, PartitionKey};

/// Pending partitions and the keys currently executing.
///
/// A key is never handed out twice at the same time: operations offered for a
/// key that is in flight wait in a pending partition of the same key until the
/// running one completes.
#[derive(Debug, Default)]
pub struct PartitionQueue {
    pending: BTreeMap<PartitionKey, Vec<Operation>>,
    in_flight: HashSet<PartitionKey>,
}

impl PartitionQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an operation, merging it into the pending partition of its key.
    pub fn offer(&mut self, operation: Operation, offline: bool) {
        let partition = self
            .pending
            .entry(operation.partition_key(offline))
            .or_default();
        if partition.iter().any(|op| op.id == operation.id) {
            return;
        }
        let at = partition.partition_point(|op| op.order() < operation.order());
        partition.insert(at, operation);
    }

    /// Take the next dispatchable partition: lowest priority first, then
    /// earliest insertion. Keys in flight are skipped.
    pub fn next(&mut self) -> Option<(PartitionKey, Vec<Operation>)> {
        let key = self
            .pending
            .iter()
            .filter(|(key, _)| !self.in_flight.contains(*key))
            .min_by_key(|(key, ops)| (key.priority, ops.first().map(Operation::order)))
            .map(|(key, _)| *key)?;

        let operations = self.pending.remove(&key)?;
        self.in_flight.insert(key);
        Some((key, operations))
    }

    /// Mark a dispatched partition as finished.
    pub fn complete(&mut self, key: PartitionKey) {
        self.in_flight.remove(&key);
    }

    /// Whether nothing is pending or running.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::model::{AccountId, FolderId, OperationId, OperationKind};

    fn op(id: i64, folder: i64, kind: OperationKind) -> Operation {
        Operation {
            id: OperationId(id),
            account: AccountId::new(1),
            folder: FolderId::new(folder),
            kind,
            priority: kind.priority(),
            payload: json!({ "n": id }),
            created: Utc::now(),
            tries: 0,
            error: None,
        }
    }

    fn ids(ops: &[Operation]) -> Vec<i64> {
        ops.iter().map(|op| op.id.0).collect()
    }

    #[test]
    fn priority_then_insertion_order() {
        let mut queue = PartitionQueue::new();
        queue.offer(op(1, 1, OperationKind::Sync), false);
        queue.offer(op(2, 2, OperationKind::Fetch), false);
        queue.offer(op(3, 1, OperationKind::Fetch), false);
        queue.offer(op(4, 3, OperationKind::Send), true);

        let order: Vec<_> = std::iter::from_fn(|| queue.next())
            .map(|(key, ops)| (key.folder.0, ids(&ops)))
            .collect();
        assert_eq!(order, vec![(3, vec![4]), (2, vec![2]), (1, vec![3]), (1, vec![1])]);
    }

    #[test]
    fn same_key_is_never_in_flight_twice() {
        let mut queue = PartitionQueue::new();
        queue.offer(op(1, 1, OperationKind::Fetch), false);
        let (key, first) = queue.next().unwrap();
        assert_eq!(ids(&first), vec![1]);

        queue.offer(op(2, 1, OperationKind::Fetch), false);
        queue.offer(op(3, 1, OperationKind::Fetch), false);
        assert!(queue.next().is_none());

        queue.complete(key);
        let (_, merged) = queue.next().unwrap();
        assert_eq!(ids(&merged), vec![2, 3]);
    }

    #[test]
    fn offline_is_part_of_the_key() {
        let mut queue = PartitionQueue::new();
        queue.offer(op(1, 1, OperationKind::Fetch), false);
        queue.offer(op(2, 1, OperationKind::Fetch), true);
        assert!(queue.next().is_some());
        assert!(queue.next().is_some());
        assert!(queue.next().is_none());
    }

    #[test]
    fn repeated_offer_is_ignored_and_sorted() {
        let mut queue = PartitionQueue::new();
        queue.offer(op(5, 1, OperationKind::Fetch), false);
        queue.offer(op(2, 1, OperationKind::Fetch), false);
        queue.offer(op(5, 1, OperationKind::Fetch), false);
        let (_, ops) = queue.next().unwrap();
        assert_eq!(ids(&ops), vec![2, 5]);
    }

    #[test]
    fn idle_tracks_running_partitions() {
        let mut queue = PartitionQueue::new();
        assert!(queue.is_idle());
        queue.offer(op(1, 1, OperationKind::Sync), false);
        let (key, _) = queue.next().unwrap();
        assert!(!queue.is_idle());
        queue.complete(key);
        assert!(queue.is_idle());
    }
}
