//! Lock-queue tails and wait-for records.
//!
//! This module holds the mutable state shared between the lock manager and
//! the deadlock resolver. It is separate from the manager logic so that the
//! resolver can snapshot and rewrite records without knowing anything about
//! lock tables.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::sched::types::{TxnId, SENTINEL_TXN_ID};

/// Wait-for bookkeeping for one locally-known transaction.
///
/// `waited_by` keeps positional slots: removed edges are overwritten with the
/// sentinel instead of being compacted, so the resolver can rewrite a
/// snapshotted prefix in place while new entries keep appending behind it.
#[derive(Clone, Debug)]
pub(super) struct TxnInfo {
    pub(super) id: TxnId,
    /// Lock requests the partition still expects for this transaction.
    pub(super) unarrived_lock_requests: i32,
    /// Edges `other -> self` currently in the wait-for graph. A blocker seen
    /// by two lock-only pieces of one multi-home transaction is counted
    /// twice, and the same transaction then appears twice in the blocker's
    /// `waited_by`, so decrements on release balance exactly.
    pub(super) num_waiting_for: i32,
    pub(super) waited_by: Vec<TxnId>,
}

impl TxnInfo {
    pub(super) fn new(id: TxnId) -> Self {
        Self {
            id,
            unarrived_lock_requests: 0,
            num_waiting_for: 0,
            waited_by: Vec::new(),
        }
    }

    pub(super) fn is_complete(&self) -> bool {
        self.unarrived_lock_requests == 0
    }

    pub(super) fn is_ready(&self) -> bool {
        self.is_complete() && self.num_waiting_for == 0
    }

    pub(super) fn live_waited_by(&self) -> impl Iterator<Item = TxnId> + '_ {
        self.waited_by
            .iter()
            .copied()
            .filter(|id| *id != SENTINEL_TXN_ID)
    }
}

/// State shared with the deadlock resolver thread.
///
/// Two locks only: `txn_info` is held for whole lock-manager operations and
/// for the resolver's snapshot and write-back, `ready_txns` guards the
/// resolver's outbox. Neither is ever held across I/O.
#[derive(Debug, Default)]
pub(super) struct Shared {
    pub(super) txn_info: Mutex<HashMap<TxnId, TxnInfo>>,
    pub(super) ready_txns: Mutex<Vec<TxnId>>,
}

/// Tail of the conceptual lock queue for one key-replica: who the next
/// arriving request must wait for. Earlier holders are irrelevant, so the
/// whole queue is never materialized.
#[derive(Debug, Default)]
pub(super) struct LockQueueTail {
    write_lock_requester: Option<TxnId>,
    read_lock_requesters: Vec<TxnId>,
}

impl LockQueueTail {
    /// Append a reader; the current write requester, if any, is the single
    /// transaction this reader must wait for.
    pub(super) fn acquire_read_lock(&mut self, txn_id: TxnId) -> Option<TxnId> {
        self.read_lock_requesters.push(txn_id);
        self.write_lock_requester
    }

    /// Claim the write tail, returning everything the writer must wait for:
    /// the readers that queued up behind the previous writer, or the
    /// previous writer itself when no reader arrived in between.
    pub(super) fn acquire_write_lock(&mut self, txn_id: TxnId) -> Vec<TxnId> {
        let deps = if self.read_lock_requesters.is_empty() {
            self.write_lock_requester.into_iter().collect()
        } else {
            std::mem::take(&mut self.read_lock_requesters)
        };
        self.write_lock_requester = Some(txn_id);
        deps
    }

    pub(super) fn write_lock_requester(&self) -> Option<TxnId> {
        self.write_lock_requester
    }

    pub(super) fn read_lock_requesters(&self) -> &[TxnId] {
        &self.read_lock_requesters
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_waits_on_current_writer() {
        let mut tail = LockQueueTail::default();
        assert_eq!(tail.acquire_write_lock(100), Vec::<TxnId>::new());
        assert_eq!(tail.acquire_read_lock(200), Some(100));
        // The writer is not displaced by readers queueing behind it.
        assert_eq!(tail.write_lock_requester(), Some(100));
    }

    #[test]
    fn writer_waits_on_queued_readers_and_clears_them() {
        let mut tail = LockQueueTail::default();
        assert_eq!(tail.acquire_read_lock(1), None);
        assert_eq!(tail.acquire_read_lock(2), None);
        assert_eq!(tail.acquire_write_lock(3), vec![1, 2]);
        assert!(tail.read_lock_requesters().is_empty());
        assert_eq!(tail.write_lock_requester(), Some(3));
    }

    #[test]
    fn second_writer_sees_only_the_first() {
        let mut tail = LockQueueTail::default();
        assert!(tail.acquire_write_lock(7).is_empty());
        assert_eq!(tail.acquire_write_lock(8), vec![7]);
        assert_eq!(tail.write_lock_requester(), Some(8));
    }

    #[test]
    fn txn_info_readiness() {
        let mut info = TxnInfo::new(42);
        assert!(info.is_ready());
        info.unarrived_lock_requests += 2;
        assert!(!info.is_complete());
        info.unarrived_lock_requests -= 2;
        info.num_waiting_for = 1;
        assert!(info.is_complete());
        assert!(!info.is_ready());
    }
}
