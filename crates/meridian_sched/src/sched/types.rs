//! Shared types for the scheduling core.
//!
//! These types are kept in a small, dependency-light module because they are
//! used by the lock manager, the node modules, and the workload generator.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Globally unique transaction identifier, monotonically increasing in
/// generation order.
pub type TxnId = u64;

/// Reserved id marking a removed edge in a waited-by list. Slots are
/// overwritten rather than compacted so the resolver can rewrite them in
/// place.
pub const SENTINEL_TXN_ID: TxnId = 0;

pub type Key = Vec<u8>;
pub type Value = Vec<u8>;
/// Lock-table index: a key qualified by the replica mastering it. The same
/// key mastered at two replicas (mid-remaster) has two independent entries.
pub type KeyReplica = Vec<u8>;
pub type BatchId = u32;
pub type SlotId = u32;
pub type ReplicaId = u32;
pub type PartitionId = u32;
/// Packed `(replica, partition)` address: `replica * num_partitions + partition`.
pub type MachineId = u32;

/// Build the lock-table index for a key mastered at `master`.
pub fn make_key_replica(key: &[u8], master: ReplicaId) -> KeyReplica {
    let master_str = master.to_string();
    let mut key_replica = Vec::with_capacity(key.len() + master_str.len() + 1);
    key_replica.extend_from_slice(key);
    key_replica.push(b':');
    key_replica.extend_from_slice(master_str.as_bytes());
    key_replica
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LockMode {
    Read,
    Write,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquireLocksResult {
    Acquired,
    Waiting,
    /// Reserved for lock-manager variants that can reject a request outright.
    Abort,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionType {
    /// All keys share one master replica.
    SingleHome,
    /// Keys are mastered at multiple replicas.
    MultiHome,
    /// Per-master piece of a multi-home transaction, holding its locks at
    /// one master.
    LockOnly,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    NotStarted,
    Committed,
    Aborted,
}

/// Master metadata attached to each key of a transaction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub master: ReplicaId,
    pub counter: u32,
}

impl Metadata {
    pub fn new(master: ReplicaId) -> Self {
        Self { master, counter: 0 }
    }
}

/// Transfer of a key's master from its current replica to `new_master`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Remaster {
    pub new_master: ReplicaId,
    /// Set on the lock-only piece that acquires the lock at the new master.
    pub is_new_master_lock_only: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Procedure {
    /// Read/write the declared key sets. Execution logic lives outside the
    /// scheduling core.
    Access,
    Remaster(Remaster),
}

/// Lifecycle points recorded on a transaction as it moves through the node.
///
/// Individual events can be suppressed through the node configuration.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionEvent {
    EnterSequencer,
    EnterLocalBatch,
    ExitSequencerInBatch,
    EnterScheduler,
    Dispatched,
    Released,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TxnId,
    pub txn_type: TransactionType,
    pub status: TransactionStatus,
    pub abort_reason: Option<String>,
    /// Originator-local nanoseconds. Gates entry into the local batch when
    /// synchronized batching is enabled.
    pub timestamp: i64,
    pub coordinating_server: MachineId,
    pub read_set: BTreeMap<Key, Value>,
    pub write_set: BTreeMap<Key, Value>,
    pub master_metadata: BTreeMap<Key, Metadata>,
    pub procedure: Procedure,
    /// Recorded lifecycle events with their local timestamps.
    pub events: Vec<(TransactionEvent, i64)>,
}

impl Transaction {
    pub fn new(id: TxnId, txn_type: TransactionType) -> Self {
        Self {
            id,
            txn_type,
            status: TransactionStatus::NotStarted,
            abort_reason: None,
            timestamp: 0,
            coordinating_server: 0,
            read_set: BTreeMap::new(),
            write_set: BTreeMap::new(),
            master_metadata: BTreeMap::new(),
            procedure: Procedure::Access,
            events: Vec::new(),
        }
    }

    pub fn with_read(mut self, key: impl Into<Key>, master: ReplicaId) -> Self {
        let key = key.into();
        self.master_metadata.insert(key.clone(), Metadata::new(master));
        self.read_set.insert(key, Value::new());
        self
    }

    pub fn with_write(mut self, key: impl Into<Key>, master: ReplicaId) -> Self {
        let key = key.into();
        self.master_metadata.insert(key.clone(), Metadata::new(master));
        self.write_set.insert(key, Value::new());
        self
    }

    pub fn is_remaster(&self) -> bool {
        matches!(self.procedure, Procedure::Remaster(_))
    }

    pub fn record_event(&mut self, event: TransactionEvent, at: i64) {
        self.events.push((event, at));
    }
}

/// Key-placement seam implemented by the node configuration.
///
/// The scheduling core never computes placement itself; everything it needs
/// to know about the topology comes through this trait.
pub trait Sharding {
    fn num_partitions(&self) -> u32;
    fn num_replicas(&self) -> u32;
    fn local_partition(&self) -> PartitionId;
    fn partition_of_key(&self, key: &[u8]) -> PartitionId;

    fn key_is_in_local_partition(&self, key: &[u8]) -> bool {
        self.partition_of_key(key) == self.local_partition()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_replica_is_key_colon_master() {
        assert_eq!(make_key_replica(b"acct-7", 2), b"acct-7:2".to_vec());
        assert_eq!(make_key_replica(b"acct-7", 12), b"acct-7:12".to_vec());
        // Distinct masters index distinct lock entries for the same key.
        assert_ne!(make_key_replica(b"k", 0), make_key_replica(b"k", 1));
    }

    #[test]
    fn remaster_flag_follows_the_procedure() {
        let mut txn = Transaction::new(100, TransactionType::SingleHome).with_write(b"k".to_vec(), 0);
        assert!(!txn.is_remaster());
        txn.procedure = Procedure::Remaster(Remaster {
            new_master: 1,
            is_new_master_lock_only: false,
        });
        assert!(txn.is_remaster());
    }
}
