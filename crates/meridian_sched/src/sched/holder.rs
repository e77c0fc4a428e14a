//! Precomputed per-transaction view.
//!
//! A `TxnHolder` is materialized once at intake and carries everything the
//! scheduler needs repeatedly: which of the transaction's keys live in this
//! partition (with their lock mode), the involved partitions and replicas,
//! and the representative home replica.

use anyhow::Context;

use crate::sched::types::{
    Key, LockMode, PartitionId, Procedure, ReplicaId, Sharding, Transaction, TransactionType,
    TxnId,
};

#[derive(Clone, Debug)]
pub struct TxnHolder {
    txn: Transaction,
    keys_in_partition: Vec<(Key, LockMode)>,
    num_involved_partitions: u32,
    active_partitions: Vec<PartitionId>,
    involved_replicas: Vec<ReplicaId>,
}

impl TxnHolder {
    /// Build the view for `txn` under the given placement. Fails when the
    /// transaction carries no master metadata: every production transaction
    /// is annotated by the forwarder before it reaches this partition.
    pub fn new(sharding: &dyn Sharding, txn: Transaction) -> anyhow::Result<Self> {
        txn.master_metadata
            .keys()
            .next()
            .with_context(|| format!("txn {} has no master metadata", txn.id))?;

        let mut keys_in_partition = Vec::new();
        let mut involved_partitions = Vec::new();
        let mut active_partitions = Vec::new();
        let mut involved_replicas = Vec::new();

        for key in txn.read_set.keys() {
            involved_partitions.push(sharding.partition_of_key(key));
            // A key in both sets gets the write lock instead.
            if sharding.key_is_in_local_partition(key) && !txn.write_set.contains_key(key) {
                keys_in_partition.push((key.clone(), LockMode::Read));
            }
        }
        for key in txn.write_set.keys() {
            let partition = sharding.partition_of_key(key);
            involved_partitions.push(partition);
            active_partitions.push(partition);
            if sharding.key_is_in_local_partition(key) {
                keys_in_partition.push((key.clone(), LockMode::Write));
            }
        }

        for metadata in txn.master_metadata.values() {
            involved_replicas.push(metadata.master);
        }
        // A counterless remaster holds locks at both the old and the new
        // master, so the new master is involved even though no key is
        // annotated with it yet.
        if txn.txn_type == TransactionType::MultiHome {
            if let Procedure::Remaster(remaster) = &txn.procedure {
                involved_replicas.push(remaster.new_master);
            }
        }

        involved_partitions.sort_unstable();
        involved_partitions.dedup();
        active_partitions.sort_unstable();
        active_partitions.dedup();
        involved_replicas.sort_unstable();
        involved_replicas.dedup();

        Ok(Self {
            txn,
            keys_in_partition,
            num_involved_partitions: involved_partitions.len() as u32,
            active_partitions,
            involved_replicas,
        })
    }

    pub fn transaction(&self) -> &Transaction {
        &self.txn
    }

    pub fn transaction_mut(&mut self) -> &mut Transaction {
        &mut self.txn
    }

    pub fn into_transaction(self) -> Transaction {
        self.txn
    }

    pub fn id(&self) -> TxnId {
        self.txn.id
    }

    pub fn keys_in_partition(&self) -> &[(Key, LockMode)] {
        &self.keys_in_partition
    }

    pub fn num_involved_partitions(&self) -> u32 {
        self.num_involved_partitions
    }

    /// Partitions with at least one write.
    pub fn active_partitions(&self) -> &[PartitionId] {
        &self.active_partitions
    }

    pub fn involved_replicas(&self) -> &[ReplicaId] {
        &self.involved_replicas
    }

    /// Representative home replica. Single-home transactions and lock-only
    /// pieces carry one master across all their metadata, so the first entry
    /// suffices.
    pub fn replica_id(&self) -> ReplicaId {
        self.txn
            .master_metadata
            .values()
            .next()
            .expect("master metadata checked non-empty at construction")
            .master
    }

    /// Identifier used by per-replica log assembly. The lock-only piece of a
    /// remaster that runs at the new master reports the new master, not the
    /// metadata one.
    pub fn id_and_replica(&self) -> (TxnId, ReplicaId) {
        if self.txn.txn_type == TransactionType::LockOnly {
            if let Procedure::Remaster(remaster) = &self.txn.procedure {
                if remaster.is_new_master_lock_only {
                    return (self.txn.id, remaster.new_master);
                }
            }
        }
        (self.txn.id, self.replica_id())
    }
}
