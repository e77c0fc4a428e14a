//! Scheduling module wiring.
//!
//! `async_log` holds the in-order batch log, `holder` the precomputed
//! per-transaction view, `state` the lock-queue tails and wait-for records,
//! `manager` the lock-manager variants, and `resolver` the deterministic
//! deadlock resolver. `types` defines the shared ids, the transaction model,
//! and the `Sharding` seam implemented by the node configuration.

mod async_log;
mod holder;
mod manager;
mod resolver;
mod state;
mod types;

pub use async_log::AsyncLog;
pub use holder::TxnHolder;
pub use manager::{
    AnyLockManager, DdrLockManager, FifoLockManager, LockManager, LockManagerKind,
};
pub use types::{
    make_key_replica, AcquireLocksResult, BatchId, Key, KeyReplica, LockMode, MachineId, Metadata,
    PartitionId, Procedure, Remaster, ReplicaId, Sharding, SlotId, Transaction, TransactionEvent,
    TransactionStatus, TransactionType, TxnId, Value, SENTINEL_TXN_ID,
};
