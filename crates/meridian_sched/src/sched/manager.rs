//! Lock-manager variants.
//!
//! Two implementations share one trait: `DdrLockManager` grants locks
//! optimistically and relies on the deadlock resolver to rewrite wait-for
//! cycles deterministically, while `FifoLockManager` keeps classic per-key
//! FIFO queues for deployments that restart mistimed transactions instead of
//! resolving deadlocks. The variant is chosen at construction.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{error, warn};

use crate::sched::holder::TxnHolder;
use crate::sched::resolver::{DeadlockResolver, ResolverCmd};
use crate::sched::state::{LockQueueTail, Shared, TxnInfo};
use crate::sched::types::{
    make_key_replica, AcquireLocksResult, KeyReplica, LockMode, Procedure, TxnId,
};

/// Operations every lock-manager variant exposes to the scheduler.
pub trait LockManager: Send {
    /// Register the number of lock requests still expected for this
    /// transaction. Returns whether the transaction is ready afterwards.
    fn accept_transaction(&mut self, holder: &TxnHolder) -> bool;

    /// Request all locks the transaction needs in this partition.
    fn acquire_locks(&mut self, holder: &TxnHolder) -> AcquireLocksResult;

    fn accept_txn_and_acquire_locks(&mut self, holder: &TxnHolder) -> AcquireLocksResult {
        self.accept_transaction(holder);
        self.acquire_locks(holder)
    }

    /// Release everything the transaction holds and return the transactions
    /// that became ready as a result.
    fn release_locks(&mut self, holder: &TxnHolder) -> Vec<TxnId>;

    /// Drain transactions made ready outside the acquire/release path.
    fn get_ready_txns(&mut self) -> Vec<TxnId>;

    fn get_stats(&self, level: u32) -> serde_json::Value;
}

/// Construction-time lock-manager selection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockManagerKind {
    /// Deterministic deadlock resolution.
    #[default]
    Ddr,
    /// Per-key FIFO queues; pairs with restart-based remastering.
    Fifo,
}

pub enum AnyLockManager {
    Ddr(DdrLockManager),
    Fifo(FifoLockManager),
}

impl AnyLockManager {
    pub fn new(kind: LockManagerKind) -> Self {
        match kind {
            LockManagerKind::Ddr => Self::Ddr(DdrLockManager::default()),
            LockManagerKind::Fifo => Self::Fifo(FifoLockManager::default()),
        }
    }

    pub fn kind(&self) -> LockManagerKind {
        match self {
            Self::Ddr(_) => LockManagerKind::Ddr,
            Self::Fifo(_) => LockManagerKind::Fifo,
        }
    }

    /// Spawn the deadlock resolver where the variant has one. Returns
    /// whether a resolver was started.
    pub fn start_deadlock_resolver(
        &mut self,
        signal: UnboundedSender<()>,
        check_interval: Duration,
    ) -> bool {
        match self {
            Self::Ddr(lm) => {
                lm.start_deadlock_resolver(signal, check_interval);
                true
            }
            Self::Fifo(_) => false,
        }
    }

    /// Trigger one resolver pass out of schedule. Returns false when the
    /// variant has no resolver or a pass is already running.
    pub fn resolve_deadlock(&self) -> bool {
        match self {
            Self::Ddr(lm) => lm.resolve_deadlock(),
            Self::Fifo(_) => false,
        }
    }
}

impl LockManager for AnyLockManager {
    fn accept_transaction(&mut self, holder: &TxnHolder) -> bool {
        match self {
            Self::Ddr(lm) => lm.accept_transaction(holder),
            Self::Fifo(lm) => lm.accept_transaction(holder),
        }
    }

    fn acquire_locks(&mut self, holder: &TxnHolder) -> AcquireLocksResult {
        match self {
            Self::Ddr(lm) => lm.acquire_locks(holder),
            Self::Fifo(lm) => lm.acquire_locks(holder),
        }
    }

    fn release_locks(&mut self, holder: &TxnHolder) -> Vec<TxnId> {
        match self {
            Self::Ddr(lm) => lm.release_locks(holder),
            Self::Fifo(lm) => lm.release_locks(holder),
        }
    }

    fn get_ready_txns(&mut self) -> Vec<TxnId> {
        match self {
            Self::Ddr(lm) => lm.get_ready_txns(),
            Self::Fifo(lm) => lm.get_ready_txns(),
        }
    }

    fn get_stats(&self, level: u32) -> serde_json::Value {
        match self {
            Self::Ddr(lm) => lm.get_stats(level),
            Self::Fifo(lm) => lm.get_stats(level),
        }
    }
}

/// Enumerate the key-replicas a transaction must lock in this partition.
///
/// A remaster transaction carries a single key but locks it at the old
/// master on its first piece and at the new master on the new-master
/// lock-only piece.
fn locks_to_request(holder: &TxnHolder) -> Vec<(KeyReplica, LockMode)> {
    let txn = holder.transaction();
    if let Procedure::Remaster(remaster) = &txn.procedure {
        let (key, _) = holder
            .keys_in_partition()
            .first()
            .expect("caller checked keys_in_partition is non-empty");
        let mut master = txn
            .master_metadata
            .get(key)
            .expect("key in partition without master metadata")
            .master;
        if remaster.is_new_master_lock_only {
            master = remaster.new_master;
        }
        vec![(make_key_replica(key, master), LockMode::Write)]
    } else {
        holder
            .keys_in_partition()
            .iter()
            .map(|(key, mode)| {
                let master = txn
                    .master_metadata
                    .get(key)
                    .expect("key in partition without master metadata")
                    .master;
                (make_key_replica(key, master), *mode)
            })
            .collect()
    }
}

fn expected_lock_requests(holder: &TxnHolder) -> i32 {
    if holder.transaction().is_remaster() {
        // One key, locked at both the old and the new master.
        2
    } else {
        holder.keys_in_partition().len() as i32
    }
}

struct ResolverHandle {
    cmd_tx: Option<mpsc::Sender<ResolverCmd>>,
    running: Arc<AtomicBool>,
    join: Option<thread::JoinHandle<()>>,
}

impl Drop for ResolverHandle {
    fn drop(&mut self) {
        // Closing the command channel stops the resolver loop.
        self.cmd_tx.take();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Lock manager with deterministic deadlock resolution.
///
/// The lock table is only ever touched by the owning scheduler thread; the
/// wait-for records behind `Shared` are the sole state the resolver thread
/// sees.
#[derive(Default)]
pub struct DdrLockManager {
    lock_table: HashMap<KeyReplica, LockQueueTail>,
    shared: Arc<Shared>,
    resolver: Option<ResolverHandle>,
}

impl DdrLockManager {
    /// Spawn the resolver thread, waking every `check_interval`. Newly
    /// ready transactions are published through `get_ready_txns` and
    /// announced on `signal`.
    pub fn start_deadlock_resolver(
        &mut self,
        signal: UnboundedSender<()>,
        check_interval: Duration,
    ) {
        if self.resolver.is_some() {
            warn!("deadlock resolver is already running");
            return;
        }
        let (cmd_tx, cmd_rx) = mpsc::channel();
        let running = Arc::new(AtomicBool::new(false));
        let mut resolver = DeadlockResolver::new(Arc::clone(&self.shared), Some(signal));
        let join = {
            let running = Arc::clone(&running);
            thread::Builder::new()
                .name("deadlock-resolver".into())
                .spawn(move || resolver.run(cmd_rx, check_interval, running))
                .expect("failed to spawn deadlock resolver thread")
        };
        self.resolver = Some(ResolverHandle {
            cmd_tx: Some(cmd_tx),
            running,
            join: Some(join),
        });
    }

    /// Trigger a resolver pass outside the regular cadence. Returns false
    /// when no resolver was started or a pass is in flight.
    pub fn resolve_deadlock(&self) -> bool {
        let Some(handle) = &self.resolver else {
            return false;
        };
        if handle.running.load(Ordering::Acquire) {
            return false;
        }
        handle
            .cmd_tx
            .as_ref()
            .is_some_and(|tx| tx.send(ResolverCmd::RunOnce).is_ok())
    }

    #[cfg(test)]
    pub(super) fn shared(&self) -> Arc<Shared> {
        Arc::clone(&self.shared)
    }
}

impl LockManager for DdrLockManager {
    fn accept_transaction(&mut self, holder: &TxnHolder) -> bool {
        assert!(
            !holder.keys_in_partition().is_empty(),
            "empty txn must not reach the lock manager"
        );
        let txn_id = holder.id();
        let mut txns = self.shared.txn_info.lock().expect("txn info lock poisoned");
        let info = txns.entry(txn_id).or_insert_with(|| TxnInfo::new(txn_id));
        info.unarrived_lock_requests += expected_lock_requests(holder);
        info.is_ready()
    }

    fn acquire_locks(&mut self, holder: &TxnHolder) -> AcquireLocksResult {
        assert!(
            !holder.keys_in_partition().is_empty(),
            "empty txn must not reach the lock manager"
        );
        let txn_id = holder.id();
        let locks = locks_to_request(holder);

        // Walk the lock-queue tails to find the transactions blocking this
        // one.
        let mut blocking_txns = Vec::new();
        for (key_replica, mode) in &locks {
            let tail = self.lock_table.entry(key_replica.clone()).or_default();
            match mode {
                LockMode::Read => {
                    if let Some(blocker) = tail.acquire_read_lock(txn_id) {
                        blocking_txns.push(blocker);
                    }
                }
                LockMode::Write => blocking_txns.extend(tail.acquire_write_lock(txn_id)),
            }
        }
        blocking_txns.sort_unstable();
        blocking_txns.dedup();

        let mut txns = self.shared.txn_info.lock().expect("txn info lock poisoned");
        txns.entry(txn_id)
            .or_insert_with(|| TxnInfo::new(txn_id))
            .unarrived_lock_requests -= locks.len() as i32;

        let mut new_edges = 0;
        for &blocker in &blocking_txns {
            if blocker == txn_id {
                continue;
            }
            // Transactions returned from the lock table may have already
            // left the manager.
            if let Some(blocker_info) = txns.get_mut(&blocker) {
                // A blocker seen by two lock-only pieces of one multi-home
                // txn is counted twice here and appears twice in its
                // waited_by, so decrements on release balance exactly.
                blocker_info.waited_by.push(txn_id);
                new_edges += 1;
            }
        }
        let info = txns.get_mut(&txn_id).expect("inserted above");
        info.num_waiting_for += new_edges;
        if info.is_ready() {
            AcquireLocksResult::Acquired
        } else {
            AcquireLocksResult::Waiting
        }
    }

    fn release_locks(&mut self, holder: &TxnHolder) -> Vec<TxnId> {
        let txn_id = holder.id();
        let mut txns = self.shared.txn_info.lock().expect("txn info lock poisoned");
        let Some(info) = txns.remove(&txn_id) else {
            return Vec::new();
        };
        assert!(info.is_ready(), "releasing unready txn {txn_id} is forbidden");

        let mut newly_ready = Vec::new();
        for blocked in info.live_waited_by() {
            let Some(blocked_info) = txns.get_mut(&blocked) else {
                error!("blocked txn {blocked} does not exist");
                continue;
            };
            blocked_info.num_waiting_for -= 1;
            // waited_by may hold duplicates; the blocked txn only becomes
            // ready once its last entry is accounted for.
            if blocked_info.is_ready() {
                newly_ready.push(blocked);
            }
        }
        newly_ready
    }

    fn get_ready_txns(&mut self) -> Vec<TxnId> {
        std::mem::take(&mut *self.shared.ready_txns.lock().expect("ready txns lock poisoned"))
    }

    fn get_stats(&self, level: u32) -> serde_json::Value {
        let mut doc = serde_json::Map::new();
        {
            let txns = self.shared.txn_info.lock().expect("txn info lock poisoned");
            doc.insert("num_txns_waiting_for_lock".into(), json!(txns.len()));
            if level >= 1 {
                let mut waited: Vec<(TxnId, i32)> =
                    txns.values().map(|info| (info.id, info.num_waiting_for)).collect();
                waited.sort_unstable();
                doc.insert("num_waited_per_txn".into(), json!(waited));
            }
        }
        doc.insert("num_locked_keys".into(), json!(0));
        if level >= 2 {
            let mut entries: Vec<_> = self.lock_table.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let table: Vec<serde_json::Value> = entries
                .into_iter()
                .map(|(key, tail)| {
                    json!([
                        String::from_utf8_lossy(key),
                        tail.write_lock_requester().unwrap_or(0),
                        tail.read_lock_requesters(),
                    ])
                })
                .collect();
            doc.insert("lock_table".into(), json!(table));
        }
        serde_json::Value::Object(doc)
    }
}

/// Per-key FIFO queue: the first `granted` entries hold the lock.
#[derive(Debug, Default)]
struct FifoQueue {
    entries: VecDeque<(TxnId, LockMode)>,
    granted: usize,
}

impl FifoQueue {
    fn grants_all_reads(&self) -> bool {
        self.entries
            .iter()
            .take(self.granted)
            .all(|(_, mode)| *mode == LockMode::Read)
    }

    /// Extend the granted prefix as far as compatibility allows, returning
    /// the transactions granted by this step.
    fn extend_grants(&mut self) -> Vec<TxnId> {
        let mut newly_granted = Vec::new();
        while let Some(&(txn_id, mode)) = self.entries.get(self.granted) {
            let compatible =
                self.granted == 0 || (mode == LockMode::Read && self.grants_all_reads());
            if !compatible {
                break;
            }
            self.granted += 1;
            newly_granted.push(txn_id);
        }
        newly_granted
    }

    /// Enqueue a request; returns true when it is granted immediately.
    fn push(&mut self, txn_id: TxnId, mode: LockMode) -> bool {
        self.entries.push_back((txn_id, mode));
        self.extend_grants().contains(&txn_id)
    }

    /// Drop a transaction's entry and hand the lock onwards.
    fn remove(&mut self, txn_id: TxnId) -> Vec<TxnId> {
        let Some(pos) = self.entries.iter().position(|(id, _)| *id == txn_id) else {
            return Vec::new();
        };
        if pos < self.granted {
            self.granted -= 1;
        }
        self.entries.remove(pos);
        self.extend_grants()
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Default)]
struct FifoTxnInfo {
    unarrived_lock_requests: i32,
    num_waiting: i32,
    keys: Vec<KeyReplica>,
}

impl FifoTxnInfo {
    fn is_ready(&self) -> bool {
        self.unarrived_lock_requests == 0 && self.num_waiting == 0
    }
}

/// Queue-based lock manager without deadlock resolution. Deployments using
/// it restart transactions whose timestamps fall behind the local clock, so
/// lock-order cycles between correctly timestamped transactions do not
/// arise.
#[derive(Default)]
pub struct FifoLockManager {
    lock_table: HashMap<KeyReplica, FifoQueue>,
    txn_info: HashMap<TxnId, FifoTxnInfo>,
}

impl LockManager for FifoLockManager {
    fn accept_transaction(&mut self, holder: &TxnHolder) -> bool {
        assert!(
            !holder.keys_in_partition().is_empty(),
            "empty txn must not reach the lock manager"
        );
        let info = self.txn_info.entry(holder.id()).or_default();
        info.unarrived_lock_requests += expected_lock_requests(holder);
        info.is_ready()
    }

    fn acquire_locks(&mut self, holder: &TxnHolder) -> AcquireLocksResult {
        assert!(
            !holder.keys_in_partition().is_empty(),
            "empty txn must not reach the lock manager"
        );
        let txn_id = holder.id();
        let locks = locks_to_request(holder);

        let mut num_granted = 0;
        for (key_replica, mode) in &locks {
            let queue = self.lock_table.entry(key_replica.clone()).or_default();
            if queue.push(txn_id, *mode) {
                num_granted += 1;
            }
        }

        let info = self.txn_info.entry(txn_id).or_default();
        info.unarrived_lock_requests -= locks.len() as i32;
        info.num_waiting += locks.len() as i32 - num_granted;
        info.keys.extend(locks.into_iter().map(|(key, _)| key));
        if info.is_ready() {
            AcquireLocksResult::Acquired
        } else {
            AcquireLocksResult::Waiting
        }
    }

    fn release_locks(&mut self, holder: &TxnHolder) -> Vec<TxnId> {
        let txn_id = holder.id();
        let Some(info) = self.txn_info.remove(&txn_id) else {
            return Vec::new();
        };
        assert!(info.is_ready(), "releasing unready txn {txn_id} is forbidden");

        let mut newly_ready = Vec::new();
        for key_replica in &info.keys {
            let Some(queue) = self.lock_table.get_mut(key_replica) else {
                error!(
                    "lock queue for {} is missing",
                    String::from_utf8_lossy(key_replica)
                );
                continue;
            };
            for granted in queue.remove(txn_id) {
                let Some(granted_info) = self.txn_info.get_mut(&granted) else {
                    error!("granted txn {granted} does not exist");
                    continue;
                };
                granted_info.num_waiting -= 1;
                if granted_info.is_ready() {
                    newly_ready.push(granted);
                }
            }
            if queue.is_empty() {
                self.lock_table.remove(key_replica);
            }
        }
        newly_ready
    }

    fn get_ready_txns(&mut self) -> Vec<TxnId> {
        // Readiness is only ever produced on the acquire/release path.
        Vec::new()
    }

    fn get_stats(&self, level: u32) -> serde_json::Value {
        let mut doc = serde_json::Map::new();
        doc.insert("num_txns_waiting_for_lock".into(), json!(self.txn_info.len()));
        if level >= 2 {
            let mut entries: Vec<_> = self.lock_table.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let table: Vec<serde_json::Value> = entries
                .into_iter()
                .map(|(key, queue)| {
                    json!([
                        String::from_utf8_lossy(key),
                        queue.granted,
                        queue.entries.iter().map(|(id, _)| *id).collect::<Vec<_>>(),
                    ])
                })
                .collect();
            doc.insert("lock_table".into(), json!(table));
        }
        serde_json::Value::Object(doc)
    }
}
