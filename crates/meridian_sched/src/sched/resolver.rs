//! Deterministic deadlock resolver.
//!
//! Periodically the resolver takes a snapshot of the wait-for records,
//! finds strongly connected components, and rewrites the *stable* ones into
//! simple paths, ordered by ascending transaction id so that every replica
//! of the partition produces the identical rewrite. The live records may
//! keep growing while a pass runs: for the members of a stable component the
//! waiting-for counter cannot change underneath us and the waited-by list
//! can only grow at the tail, so writing back the rewritten prefix and the
//! recomputed counters commutes with concurrent inserts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, trace};

use crate::sched::state::{Shared, TxnInfo};
use crate::sched::types::{TxnId, SENTINEL_TXN_ID};

pub(super) enum ResolverCmd {
    RunOnce,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Component {
    Unassigned,
    Stable,
    Unstable,
}

#[derive(Debug)]
struct Node {
    is_complete: bool,
    visited: bool,
    component: Component,
    /// Transpose edges: the transactions whose waited-by lists point here.
    redges: Vec<TxnId>,
}

impl Node {
    fn new(is_complete: bool) -> Self {
        Self {
            is_complete,
            visited: false,
            component: Component::Unassigned,
            redges: Vec::new(),
        }
    }
}

pub(super) struct DeadlockResolver {
    shared: Arc<Shared>,
    signal: Option<UnboundedSender<()>>,

    // Scratch state reused across passes.
    txn_info: HashMap<TxnId, TxnInfo>,
    graph: HashMap<TxnId, Node>,
    topo_order: Vec<TxnId>,
    scc: Vec<TxnId>,
}

impl DeadlockResolver {
    pub(super) fn new(shared: Arc<Shared>, signal: Option<UnboundedSender<()>>) -> Self {
        Self {
            shared,
            signal,
            txn_info: HashMap::new(),
            graph: HashMap::new(),
            topo_order: Vec::new(),
            scc: Vec::new(),
        }
    }

    /// Thread body: wake on every command or after `check_interval`, run one
    /// pass, and exit when the command channel closes.
    pub(super) fn run(
        &mut self,
        cmds: mpsc::Receiver<ResolverCmd>,
        check_interval: Duration,
        running: Arc<AtomicBool>,
    ) {
        loop {
            match cmds.recv_timeout(check_interval) {
                Ok(ResolverCmd::RunOnce) | Err(mpsc::RecvTimeoutError::Timeout) => {
                    running.store(true, Ordering::Release);
                    self.run_once();
                    running.store(false, Ordering::Release);
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    /// One full pass: snapshot, resolve, write back, publish. Returns the
    /// number of components resolved.
    pub(super) fn run_once(&mut self) -> usize {
        trace!("deadlock resolver woke up");

        self.take_snapshot();
        let (to_update, ready_txns, num_components) = self.resolve_all();
        if num_components > 0 {
            trace!("found and resolved {num_components} deadlock group(s)");
        } else {
            trace!("no stable deadlock found");
        }

        if !to_update.is_empty() {
            self.write_back(&to_update);
        }
        if !ready_txns.is_empty() {
            self.publish(ready_txns);
        }
        num_components
    }

    pub(super) fn take_snapshot(&mut self) {
        self.txn_info = self
            .shared
            .txn_info
            .lock()
            .expect("txn info lock poisoned")
            .clone();
    }

    /// Resolve every stable component of size >= 2 in the snapshot. Returns
    /// the txns whose records were rewritten, the txns made ready, and the
    /// number of components resolved.
    pub(super) fn resolve_all(&mut self) -> (Vec<TxnId>, Vec<TxnId>, usize) {
        self.topo_order.clear();
        self.graph.clear();

        // Depth-first traversals produce the transpose adjacency and a
        // post-order; reversed, the post-order is a topological order of the
        // forward graph.
        let ids: Vec<TxnId> = self.txn_info.keys().copied().collect();
        for id in ids {
            let is_complete = self.txn_info[&id].is_complete();
            let node = self.graph.entry(id).or_insert_with(|| Node::new(is_complete));
            if !node.visited {
                node.visited = true;
                self.build_transpose_from(id);
            }
        }
        self.topo_order.reverse();

        let mut to_update = Vec::new();
        let mut ready_txns = Vec::new();
        let mut num_components = 0;
        let topo_order = std::mem::take(&mut self.topo_order);
        for &txn_id in &topo_order {
            let node = self
                .graph
                .get(&txn_id)
                .expect("topological order contains unknown txn");
            if node.component != Component::Unassigned {
                continue;
            }
            self.scc.clear();
            if !self.form_component(txn_id) {
                for idx in 0..self.scc.len() {
                    let member = self.scc[idx];
                    self.graph
                        .get_mut(&member)
                        .expect("component contains unknown node")
                        .component = Component::Unstable;
                }
            } else if self.scc.len() > 1 {
                if let Some(ready) = self.rewrite_component() {
                    ready_txns.push(ready);
                }
                to_update.extend_from_slice(&self.scc);
                num_components += 1;
            }
        }
        self.topo_order = topo_order;

        (to_update, ready_txns, num_components)
    }

    /// Iterative depth-first traversal from `root` over waited-by edges.
    fn build_transpose_from(&mut self, root: TxnId) {
        // Each stack entry resumes at the next unprocessed edge.
        let mut stack = vec![(root, 0usize)];
        while let Some((id, edge_start)) = stack.pop() {
            let waited_by = &self
                .txn_info
                .get(&id)
                .expect("corrupted graph: unknown txn")
                .waited_by;
            let mut descended = false;
            let mut j = edge_start;
            while j < waited_by.len() {
                let neighbor = waited_by[j];
                j += 1;
                if neighbor == SENTINEL_TXN_ID {
                    continue;
                }
                let neighbor_complete = self
                    .txn_info
                    .get(&neighbor)
                    .expect("corrupted graph: unknown txn")
                    .is_complete();
                let node = self
                    .graph
                    .entry(neighbor)
                    .or_insert_with(|| Node::new(neighbor_complete));
                node.redges.push(id);
                if !node.visited {
                    node.visited = true;
                    stack.push((id, j));
                    stack.push((neighbor, 0));
                    descended = true;
                    break;
                }
            }
            if !descended {
                self.topo_order.push(id);
            }
        }
    }

    /// Collect the component containing `root` by traversing the transpose.
    /// Members are tentatively marked stable; the component is stable iff
    /// every member is complete and no traversed in-edge comes from an
    /// unstable node.
    fn form_component(&mut self, root: TxnId) -> bool {
        let mut is_stable = true;
        self.graph
            .get_mut(&root)
            .expect("corrupted auxiliary graph")
            .component = Component::Stable;
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            self.scc.push(id);
            let (is_complete, redges) = {
                let node = &self.graph[&id];
                (node.is_complete, node.redges.clone())
            };
            if !is_complete {
                is_stable = false;
            }
            for neighbor in redges {
                let node = self
                    .graph
                    .get_mut(&neighbor)
                    .expect("corrupted auxiliary graph: unknown node");
                match node.component {
                    Component::Unassigned => {
                        node.component = Component::Stable;
                        stack.push(neighbor);
                    }
                    Component::Unstable => is_stable = false,
                    Component::Stable => {}
                }
            }
        }
        is_stable
    }

    /// Rewrite the current component into the simple path
    /// `s_{k-1} -> ... -> s_0` over ascending txn ids. Every member gains
    /// exactly one outgoing edge (the head gains none) and every edge inside
    /// the component is eliminated. Returns the head if it became ready.
    fn rewrite_component(&mut self) -> Option<TxnId> {
        debug_assert!(self.scc.len() >= 2);
        self.scc.sort_unstable();

        for i in (0..self.scc.len()).rev() {
            let txn_id = self.scc[i];
            let mut waited_by = {
                let info = self
                    .txn_info
                    .get_mut(&txn_id)
                    .expect("component contains unknown txn");
                assert!(
                    info.is_complete(),
                    "component contains incomplete txn {txn_id}"
                );
                std::mem::take(&mut info.waited_by)
            };

            let mut new_edge_added = i == self.scc.len() - 1;
            for slot in waited_by.iter_mut() {
                if self.scc.binary_search(slot).is_err() {
                    continue;
                }
                let former = *slot;
                if !new_edge_added {
                    *slot = self.scc[i + 1];
                    self.txn_info
                        .get_mut(&self.scc[i + 1])
                        .expect("component member missing from snapshot")
                        .num_waiting_for += 1;
                    new_edge_added = true;
                } else {
                    *slot = SENTINEL_TXN_ID;
                }
                self.txn_info
                    .get_mut(&former)
                    .expect("component member missing from snapshot")
                    .num_waiting_for -= 1;
            }
            self.txn_info
                .get_mut(&txn_id)
                .expect("component contains unknown txn")
                .waited_by = waited_by;

            // Every member of a cycle is waited on by another member, so a
            // slot for the new edge must have existed.
            assert!(new_edge_added, "no slot to add the new edge of txn {txn_id}");
        }

        let head = &self.txn_info[&self.scc[0]];
        if head.is_ready() {
            Some(head.id)
        } else {
            None
        }
    }

    /// Copy the rewritten prefixes and counters over the live records.
    /// Entries appended behind the snapshotted prefix while the pass ran are
    /// left untouched.
    pub(super) fn write_back(&self, to_update: &[TxnId]) {
        let mut live = self.shared.txn_info.lock().expect("txn info lock poisoned");
        for &txn_id in to_update {
            let Some(new_info) = self.txn_info.get(&txn_id) else {
                error!("rewritten txn {txn_id} is missing from the snapshot");
                continue;
            };
            let Some(live_info) = live.get_mut(&txn_id) else {
                error!("rewritten txn {txn_id} no longer exists");
                continue;
            };
            let prefix = new_info.waited_by.len();
            live_info.waited_by[..prefix].copy_from_slice(&new_info.waited_by);
            live_info.num_waiting_for = new_info.num_waiting_for;
        }
    }

    /// Append to the ready outbox, then signal the scheduler.
    pub(super) fn publish(&self, ready_txns: Vec<TxnId>) {
        {
            let mut out = self
                .shared
                .ready_txns
                .lock()
                .expect("ready txns lock poisoned");
            out.extend_from_slice(&ready_txns);
        }
        if let Some(signal) = &self.signal {
            if signal.send(()).is_err() {
                debug!("resolver signal receiver is gone");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::manager::tests::holder;
    use crate::sched::manager::{DdrLockManager, LockManager};
    use crate::sched::types::{AcquireLocksResult, Transaction, TransactionType};

    fn seed_txn(shared: &Shared, id: TxnId, unarrived: i32, waiting_for: i32, waited_by: Vec<TxnId>) {
        let mut txns = shared.txn_info.lock().unwrap();
        let mut info = TxnInfo::new(id);
        info.unarrived_lock_requests = unarrived;
        info.num_waiting_for = waiting_for;
        info.waited_by = waited_by;
        txns.insert(id, info);
    }

    fn build_two_cycle(lm: &mut DdrLockManager) {
        // Txn 1 writes a (mastered at 0) and reads b (mastered at 1); txn 2
        // writes b and reads a. The lock-only pieces interleave so that each
        // ends up waiting for the other.
        let t1 = holder(
            Transaction::new(1, TransactionType::MultiHome)
                .with_write(b"a".to_vec(), 0)
                .with_read(b"b".to_vec(), 1),
        );
        let t2 = holder(
            Transaction::new(2, TransactionType::MultiHome)
                .with_write(b"b".to_vec(), 1)
                .with_read(b"a".to_vec(), 0),
        );
        lm.accept_transaction(&t1);
        lm.accept_transaction(&t2);

        let t1_write = holder(Transaction::new(1, TransactionType::LockOnly).with_write(b"a".to_vec(), 0));
        let t1_read = holder(Transaction::new(1, TransactionType::LockOnly).with_read(b"b".to_vec(), 1));
        let t2_write = holder(Transaction::new(2, TransactionType::LockOnly).with_write(b"b".to_vec(), 1));
        let t2_read = holder(Transaction::new(2, TransactionType::LockOnly).with_read(b"a".to_vec(), 0));

        assert_eq!(lm.acquire_locks(&t1_write), AcquireLocksResult::Waiting);
        assert_eq!(lm.acquire_locks(&t2_write), AcquireLocksResult::Waiting);
        assert_eq!(lm.acquire_locks(&t1_read), AcquireLocksResult::Waiting);
        assert_eq!(lm.acquire_locks(&t2_read), AcquireLocksResult::Waiting);
    }

    #[test]
    fn two_cycle_is_rewritten_into_a_path() {
        let mut lm = DdrLockManager::default();
        build_two_cycle(&mut lm);

        let (signal_tx, mut signal_rx) = tokio::sync::mpsc::unbounded_channel();
        let mut resolver = DeadlockResolver::new(lm.shared(), Some(signal_tx));
        assert_eq!(resolver.run_once(), 1);
        assert!(signal_rx.try_recv().is_ok());

        // The lower id becomes the head of the path and is published.
        assert_eq!(lm.get_ready_txns(), vec![1]);
        {
            let shared = lm.shared();
            let txns = shared.txn_info.lock().unwrap();
            assert_eq!(txns[&1].num_waiting_for, 0);
            assert_eq!(txns[&1].waited_by, vec![2]);
            assert_eq!(txns[&2].num_waiting_for, 1);
            assert_eq!(txns[&2].waited_by, vec![SENTINEL_TXN_ID]);
        }

        // Finishing the head unblocks the rest of the path.
        let t1 = holder(
            Transaction::new(1, TransactionType::MultiHome)
                .with_write(b"a".to_vec(), 0)
                .with_read(b"b".to_vec(), 1),
        );
        assert_eq!(lm.release_locks(&t1), vec![2]);
    }

    #[test]
    fn component_with_incomplete_member_is_not_touched() {
        let shared = Arc::new(Shared::default());
        // 1 -> 2 -> 3 -> 1, but txn 3 still expects a lock request.
        seed_txn(&shared, 1, 0, 1, vec![2]);
        seed_txn(&shared, 2, 0, 1, vec![3]);
        seed_txn(&shared, 3, 1, 1, vec![1]);

        let mut resolver = DeadlockResolver::new(Arc::clone(&shared), None);
        assert_eq!(resolver.run_once(), 0);

        let txns = shared.txn_info.lock().unwrap();
        for id in 1..=3 {
            assert_eq!(txns[&id].num_waiting_for, 1);
        }
        assert!(shared.ready_txns.lock().unwrap().is_empty());
    }

    #[test]
    fn larger_cycle_resolves_to_a_path_with_one_ready_head() {
        let shared = Arc::new(Shared::default());
        // 5 waits on 3, 7 on 5, 9 on 7, 3 on 9.
        seed_txn(&shared, 3, 0, 1, vec![5]);
        seed_txn(&shared, 5, 0, 1, vec![7]);
        seed_txn(&shared, 7, 0, 1, vec![9]);
        seed_txn(&shared, 9, 0, 1, vec![3]);

        let mut resolver = DeadlockResolver::new(Arc::clone(&shared), None);
        assert_eq!(resolver.run_once(), 1);

        let txns = shared.txn_info.lock().unwrap();
        assert_eq!(txns[&3].num_waiting_for, 0);
        assert_eq!(txns[&3].waited_by, vec![5]);
        assert_eq!(txns[&5].waited_by, vec![7]);
        assert_eq!(txns[&7].waited_by, vec![9]);
        assert_eq!(txns[&9].waited_by, vec![SENTINEL_TXN_ID]);
        for id in [5, 7, 9] {
            assert_eq!(txns[&id].num_waiting_for, 1);
        }
        // Exactly k-1 intra-component edges remain.
        let members = [3, 5, 7, 9];
        let intra: usize = members
            .iter()
            .map(|id| {
                txns[id]
                    .live_waited_by()
                    .filter(|n| members.contains(n))
                    .count()
            })
            .sum();
        assert_eq!(intra, members.len() - 1);
        assert_eq!(*shared.ready_txns.lock().unwrap(), vec![3]);
    }

    #[test]
    fn resolution_is_identical_across_replicas() {
        // Two replicas with the same wait-for records, inserted in different
        // orders, must produce identical rewrites.
        let build = |ids: &[TxnId]| {
            let shared = Arc::new(Shared::default());
            for &id in ids {
                let next = ids[(ids.iter().position(|x| *x == id).unwrap() + 1) % ids.len()];
                // next waits on id
                seed_txn(&shared, id, 0, 1, vec![next]);
            }
            shared
        };
        let a = build(&[11, 13, 17, 19]);
        let b = build(&[17, 19, 11, 13]);

        DeadlockResolver::new(Arc::clone(&a), None).run_once();
        DeadlockResolver::new(Arc::clone(&b), None).run_once();

        let txns_a = a.txn_info.lock().unwrap();
        let txns_b = b.txn_info.lock().unwrap();
        for id in [11, 13, 17, 19] {
            assert_eq!(txns_a[&id].num_waiting_for, txns_b[&id].num_waiting_for);
            assert_eq!(txns_a[&id].waited_by, txns_b[&id].waited_by);
        }
        assert_eq!(
            *a.ready_txns.lock().unwrap(),
            *b.ready_txns.lock().unwrap()
        );
    }

    #[test]
    fn suffix_added_during_resolution_is_preserved() {
        let mut lm = DdrLockManager::default();
        build_two_cycle(&mut lm);
        let shared = lm.shared();

        let mut resolver = DeadlockResolver::new(Arc::clone(&shared), None);
        resolver.take_snapshot();

        // While the resolver works on its snapshot, txn 5 starts waiting on
        // txn 1: a suffix entry on the live record only.
        seed_txn(&shared, 5, 0, 1, vec![]);
        shared
            .txn_info
            .lock()
            .unwrap()
            .get_mut(&1)
            .unwrap()
            .waited_by
            .push(5);

        let (to_update, ready, _) = resolver.resolve_all();
        resolver.write_back(&to_update);
        resolver.publish(ready);

        let txns = shared.txn_info.lock().unwrap();
        // Rewritten prefix plus the concurrently added suffix.
        assert_eq!(txns[&1].waited_by, vec![2, 5]);
        assert_eq!(txns[&1].num_waiting_for, 0);
        assert_eq!(txns[&5].num_waiting_for, 1);
    }

    #[test]
    fn manual_resolution_needs_an_idle_resolver() {
        let mut lm = DdrLockManager::default();
        assert!(!lm.resolve_deadlock());

        build_two_cycle(&mut lm);
        let (signal_tx, mut signal_rx) = tokio::sync::mpsc::unbounded_channel();
        // An interval far in the future: passes only run on demand.
        lm.start_deadlock_resolver(signal_tx, Duration::from_secs(3600));
        assert!(lm.resolve_deadlock());
        signal_rx.blocking_recv().expect("resolver signal");
        assert_eq!(lm.get_ready_txns(), vec![1]);
    }

    #[test]
    fn resolver_thread_publishes_and_signals() {
        let mut lm = DdrLockManager::default();
        build_two_cycle(&mut lm);

        let (signal_tx, mut signal_rx) = tokio::sync::mpsc::unbounded_channel();
        lm.start_deadlock_resolver(signal_tx, Duration::from_millis(1));
        signal_rx.blocking_recv().expect("resolver signal");
        assert_eq!(lm.get_ready_txns(), vec![1]);
    }
}
