//! Batcher module.
//!
//! Transactions released by the sequencer are collected into fixed-duration
//! batches. Future-timestamped transactions wait in a min-heap shared with
//! the sequencer; the batcher drains everything due at each wake-up. A
//! signal envelope arrives whenever an insert lowers the heap minimum so the
//! wake-up deadline is recomputed.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;
use tracing::error;

use meridian_sched::sched::{
    BatchId, MachineId, ReplicaId, SlotId, Transaction, TransactionEvent, TransactionType, Value,
};

use crate::clock;
use crate::config::Config;
use crate::envelope::{
    Batch, Broker, Envelope, Message, Request, Response, BATCHER_CHANNEL, SCHEDULER_CHANNEL,
    SERVER_CHANNEL,
};
use crate::module::Module;

#[derive(Debug)]
struct FutureTxn {
    timestamp: i64,
    /// Arrival tiebreaker for equal timestamps.
    seq: u64,
    txn: Transaction,
}

impl PartialEq for FutureTxn {
    fn eq(&self, other: &Self) -> bool {
        (self.timestamp, self.seq) == (other.timestamp, other.seq)
    }
}

impl Eq for FutureTxn {}

impl PartialOrd for FutureTxn {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FutureTxn {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.timestamp, self.seq).cmp(&(other.timestamp, other.seq))
    }
}

/// Min-heap of transactions waiting for the local clock to reach their
/// timestamps.
#[derive(Debug, Default)]
pub struct FutureBuffer {
    heap: BinaryHeap<Reverse<FutureTxn>>,
    next_seq: u64,
}

impl FutureBuffer {
    /// Park a transaction. Returns true when it became the earliest entry,
    /// in which case the batcher needs a reschedule.
    pub fn insert(&mut self, txn: Transaction) -> bool {
        let earliest = self.next_timestamp();
        let timestamp = txn.timestamp;
        self.heap.push(Reverse(FutureTxn {
            timestamp,
            seq: self.next_seq,
            txn,
        }));
        self.next_seq += 1;
        earliest.map_or(true, |e| timestamp < e)
    }

    /// Remove and return every transaction due at `now`, in release order.
    pub fn pop_due(&mut self, now: i64) -> Vec<Transaction> {
        let mut due = Vec::new();
        while self
            .heap
            .peek()
            .is_some_and(|Reverse(top)| top.timestamp <= now)
        {
            if let Some(Reverse(entry)) = self.heap.pop() {
                due.push(entry.txn);
            }
        }
        due
    }

    pub fn next_timestamp(&self) -> Option<i64> {
        self.heap.peek().map(|Reverse(top)| top.timestamp)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

/// One lock-only piece per home of a multi-home transaction, each carrying
/// the keys mastered at its home.
fn lock_only_pieces(txn: &Transaction) -> Vec<Transaction> {
    let mut pieces: std::collections::BTreeMap<ReplicaId, Transaction> =
        std::collections::BTreeMap::new();
    for (key, metadata) in &txn.master_metadata {
        let piece = pieces.entry(metadata.master).or_insert_with(|| {
            let mut piece = Transaction::new(txn.id, TransactionType::LockOnly);
            piece.timestamp = txn.timestamp;
            piece.coordinating_server = txn.coordinating_server;
            piece
        });
        piece.master_metadata.insert(key.clone(), *metadata);
        if txn.write_set.contains_key(key) {
            piece.write_set.insert(key.clone(), Value::new());
        } else {
            piece.read_set.insert(key.clone(), Value::new());
        }
    }
    pieces.into_values().collect()
}

pub struct Batcher {
    config: Arc<Config>,
    broker: Arc<Broker>,
    requests: UnboundedReceiver<Envelope>,
    future_txns: Arc<Mutex<FutureBuffer>>,
    batch: Vec<Transaction>,
    batch_deadline: Option<Instant>,
    batch_id_counter: BatchId,
    next_slot: SlotId,
    batches_emitted: u64,
    txns_batched: u64,
}

impl Batcher {
    pub fn new(
        config: Arc<Config>,
        broker: Arc<Broker>,
        requests: UnboundedReceiver<Envelope>,
        future_txns: Arc<Mutex<FutureBuffer>>,
    ) -> Self {
        Self {
            config,
            broker,
            requests,
            future_txns,
            batch: Vec::new(),
            batch_deadline: None,
            batch_id_counter: 0,
            next_slot: 0,
            batches_emitted: 0,
            txns_batched: 0,
        }
    }

    fn add_txn(&mut self, txn: Transaction) {
        // A multi-home transaction holds its locks through one lock-only
        // piece per home; those pieces ride in the batch right behind it.
        let pieces = if txn.txn_type == TransactionType::MultiHome && !txn.is_remaster() {
            lock_only_pieces(&txn)
        } else {
            Vec::new()
        };
        for txn in std::iter::once(txn).chain(pieces) {
            if self.batch.is_empty() {
                self.batch_deadline = Some(Instant::now() + self.config.sequencer_batch_duration());
            }
            self.batch.push(txn);
            let max_batch_size = self.config.sequencer_max_batch_size();
            if max_batch_size > 0 && self.batch.len() >= max_batch_size {
                self.emit_batch();
            }
        }
    }

    fn emit_batch(&mut self) {
        self.batch_deadline = None;
        if self.batch.is_empty() {
            return;
        }
        // Machine-scoped numbering keeps batch ids globally unique.
        let id: BatchId =
            self.batch_id_counter * self.config.num_machines() + self.broker.local_machine_id();
        self.batch_id_counter += 1;

        let mut transactions = std::mem::take(&mut self.batch);
        for txn in &mut transactions {
            self.config
                .record_event(txn, TransactionEvent::ExitSequencerInBatch);
        }
        self.txns_batched += transactions.len() as u64;
        self.batches_emitted += 1;

        // The slot stands in for the position the global ordering layer
        // grants; consumers tolerate arrival in any slot order.
        let slot = self.next_slot;
        self.next_slot += 1;
        self.broker.send_to(
            SCHEDULER_CHANNEL,
            Envelope::request(
                self.broker.local_machine_id(),
                Request::ForwardBatch {
                    slot,
                    batch: Batch { id, transactions },
                },
            ),
        );
    }

    fn report_stats(&self, from: MachineId) {
        let buffered = self
            .future_txns
            .lock()
            .expect("future txn buffer lock poisoned")
            .len();
        let stats = json!({
            "batches_emitted": self.batches_emitted,
            "txns_batched": self.txns_batched,
            "current_batch_size": self.batch.len(),
            "future_txns_buffered": buffered,
        });
        self.broker.send_to_machine(
            from,
            SERVER_CHANNEL,
            Envelope::response(
                self.broker.local_machine_id(),
                Response::Stats {
                    from_channel: BATCHER_CHANNEL,
                    stats,
                },
            ),
        );
    }
}

#[async_trait]
impl Module for Batcher {
    fn name(&self) -> &'static str {
        "batcher"
    }

    async fn loop_once(&mut self) -> anyhow::Result<bool> {
        let mut work = false;

        let due = self
            .future_txns
            .lock()
            .expect("future txn buffer lock poisoned")
            .pop_due(clock::now_ns());
        for mut txn in due {
            self.config
                .record_event(&mut txn, TransactionEvent::EnterLocalBatch);
            self.add_txn(txn);
            work = true;
        }

        match self.requests.try_recv() {
            Ok(Envelope { from, message }) => {
                work = true;
                match message {
                    Message::Request(Request::ForwardTxn { txn }) => self.add_txn(txn),
                    // A signal only needs to wake the loop; the next deadline
                    // is recomputed from the buffer below.
                    Message::Request(Request::Signal) => {}
                    Message::Request(Request::Stats { .. }) => self.report_stats(from),
                    other => error!("unexpected request type received: {other:?}"),
                }
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {}
        }

        if self.batch_deadline.is_some_and(|d| Instant::now() >= d) {
            self.emit_batch();
            work = true;
        }
        Ok(work)
    }

    fn next_wake(&self) -> Option<Instant> {
        let mut wake = self.batch_deadline;
        if let Ok(buffer) = self.future_txns.lock() {
            if let Some(timestamp) = buffer.next_timestamp() {
                let wait_ns = timestamp.saturating_sub(clock::now_ns()).max(0);
                let at = Instant::now() + Duration::from_nanos(wait_ns as u64);
                wake = Some(wake.map_or(at, |w| w.min(at)));
            }
        }
        wake
    }
}
