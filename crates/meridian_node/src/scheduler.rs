//! Scheduler module.
//!
//! The scheduler owns the partition's lock table. Batches arrive tagged
//! with their log slot and possibly out of order; an in-order log hands them
//! over one by one. Each transaction is registered with the lock manager,
//! dispatched to the worker the moment it becomes ready, and released when
//! the worker reports completion, which may make further transactions
//! ready. The deadlock resolver publishes additional ready transactions
//! through a side channel serviced by weighted polling.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error};

use meridian_sched::sched::{
    AcquireLocksResult, AnyLockManager, AsyncLog, LockManager, MachineId, Transaction,
    TransactionEvent, TransactionType, TxnHolder, TxnId,
};

use crate::config::Config;
use crate::envelope::{
    Batch, Broker, Envelope, Message, Request, Response, SCHEDULER_CHANNEL, SERVER_CHANNEL,
    WORKER_CHANNEL,
};
use crate::module::{Module, PollSource, WeightedPoller};

pub struct Scheduler {
    config: Arc<Config>,
    broker: Arc<Broker>,
    requests: UnboundedReceiver<Envelope>,
    ready_signal_rx: UnboundedReceiver<()>,
    ready_signal_tx: Option<UnboundedSender<()>>,
    poller: WeightedPoller,
    local_log: AsyncLog<Batch>,
    lock_manager: AnyLockManager,
    /// Full transactions currently inside the lock manager, by id.
    active_txns: HashMap<TxnId, TxnHolder>,
    txns_dispatched: u64,
    txns_released: u64,
}

impl Scheduler {
    pub fn new(
        config: Arc<Config>,
        broker: Arc<Broker>,
        requests: UnboundedReceiver<Envelope>,
    ) -> Self {
        let (ready_signal_tx, ready_signal_rx) = unbounded_channel();
        let lock_manager = AnyLockManager::new(config.lock_manager_kind());
        Self {
            config,
            broker,
            requests,
            ready_signal_rx,
            ready_signal_tx: Some(ready_signal_tx),
            poller: WeightedPoller::new([2, 1]),
            local_log: AsyncLog::new(0),
            lock_manager,
            active_txns: HashMap::new(),
            txns_dispatched: 0,
            txns_released: 0,
        }
    }

    fn process_next_request(&mut self) -> anyhow::Result<bool> {
        let Envelope { from, message } = match self.requests.try_recv() {
            Ok(env) => env,
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return Ok(false),
        };
        match message {
            Message::Request(Request::ForwardBatch { slot, batch }) => {
                self.local_log.insert(slot, batch)?;
                self.process_log()?;
            }
            Message::Request(Request::TxnFinished { txn_id }) => self.finish_txn(txn_id),
            Message::Request(Request::Signal) => self.publish_ready_txns(),
            Message::Request(Request::Stats { level }) => self.report_stats(from, level),
            other => error!("unexpected request type received: {other:?}"),
        }
        Ok(true)
    }

    fn drain_resolver_signal(&mut self) -> bool {
        match self.ready_signal_rx.try_recv() {
            Ok(()) => {
                self.publish_ready_txns();
                true
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => false,
        }
    }

    /// Hand over every batch the log can release, in slot order.
    fn process_log(&mut self) -> anyhow::Result<()> {
        while let Some((slot, batch)) = self.local_log.next() {
            debug!(
                "processing batch {} from slot {slot} ({} txns)",
                batch.id,
                batch.transactions.len()
            );
            for mut txn in batch.transactions {
                self.config
                    .record_event(&mut txn, TransactionEvent::EnterScheduler);
                self.accept_txn(txn)?;
            }
        }
        Ok(())
    }

    fn accept_txn(&mut self, txn: Transaction) -> anyhow::Result<()> {
        let txn_type = txn.txn_type;
        let holder = TxnHolder::new(self.config.as_ref(), txn)?;
        let txn_id = holder.id();
        // Batches are replicated to every partition; transactions without
        // local keys belong to the other partitions.
        if holder.keys_in_partition().is_empty() {
            debug!("txn {txn_id} has no keys in this partition");
            return Ok(());
        }

        let result = match txn_type {
            // Lock-only pieces drive lock acquisition on behalf of their
            // multi-home transaction and are not kept around.
            TransactionType::LockOnly => self.lock_manager.acquire_locks(&holder),
            TransactionType::MultiHome => {
                let ready = self.lock_manager.accept_transaction(&holder);
                self.active_txns.insert(txn_id, holder);
                if ready {
                    AcquireLocksResult::Acquired
                } else {
                    AcquireLocksResult::Waiting
                }
            }
            TransactionType::SingleHome => {
                self.active_txns.insert(txn_id, holder);
                let holder = self.active_txns.get(&txn_id).expect("inserted above");
                self.lock_manager.accept_txn_and_acquire_locks(holder)
            }
        };
        match result {
            AcquireLocksResult::Acquired => self.dispatch(txn_id),
            AcquireLocksResult::Waiting => {}
            AcquireLocksResult::Abort => anyhow::bail!("lock manager rejected txn {txn_id}"),
        }
        Ok(())
    }

    fn dispatch(&mut self, txn_id: TxnId) {
        let Some(holder) = self.active_txns.get_mut(&txn_id) else {
            error!("ready txn {txn_id} is not active");
            return;
        };
        self.config
            .record_event(holder.transaction_mut(), TransactionEvent::Dispatched);
        let txn = holder.transaction().clone();
        self.txns_dispatched += 1;
        self.broker.send_to(
            WORKER_CHANNEL,
            Envelope::request(self.broker.local_machine_id(), Request::RunTxn { txn }),
        );
    }

    fn finish_txn(&mut self, txn_id: TxnId) {
        let Some(mut holder) = self.active_txns.remove(&txn_id) else {
            error!("finished txn {txn_id} is not active");
            return;
        };
        self.config
            .record_event(holder.transaction_mut(), TransactionEvent::Released);
        self.txns_released += 1;
        let newly_ready = self.lock_manager.release_locks(&holder);
        for ready in newly_ready {
            self.dispatch(ready);
        }
    }

    fn publish_ready_txns(&mut self) {
        for txn_id in self.lock_manager.get_ready_txns() {
            self.dispatch(txn_id);
        }
    }

    fn report_stats(&self, from: MachineId, level: u32) {
        let mut stats = self.lock_manager.get_stats(level);
        if let Some(doc) = stats.as_object_mut() {
            doc.insert("txns_dispatched".into(), json!(self.txns_dispatched));
            doc.insert("txns_released".into(), json!(self.txns_released));
            doc.insert("active_txns".into(), json!(self.active_txns.len()));
        }
        self.broker.send_to_machine(
            from,
            SERVER_CHANNEL,
            Envelope::response(
                self.broker.local_machine_id(),
                Response::Stats {
                    from_channel: SCHEDULER_CHANNEL,
                    stats,
                },
            ),
        );
    }
}

#[async_trait]
impl Module for Scheduler {
    fn name(&self) -> &'static str {
        "scheduler"
    }

    async fn set_up(&mut self) -> anyhow::Result<()> {
        let signal = self
            .ready_signal_tx
            .take()
            .expect("scheduler set up twice");
        let interval = self.config.ddr_interval();
        if !interval.is_zero() && self.lock_manager.start_deadlock_resolver(signal, interval) {
            debug!("deadlock resolver started with interval {interval:?}");
        }
        Ok(())
    }

    async fn loop_once(&mut self) -> anyhow::Result<bool> {
        match self.poller.next_source() {
            PollSource::Main => {
                if self.process_next_request()? {
                    return Ok(true);
                }
                Ok(self.drain_resolver_signal())
            }
            PollSource::Custom => {
                if self.drain_resolver_signal() {
                    return Ok(true);
                }
                self.process_next_request()
            }
        }
    }
}
