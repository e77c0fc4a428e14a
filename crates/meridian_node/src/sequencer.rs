//! Sequencer module.
//!
//! The sequencer is the entry gate into the local batch stream. When
//! synchronized batching is active it compares every transaction's
//! originator timestamp with the local clock: past transactions go straight
//! to the batcher (restarted first when the lock manager does not resolve
//! deadlocks), future transactions are parked in the batcher's buffer until
//! the clock catches up. It also maintains a per-source estimate of the
//! observed clock deviation and answers pings with it.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{error, trace};

use meridian_sched::sched::{
    LockManagerKind, MachineId, Transaction, TransactionEvent, TransactionStatus,
};

use crate::batcher::FutureBuffer;
use crate::clock;
use crate::config::Config;
use crate::envelope::{
    Broker, Envelope, Message, Request, Response, BATCHER_CHANNEL, FORWARDER_CHANNEL,
};
use crate::module::Module;

/// Samples kept per source machine for the deviation estimate.
const DEVIATION_WINDOW: usize = 100;

/// Sliding mean over the most recent samples.
#[derive(Debug)]
pub(crate) struct MovingAverage {
    samples: VecDeque<i64>,
    sum: i64,
    capacity: usize,
}

impl MovingAverage {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            sum: 0,
            capacity,
        }
    }

    pub(crate) fn add(&mut self, sample: i64) {
        if self.samples.len() == self.capacity {
            if let Some(evicted) = self.samples.pop_front() {
                self.sum -= evicted;
            }
        }
        self.samples.push_back(sample);
        self.sum += sample;
    }

    pub(crate) fn avg(&self) -> i64 {
        if self.samples.is_empty() {
            0
        } else {
            self.sum / self.samples.len() as i64
        }
    }
}

pub struct Sequencer {
    config: Arc<Config>,
    broker: Arc<Broker>,
    requests: UnboundedReceiver<Envelope>,
    future_txns: Arc<Mutex<FutureBuffer>>,
    /// One estimator per machine, indexed by machine id.
    deviations: Vec<MovingAverage>,
}

impl Sequencer {
    pub fn new(
        config: Arc<Config>,
        broker: Arc<Broker>,
        requests: UnboundedReceiver<Envelope>,
        future_txns: Arc<Mutex<FutureBuffer>>,
    ) -> Self {
        let num_machines = config.num_machines() as usize;
        Self {
            config,
            broker,
            requests,
            future_txns,
            deviations: (0..num_machines)
                .map(|_| MovingAverage::new(DEVIATION_WINDOW))
                .collect(),
        }
    }

    fn process_forward_txn(&mut self, from: MachineId, mut txn: Transaction) {
        let now = clock::now_ns();
        self.config
            .record_event(&mut txn, TransactionEvent::EnterSequencer);

        if self.config.bypass_mh_orderer() && self.config.synchronized_batching() {
            let dev = txn.timestamp - now;
            if dev <= 0 {
                trace!(
                    "txn {} has a timestamp {} us in the past",
                    txn.id,
                    -dev / 1000
                );
                if self.config.lock_manager_kind() != LockManagerKind::Ddr {
                    // Without deadlock resolution a late transaction cannot
                    // keep its place in the deterministic order; restart it.
                    txn.status = TransactionStatus::Aborted;
                    txn.abort_reason = Some("restarted".into());
                }
                self.send_to_batcher(txn);
            } else {
                trace!(
                    "txn {} has a timestamp {} us into the future",
                    txn.id,
                    dev / 1000
                );
                let signal_needed = self
                    .future_txns
                    .lock()
                    .expect("future txn buffer lock poisoned")
                    .insert(txn);
                if signal_needed {
                    // The buffer minimum moved earlier; have the batcher
                    // reschedule its wake-up.
                    self.broker.send_to(
                        BATCHER_CHANNEL,
                        Envelope::request(self.broker.local_machine_id(), Request::Signal),
                    );
                }
            }
            match self.deviations.get_mut(from as usize) {
                Some(estimator) => estimator.add(dev),
                None => error!("deviation sample from unknown machine {from}"),
            }
        } else {
            self.send_to_batcher(txn);
        }
    }

    fn send_to_batcher(&self, mut txn: Transaction) {
        self.config
            .record_event(&mut txn, TransactionEvent::EnterLocalBatch);
        self.broker.send_to(
            BATCHER_CHANNEL,
            Envelope::request(self.broker.local_machine_id(), Request::ForwardTxn { txn }),
        );
    }

    fn process_ping(&self, from: MachineId, src_send_time: i64, dst: MachineId) {
        let dev = self
            .deviations
            .get(from as usize)
            .map(MovingAverage::avg)
            .unwrap_or(0);
        let pong = Response::Pong {
            src_send_time,
            dev,
            dst,
        };
        self.broker.send_to_machine(
            from,
            FORWARDER_CHANNEL,
            Envelope::response(self.broker.local_machine_id(), pong),
        );
    }
}

#[async_trait]
impl Module for Sequencer {
    fn name(&self) -> &'static str {
        "sequencer"
    }

    async fn loop_once(&mut self) -> anyhow::Result<bool> {
        let Envelope { from, message } = match self.requests.try_recv() {
            Ok(env) => env,
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return Ok(false),
        };
        match message {
            Message::Request(Request::ForwardTxn { txn }) => self.process_forward_txn(from, txn),
            Message::Request(Request::Ping { src_send_time, dst }) => {
                self.process_ping(from, src_send_time, dst)
            }
            Message::Request(Request::Stats { level }) => {
                // The batcher carries the sequencing-side counters.
                self.broker
                    .send_to(BATCHER_CHANNEL, Envelope::request(from, Request::Stats { level }));
            }
            other => error!("unexpected request type received: {other:?}"),
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn moving_average_slides_over_its_window() {
        let mut avg = MovingAverage::new(3);
        assert_eq!(avg.avg(), 0);
        avg.add(3);
        avg.add(6);
        assert_eq!(avg.avg(), 4);
        avg.add(9);
        assert_eq!(avg.avg(), 6);
        // The first sample falls out of the window.
        avg.add(12);
        assert_eq!(avg.avg(), 9);
    }

    #[test]
    fn moving_average_handles_negative_samples() {
        let mut avg = MovingAverage::new(100);
        avg.add(-1000);
        avg.add(-2000);
        assert_eq!(avg.avg(), -1500);
    }
}
