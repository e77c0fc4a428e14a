//! Worker module.
//!
//! The storage engine lives outside this crate: the worker stamps the
//! outcome on each dispatched transaction, notifies the scheduler so its
//! locks are released, and forwards the finished transaction towards its
//! coordinating server.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::error;

use meridian_sched::sched::{MachineId, Transaction, TransactionStatus};

use crate::envelope::{
    Broker, Envelope, Message, Request, Response, SCHEDULER_CHANNEL, SERVER_CHANNEL, WORKER_CHANNEL,
};
use crate::module::Module;

pub struct Worker {
    broker: Arc<Broker>,
    requests: UnboundedReceiver<Envelope>,
    txns_processed: u64,
}

impl Worker {
    pub fn new(broker: Arc<Broker>, requests: UnboundedReceiver<Envelope>) -> Self {
        Self {
            broker,
            requests,
            txns_processed: 0,
        }
    }

    fn run_txn(&mut self, mut txn: Transaction) {
        if txn.status != TransactionStatus::Aborted {
            txn.status = TransactionStatus::Committed;
        }
        self.txns_processed += 1;

        let txn_id = txn.id;
        self.broker.send_to(
            SCHEDULER_CHANNEL,
            Envelope::request(
                self.broker.local_machine_id(),
                Request::TxnFinished { txn_id },
            ),
        );
        let coordinator = txn.coordinating_server;
        self.broker.send_to_machine(
            coordinator,
            SERVER_CHANNEL,
            Envelope::response(
                self.broker.local_machine_id(),
                Response::TxnResult { txn },
            ),
        );
    }

    fn report_stats(&self, from: MachineId) {
        self.broker.send_to_machine(
            from,
            SERVER_CHANNEL,
            Envelope::response(
                self.broker.local_machine_id(),
                Response::Stats {
                    from_channel: WORKER_CHANNEL,
                    stats: json!({ "txns_processed": self.txns_processed }),
                },
            ),
        );
    }
}

#[async_trait]
impl Module for Worker {
    fn name(&self) -> &'static str {
        "worker"
    }

    async fn loop_once(&mut self) -> anyhow::Result<bool> {
        let Envelope { from, message } = match self.requests.try_recv() {
            Ok(env) => env,
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return Ok(false),
        };
        match message {
            Message::Request(Request::RunTxn { txn }) => self.run_txn(txn),
            Message::Request(Request::Stats { .. }) => self.report_stats(from),
            other => error!("unexpected request type received: {other:?}"),
        }
        Ok(true)
    }
}
