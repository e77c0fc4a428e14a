//! Meridian partition node.
//!
//! A node runs one module per concern: the sequencer gates incoming
//! transactions on their timestamps, the batcher cuts fixed-duration batches,
//! the scheduler assembles the in-order batch log and drives the lock
//! manager, and the worker closes the execution loop. Modules communicate
//! through in-process channels registered with a broker; wire transport and
//! the storage engine live outside this crate.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tracing::info;

pub mod batcher;
pub mod clock;
pub mod config;
pub mod envelope;
pub mod module;
pub mod scheduler;
pub mod sequencer;
pub mod worker;

use batcher::{Batcher, FutureBuffer};
use config::Config;
use envelope::{
    Broker, Envelope, BATCHER_CHANNEL, FORWARDER_CHANNEL, SCHEDULER_CHANNEL, SEQUENCER_CHANNEL,
    SERVER_CHANNEL, WORKER_CHANNEL,
};
use module::ModuleRunner;
use scheduler::Scheduler;
use sequencer::Sequencer;
use worker::Worker;

/// Runner cadence when a module reports no work and no deadline.
pub const MODULE_POLL_TIMEOUT: Duration = Duration::from_millis(1);

/// A running node: the broker for injecting envelopes plus the receiving
/// ends of the channels that leave the node (completed transactions and
/// pong/stat responses for the server, pongs for the forwarder).
pub struct Node {
    pub broker: Arc<Broker>,
    pub server_rx: UnboundedReceiver<Envelope>,
    pub forwarder_rx: UnboundedReceiver<Envelope>,
    runners: Vec<ModuleRunner>,
}

impl Node {
    pub async fn shutdown(self) {
        for runner in self.runners {
            runner.shutdown().await;
        }
    }
}

/// Wire up and start all modules of one partition node.
pub fn start_node(config: Arc<Config>) -> Node {
    let mut broker = Broker::new(config.local_machine_id());
    let sequencer_rx = broker.add_channel(SEQUENCER_CHANNEL);
    let batcher_rx = broker.add_channel(BATCHER_CHANNEL);
    let scheduler_rx = broker.add_channel(SCHEDULER_CHANNEL);
    let worker_rx = broker.add_channel(WORKER_CHANNEL);
    let server_rx = broker.add_channel(SERVER_CHANNEL);
    let forwarder_rx = broker.add_channel(FORWARDER_CHANNEL);
    let broker = Arc::new(broker);

    for pinning in &config.config_file().cpu_pinnings {
        info!(
            "module {:?} is assigned to cpu {} (affinity applied by deployment tooling)",
            pinning.module, pinning.cpu
        );
    }

    let future_txns = Arc::new(Mutex::new(FutureBuffer::default()));
    let sequencer = Sequencer::new(
        Arc::clone(&config),
        Arc::clone(&broker),
        sequencer_rx,
        Arc::clone(&future_txns),
    );
    let batcher = Batcher::new(
        Arc::clone(&config),
        Arc::clone(&broker),
        batcher_rx,
        future_txns,
    );
    let scheduler = Scheduler::new(Arc::clone(&config), Arc::clone(&broker), scheduler_rx);
    let worker = Worker::new(Arc::clone(&broker), worker_rx);

    let runners = vec![
        module::start(sequencer, MODULE_POLL_TIMEOUT),
        module::start(batcher, MODULE_POLL_TIMEOUT),
        module::start(scheduler, MODULE_POLL_TIMEOUT),
        module::start(worker, MODULE_POLL_TIMEOUT),
    ];

    Node {
        broker,
        server_rx,
        forwarder_rx,
        runners,
    }
}
