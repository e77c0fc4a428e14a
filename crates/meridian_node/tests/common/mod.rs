//! Shared helpers for integration tests.
//!
//! Tests run a whole node in-process: envelopes are injected straight into
//! the broker channels and results are read from the server/forwarder
//! receivers, standing in for the network transport.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

use meridian_node::clock;
use meridian_node::config::{Config, ConfigFile, HashPartitioning, ReplicaConfig};
use meridian_node::envelope::{Channel, Envelope, Message, Request, Response, SEQUENCER_CHANNEL};
use meridian_node::Node;
use meridian_sched::sched::{LockManagerKind, ReplicaId, Transaction, TransactionType, TxnId};

/// Timeout for any single expected envelope.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(10);

/// Two replicas with one partition each; the local machine is replica 0.
pub fn config_file() -> ConfigFile {
    ConfigFile {
        replicas: vec![
            ReplicaConfig {
                addresses: vec!["local:2020".into()],
            },
            ReplicaConfig {
                addresses: vec!["remote:2020".into()],
            },
        ],
        num_partitions: 1,
        replication_factor: 1,
        num_workers: 1,
        broker_ports: Vec::new(),
        server_port: 2023,
        forwarder_batch_duration_ms: 1,
        forwarder_max_batch_size: 0,
        sequencer_batch_duration_ms: 1,
        sequencer_max_batch_size: 0,
        synchronized_batching: false,
        bypass_mh_orderer: false,
        replica_latency: Vec::new(),
        hash_partitioning: Some(HashPartitioning {
            partition_key_num_bytes: 8,
        }),
        simple_partitioning: None,
        cpu_pinnings: Vec::new(),
        ddr_interval_ms: 5,
        disabled_tracing_events: Vec::new(),
        lock_manager: LockManagerKind::Ddr,
    }
}

pub fn start_node_with(mutate: impl FnOnce(&mut ConfigFile)) -> Node {
    let mut file = config_file();
    mutate(&mut file);
    let config = Arc::new(Config::new(file, "local:2020").expect("config"));
    meridian_node::start_node(config)
}

/// A transaction homed at `master`, coordinated by the local machine.
pub fn make_txn(id: TxnId, master: ReplicaId, writes: &[&str], reads: &[&str]) -> Transaction {
    let mut txn = Transaction::new(id, TransactionType::SingleHome);
    for key in writes {
        txn = txn.with_write(key.as_bytes().to_vec(), master);
    }
    for key in reads {
        txn = txn.with_read(key.as_bytes().to_vec(), master);
    }
    txn.timestamp = clock::now_ns();
    txn.coordinating_server = 0;
    txn
}

pub fn forward_txn(node: &Node, txn: Transaction) {
    node.broker.send_to(
        SEQUENCER_CHANNEL,
        Envelope::request(
            node.broker.local_machine_id(),
            Request::ForwardTxn { txn },
        ),
    );
}

/// Wait for the next completed transaction, skipping other responses.
pub async fn recv_txn_result(rx: &mut UnboundedReceiver<Envelope>) -> Transaction {
    loop {
        let env = timeout(RECV_TIMEOUT, rx.recv())
            .await
            .expect("timed out waiting for a txn result")
            .expect("server channel closed");
        if let Message::Response(Response::TxnResult { txn }) = env.message {
            return txn;
        }
    }
}

/// Wait for the next stats response, skipping other envelopes.
pub async fn recv_stats(rx: &mut UnboundedReceiver<Envelope>) -> (Channel, serde_json::Value) {
    loop {
        let env = timeout(RECV_TIMEOUT, rx.recv())
            .await
            .expect("timed out waiting for stats")
            .expect("server channel closed");
        if let Message::Response(Response::Stats {
            from_channel,
            stats,
        }) = env.message
        {
            return (from_channel, stats);
        }
    }
}
