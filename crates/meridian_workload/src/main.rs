//! Workload generator for exercising a meridian partition in-process.
//!
//! This binary synthesizes transactions over the integer-keyed partitioning
//! scheme, feeds them through a full node pipeline (sequencer, batcher,
//! scheduler, worker), and reports throughput plus a stats snapshot. Keys
//! are drawn per `(partition, home)` list so the mix of multi-home and
//! multi-partition transactions is controlled directly.

use std::collections::BTreeMap;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Context};
use clap::Parser;
use rand::rngs::SmallRng;
use rand::seq::index::sample;
use rand::{Rng, SeedableRng};
use tokio::time::timeout;
use tracing::info;

use meridian_node::clock;
use meridian_node::config::Config;
use meridian_node::envelope::{
    Envelope, Message, Request, Response, SCHEDULER_CHANNEL, SEQUENCER_CHANNEL,
};
use meridian_node::start_node;
use meridian_sched::sched::{
    Key, Metadata, PartitionId, ReplicaId, Sharding, Transaction, TransactionEvent,
    TransactionStatus, TransactionType, TxnId, Value,
};

#[derive(Parser, Debug)]
#[command(name = "meridian-workload")]
struct Args {
    /// Path to the deployment configuration (JSON). Must use the
    /// integer-keyed partitioning scheme.
    #[arg(long)]
    config: PathBuf,

    /// Address of the machine to emulate, as listed in the configuration.
    #[arg(long)]
    address: String,

    /// Number of transactions to run.
    #[arg(long, default_value_t = 1000)]
    txns: u64,

    /// Percent of multi-home transactions.
    #[arg(long, default_value_t = 0)]
    mh: u32,

    /// Number of home replicas accessed by a multi-home transaction.
    #[arg(long, default_value_t = 2)]
    mh_homes: u32,

    /// Percent of multi-partition transactions. The local partition is
    /// always among the chosen ones.
    #[arg(long, default_value_t = 0)]
    mp: u32,

    /// Number of partitions accessed by a multi-partition transaction.
    #[arg(long, default_value_t = 2)]
    mp_parts: u32,

    /// Number of records in a transaction.
    #[arg(long, default_value_t = 10)]
    records: u32,

    /// Number of those records that are written.
    #[arg(long, default_value_t = 10)]
    writes: u32,

    /// Size of a written value in bytes.
    #[arg(long, default_value_t = 100)]
    value_size: usize,

    /// Number of hot keys per (partition, home) key list; zero disables
    /// hot-key skew.
    #[arg(long, default_value_t = 0)]
    hot: u64,

    /// Number of records per transaction drawn from the hot keys.
    #[arg(long, default_value_t = 0)]
    hot_records: u32,

    /// Offset added to every transaction timestamp, exercising the
    /// synchronized-batching gate when enabled in the configuration.
    #[arg(long, default_value = "0s")]
    future: humantime::Duration,

    /// Random seed (0 picks one from the clock).
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Detail level of the final stats snapshot.
    #[arg(long, default_value_t = 1)]
    stats_level: u32,

    /// How long to wait for all transactions to complete.
    #[arg(long, default_value = "60s")]
    run_timeout: humantime::Duration,
}

/// Synthesizes transactions for one machine of a deployment.
struct BasicWorkload<'a> {
    config: &'a Config,
    args: &'a Args,
    rng: SmallRng,
    /// Keys available per (partition, home) list.
    keys_per_list: u64,
    next_txn_id: TxnId,
}

impl<'a> BasicWorkload<'a> {
    fn new(config: &'a Config, args: &'a Args, seed: u64) -> anyhow::Result<Self> {
        let Some(simple) = config.simple_partitioning() else {
            bail!("the workload requires the integer-keyed partitioning scheme");
        };
        let lists = u64::from(config.num_partitions()) * u64::from(config.num_replicas());
        let keys_per_list = simple.num_records / lists;
        if keys_per_list == 0 {
            bail!("num_records must cover at least one key per (partition, home) list");
        }
        Ok(Self {
            config,
            args,
            rng: SmallRng::seed_from_u64(seed),
            keys_per_list,
            next_txn_id: 1,
        })
    }

    /// Key `index` of the list for `partition` mastered at `home`.
    fn key_at(&self, partition: PartitionId, home: ReplicaId, index: u64) -> Key {
        let np = u64::from(self.config.num_partitions());
        let nr = u64::from(self.config.num_replicas());
        let key = u64::from(partition) + np * (u64::from(home) + nr * index);
        key.to_string().into_bytes()
    }

    fn pick_partitions(&mut self) -> Vec<PartitionId> {
        let local = Sharding::local_partition(self.config);
        let num_partitions = self.config.num_partitions();
        if num_partitions > 1 && self.rng.gen_ratio(self.args.mp.min(100), 100) {
            let wanted = self.args.mp_parts.clamp(2, num_partitions) as usize;
            let mut partitions = vec![local];
            let others: Vec<PartitionId> =
                (0..num_partitions).filter(|p| *p != local).collect();
            for picked in sample(&mut self.rng, others.len(), wanted - 1).iter() {
                partitions.push(others[picked]);
            }
            partitions
        } else {
            vec![local]
        }
    }

    fn pick_homes(&mut self) -> Vec<ReplicaId> {
        let num_replicas = self.config.num_replicas();
        if num_replicas > 1 && self.rng.gen_ratio(self.args.mh.min(100), 100) {
            let wanted = self.args.mh_homes.clamp(2, num_replicas) as usize;
            sample(&mut self.rng, num_replicas as usize, wanted)
                .iter()
                .map(|r| r as ReplicaId)
                .collect()
        } else {
            vec![self.rng.gen_range(0..num_replicas)]
        }
    }

    fn next_txn(&mut self) -> Transaction {
        let partitions = self.pick_partitions();
        let homes = self.pick_homes();
        let records = self.args.records.max(1);
        let writes = self.args.writes.min(records);
        let hot_keys = self.args.hot.min(self.keys_per_list);

        let mut read_set: BTreeMap<Key, Value> = BTreeMap::new();
        let mut write_set: BTreeMap<Key, Value> = BTreeMap::new();
        let mut master_metadata = BTreeMap::new();
        for i in 0..records {
            let partition = partitions[i as usize % partitions.len()];
            let home = homes[i as usize % homes.len()];
            let index = if i < self.args.hot_records && hot_keys > 0 {
                self.rng.gen_range(0..hot_keys)
            } else {
                self.rng.gen_range(0..self.keys_per_list)
            };
            let key = self.key_at(partition, home, index);
            if master_metadata.contains_key(&key) {
                continue;
            }
            master_metadata.insert(key.clone(), Metadata::new(home));
            if i < writes {
                write_set.insert(key, vec![b'x'; self.args.value_size]);
            } else {
                read_set.insert(key, Value::new());
            }
        }

        let mut txn = Transaction::new(
            self.next_txn_id,
            if homes.len() > 1 {
                TransactionType::MultiHome
            } else {
                TransactionType::SingleHome
            },
        );
        self.next_txn_id += 1;
        txn.read_set = read_set;
        txn.write_set = write_set;
        txn.master_metadata = master_metadata;
        txn.timestamp = clock::now_ns() + self.args.future.as_nanos().min(i64::MAX as u128) as i64;
        txn.coordinating_server = self.config.local_machine_id();
        txn
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let config = Config::from_file(&args.config, &args.address)
        .context("failed to load configuration")?;
    let seed = if args.seed == 0 {
        clock::now_ns() as u64
    } else {
        args.seed
    };
    info!("workload seed: {seed}");

    let mut workload = BasicWorkload::new(&config, &args, seed)?;
    let transactions: Vec<Transaction> = (0..args.txns).map(|_| workload.next_txn()).collect();

    let mut node = start_node(config.clone());
    let machine = node.broker.local_machine_id();
    let started = Instant::now();
    for txn in transactions {
        node.broker.send_to(
            SEQUENCER_CHANNEL,
            Envelope::request(machine, Request::ForwardTxn { txn }),
        );
    }

    let mut committed = 0u64;
    let mut aborted = 0u64;
    let mut latency_sum_ns = 0i64;
    let deadline = tokio::time::Instant::now() + *args.run_timeout;
    while committed + aborted < args.txns {
        let env = match timeout(deadline - tokio::time::Instant::now(), node.server_rx.recv()).await
        {
            Ok(Some(env)) => env,
            Ok(None) => bail!("server channel closed early"),
            Err(_) => bail!(
                "timed out: {} of {} transactions finished",
                committed + aborted,
                args.txns
            ),
        };
        let Message::Response(Response::TxnResult { txn }) = env.message else {
            continue;
        };
        match txn.status {
            TransactionStatus::Aborted => aborted += 1,
            _ => committed += 1,
        }
        if let Some((_, entered)) = txn
            .events
            .iter()
            .find(|(event, _)| *event == TransactionEvent::EnterSequencer)
        {
            latency_sum_ns += clock::now_ns() - entered;
        }
    }
    let elapsed = started.elapsed();

    println!("transactions: {} committed, {} aborted", committed, aborted);
    println!(
        "throughput:   {:.0} txn/s over {:.3} s",
        args.txns as f64 / elapsed.as_secs_f64(),
        elapsed.as_secs_f64()
    );
    println!(
        "avg latency:  {:.3} ms",
        latency_sum_ns as f64 / args.txns as f64 / 1e6
    );

    node.broker.send_to(
        SCHEDULER_CHANNEL,
        Envelope::request(
            machine,
            Request::Stats {
                level: args.stats_level,
            },
        ),
    );
    while let Ok(Some(env)) =
        timeout(std::time::Duration::from_secs(5), node.server_rx.recv()).await
    {
        if let Message::Response(Response::Stats { stats, .. }) = env.message {
            println!("scheduler stats: {stats:#}");
            break;
        }
    }

    node.shutdown().await;
    Ok(())
}
