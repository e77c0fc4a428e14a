//! Node configuration.
//!
//! A JSON document describes the whole deployment: the replica/partition
//! topology, batching durations, the partitioning scheme, and the knobs of
//! the individual modules. Every machine loads the same document and derives
//! its own coordinates from its local address. All validation failures are
//! fatal at load time.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use meridian_sched::sched::{
    LockManagerKind, MachineId, PartitionId, ReplicaId, Sharding, Transaction, TransactionEvent,
};

use crate::clock;
use crate::envelope::{BROKER_CHANNEL, MAX_CHANNEL};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplicaConfig {
    /// One address per partition, in partition order.
    pub addresses: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HashPartitioning {
    /// Number of leading key bytes fed into the partition hash.
    pub partition_key_num_bytes: u32,
}

/// Integer-keyed partitioning over a fixed record universe. The partition is
/// `key % num_partitions` and the master `(key / num_partitions) %
/// num_replicas`, so workloads can generate keys for any placement directly.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SimplePartitioning {
    pub num_records: u64,
    #[serde(default)]
    pub record_size_bytes: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleId {
    Sequencer,
    Batcher,
    Scheduler,
    Worker,
    DeadlockResolver,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct CpuPinning {
    pub module: ModuleId,
    pub cpu: u32,
}

fn default_ddr_interval_ms() -> u64 {
    100
}

/// The on-disk configuration document.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    pub replicas: Vec<ReplicaConfig>,
    pub num_partitions: u32,
    #[serde(default)]
    pub replication_factor: u32,
    #[serde(default)]
    pub num_workers: u32,
    #[serde(default)]
    pub broker_ports: Vec<u32>,
    #[serde(default)]
    pub server_port: u32,
    #[serde(default)]
    pub forwarder_batch_duration_ms: u64,
    #[serde(default)]
    pub forwarder_max_batch_size: usize,
    #[serde(default)]
    pub sequencer_batch_duration_ms: u64,
    #[serde(default)]
    pub sequencer_max_batch_size: usize,
    /// Gate transactions on their timestamps before batching.
    #[serde(default)]
    pub synchronized_batching: bool,
    /// Single-home-only mode: skip the global orderer for multi-home
    /// transactions.
    #[serde(default)]
    pub bypass_mh_orderer: bool,
    /// Per-replica round-trip hints, one comma-separated list per replica.
    #[serde(default)]
    pub replica_latency: Vec<String>,
    #[serde(default)]
    pub hash_partitioning: Option<HashPartitioning>,
    #[serde(default)]
    pub simple_partitioning: Option<SimplePartitioning>,
    #[serde(default)]
    pub cpu_pinnings: Vec<CpuPinning>,
    #[serde(default = "default_ddr_interval_ms")]
    pub ddr_interval_ms: u64,
    #[serde(default)]
    pub disabled_tracing_events: Vec<TransactionEvent>,
    #[serde(default)]
    pub lock_manager: LockManagerKind,
}

/// Validated configuration plus the local machine's derived coordinates.
#[derive(Debug)]
pub struct Config {
    file: ConfigFile,
    local_address: String,
    local_replica: ReplicaId,
    local_partition: PartitionId,
    all_addresses: Vec<String>,
    /// Round-trip hints to the other replicas, in replica order.
    latency: Vec<u32>,
    /// The same hints sorted ascending, paired with the replica.
    ordered_latency: Vec<(u32, ReplicaId)>,
    disabled_events: HashSet<TransactionEvent>,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>, local_address: &str) -> anyhow::Result<Arc<Config>> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("configuration file error: {}", path.display()))?;
        let file: ConfigFile = serde_json::from_str(&raw)
            .with_context(|| format!("malformed configuration: {}", path.display()))?;
        Ok(Arc::new(Self::new(file, local_address)?))
    }

    pub fn new(file: ConfigFile, local_address: &str) -> anyhow::Result<Config> {
        if file.replicas.is_empty() {
            bail!("configuration must list at least one replica");
        }
        if file.replication_factor as usize > file.replicas.len() {
            bail!("replication factor must not exceed number of replicas");
        }
        let max_brokers = (MAX_CHANNEL - BROKER_CHANNEL) as usize;
        if file.broker_ports.len() > max_brokers {
            bail!("maximum number of broker threads is {max_brokers}");
        }

        let mut all_addresses = Vec::new();
        let mut local = None;
        for (r, replica) in file.replicas.iter().enumerate() {
            if replica.addresses.len() != file.num_partitions as usize {
                bail!("number of addresses in each replica must match number of partitions");
            }
            for (p, address) in replica.addresses.iter().enumerate() {
                all_addresses.push(address.clone());
                if address == local_address {
                    local = Some((r as ReplicaId, p as PartitionId));
                }
            }
        }
        let Some((local_replica, local_partition)) = local else {
            bail!("the configuration does not contain the local address \"{local_address}\"");
        };

        let mut latency = Vec::new();
        let mut ordered_latency = Vec::new();
        if !file.replica_latency.is_empty() {
            if file.replica_latency.len() != file.replicas.len() {
                bail!("number of latency strings must match number of replicas");
            }
            let entries: Vec<&str> = file.replica_latency[local_replica as usize]
                .split(',')
                .collect();
            if entries.len() != file.replicas.len() {
                bail!("number of latency values must match number of replicas");
            }
            for (i, entry) in entries.iter().enumerate() {
                if i == local_replica as usize {
                    continue;
                }
                let value: u32 = entry
                    .trim()
                    .parse()
                    .with_context(|| format!("malformed latency value \"{entry}\""))?;
                latency.push(value);
                ordered_latency.push((value, i as ReplicaId));
            }
        } else {
            for i in 0..file.replicas.len() {
                if i != local_replica as usize {
                    latency.push(0);
                    ordered_latency.push((0, i as ReplicaId));
                }
            }
        }
        ordered_latency.sort_unstable();

        let disabled_events = file.disabled_tracing_events.iter().copied().collect();

        Ok(Config {
            file,
            local_address: local_address.to_string(),
            local_replica,
            local_partition,
            all_addresses,
            latency,
            ordered_latency,
            disabled_events,
        })
    }

    pub fn config_file(&self) -> &ConfigFile {
        &self.file
    }

    pub fn num_replicas(&self) -> u32 {
        self.file.replicas.len() as u32
    }

    pub fn num_partitions(&self) -> u32 {
        self.file.num_partitions
    }

    pub fn num_workers(&self) -> u32 {
        self.file.num_workers.max(1)
    }

    pub fn replication_factor(&self) -> u32 {
        self.file.replication_factor.max(1)
    }

    pub fn broker_ports(&self) -> &[u32] {
        &self.file.broker_ports
    }

    pub fn server_port(&self) -> u32 {
        self.file.server_port
    }

    pub fn forwarder_batch_duration(&self) -> Duration {
        Duration::from_millis(self.file.forwarder_batch_duration_ms)
    }

    pub fn forwarder_max_batch_size(&self) -> usize {
        self.file.forwarder_max_batch_size
    }

    /// Batch cut cadence; a configured zero means one millisecond.
    pub fn sequencer_batch_duration(&self) -> Duration {
        if self.file.sequencer_batch_duration_ms == 0 {
            Duration::from_millis(1)
        } else {
            Duration::from_millis(self.file.sequencer_batch_duration_ms)
        }
    }

    pub fn sequencer_max_batch_size(&self) -> usize {
        self.file.sequencer_max_batch_size
    }

    pub fn synchronized_batching(&self) -> bool {
        self.file.synchronized_batching
    }

    pub fn bypass_mh_orderer(&self) -> bool {
        self.file.bypass_mh_orderer
    }

    pub fn ddr_interval(&self) -> Duration {
        Duration::from_millis(self.file.ddr_interval_ms)
    }

    pub fn lock_manager_kind(&self) -> LockManagerKind {
        self.file.lock_manager
    }

    pub fn local_address(&self) -> &str {
        &self.local_address
    }

    pub fn local_replica(&self) -> ReplicaId {
        self.local_replica
    }

    pub fn local_machine_id(&self) -> MachineId {
        self.make_machine_id(self.local_replica, self.local_partition)
    }

    pub fn make_machine_id(&self, replica: ReplicaId, partition: PartitionId) -> MachineId {
        replica * self.num_partitions() + partition
    }

    pub fn unpack_machine_id(&self, machine_id: MachineId) -> (ReplicaId, PartitionId) {
        let num_partitions = self.num_partitions();
        (machine_id / num_partitions, machine_id % num_partitions)
    }

    pub fn all_addresses(&self) -> &[String] {
        &self.all_addresses
    }

    pub fn address(&self, replica: ReplicaId, partition: PartitionId) -> &str {
        &self.all_addresses[self.make_machine_id(replica, partition) as usize]
    }

    pub fn all_machine_ids(&self) -> Vec<MachineId> {
        (0..self.num_replicas())
            .flat_map(|r| (0..self.num_partitions()).map(move |p| (r, p)))
            .map(|(r, p)| self.make_machine_id(r, p))
            .collect()
    }

    pub fn num_machines(&self) -> u32 {
        self.num_replicas() * self.num_partitions()
    }

    pub fn leader_replica_for_multi_home_ordering(&self) -> ReplicaId {
        0
    }

    pub fn leader_partition_for_multi_home_ordering(&self) -> PartitionId {
        // Partition 0 already leads the local consensus process.
        self.num_partitions() - 1
    }

    pub fn simple_partitioning(&self) -> Option<&SimplePartitioning> {
        self.file.simple_partitioning.as_ref()
    }

    pub fn partition_of_int_key(&self, key: u64) -> PartitionId {
        (key % u64::from(self.num_partitions())) as PartitionId
    }

    pub fn master_of_int_key(&self, key: u64) -> ReplicaId {
        ((key / u64::from(self.num_partitions())) % u64::from(self.num_replicas())) as ReplicaId
    }

    pub fn latency(&self, i: usize) -> u32 {
        self.latency[i]
    }

    /// The n-th closest remote replica and its round-trip hint.
    pub fn nth_latency(&self, n: usize) -> (u32, ReplicaId) {
        self.ordered_latency[n]
    }

    pub fn cpu_pinnings(&self, module: ModuleId) -> Vec<u32> {
        self.file
            .cpu_pinnings
            .iter()
            .filter(|pinning| pinning.module == module)
            .map(|pinning| pinning.cpu)
            .collect()
    }

    pub fn event_enabled(&self, event: TransactionEvent) -> bool {
        !self.disabled_events.contains(&event)
    }

    /// Stamp a lifecycle event unless it is suppressed by configuration.
    pub fn record_event(&self, txn: &mut Transaction, event: TransactionEvent) {
        if self.event_enabled(event) {
            txn.record_event(event, clock::now_ns());
        }
    }
}

/// 32-bit FNV-1a folded modulo 2^32, multiplying before the byte is mixed
/// in.
fn fnv_hash(bytes: &[u8]) -> u32 {
    let mut hash: u64 = 0x811c9dc5;
    for byte in bytes {
        hash = hash.wrapping_mul(0x0100_0193) % (1 << 32);
        hash ^= u64::from(*byte);
    }
    hash as u32
}

impl Sharding for Config {
    fn num_partitions(&self) -> u32 {
        Config::num_partitions(self)
    }

    fn num_replicas(&self) -> u32 {
        Config::num_replicas(self)
    }

    fn local_partition(&self) -> PartitionId {
        self.local_partition
    }

    fn partition_of_key(&self, key: &[u8]) -> PartitionId {
        if let Some(hash) = &self.file.hash_partitioning {
            let end = (hash.partition_key_num_bytes as usize).min(key.len());
            fnv_hash(&key[..end]) % self.num_partitions()
        } else {
            let key: u64 = std::str::from_utf8(key)
                .ok()
                .and_then(|s| s.parse().ok())
                .expect("integer partitioning requires numeric keys");
            self.partition_of_int_key(key)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn two_by_two() -> ConfigFile {
        ConfigFile {
            replicas: vec![
                ReplicaConfig {
                    addresses: vec!["10.0.0.1:2020".into(), "10.0.0.2:2020".into()],
                },
                ReplicaConfig {
                    addresses: vec!["10.0.1.1:2020".into(), "10.0.1.2:2020".into()],
                },
            ],
            num_partitions: 2,
            replication_factor: 1,
            num_workers: 0,
            broker_ports: vec![2021],
            server_port: 2023,
            forwarder_batch_duration_ms: 1,
            forwarder_max_batch_size: 0,
            sequencer_batch_duration_ms: 0,
            sequencer_max_batch_size: 0,
            synchronized_batching: false,
            bypass_mh_orderer: false,
            replica_latency: Vec::new(),
            hash_partitioning: None,
            simple_partitioning: None,
            cpu_pinnings: Vec::new(),
            ddr_interval_ms: 5,
            disabled_tracing_events: Vec::new(),
            lock_manager: LockManagerKind::Ddr,
        }
    }

    #[test]
    fn local_coordinates_are_derived_from_the_address() {
        let config = Config::new(two_by_two(), "10.0.1.1:2020").unwrap();
        assert_eq!(config.local_replica(), 1);
        assert_eq!(Sharding::local_partition(&config), 0);
        assert_eq!(config.local_machine_id(), 2);
        assert_eq!(config.unpack_machine_id(2), (1, 0));
        assert_eq!(config.all_machine_ids(), vec![0, 1, 2, 3]);
        assert_eq!(config.address(1, 0), "10.0.1.1:2020");
    }

    #[test]
    fn unknown_local_address_is_rejected() {
        assert!(Config::new(two_by_two(), "10.9.9.9:2020").is_err());
    }

    #[test]
    fn replication_factor_must_fit() {
        let mut file = two_by_two();
        file.replication_factor = 3;
        assert!(Config::new(file, "10.0.0.1:2020").is_err());
    }

    #[test]
    fn address_count_must_match_partitions() {
        let mut file = two_by_two();
        file.replicas[1].addresses.pop();
        assert!(Config::new(file, "10.0.0.1:2020").is_err());
    }

    #[test]
    fn too_many_broker_ports_are_rejected() {
        let mut file = two_by_two();
        file.broker_ports = (0..=(MAX_CHANNEL - BROKER_CHANNEL)).collect();
        assert!(Config::new(file, "10.0.0.1:2020").is_err());
    }

    #[test]
    fn latency_hints_are_per_remote_replica() {
        let mut file = two_by_two();
        file.replica_latency = vec!["0,80".into(), "80,0".into()];
        let config = Config::new(file, "10.0.1.1:2020").unwrap();
        assert_eq!(config.latency(0), 80);
        assert_eq!(config.nth_latency(0), (80, 0));

        let mut bad = two_by_two();
        bad.replica_latency = vec!["0,80".into()];
        assert!(Config::new(bad, "10.0.0.1:2020").is_err());
    }

    #[test]
    fn zero_batch_duration_becomes_one_millisecond() {
        let config = Config::new(two_by_two(), "10.0.0.1:2020").unwrap();
        assert_eq!(config.sequencer_batch_duration(), Duration::from_millis(1));
    }

    #[test]
    fn integer_partitioning_places_keys_and_masters() {
        let mut file = two_by_two();
        file.num_partitions = 4;
        file.replicas[0].addresses = vec!["a".into(), "b".into(), "c".into(), "d".into()];
        file.replicas[1].addresses = vec!["e".into(), "f".into(), "g".into(), "h".into()];
        let config = Config::new(file, "a").unwrap();

        assert_eq!(config.partition_of_key(b"37"), 1);
        assert_eq!(config.master_of_int_key(37), 1);
        assert_eq!(config.partition_of_int_key(8), 0);
        assert_eq!(config.master_of_int_key(8), 0);
    }

    #[test]
    fn hash_partitioning_uses_a_key_prefix() {
        let mut file = two_by_two();
        file.num_partitions = 4;
        file.replicas[0].addresses = vec!["a".into(), "b".into(), "c".into(), "d".into()];
        file.replicas[1].addresses = vec!["e".into(), "f".into(), "g".into(), "h".into()];
        file.hash_partitioning = Some(HashPartitioning {
            partition_key_num_bytes: 8,
        });
        let config = Config::new(file, "a").unwrap();

        // Keys sharing their first eight bytes land in the same partition.
        assert_eq!(
            config.partition_of_key(b"user-0001"),
            config.partition_of_key(b"user-0002")
        );
        assert_eq!(
            config.partition_of_key(b"user-0001"),
            config.partition_of_key(b"user-000")
        );
        // Known values of the folded FNV-1a variant.
        assert_eq!(fnv_hash(b""), 0x811c_9dc5);
        assert_eq!(fnv_hash(&[0u8]), 84_696_351);
        assert_eq!(config.partition_of_key(b""), 1);
        assert_eq!(config.partition_of_key(&[0u8]), 3);
    }

    #[test]
    fn disabled_events_are_not_recorded() {
        let mut file = two_by_two();
        file.disabled_tracing_events = vec![TransactionEvent::EnterSequencer];
        let config = Config::new(file, "10.0.0.1:2020").unwrap();

        let mut txn = Transaction::new(1, meridian_sched::sched::TransactionType::SingleHome);
        config.record_event(&mut txn, TransactionEvent::EnterSequencer);
        assert!(txn.events.is_empty());
        config.record_event(&mut txn, TransactionEvent::Dispatched);
        assert_eq!(txn.events.len(), 1);
    }
}
