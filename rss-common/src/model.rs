//! Core entities from the data model: identifiers, worker membership, the
//! shuffle handle, and the on-the-wire block unit.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Identifies one logical shuffle output. Equality is tuple equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StageShuffleId {
    pub app_id: String,
    pub app_attempt: u32,
    pub stage_attempt: u32,
    pub shuffle_id: u32,
}

impl StageShuffleId {
    pub fn new(app_id: impl Into<String>, app_attempt: u32, stage_attempt: u32, shuffle_id: u32) -> Self {
        Self {
            app_id: app_id.into(),
            app_attempt,
            stage_attempt,
            shuffle_id,
        }
    }

    /// DFS directory prefix for this stage attempt, per the §6 layout:
    /// `{root}/{appId}/{appAttempt}/{shuffleId}/stage-{stageAttempt}`.
    pub fn dfs_prefix(&self, root: &str) -> String {
        format!(
            "{}/{}/{}/{}/stage-{}",
            root.trim_end_matches('/'),
            self.app_id,
            self.app_attempt,
            self.shuffle_id,
            self.stage_attempt,
        )
    }

    /// A new StageShuffleId for a stage re-run: same identity, next attempt.
    pub fn next_attempt(&self) -> Self {
        Self {
            stage_attempt: self.stage_attempt + 1,
            ..self.clone()
        }
    }
}

/// A StageShuffleId plus the partition it targets. `partition_id ∈
/// [0, numPartitions)`, enforced by callers that construct one from a valid
/// `ShuffleHandle`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionShuffleId {
    pub stage: StageShuffleId,
    pub partition_id: u32,
}

impl PartitionShuffleId {
    pub fn new(stage: StageShuffleId, partition_id: u32) -> Self {
        Self { stage, partition_id }
    }

    pub fn dfs_dir(&self, root: &str) -> String {
        format!("{}/partition-{}", self.stage.dfs_prefix(root), self.partition_id)
    }
}

/// A live Worker as known to the Registry / Master.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerDetail {
    pub host: String,
    pub data_port: u16,
    pub control_port: u16,
    /// Relative load weight used for weighted sampling. Must be ≥ 1.
    pub weight: u32,
    pub datacenter: String,
    pub cluster: String,
    /// Unix millis of the last heartbeat observed by the registry.
    pub last_heartbeat_millis: u64,
}

impl WorkerDetail {
    /// Unique key: `(host, dataPort)` per the invariant table.
    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.data_port)
    }

    pub fn data_endpoint(&self) -> String {
        format!("{}:{}", self.host, self.data_port)
    }

    pub fn control_endpoint(&self) -> String {
        format!("{}:{}", self.host, self.control_port)
    }

    pub fn now_millis() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// An ordered, duplicate-free set of Workers assigned to a subset of a
/// shuffle's partitions. Size equals the configured workers-per-group, unless
/// the live Worker pool is too small.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerGroup {
    pub workers: Vec<WorkerDetail>,
}

impl ServerGroup {
    pub fn new(workers: Vec<WorkerDetail>) -> Self {
        Self { workers }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// The Worker within this group responsible for a given partition, chosen
    /// by `hash(partitionId) mod group.size` per §5: "a single partition's
    /// blocks are always sent to the same group-member".
    pub fn worker_for_partition(&self, partition_id: u32) -> Option<&WorkerDetail> {
        if self.workers.is_empty() {
            return None;
        }
        let idx = (partition_id as usize) % self.workers.len();
        self.workers.get(idx)
    }
}

/// Opaque, DFS-site specific configuration blob returned by the Master
/// alongside a Worker allocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConf {
    pub root_dir: String,
    pub datacenter: String,
    pub cluster: String,
    /// Opaque DFS-site blob (e.g. serialized core-site.xml-equivalent).
    pub dfs_site: Vec<u8>,
}

/// Driver-side object produced at stage registration: the Worker group
/// assignment, a partition-to-group map, and the cluster config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShuffleHandle {
    pub stage: StageShuffleId,
    pub num_partitions: u32,
    /// `partition_to_group[p]` is the index into `groups` serving partition `p`.
    pub partition_to_group: Vec<usize>,
    pub groups: Vec<ServerGroup>,
    pub cluster_conf: ClusterConf,
}

impl ShuffleHandle {
    /// The group responsible for a given partition. Panics if `partition_id`
    /// is out of range — callers are expected to have validated it against
    /// `num_partitions` already (an internal invariant, not user input).
    pub fn group_for_partition(&self, partition_id: u32) -> &ServerGroup {
        let idx = self.partition_to_group[partition_id as usize];
        &self.groups[idx]
    }

    /// The single Worker within the responsible group that owns this
    /// partition for all its map attempts.
    pub fn worker_for_partition(&self, partition_id: u32) -> Option<&WorkerDetail> {
        self.group_for_partition(partition_id).worker_for_partition(partition_id)
    }
}

/// A unit of map output routed to a single Worker. `seq_no` is monotonic per
/// (map attempt, partition); `(map_id, map_attempt, seq_no)` is the
/// idempotence key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub stage: StageShuffleId,
    pub map_id: u32,
    pub map_attempt: u16,
    pub partition_id: u32,
    pub seq_no: u32,
    pub payload: Vec<u8>,
    /// Set on the final block a map attempt sends for a given partition.
    /// Makes winning-attempt resolution deterministic (§9 Open Question).
    pub is_terminator: bool,
}

impl Block {
    pub fn fingerprint(&self) -> (u32, u16, u32) {
        (self.map_id, self.map_attempt, self.seq_no)
    }
}

/// A completed flush of in-memory bytes to a DFS file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlushRecord {
    pub dfs_path: String,
    pub length: u64,
    pub crc32c: u32,
}

/// Terminal state of a stage's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageMarkerStatus {
    Success,
    Aborted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageMarker {
    pub stage: StageShuffleId,
    pub status: StageMarkerStatus,
}

impl StageMarker {
    /// File name used at the stage root per §6 (`_SUCCESS` / `_FAILED`).
    pub fn file_name(status: StageMarkerStatus) -> &'static str {
        match status {
            StageMarkerStatus::Success => "_SUCCESS",
            StageMarkerStatus::Aborted => "_FAILED",
        }
    }
}

/// Request shape for `GetShuffleWorkers`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShuffleWorkersRequest {
    pub datacenter: String,
    pub cluster: String,
    pub app_id: String,
    pub dag_id: String,
    pub priority: u32,
    pub task_id: String,
    pub app_name: String,
    pub requested_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(host: &str, port: u16) -> WorkerDetail {
        WorkerDetail {
            host: host.to_string(),
            data_port: port,
            control_port: port + 1,
            weight: 1,
            datacenter: "dc1".to_string(),
            cluster: "prod".to_string(),
            last_heartbeat_millis: 0,
        }
    }

    #[test]
    fn stage_shuffle_id_equality_is_tuple_equality() {
        let a = StageShuffleId::new("app-1", 0, 0, 5);
        let b = StageShuffleId::new("app-1", 0, 0, 5);
        let c = StageShuffleId::new("app-1", 0, 1, 5);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn next_attempt_bumps_stage_attempt_only() {
        let a = StageShuffleId::new("app-1", 0, 2, 5);
        let b = a.next_attempt();
        assert_eq!(b.stage_attempt, 3);
        assert_eq!(b.shuffle_id, a.shuffle_id);
        assert_eq!(b.app_id, a.app_id);
    }

    #[test]
    fn dfs_prefix_matches_layout() {
        let id = StageShuffleId::new("app-1", 0, 1, 7);
        assert_eq!(id.dfs_prefix("/rss-root"), "/rss-root/app-1/0/7/stage-1");
    }

    #[test]
    fn server_group_worker_for_partition_is_modular() {
        let group = ServerGroup::new(vec![worker("a", 1000), worker("b", 1000), worker("c", 1000)]);
        assert_eq!(group.worker_for_partition(0).unwrap().host, "a");
        assert_eq!(group.worker_for_partition(1).unwrap().host, "b");
        assert_eq!(group.worker_for_partition(3).unwrap().host, "a");
    }

    #[test]
    fn server_group_empty_has_no_target() {
        let group = ServerGroup::new(vec![]);
        assert!(group.worker_for_partition(0).is_none());
    }

    #[test]
    fn worker_detail_key_is_host_port() {
        let w = worker("10.0.0.1", 9000);
        assert_eq!(w.key(), "10.0.0.1:9000");
    }
}
