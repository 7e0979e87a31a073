//! Driver-side Shuffle Handle construction (§4.7): shuffle the Worker list,
//! build sliding-window groups, assign partitions modularly.

use rand::seq::SliceRandom;
use rand::Rng;
use rss_common::model::{ClusterConf, ServerGroup, ShuffleHandle, StageShuffleId, WorkerDetail};

/// Build a `ShuffleHandle` from the Workers the Master allocated. `workers_per_group`
/// is the target window size; groups end up smaller only when fewer Workers are
/// live than requested.
pub fn build_handle<R: Rng + ?Sized>(
    stage: StageShuffleId,
    num_partitions: u32,
    mut workers: Vec<WorkerDetail>,
    workers_per_group: usize,
    cluster_conf: ClusterConf,
    rng: &mut R,
) -> ShuffleHandle {
    workers.shuffle(rng);

    let groups = build_groups(&workers, workers_per_group);
    let partition_to_group: Vec<usize> = (0..num_partitions as usize)
        .map(|p| if groups.is_empty() { 0 } else { p % groups.len() })
        .collect();

    ShuffleHandle {
        stage,
        num_partitions,
        partition_to_group,
        groups,
        cluster_conf,
    }
}

/// One group per Worker position in the shuffled list, each a sliding window
/// of `window` Workers starting at that position (wrapping), deduplicated.
fn build_groups(shuffled: &[WorkerDetail], window: usize) -> Vec<ServerGroup> {
    if shuffled.is_empty() {
        return Vec::new();
    }
    let window = window.max(1).min(shuffled.len());

    (0..shuffled.len())
        .map(|start| {
            let mut seen = std::collections::HashSet::new();
            let mut members = Vec::with_capacity(window);
            for offset in 0..window {
                let idx = (start + offset) % shuffled.len();
                let worker = &shuffled[idx];
                if seen.insert(worker.key()) {
                    members.push(worker.clone());
                }
            }
            ServerGroup::new(members)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn worker(host: &str) -> WorkerDetail {
        WorkerDetail {
            host: host.to_string(),
            data_port: 7000,
            control_port: 7001,
            weight: 1,
            datacenter: "dc1".to_string(),
            cluster: "prod".to_string(),
            last_heartbeat_millis: 0,
        }
    }

    fn stage() -> StageShuffleId {
        StageShuffleId::new("app-1", 0, 0, 0)
    }

    fn conf() -> ClusterConf {
        ClusterConf {
            root_dir: "/rss".to_string(),
            datacenter: "dc1".to_string(),
            cluster: "prod".to_string(),
            dfs_site: vec![],
        }
    }

    #[test]
    fn one_group_per_worker() {
        let workers: Vec<_> = (0..5).map(|i| worker(&format!("h{i}"))).collect();
        let mut rng = StdRng::seed_from_u64(42);
        let handle = build_handle(stage(), 8, workers, 2, conf(), &mut rng);
        assert_eq!(handle.groups.len(), 5);
    }

    #[test]
    fn groups_have_no_duplicate_members() {
        let workers: Vec<_> = (0..3).map(|i| worker(&format!("h{i}"))).collect();
        let mut rng = StdRng::seed_from_u64(7);
        let handle = build_handle(stage(), 4, workers, 3, conf(), &mut rng);
        for group in &handle.groups {
            let mut keys: Vec<_> = group.workers.iter().map(|w| w.key()).collect();
            let len_before = keys.len();
            keys.sort();
            keys.dedup();
            assert_eq!(keys.len(), len_before);
        }
    }

    #[test]
    fn partition_assignment_is_modular_and_in_range() {
        let workers: Vec<_> = (0..4).map(|i| worker(&format!("h{i}"))).collect();
        let mut rng = StdRng::seed_from_u64(1);
        let handle = build_handle(stage(), 10, workers, 2, conf(), &mut rng);
        for p in 0..10usize {
            assert_eq!(handle.partition_to_group[p], p % handle.groups.len());
        }
    }

    #[test]
    fn no_workers_yields_no_groups_and_empty_assignment_is_safe() {
        let mut rng = StdRng::seed_from_u64(1);
        let handle = build_handle(stage(), 3, Vec::new(), 2, conf(), &mut rng);
        assert!(handle.groups.is_empty());
        assert_eq!(handle.partition_to_group, vec![0, 0, 0]);
    }
}
