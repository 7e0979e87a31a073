//! `Registry`: Worker membership and Master leader election, built on top of
//! a `CoordinationClient`. This generalizes the teacher's `GossipRegistry`
//! start/stop/set_key/get_node_states singleton from a process-local,
//! sync-bridged table into a `Registry` value that both the Master and
//! Worker binaries hold an `Arc` of.

use crate::coordination::CoordinationClient;
use rss_common::error::RssError;
use rss_common::model::WorkerDetail;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

const ROLE_KEY: &str = "rss_role";
const DATACENTER_KEY: &str = "rss_datacenter";
const CLUSTER_KEY: &str = "rss_cluster";
const WORKER_DETAIL_KEY: &str = "rss_worker_detail";
const MASTER_CANDIDATE_ADDR_KEY: &str = "rss_master_addr";

const ROLE_WORKER: &str = "worker";
const ROLE_MASTER_CANDIDATE: &str = "master_candidate";

fn registry_err(message: impl Into<String>) -> RssError {
    RssError::ConfigError {
        message: message.into(),
    }
}

/// The host:port a Master candidate publishes, resolved into the elected
/// leader by every reader independently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterLocation {
    pub node_id: String,
    pub addr: String,
}

/// Cluster membership and leader election, scoped to one datacenter/cluster
/// pair. Multiple `Registry` values may share one `CoordinationClient` (e.g.
/// a test harness standing up several logical clusters over one gossip mesh)
/// since every read and write here is filtered by datacenter and cluster.
pub struct Registry {
    coordination: Arc<dyn CoordinationClient>,
    datacenter: String,
    cluster: String,
}

impl Registry {
    pub fn new(coordination: Arc<dyn CoordinationClient>, datacenter: &str, cluster: &str) -> Self {
        Self {
            coordination,
            datacenter: datacenter.to_string(),
            cluster: cluster.to_string(),
        }
    }

    pub fn node_id(&self) -> &str {
        self.coordination.node_id()
    }

    fn in_scope(&self, kv: &std::collections::HashMap<String, String>) -> bool {
        kv.get(DATACENTER_KEY).map(String::as_str) == Some(self.datacenter.as_str())
            && kv.get(CLUSTER_KEY).map(String::as_str) == Some(self.cluster.as_str())
    }

    /// Publish `detail` as this node's Worker identity. There is no separate
    /// lease to renew: the gossip failure detector (`chitchat`'s phi-accrual
    /// detector) removes a Worker's state from `snapshot_live` once its
    /// heartbeats stop arriving, which is the ephemeral-registration
    /// behavior §2 asks of the coordination service.
    pub async fn register_worker(&self, detail: &WorkerDetail) -> Result<(), RssError> {
        let json = serde_json::to_string(detail)
            .map_err(|e| registry_err(format!("failed to encode worker detail: {e}")))?;
        self.coordination.publish(ROLE_KEY, ROLE_WORKER).await;
        self.coordination.publish(DATACENTER_KEY, &self.datacenter).await;
        self.coordination.publish(CLUSTER_KEY, &self.cluster).await;
        self.coordination.publish(WORKER_DETAIL_KEY, &json).await;
        Ok(())
    }

    /// Refresh the heartbeat timestamp on an already-registered Worker.
    /// Called periodically by the Worker process; the gossip layer carries
    /// the update to peers within a few gossip rounds.
    pub async fn refresh_worker_heartbeat(&self, detail: &WorkerDetail) -> Result<(), RssError> {
        self.register_worker(detail).await
    }

    pub async fn deregister_worker(&self) {
        self.coordination.retract(WORKER_DETAIL_KEY).await;
        self.coordination.retract(ROLE_KEY).await;
    }

    /// Every live Worker in this datacenter/cluster, per the view of the
    /// coordination layer as of now.
    pub async fn list_workers(&self) -> Result<Vec<WorkerDetail>, RssError> {
        let snapshot = self.coordination.snapshot_live().await;
        let mut workers = Vec::new();
        for node in snapshot {
            if node.key_values.get(ROLE_KEY).map(String::as_str) != Some(ROLE_WORKER) {
                continue;
            }
            if !self.in_scope(&node.key_values) {
                continue;
            }
            let Some(raw) = node.key_values.get(WORKER_DETAIL_KEY) else {
                continue;
            };
            match serde_json::from_str::<WorkerDetail>(raw) {
                Ok(detail) => workers.push(detail),
                Err(e) => tracing::warn!(node_id = %node.node_id, error = %e, "dropping unparseable worker detail"),
            }
        }
        Ok(workers)
    }

    /// Announce this node as a Master candidate at `self_addr`. Returns
    /// whether this node is, as of this call, the elected leader.
    ///
    /// Leader election is deterministic-function-of-membership rather than a
    /// compare-and-swap on a shared key: every reader (including candidates
    /// themselves) independently computes the same winner — the live
    /// candidate with the lexicographically smallest node id — from the same
    /// gossip snapshot. This sacrifices the strict linearizability a real
    /// consensus store would give the leader pointer in exchange for needing
    /// no additional infrastructure beyond the gossip mesh already used for
    /// Worker membership; see `DESIGN.md` for the trade-off.
    pub async fn elect_master(&self, self_addr: &str) -> Result<bool, RssError> {
        self.coordination.publish(ROLE_KEY, ROLE_MASTER_CANDIDATE).await;
        self.coordination.publish(DATACENTER_KEY, &self.datacenter).await;
        self.coordination.publish(CLUSTER_KEY, &self.cluster).await;
        self.coordination
            .publish(MASTER_CANDIDATE_ADDR_KEY, self_addr)
            .await;

        let leader = self.compute_leader().await;
        Ok(leader.map(|l| l.node_id == self.node_id()).unwrap_or(false))
    }

    pub async fn resign_master(&self) {
        self.coordination.retract(MASTER_CANDIDATE_ADDR_KEY).await;
        self.coordination.retract(ROLE_KEY).await;
    }

    /// The currently elected Master, recomputed from the live candidate set.
    /// Returns `None` when no candidate is currently live.
    pub async fn get_active_master(&self) -> Result<Option<MasterLocation>, RssError> {
        Ok(self.compute_leader().await)
    }

    async fn compute_leader(&self) -> Option<MasterLocation> {
        let snapshot = self.coordination.snapshot_live().await;
        let mut candidates: Vec<MasterLocation> = snapshot
            .into_iter()
            .filter(|n| n.key_values.get(ROLE_KEY).map(String::as_str) == Some(ROLE_MASTER_CANDIDATE))
            .filter(|n| self.in_scope(&n.key_values))
            .filter_map(|n| {
                let addr = n.key_values.get(MASTER_CANDIDATE_ADDR_KEY)?.clone();
                Some(MasterLocation {
                    node_id: n.node_id,
                    addr,
                })
            })
            .collect();
        candidates.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        candidates.into_iter().next()
    }

    /// Poll `list_workers` every `interval` and invoke `on_change` whenever
    /// the set of worker keys changes. Returns a handle that stops the watch
    /// when aborted or dropped-and-awaited; `chitchat` itself has no
    /// server-push watch API, so this emulates one the way a client of a
    /// gossip-backed registry must.
    pub fn watch_workers<F>(self: &Arc<Self>, interval: Duration, mut on_change: F) -> JoinHandle<()>
    where
        F: FnMut(Vec<WorkerDetail>) + Send + 'static,
    {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut last_keys: Vec<String> = Vec::new();
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let workers = match registry.list_workers().await {
                    Ok(w) => w,
                    Err(e) => {
                        tracing::warn!(error = %e, "watch_workers poll failed");
                        continue;
                    }
                };
                let mut keys: Vec<String> = workers.iter().map(|w| w.key()).collect();
                keys.sort();
                if keys != last_keys {
                    last_keys = keys;
                    on_change(workers);
                }
            }
        })
    }

    /// Poll `get_active_master` every `interval` and invoke `on_change`
    /// whenever the elected leader changes.
    pub fn watch_master<F>(self: &Arc<Self>, interval: Duration, mut on_change: F) -> JoinHandle<()>
    where
        F: FnMut(Option<MasterLocation>) + Send + 'static,
    {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut last: Option<MasterLocation> = None;
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let current = match registry.get_active_master().await {
                    Ok(m) => m,
                    Err(e) => {
                        tracing::warn!(error = %e, "watch_master poll failed");
                        continue;
                    }
                };
                if current != last {
                    last = current.clone();
                    on_change(current);
                }
            }
        })
    }
}
