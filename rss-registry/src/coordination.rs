//! The coordination-service contract §1 assumes as external infrastructure:
//! ephemeral registration, small linearizable-ish reads, and change
//! notification. `GossipCoordinationClient` is the reference implementation,
//! built directly over `chitchat`'s SWIM-style membership gossip rather than
//! a strongly-consistent store, so reads here are eventually consistent
//! across the cluster. §9 records this as the deliberate trade for a
//! dependency-free reference deployment; a production rollout can swap in a
//! `CoordinationClient` backed by a real consensus store without touching
//! `Registry`.

use async_trait::async_trait;
use chitchat::transport::UdpTransport;
use chitchat::{spawn_chitchat, ChitchatConfig, ChitchatHandle, ChitchatId, FailureDetectorConfig};
use rss_common::error::RssError;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use uuid::Uuid;

/// A node's full key-value state as observed through gossip, plus its id.
#[derive(Debug, Clone)]
pub struct NodeSnapshot {
    pub node_id: String,
    pub gossip_addr: SocketAddr,
    pub key_values: HashMap<String, String>,
}

/// Abstraction over the coordination primitives `Registry` needs: publish a
/// key-value on this node's own state, retract one, and snapshot every
/// currently-live node's state. Kept narrow and gossip-shaped on purpose —
/// `Registry` is the layer that gives these primitives shuffle semantics.
#[async_trait]
pub trait CoordinationClient: Send + Sync {
    fn node_id(&self) -> &str;

    async fn publish(&self, key: &str, value: &str);

    async fn retract(&self, key: &str);

    /// Snapshot of every node currently considered live by the failure
    /// detector, keyed by node id.
    async fn snapshot_live(&self) -> Vec<NodeSnapshot>;
}

fn coordination_err(message: impl Into<String>) -> RssError {
    RssError::ConfigError {
        message: message.into(),
    }
}

/// `CoordinationClient` over `chitchat`. One instance owns one UDP gossip
/// socket; Master and Worker binaries each start exactly one at startup and
/// hand an `Arc<dyn CoordinationClient>` down to their `Registry`.
pub struct GossipCoordinationClient {
    handle: ChitchatHandle,
    node_id: String,
}

impl GossipCoordinationClient {
    /// Start gossiping on `bind_addr` within `cluster_id`, seeded by `seeds`,
    /// publishing `initial_kv` as this node's first key-values. Must be
    /// called from within a running tokio runtime: unlike the embedded
    /// DuckDB-extension deployment this pattern is drawn from, RSS's Master
    /// and Worker binaries are async-native, so the gossip handle runs on
    /// the caller's own runtime instead of a dedicated bridging one.
    pub async fn start(
        bind_addr: SocketAddr,
        cluster_id: &str,
        seeds: Vec<SocketAddr>,
        initial_kv: Vec<(String, String)>,
    ) -> Result<Self, RssError> {
        let node_id = Uuid::new_v4().to_string();
        let chitchat_id = ChitchatId::new(node_id.clone(), 0, bind_addr);

        let config = ChitchatConfig {
            chitchat_id,
            cluster_id: cluster_id.to_string(),
            gossip_interval: Duration::from_millis(500),
            listen_addr: bind_addr,
            seed_nodes: seeds.iter().map(|a| a.to_string()).collect(),
            failure_detector_config: FailureDetectorConfig::default(),
            marked_for_deletion_grace_period: Duration::from_secs(60),
            catchup_callback: None,
            extra_liveness_predicate: None,
        };

        let handle = spawn_chitchat(config, initial_kv, &UdpTransport)
            .await
            .map_err(|e| coordination_err(format!("failed to start gossip on {bind_addr}: {e}")))?;

        tracing::info!(node_id = %node_id, addr = %bind_addr, cluster = cluster_id, "gossip coordination client started");

        Ok(Self { handle, node_id })
    }

    /// Mark this node as draining so peers garbage-collect it promptly
    /// instead of waiting out the full failure-detector timeout.
    pub async fn shutdown(&self) {
        let chitchat = self.handle.chitchat();
        let mut cc = chitchat.lock().await;
        cc.self_node_state().set("status", "draining");
    }
}

#[async_trait]
impl CoordinationClient for GossipCoordinationClient {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    async fn publish(&self, key: &str, value: &str) {
        let chitchat = self.handle.chitchat();
        let mut cc = chitchat.lock().await;
        cc.self_node_state().set(key, value);
    }

    async fn retract(&self, key: &str) {
        let chitchat = self.handle.chitchat();
        let mut cc = chitchat.lock().await;
        cc.self_node_state().delete(key);
    }

    async fn snapshot_live(&self) -> Vec<NodeSnapshot> {
        let chitchat = self.handle.chitchat();
        let cc = chitchat.lock().await;
        let live: std::collections::HashSet<&ChitchatId> = cc.live_nodes().collect();
        cc.node_states()
            .iter()
            .filter(|(id, _)| live.contains(id))
            .map(|(id, state)| NodeSnapshot {
                node_id: id.node_id.clone(),
                gossip_addr: id.gossip_advertise_addr,
                key_values: state
                    .key_values()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            })
            .collect()
    }
}
