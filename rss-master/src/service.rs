//! The `GetShuffleWorkers` tonic endpoint. Generalizes the teacher's
//! `DuckDBFlightService` shape — a `#[tonic::async_trait] impl ... for
//! ...Service` parsing a request, doing the real work, and building a typed
//! reply — to the RSS wire messages instead of Arrow Flight ones.

use rss_common::config::RssConfig;
use rss_common::error::RssError;
use rss_common::model::WorkerDetail;
use rss_proto::master_service_server::MasterService;
use rss_proto::{ClusterConf, ErrorKind, GetShuffleWorkersReply, GetShuffleWorkersRequest};
use rss_registry::Registry;
use std::sync::Arc;
use tonic::{Request, Response, Status};

use crate::allocator;

fn to_wire_worker(w: &WorkerDetail) -> rss_proto::WorkerDetail {
    rss_proto::WorkerDetail {
        host: w.host.clone(),
        data_port: w.data_port as u32,
        control_port: w.control_port as u32,
        weight: w.weight,
        datacenter: w.datacenter.clone(),
        cluster: w.cluster.clone(),
        last_heartbeat_millis: w.last_heartbeat_millis,
    }
}

fn to_wire_error(err: &RssError) -> ErrorKind {
    match err.kind() {
        rss_common::error::ErrorKind::NoShuffleWorkers => ErrorKind::NoShuffleWorkers,
        rss_common::error::ErrorKind::NoToken => ErrorKind::NoToken,
        rss_common::error::ErrorKind::Backpressure => ErrorKind::Backpressure,
        rss_common::error::ErrorKind::InputNotReady => ErrorKind::InputNotReady,
        rss_common::error::ErrorKind::Dfs => ErrorKind::Dfs,
        rss_common::error::ErrorKind::StageAborted => ErrorKind::StageAborted,
        rss_common::error::ErrorKind::Config => ErrorKind::Config,
        rss_common::error::ErrorKind::Protocol => ErrorKind::Protocol,
    }
}

/// Implements `MasterService`. Only the elected leader serves real
/// allocations; a standby instance answers every RPC with a `Protocol`
/// error telling the caller to re-resolve the leader through the registry.
pub struct ShuffleMasterService {
    registry: Arc<Registry>,
    config: RssConfig,
}

impl ShuffleMasterService {
    pub fn new(registry: Arc<Registry>, config: RssConfig) -> Self {
        Self { registry, config }
    }

    async fn is_leading(&self) -> bool {
        match self.registry.get_active_master().await {
            Ok(Some(leader)) => leader.node_id == self.registry.node_id(),
            _ => false,
        }
    }
}

#[tonic::async_trait]
impl MasterService for ShuffleMasterService {
    async fn get_shuffle_workers(
        &self,
        request: Request<GetShuffleWorkersRequest>,
    ) -> Result<Response<GetShuffleWorkersReply>, Status> {
        let req = request.into_inner();
        let request_id = req.request_id.clone();

        if !self.is_leading().await {
            tracing::debug!(app_id = %req.app_id, "rejecting GetShuffleWorkers: not the active master");
            return Ok(Response::new(GetShuffleWorkersReply {
                request_id,
                error: ErrorKind::Protocol as i32,
                error_message: "not the active master; retry via registry".to_string(),
                workers: Vec::new(),
                cluster_conf: None,
            }));
        }

        let live = match self.registry.list_workers().await {
            Ok(w) => w,
            Err(e) => {
                return Ok(Response::new(GetShuffleWorkersReply {
                    request_id,
                    error: to_wire_error(&e) as i32,
                    error_message: e.to_string(),
                    workers: Vec::new(),
                    cluster_conf: None,
                }));
            }
        };

        let scoped: Vec<WorkerDetail> = live
            .into_iter()
            .filter(|w| w.datacenter == req.datacenter && w.cluster == req.cluster)
            .collect();

        let picked = match allocator::allocate(
            &scoped,
            req.requested_count,
            self.config.min_server_count,
            self.config.max_server_count,
        ) {
            Ok(p) => p,
            Err(e) => {
                tracing::info!(app_id = %req.app_id, error = %e, "GetShuffleWorkers failed");
                return Ok(Response::new(GetShuffleWorkersReply {
                    request_id,
                    error: to_wire_error(&e) as i32,
                    error_message: e.to_string(),
                    workers: Vec::new(),
                    cluster_conf: None,
                }));
            }
        };

        tracing::info!(
            app_id = %req.app_id,
            dag_id = %req.dag_id,
            requested = req.requested_count,
            allocated = picked.len(),
            "GetShuffleWorkers served"
        );

        Ok(Response::new(GetShuffleWorkersReply {
            request_id,
            error: ErrorKind::None as i32,
            error_message: String::new(),
            workers: picked.iter().map(to_wire_worker).collect(),
            cluster_conf: Some(ClusterConf {
                root_dir: self.config.root_dir.clone(),
                datacenter: req.datacenter,
                cluster: req.cluster,
                dfs_site: Vec::new(),
            }),
        }))
    }
}
