//! Control- and data-channel tonic services. Generalizes the teacher's
//! `DuckDBFlightService` shape — parse request, do the real work, build a
//! typed reply — to the two Worker-facing services instead of one Flight
//! service.

use rss_common::error::{ErrorKind as RssErrorKind, RssError, SendBlockOutcome};
use rss_common::model::{Block, PartitionShuffleId, StageShuffleId};
use rss_proto::worker_control_service_server::WorkerControlService;
use rss_proto::worker_data_service_server::WorkerDataService;
use rss_proto::{
    ErrorKind, FinalizeStageReply, FinalizeStageRequest, HealthCheckReply, HealthCheckRequest,
    OpenConnectionReply, OpenConnectionRequest, SendBlockReply, SendBlockRequest,
};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tonic::{Request, Response, Status};

use crate::storage::Storage;
use crate::token_bucket::TokenBucket;

fn to_wire_error(err: &RssError) -> ErrorKind {
    match err.kind() {
        RssErrorKind::NoShuffleWorkers => ErrorKind::NoShuffleWorkers,
        RssErrorKind::NoToken => ErrorKind::NoToken,
        RssErrorKind::Backpressure => ErrorKind::Backpressure,
        RssErrorKind::InputNotReady => ErrorKind::InputNotReady,
        RssErrorKind::Dfs => ErrorKind::Dfs,
        RssErrorKind::StageAborted => ErrorKind::StageAborted,
        RssErrorKind::Config => ErrorKind::Config,
        RssErrorKind::Protocol => ErrorKind::Protocol,
    }
}

fn from_wire_stage(stage: rss_proto::StageShuffleId) -> StageShuffleId {
    StageShuffleId::new(stage.app_id, stage.app_attempt, stage.stage_attempt, stage.shuffle_id)
}

/// Shared token ledger for the control/data split: `OpenConnection` mints a
/// token on the control channel, `SendBlock` spends it on the data channel.
pub(crate) struct TokenLedger {
    bucket: TokenBucket,
    issued: Mutex<HashSet<String>>,
}

impl TokenLedger {
    fn new(base_connections: u32, total_connections: u32) -> Self {
        Self {
            bucket: TokenBucket::new(base_connections, total_connections),
            issued: Mutex::new(HashSet::new()),
        }
    }

    async fn issue(&self, deadline: Duration) -> Option<String> {
        let token = self.bucket.acquire(deadline).await?;
        self.issued.lock().unwrap().insert(token.clone());
        Some(token)
    }

    fn is_valid(&self, token: &str) -> bool {
        self.issued.lock().unwrap().contains(token)
    }
}

pub struct ShuffleWorkerControlService {
    tokens: Arc<TokenLedger>,
    network_timeout_millis: u64,
}

impl ShuffleWorkerControlService {
    pub fn new(tokens: Arc<TokenLedger>, network_timeout_millis: u64) -> Self {
        Self {
            tokens,
            network_timeout_millis,
        }
    }
}

#[tonic::async_trait]
impl WorkerControlService for ShuffleWorkerControlService {
    async fn open_connection(
        &self,
        request: Request<OpenConnectionRequest>,
    ) -> Result<Response<OpenConnectionReply>, Status> {
        let req = request.into_inner();
        let deadline = Duration::from_millis(self.network_timeout_millis);

        match self.tokens.issue(deadline).await {
            Some(token) => Ok(Response::new(OpenConnectionReply {
                request_id: req.request_id,
                error: ErrorKind::None as i32,
                error_message: String::new(),
                token,
            })),
            None => {
                tracing::debug!(client_id = %req.client_id, "OpenConnection rejected: no token within deadline");
                Ok(Response::new(OpenConnectionReply {
                    request_id: req.request_id,
                    error: ErrorKind::NoToken as i32,
                    error_message: "no token available on control channel within deadline".to_string(),
                    token: String::new(),
                }))
            }
        }
    }

    async fn health_check(
        &self,
        request: Request<HealthCheckRequest>,
    ) -> Result<Response<HealthCheckReply>, Status> {
        let req = request.into_inner();
        Ok(Response::new(HealthCheckReply {
            request_id: req.request_id,
            error: ErrorKind::None as i32,
            healthy: true,
        }))
    }
}

pub struct ShuffleWorkerDataService {
    storage: Arc<Storage>,
    tokens: Arc<TokenLedger>,
}

impl ShuffleWorkerDataService {
    pub fn new(storage: Arc<Storage>, tokens: Arc<TokenLedger>) -> Self {
        Self { storage, tokens }
    }
}

#[tonic::async_trait]
impl WorkerDataService for ShuffleWorkerDataService {
    async fn send_block(&self, request: Request<SendBlockRequest>) -> Result<Response<SendBlockReply>, Status> {
        let req = request.into_inner();
        let request_id = req.request_id.clone();

        if !self.tokens.is_valid(&req.token) {
            return Ok(Response::new(SendBlockReply {
                request_id,
                error: ErrorKind::NoToken as i32,
                error_message: "token not recognized; call OpenConnection first".to_string(),
                duplicate: false,
            }));
        }

        let Some(wire_stage) = req.stage else {
            return Ok(Response::new(SendBlockReply {
                request_id,
                error: ErrorKind::Protocol as i32,
                error_message: "missing stage".to_string(),
                duplicate: false,
            }));
        };
        let stage = from_wire_stage(wire_stage);
        let partition = PartitionShuffleId::new(stage.clone(), req.partition_id);

        let block = Block {
            stage,
            map_id: req.map_id,
            map_attempt: req.map_attempt as u16,
            partition_id: req.partition_id,
            seq_no: req.seq_no,
            payload: req.payload,
            is_terminator: req.is_terminator,
        };

        match self.storage.append_block(partition, block).await {
            Ok(SendBlockOutcome::Accepted) => Ok(Response::new(SendBlockReply {
                request_id,
                error: ErrorKind::None as i32,
                error_message: String::new(),
                duplicate: false,
            })),
            Ok(SendBlockOutcome::Duplicate) => Ok(Response::new(SendBlockReply {
                request_id,
                error: ErrorKind::None as i32,
                error_message: String::new(),
                duplicate: true,
            })),
            Err(e) => {
                tracing::debug!(error = %e, "SendBlock rejected");
                Ok(Response::new(SendBlockReply {
                    request_id,
                    error: to_wire_error(&e) as i32,
                    error_message: e.to_string(),
                    duplicate: false,
                }))
            }
        }
    }

    async fn finalize_stage(
        &self,
        request: Request<FinalizeStageRequest>,
    ) -> Result<Response<FinalizeStageReply>, Status> {
        let req = request.into_inner();
        let request_id = req.request_id.clone();

        let Some(wire_stage) = req.stage else {
            return Ok(Response::new(FinalizeStageReply {
                request_id,
                error: ErrorKind::Protocol as i32,
                error_message: "missing stage".to_string(),
            }));
        };
        let stage = from_wire_stage(wire_stage);

        match self.storage.finalize_stage(&stage).await {
            Ok(()) => {
                tracing::info!(app_id = %stage.app_id, shuffle_id = stage.shuffle_id, "FinalizeStage completed");
                Ok(Response::new(FinalizeStageReply {
                    request_id,
                    error: ErrorKind::None as i32,
                    error_message: String::new(),
                }))
            }
            Err(e) => {
                tracing::warn!(error = %e, "FinalizeStage failed");
                Ok(Response::new(FinalizeStageReply {
                    request_id,
                    error: to_wire_error(&e) as i32,
                    error_message: e.to_string(),
                }))
            }
        }
    }
}

pub fn new_token_ledger(base_connections: u32, total_connections: u32) -> Arc<TokenLedger> {
    Arc::new(TokenLedger::new(base_connections, total_connections))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rss_dfs::Dfs;
    use rss_proto::StageShuffleId as WireStage;

    fn storage_for_test() -> (tempfile::TempDir, Arc<Storage>, Arc<dyn Dfs>) {
        let (dir, dfs) = rss_dfs::local_fs_for_test();
        let dfs: Arc<dyn Dfs> = Arc::new(dfs);
        let memory = Arc::new(crate::memory::MemoryGovernor::new(1024 * 1024, 0.75));
        let storage = Storage::new(Arc::clone(&dfs), "", "worker-1:7000", memory, 2, 16, 64, 60_000, 30_000);
        (dir, storage, dfs)
    }

    #[tokio::test]
    async fn open_connection_then_send_block_is_accepted() {
        let (_dir, storage, _dfs) = storage_for_test();
        let tokens = new_token_ledger(10, 10);
        let control = ShuffleWorkerControlService::new(Arc::clone(&tokens), 1000);
        let data = ShuffleWorkerDataService::new(storage, Arc::clone(&tokens));

        let open = control
            .open_connection(Request::new(OpenConnectionRequest {
                request_id: vec![1],
                app_id: "app-1".to_string(),
                client_id: "client-1".to_string(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(open.error, ErrorKind::None as i32);

        let reply = data
            .send_block(Request::new(SendBlockRequest {
                request_id: vec![2],
                token: open.token,
                stage: Some(WireStage {
                    app_id: "app-1".to_string(),
                    app_attempt: 0,
                    stage_attempt: 0,
                    shuffle_id: 0,
                }),
                map_id: 0,
                map_attempt: 0,
                partition_id: 0,
                seq_no: 0,
                payload: b"hi".to_vec(),
                is_terminator: false,
            }))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(reply.error, ErrorKind::None as i32);
        assert!(!reply.duplicate);
    }

    #[tokio::test]
    async fn send_block_with_unknown_token_is_rejected() {
        let (_dir, storage, _dfs) = storage_for_test();
        let tokens = new_token_ledger(10, 10);
        let data = ShuffleWorkerDataService::new(storage, tokens);

        let reply = data
            .send_block(Request::new(SendBlockRequest {
                request_id: vec![1],
                token: "bogus".to_string(),
                stage: Some(WireStage {
                    app_id: "app-1".to_string(),
                    app_attempt: 0,
                    stage_attempt: 0,
                    shuffle_id: 0,
                }),
                map_id: 0,
                map_attempt: 0,
                partition_id: 0,
                seq_no: 0,
                payload: b"hi".to_vec(),
                is_terminator: false,
            }))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(reply.error, ErrorKind::NoToken as i32);
    }

    #[tokio::test]
    async fn finalize_stage_closes_partitions_but_writes_no_stage_marker() {
        let (_dir, storage, dfs) = storage_for_test();
        let tokens = new_token_ledger(10, 10);
        let data = ShuffleWorkerDataService::new(storage, tokens);

        let stage = WireStage {
            app_id: "app-1".to_string(),
            app_attempt: 0,
            stage_attempt: 0,
            shuffle_id: 0,
        };

        let reply = data
            .finalize_stage(Request::new(FinalizeStageRequest {
                request_id: vec![1],
                stage: Some(stage),
            }))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(reply.error, ErrorKind::None as i32);
        // The Worker only flushes/closes its own partitions; the driver-side
        // finalizer owns the single post-fan-out marker write.
        assert!(!dfs.exists("app-1/0/0/stage-0/_SUCCESS").await.unwrap());
        assert!(!dfs.exists("app-1/0/0/stage-0/_FAILED").await.unwrap());
    }
}
