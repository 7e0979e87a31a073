//! Client Writer (§4.5): strategy selection, partitioning, block packetizing,
//! and network delivery to the Worker group assigned by the Shuffle Handle.
//! Generalizes the teacher's `ShuffleWriterExec::execute` partition-buffer-
//! then-send loop and its `shuffle_partition::partition_batch` hash-
//! partitioner from a DataFusion `ExecutionPlan`/Arrow-batch shape into a
//! push-based `write(record)` API over opaque serialized records.

use rss_common::error::{ErrorKind as RssErrorKind, RssError};
use rss_common::model::ShuffleHandle;
use rss_proto::worker_control_service_client::WorkerControlServiceClient;
use rss_proto::worker_data_service_client::WorkerDataServiceClient;
use rss_proto::{OpenConnectionRequest, SendBlockRequest};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tonic::transport::Channel;

/// A write strategy chosen per the dependency shape and configuration (§4.5,
/// §9 Design Notes: "tagged variant with a common write/close contract").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterStrategyKind {
    Bypass,
    Unsafe,
    Sort,
}

/// Pure function of dependency shape and configuration, per §4.5's selection
/// rule.
pub fn select_strategy(
    num_partitions: u32,
    bypass_threshold: u32,
    supports_relocation: bool,
    has_aggregation: bool,
) -> WriterStrategyKind {
    if num_partitions <= bypass_threshold && !has_aggregation {
        WriterStrategyKind::Bypass
    } else if supports_relocation && !has_aggregation {
        WriterStrategyKind::Unsafe
    } else {
        WriterStrategyKind::Sort
    }
}

trait PartitionBuffering: Send {
    fn accept(&mut self, partition_id: u32, bytes: Vec<u8>);
    fn drain_ready(&mut self, block_size: u64) -> Vec<(u32, Vec<u8>)>;
    fn drain_all(&mut self) -> Vec<(u32, Vec<u8>)>;
}

/// Direct per-partition byte buffering, no sort. Used for both `Bypass` and
/// `Unsafe`: the off-heap arena `Unsafe` uses in the source system has no
/// meaningful safe-Rust equivalent, so both strategies share this buffer and
/// differ only in how `select_strategy` chooses between them.
struct DirectBuffers {
    buffers: Vec<Vec<u8>>,
}

impl DirectBuffers {
    fn new(num_partitions: u32) -> Self {
        Self {
            buffers: vec![Vec::new(); num_partitions as usize],
        }
    }
}

impl PartitionBuffering for DirectBuffers {
    fn accept(&mut self, partition_id: u32, bytes: Vec<u8>) {
        self.buffers[partition_id as usize].extend_from_slice(&bytes);
    }

    fn drain_ready(&mut self, block_size: u64) -> Vec<(u32, Vec<u8>)> {
        let mut out = Vec::new();
        for (pid, buf) in self.buffers.iter_mut().enumerate() {
            if buf.len() as u64 >= block_size {
                out.push((pid as u32, std::mem::take(buf)));
            }
        }
        out
    }

    fn drain_all(&mut self) -> Vec<(u32, Vec<u8>)> {
        let mut out = Vec::new();
        for (pid, buf) in self.buffers.iter_mut().enumerate() {
            if !buf.is_empty() {
                out.push((pid as u32, std::mem::take(buf)));
            }
        }
        out
    }
}

/// In-memory sort-by-partitionId with spill-on-threshold, merge-emit. Records
/// accumulate untouched until `writer_buffer_spill` bytes are buffered, at
/// which point the whole spill is sorted by partition and merged into one
/// contiguous block per partition.
struct SortBuffer {
    pending: Vec<(u32, Vec<u8>)>,
    pending_bytes: u64,
    spill_threshold: u64,
}

impl SortBuffer {
    fn new(spill_threshold: u64) -> Self {
        Self {
            pending: Vec::new(),
            pending_bytes: 0,
            spill_threshold,
        }
    }

    fn merge_sorted(&mut self) -> Vec<(u32, Vec<u8>)> {
        let mut entries = std::mem::take(&mut self.pending);
        self.pending_bytes = 0;
        entries.sort_by_key(|(pid, _)| *pid);

        let mut merged: Vec<(u32, Vec<u8>)> = Vec::new();
        for (pid, bytes) in entries {
            match merged.last_mut() {
                Some((last_pid, buf)) if *last_pid == pid => buf.extend_from_slice(&bytes),
                _ => merged.push((pid, bytes)),
            }
        }
        merged
    }
}

impl PartitionBuffering for SortBuffer {
    fn accept(&mut self, partition_id: u32, bytes: Vec<u8>) {
        self.pending_bytes += bytes.len() as u64;
        self.pending.push((partition_id, bytes));
    }

    fn drain_ready(&mut self, _block_size: u64) -> Vec<(u32, Vec<u8>)> {
        if self.pending_bytes >= self.spill_threshold {
            self.merge_sorted()
        } else {
            Vec::new()
        }
    }

    fn drain_all(&mut self) -> Vec<(u32, Vec<u8>)> {
        self.merge_sorted()
    }
}

fn new_buffering(kind: WriterStrategyKind, num_partitions: u32, writer_buffer_spill: u64) -> Box<dyn PartitionBuffering> {
    match kind {
        WriterStrategyKind::Bypass | WriterStrategyKind::Unsafe => Box::new(DirectBuffers::new(num_partitions)),
        WriterStrategyKind::Sort => Box::new(SortBuffer::new(writer_buffer_spill)),
    }
}

/// A record the Writer can partition and serialize. The host engine's record
/// type implements this; RSS never inspects the serialized bytes.
pub trait ShuffleRecord {
    /// Used only to compute `partition_id = partition_key % numPartitions`.
    fn partition_key(&self) -> u64;
    fn append_serialized(&self, buf: &mut Vec<u8>);
}

/// Per-worker token + data-channel client cache, shared by a `ShuffleWriter`
/// across its lifetime. One `OpenConnection` per Worker per writer instance.
struct WorkerChannels {
    data_clients: HashMap<String, WorkerDataServiceClient<Channel>>,
    tokens: HashMap<String, String>,
}

impl WorkerChannels {
    fn new() -> Self {
        Self {
            data_clients: HashMap::new(),
            tokens: HashMap::new(),
        }
    }
}

fn dfs_endpoint(endpoint: &str) -> String {
    format!("http://{endpoint}")
}

async fn ensure_connection(
    channels: &Mutex<WorkerChannels>,
    worker: &rss_common::model::WorkerDetail,
    network_timeout_millis: u64,
) -> Result<(WorkerDataServiceClient<Channel>, String), RssError> {
    let key = worker.key();
    {
        let guard = channels.lock().await;
        if let (Some(client), Some(token)) = (guard.data_clients.get(&key), guard.tokens.get(&key)) {
            return Ok((client.clone(), token.clone()));
        }
    }

    let data_client = WorkerDataServiceClient::connect(dfs_endpoint(&worker.data_endpoint()))
        .await
        .map_err(|e| RssError::ProtocolError {
            message: format!("connecting to worker data endpoint {}: {e}", worker.data_endpoint()),
        })?;

    let mut control_client = WorkerControlServiceClient::connect(dfs_endpoint(&worker.control_endpoint()))
        .await
        .map_err(|e| RssError::ProtocolError {
            message: format!("connecting to worker control endpoint {}: {e}", worker.control_endpoint()),
        })?;

    let reply = control_client
        .open_connection(OpenConnectionRequest {
            request_id: rss_proto::new_request_id(),
            app_id: worker.datacenter.clone(),
            client_id: "rss-client".to_string(),
        })
        .await
        .map_err(|e| RssError::ProtocolError {
            message: format!("OpenConnection rpc failed: {e}"),
        })?
        .into_inner();

    if reply.error != rss_proto::ErrorKind::None as i32 {
        return Err(RssError::NoTokenError);
    }
    let _ = network_timeout_millis;

    let mut guard = channels.lock().await;
    guard.data_clients.insert(key.clone(), data_client.clone());
    guard.tokens.insert(key.clone(), reply.token.clone());
    Ok((data_client, reply.token))
}

/// Sends one block, retrying retryable errors (`BackpressureError`,
/// `NoTokenError`) with exponential backoff up to `network_retries`, per §4.5
/// ("unacked blocks ... trigger retry up to networkRetries, after which the
/// task fails") and §7's retry policy.
async fn send_block_with_retry(
    channels: &Mutex<WorkerChannels>,
    worker: &rss_common::model::WorkerDetail,
    req_template: &SendBlockRequest,
    network_retries: u32,
    network_timeout_millis: u64,
) -> Result<(), RssError> {
    let mut delay = Duration::from_millis(50);

    for attempt in 0..=network_retries {
        let (mut client, token) = ensure_connection(channels, worker, network_timeout_millis).await?;
        let mut req = req_template.clone();
        req.token = token;
        req.request_id = rss_proto::new_request_id();

        let result = client.send_block(req).await;
        match result {
            Ok(resp) => {
                let reply = resp.into_inner();
                if reply.error == rss_proto::ErrorKind::None as i32 {
                    return Ok(());
                }
                let err = wire_error_to_rss(reply.error, reply.error_message);
                if !err.is_retryable() || attempt == network_retries {
                    return Err(err);
                }
                tracing::debug!(attempt, error = %err, "SendBlock rejected, retrying");
            }
            Err(status) => {
                if attempt == network_retries {
                    return Err(RssError::ProtocolError {
                        message: format!("SendBlock transport error: {status}"),
                    });
                }
                tracing::debug!(attempt, error = %status, "SendBlock transport error, retrying");
            }
        }

        tokio::time::sleep(delay).await;
        delay *= 2;
    }

    unreachable!("loop always returns by the last iteration")
}

fn wire_error_to_rss(error: i32, message: String) -> RssError {
    use rss_proto::ErrorKind;
    let kind = if error == ErrorKind::NoShuffleWorkers as i32 {
        RssErrorKind::NoShuffleWorkers
    } else if error == ErrorKind::NoToken as i32 {
        RssErrorKind::NoToken
    } else if error == ErrorKind::Backpressure as i32 {
        RssErrorKind::Backpressure
    } else if error == ErrorKind::Dfs as i32 {
        RssErrorKind::Dfs
    } else if error == ErrorKind::StageAborted as i32 {
        RssErrorKind::StageAborted
    } else if error == ErrorKind::Config as i32 {
        RssErrorKind::Config
    } else {
        RssErrorKind::Protocol
    };

    match kind {
        RssErrorKind::NoToken => RssError::NoTokenError,
        RssErrorKind::Backpressure => RssError::BackpressureError,
        _ => RssError::ProtocolError { message },
    }
}

/// One map task's producer. Partitions records, packetizes into blocks of
/// `block_size`, and sends them to the Worker owning each partition.
pub struct ShuffleWriter<'h> {
    handle: &'h ShuffleHandle,
    map_id: u32,
    map_attempt: u16,
    buffering: Box<dyn PartitionBuffering>,
    seq_no: Vec<u32>,
    touched: HashSet<u32>,
    block_size: u64,
    network_retries: u32,
    network_timeout_millis: u64,
    channels: Arc<Mutex<WorkerChannels>>,
}

impl<'h> ShuffleWriter<'h> {
    pub fn new(
        handle: &'h ShuffleHandle,
        map_id: u32,
        map_attempt: u16,
        strategy: WriterStrategyKind,
        block_size: u64,
        writer_buffer_spill: u64,
        network_retries: u32,
        network_timeout_millis: u64,
    ) -> Self {
        Self {
            handle,
            map_id,
            map_attempt,
            buffering: new_buffering(strategy, handle.num_partitions, writer_buffer_spill),
            seq_no: vec![0; handle.num_partitions as usize],
            touched: HashSet::new(),
            block_size,
            network_retries,
            network_timeout_millis,
            channels: Arc::new(Mutex::new(WorkerChannels::new())),
        }
    }

    /// Buffer one record, sending any partition blocks that cross `block_size`.
    pub async fn write<R: ShuffleRecord>(&mut self, record: &R) -> Result<(), RssError> {
        let partition_id = (record.partition_key() % self.handle.num_partitions as u64) as u32;
        self.touched.insert(partition_id);

        let mut bytes = Vec::new();
        record.append_serialized(&mut bytes);
        self.buffering.accept(partition_id, bytes);

        for (pid, payload) in self.buffering.drain_ready(self.block_size) {
            self.send(pid, payload, false).await?;
        }
        Ok(())
    }

    /// Flush remaining buffered bytes and send an explicit terminator block
    /// (zero-length payload, `is_terminator = true`) for every partition this
    /// map attempt touched, per §9's recommended deterministic tie-break.
    pub async fn close(mut self) -> Result<(), RssError> {
        for (pid, payload) in self.buffering.drain_all() {
            self.send(pid, payload, false).await?;
        }
        let touched: Vec<u32> = self.touched.iter().copied().collect();
        for pid in touched {
            self.send(pid, Vec::new(), true).await?;
        }
        Ok(())
    }

    async fn send(&mut self, partition_id: u32, payload: Vec<u8>, is_terminator: bool) -> Result<(), RssError> {
        let Some(worker) = self.handle.worker_for_partition(partition_id) else {
            return Err(RssError::ProtocolError {
                message: format!("no worker group covers partition {partition_id}"),
            });
        };

        let seq_no = self.seq_no[partition_id as usize];
        self.seq_no[partition_id as usize] += 1;

        let stage = &self.handle.stage;
        let req = SendBlockRequest {
            request_id: Vec::new(),
            token: String::new(),
            stage: Some(rss_proto::StageShuffleId {
                app_id: stage.app_id.clone(),
                app_attempt: stage.app_attempt,
                stage_attempt: stage.stage_attempt,
                shuffle_id: stage.shuffle_id,
            }),
            map_id: self.map_id,
            map_attempt: self.map_attempt as u32,
            partition_id,
            seq_no,
            payload,
            is_terminator,
        };

        send_block_with_retry(&self.channels, worker, &req, self.network_retries, self.network_timeout_millis).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bypass_chosen_under_threshold_without_aggregation() {
        assert_eq!(select_strategy(100, 200, false, false), WriterStrategyKind::Bypass);
    }

    #[test]
    fn unsafe_chosen_over_threshold_with_relocation_and_no_aggregation() {
        assert_eq!(select_strategy(500, 200, true, false), WriterStrategyKind::Unsafe);
    }

    #[test]
    fn sort_chosen_when_aggregating_or_no_relocation() {
        assert_eq!(select_strategy(500, 200, false, false), WriterStrategyKind::Sort);
        assert_eq!(select_strategy(50, 200, true, true), WriterStrategyKind::Sort);
    }

    #[test]
    fn direct_buffers_drain_ready_only_past_block_size() {
        let mut buf = DirectBuffers::new(2);
        buf.accept(0, vec![1, 2, 3]);
        assert!(buf.drain_ready(10).is_empty());
        buf.accept(0, vec![4, 5, 6, 7, 8, 9, 10]);
        let ready = buf.drain_ready(10);
        assert_eq!(ready, vec![(0, vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10])]);
    }

    #[test]
    fn sort_buffer_merges_by_partition_once_spilled() {
        let mut sort = SortBuffer::new(5);
        sort.accept(1, vec![1]);
        sort.accept(0, vec![2]);
        assert!(sort.drain_ready(0).is_empty());
        sort.accept(1, vec![3, 4, 5]);
        let merged = sort.drain_ready(0);
        assert_eq!(merged, vec![(0, vec![2]), (1, vec![1, 3, 4, 5])]);
    }
}
