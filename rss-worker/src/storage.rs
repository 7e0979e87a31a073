//! Partition buffering, the dumper thread pool, and the retention sweeper.
//!
//! Generalizes the teacher's `shuffle_registry.rs` in-memory accumulation
//! pattern — a lock-guarded table plus a `Notify` for waiters, with
//! opportunistic stale-entry cleanup taken under the same lock acquisition —
//! from "buffer until the reader asks" into "buffer, periodically dump to
//! DFS, and let the Reader read DFS after a stage marker."

use rss_common::error::{RssError, SendBlockOutcome};
use rss_common::framing;
use rss_common::model::{Block, FlushRecord, PartitionShuffleId, StageShuffleId, WorkerDetail};
use rss_dfs::Dfs;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};

use crate::memory::MemoryGovernor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionState {
    Empty,
    Buffering,
    Flushing,
    Closed,
}

struct PartitionEntry {
    state: PartitionState,
    buffered: Vec<Block>,
    buffered_bytes: u64,
    seen: HashSet<(u32, u16, u32)>,
    next_flush_seq: u32,
    flush_records: Vec<FlushRecord>,
    last_activity_millis: u64,
    aborted: bool,
}

impl PartitionEntry {
    fn empty() -> Self {
        Self {
            state: PartitionState::Empty,
            buffered: Vec::new(),
            buffered_bytes: 0,
            seen: HashSet::new(),
            next_flush_seq: 0,
            flush_records: Vec::new(),
            last_activity_millis: WorkerDetail::now_millis(),
            aborted: false,
        }
    }
}

struct FlushJob {
    partition: PartitionShuffleId,
    path: String,
    bytes: Vec<u8>,
    byte_len: u64,
    done: Option<oneshot::Sender<Result<(), RssError>>>,
}

struct StorageState {
    dfs: Arc<dyn Dfs>,
    memory: Arc<MemoryGovernor>,
    entries: Mutex<HashMap<PartitionShuffleId, PartitionEntry>>,
}

/// Per-(stage, partition) buffering, dump-to-DFS, and stage finalization.
/// Held behind an `Arc` and shared by the control/data tonic services and the
/// retention sweeper task.
pub struct Storage {
    state: Arc<StorageState>,
    dumpers: Vec<mpsc::Sender<FlushJob>>,
    root_dir: String,
    worker_id: String,
    blocks_per_flush: u32,
    app_obj_retention_millis: u64,
    partition_idle_millis: u64,
}

impl Storage {
    pub fn new(
        dfs: Arc<dyn Dfs>,
        root_dir: impl Into<String>,
        worker_id: impl Into<String>,
        memory: Arc<MemoryGovernor>,
        dumper_threads: u32,
        dumper_queue_size: u32,
        blocks_per_flush: u32,
        app_obj_retention_millis: u64,
        partition_idle_millis: u64,
    ) -> Arc<Self> {
        let state = Arc::new(StorageState {
            dfs,
            memory,
            entries: Mutex::new(HashMap::new()),
        });

        let mut dumpers = Vec::with_capacity(dumper_threads.max(1) as usize);
        for i in 0..dumper_threads.max(1) {
            let (tx, rx) = mpsc::channel(dumper_queue_size.max(1) as usize);
            spawn_dumper(i, Arc::clone(&state), rx);
            dumpers.push(tx);
        }

        Arc::new(Self {
            state,
            dumpers,
            root_dir: root_dir.into(),
            worker_id: worker_id.into(),
            blocks_per_flush: blocks_per_flush.max(1),
            app_obj_retention_millis,
            partition_idle_millis,
        })
    }

    fn dumper_index(&self, partition_id: u32) -> usize {
        (partition_id as usize) % self.dumpers.len()
    }

    /// Append one block to its partition buffer, applying dedup and memory
    /// admission, and trigger a flush once `blocksPerFlush` accumulates.
    pub async fn append_block(
        &self,
        partition: PartitionShuffleId,
        block: Block,
    ) -> Result<SendBlockOutcome, RssError> {
        let payload_len = block.payload.len() as u64;

        let flush_job = {
            let mut entries = self.state.entries.lock().unwrap();
            let entry = entries.entry(partition.clone()).or_insert_with(PartitionEntry::empty);

            if entry.state == PartitionState::Closed {
                return if entry.aborted {
                    Err(RssError::StageAbortedError {
                        stage: partition.stage.clone(),
                    })
                } else {
                    Err(RssError::ProtocolError {
                        message: format!("partition {} is closed", partition.dfs_dir("")),
                    })
                };
            }

            let fingerprint = block.fingerprint();
            if entry.seen.contains(&fingerprint) {
                return Ok(SendBlockOutcome::Duplicate);
            }

            if !self.state.memory.try_reserve(payload_len) {
                return Err(RssError::BackpressureError);
            }

            entry.seen.insert(fingerprint);
            entry.buffered_bytes += payload_len;
            entry.buffered.push(block);
            entry.state = PartitionState::Buffering;
            entry.last_activity_millis = WorkerDetail::now_millis();

            if entry.buffered.len() as u32 >= self.blocks_per_flush {
                Some(self.build_flush_job(&partition, entry, None))
            } else {
                None
            }
        };

        if let Some(job) = flush_job {
            self.send_flush_job(job).await;
        }

        Ok(SendBlockOutcome::Accepted)
    }

    fn build_flush_job(
        &self,
        partition: &PartitionShuffleId,
        entry: &mut PartitionEntry,
        done: Option<oneshot::Sender<Result<(), RssError>>>,
    ) -> FlushJob {
        let blocks = std::mem::take(&mut entry.buffered);
        let byte_len = entry.buffered_bytes;
        entry.buffered_bytes = 0;
        entry.state = PartitionState::Flushing;

        let seq = entry.next_flush_seq;
        entry.next_flush_seq += 1;

        let path = format!(
            "{}/part-{}-{}",
            partition.dfs_dir(&self.root_dir),
            self.worker_id,
            seq
        );

        let mut bytes = Vec::new();
        for block in &blocks {
            bytes.extend(framing::encode_block(block));
        }

        FlushJob {
            partition: partition.clone(),
            path,
            bytes,
            byte_len,
            done,
        }
    }

    async fn send_flush_job(&self, job: FlushJob) {
        let idx = self.dumper_index(job.partition.partition_id);
        if self.dumpers[idx].send(job).await.is_err() {
            tracing::error!("dumper task gone; flush job dropped");
        }
    }

    /// Flush any remaining buffered blocks and mark every partition of
    /// `stage` `Closed`. Waits for in-flight flushes to actually land on DFS
    /// before returning, so a `FinalizeStage` ack is a durability guarantee.
    pub async fn finalize_stage(&self, stage: &StageShuffleId) -> Result<(), RssError> {
        let partitions: Vec<PartitionShuffleId> = {
            let entries = self.state.entries.lock().unwrap();
            entries
                .keys()
                .filter(|p| &p.stage == stage)
                .cloned()
                .collect()
        };

        let mut first_err = None;
        for partition in partitions {
            if let Err(e) = self.flush_and_close(&partition).await {
                first_err.get_or_insert(e);
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn flush_and_close(&self, partition: &PartitionShuffleId) -> Result<(), RssError> {
        let pending = {
            let mut entries = self.state.entries.lock().unwrap();
            let Some(entry) = entries.get_mut(partition) else {
                return Ok(());
            };
            if entry.aborted {
                entry.state = PartitionState::Closed;
                return Err(RssError::StageAbortedError {
                    stage: partition.stage.clone(),
                });
            }
            if entry.buffered.is_empty() {
                entry.state = PartitionState::Closed;
                None
            } else {
                let (tx, rx) = oneshot::channel();
                Some((self.build_flush_job(partition, entry, Some(tx)), rx))
            }
        };

        if let Some((job, rx)) = pending {
            self.send_flush_job(job).await;
            let result = rx.await.unwrap_or(Err(RssError::ProtocolError {
                message: "dumper task dropped the completion channel".to_string(),
            }));
            let mut entries = self.state.entries.lock().unwrap();
            if let Some(entry) = entries.get_mut(partition) {
                entry.state = PartitionState::Closed;
            }
            return result;
        }

        Ok(())
    }

    /// Sweep Closed partitions idle past `appObjRetentionMillis` out of
    /// memory, and force-flush Buffering partitions idle past
    /// `partitionIdleMillis` so a stalled map attempt can't pin memory
    /// indefinitely.
    pub async fn sweep_once(&self) {
        let now = WorkerDetail::now_millis();

        let to_force_flush: Vec<PartitionShuffleId> = {
            let entries = self.state.entries.lock().unwrap();
            entries
                .iter()
                .filter(|(_, e)| {
                    e.state == PartitionState::Buffering
                        && !e.buffered.is_empty()
                        && now.saturating_sub(e.last_activity_millis) > self.partition_idle_millis
                })
                .map(|(id, _)| id.clone())
                .collect()
        };

        for partition in &to_force_flush {
            let job = {
                let mut entries = self.state.entries.lock().unwrap();
                entries
                    .get_mut(partition)
                    .map(|entry| self.build_flush_job(partition, entry, None))
            };
            if let Some(job) = job {
                self.send_flush_job(job).await;
            }
        }

        let mut entries = self.state.entries.lock().unwrap();
        entries.retain(|_, e| {
            !(e.state == PartitionState::Closed
                && now.saturating_sub(e.last_activity_millis) > self.app_obj_retention_millis)
        });
    }

    pub fn flush_record_count(&self, partition: &PartitionShuffleId) -> usize {
        self.state
            .entries
            .lock()
            .unwrap()
            .get(partition)
            .map(|e| e.flush_records.len())
            .unwrap_or(0)
    }

    pub fn partition_state(&self, partition: &PartitionShuffleId) -> Option<PartitionState> {
        self.state.entries.lock().unwrap().get(partition).map(|e| e.state)
    }
}

fn spawn_dumper(dumper_index: u32, state: Arc<StorageState>, mut rx: mpsc::Receiver<FlushJob>) {
    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            let result = write_with_retry(&state.dfs, &job.path, &job.bytes).await;
            state.memory.release(job.byte_len);

            {
                let mut entries = state.entries.lock().unwrap();
                if let Some(entry) = entries.get_mut(&job.partition) {
                    match &result {
                        Ok(()) => {
                            entry.flush_records.push(FlushRecord {
                                dfs_path: job.path.clone(),
                                length: job.bytes.len() as u64,
                                crc32c: 0,
                            });
                            if entry.state == PartitionState::Flushing {
                                entry.state = PartitionState::Buffering;
                            }
                        }
                        Err(e) => {
                            tracing::error!(dumper = dumper_index, path = %job.path, error = %e, "flush failed permanently");
                            entry.aborted = true;
                            entry.state = PartitionState::Closed;
                        }
                    }
                }
            }

            if let Some(done) = job.done {
                let _ = done.send(result);
            }
        }
    });
}

async fn write_with_retry(dfs: &Arc<dyn Dfs>, path: &str, bytes: &[u8]) -> Result<(), RssError> {
    const MAX_ATTEMPTS: u32 = 5;
    let mut delay = std::time::Duration::from_millis(50);
    let mut last_err = None;

    for attempt in 0..MAX_ATTEMPTS {
        match dfs.write_new(path, bytes).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                tracing::warn!(attempt, path, error = %e, "dfs flush attempt failed");
                last_err = Some(e);
                if attempt + 1 < MAX_ATTEMPTS {
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }

    Err(last_err.unwrap_or(RssError::DfsError {
        stage: None,
        partition_id: None,
        message: format!("exhausted retries writing {path}"),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rss_common::model::StageShuffleId;

    fn stage() -> StageShuffleId {
        StageShuffleId::new("app-1", 0, 0, 3)
    }

    fn partition(p: u32) -> PartitionShuffleId {
        PartitionShuffleId::new(stage(), p)
    }

    fn block(map_id: u32, attempt: u16, seq: u32, payload: &[u8]) -> Block {
        Block {
            stage: stage(),
            map_id,
            map_attempt: attempt,
            partition_id: 0,
            seq_no: seq,
            payload: payload.to_vec(),
            is_terminator: payload.is_empty(),
        }
    }

    fn test_storage(root: &str) -> (tempfile::TempDir, Arc<Storage>) {
        let (dir, dfs) = rss_dfs::local_fs_for_test();
        let _ = root;
        let storage = Storage::new(
            Arc::new(dfs),
            "",
            "worker-1:7000",
            Arc::new(MemoryGovernor::new(1024 * 1024, 0.75)),
            2,
            16,
            2,
            60_000,
            30_000,
        );
        (dir, storage)
    }

    #[tokio::test]
    async fn duplicate_block_is_acked_without_rebuffering() {
        let (_dir, storage) = test_storage("");
        let p = partition(0);
        let b = block(1, 0, 0, b"hello");
        assert_eq!(storage.append_block(p.clone(), b.clone()).await.unwrap(), SendBlockOutcome::Accepted);
        assert_eq!(storage.append_block(p, b).await.unwrap(), SendBlockOutcome::Duplicate);
    }

    #[tokio::test]
    async fn blocks_per_flush_triggers_a_flush_and_finalize_sees_records() {
        let (_dir, storage) = test_storage("");
        let p = partition(0);
        storage.append_block(p.clone(), block(1, 0, 0, b"a")).await.unwrap();
        storage.append_block(p.clone(), block(1, 0, 1, b"b")).await.unwrap();

        // give the dumper task a chance to run
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(storage.flush_record_count(&p), 1);

        storage.finalize_stage(&stage()).await.unwrap();
        assert_eq!(storage.partition_state(&p), Some(PartitionState::Closed));
    }

    #[tokio::test]
    async fn closed_partition_rejects_further_blocks() {
        let (_dir, storage) = test_storage("");
        let p = partition(0);
        storage.append_block(p.clone(), block(1, 0, 0, b"a")).await.unwrap();
        storage.finalize_stage(&stage()).await.unwrap();

        let err = storage.append_block(p, block(1, 0, 1, b"b")).await.unwrap_err();
        assert!(matches!(err, RssError::ProtocolError { .. }));
    }

    #[tokio::test]
    async fn memory_pressure_rejects_with_backpressure() {
        let (dir, dfs) = rss_dfs::local_fs_for_test();
        let storage = Storage::new(
            Arc::new(dfs),
            "",
            "worker-1:7000",
            Arc::new(MemoryGovernor::new(4, 0.75)),
            1,
            4,
            1000,
            60_000,
            30_000,
        );
        let p = partition(0);
        let err = storage
            .append_block(p, block(1, 0, 0, b"too big for the budget"))
            .await
            .unwrap_err();
        assert!(matches!(err, RssError::BackpressureError));
        drop(dir);
    }
}
