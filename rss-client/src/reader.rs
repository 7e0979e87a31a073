//! Client Reader (§4.6): poll for the stage marker, list and fetch partition
//! files from DFS, reassemble the winning map attempt per partition, and hand
//! back ordered byte chunks for the host engine to deserialize. Generalizes
//! the teacher's `shuffle_registry::wait_for_partition` poll-with-deadline
//! loop into the marker-poll step, and `ShuffleReaderExec::execute`'s
//! spawn-then-stream shape into the partition fetch/merge step.

use rss_common::error::RssError;
use rss_common::model::{Block, PartitionShuffleId, ShuffleHandle, StageMarker, StageMarkerStatus};
use rss_dfs::Dfs;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

/// Ordered, deduplicated bytes for one partition, already chunked to roughly
/// `read_merge_size` per §4.6 step 3 ("emit blocks of read.merge.size").
pub struct PartitionRead {
    pub partition_id: u32,
    pub chunks: Vec<Vec<u8>>,
}

/// Poll for the `_SUCCESS` marker, failing with `InputNotReadyError` past
/// `max_wait`, or `StageAbortedError` if `_FAILED` appears first.
pub async fn await_stage_ready(
    dfs: &dyn Dfs,
    handle: &ShuffleHandle,
    root_dir: &str,
    query_interval: Duration,
    max_wait: Duration,
) -> Result<(), RssError> {
    let prefix = handle.stage.dfs_prefix(root_dir);
    let success_path = format!("{}/{}", prefix, StageMarker::file_name(StageMarkerStatus::Success));
    let failed_path = format!("{}/{}", prefix, StageMarker::file_name(StageMarkerStatus::Aborted));

    let start = Instant::now();
    loop {
        if dfs.exists(&failed_path).await? {
            return Err(RssError::StageAbortedError {
                stage: handle.stage.clone(),
            });
        }
        if dfs.exists(&success_path).await? {
            return Ok(());
        }
        if start.elapsed() >= max_wait {
            return Err(RssError::InputNotReadyError {
                stage: handle.stage.clone(),
            });
        }
        tokio::time::sleep(query_interval).await;
    }
}

/// Read partitions `[start_partition, end_partition)`, restricted to map ids
/// in `[start_map, end_map)`. Assumes `await_stage_ready` already succeeded.
pub async fn read_partition_range(
    dfs: Arc<dyn Dfs>,
    handle: &ShuffleHandle,
    root_dir: &str,
    start_partition: u32,
    end_partition: u32,
    start_map: u32,
    end_map: u32,
    io_threads: u32,
    read_merge_size: u64,
) -> Result<Vec<PartitionRead>, RssError> {
    let semaphore = Arc::new(Semaphore::new(io_threads.max(1) as usize));
    let mut tasks = Vec::new();

    for partition_id in start_partition..end_partition {
        let dfs = Arc::clone(&dfs);
        let semaphore = Arc::clone(&semaphore);
        let stage = handle.stage.clone();
        let root_dir = root_dir.to_string();

        tasks.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore never closed");
            let partition = PartitionShuffleId::new(stage.clone(), partition_id);
            let dir = partition.dfs_dir(&root_dir);
            let files = dfs.list(&dir).await?;

            let mut blocks = Vec::new();
            for file in files {
                let bytes = dfs.read_all(&file).await?;
                blocks.extend(rss_common::framing::decode_blocks(&bytes, &stage, partition_id)?);
            }
            Ok::<_, RssError>((partition_id, blocks))
        }));
    }

    let mut reads = Vec::with_capacity(tasks.len());
    for task in tasks {
        let (partition_id, blocks) = task.await.map_err(|e| RssError::ProtocolError {
            message: format!("partition fetch task panicked: {e}"),
        })??;

        let resolved = resolve_winning_blocks(blocks, start_map, end_map);
        let chunks = chunk_bytes(concat_payloads(resolved), read_merge_size);
        reads.push(PartitionRead { partition_id, chunks });
    }

    reads.sort_by_key(|r| r.partition_id);
    Ok(reads)
}

/// Per §4.6 step 4: group by mapId, pick the winning mapAttempt (highest
/// attempt with an explicit terminator block; absent a terminator, highest
/// attempt with a contiguous seqNo run from 0), dedup by
/// `(mapId, mapAttempt, seqNo)`, and order by seqNo within each map.
fn resolve_winning_blocks(blocks: Vec<Block>, start_map: u32, end_map: u32) -> Vec<Block> {
    let mut by_map: HashMap<u32, HashMap<u16, Vec<Block>>> = HashMap::new();
    for block in blocks {
        if block.map_id < start_map || block.map_id >= end_map {
            continue;
        }
        by_map
            .entry(block.map_id)
            .or_default()
            .entry(block.map_attempt)
            .or_default()
            .push(block);
    }

    let mut ordered_map_ids: Vec<u32> = by_map.keys().copied().collect();
    ordered_map_ids.sort();

    let mut result = Vec::new();
    for map_id in ordered_map_ids {
        let attempts = by_map.remove(&map_id).unwrap();
        if let Some(mut winning) = pick_winning_attempt(attempts) {
            winning.sort_by_key(|b| b.seq_no);
            let mut seen = std::collections::HashSet::new();
            for block in winning {
                if block.is_terminator {
                    continue;
                }
                if seen.insert(block.fingerprint()) {
                    result.push(block);
                }
            }
        }
    }
    result
}

fn pick_winning_attempt(attempts: HashMap<u16, Vec<Block>>) -> Option<Vec<Block>> {
    let mut attempt_numbers: Vec<u16> = attempts.keys().copied().collect();
    attempt_numbers.sort_unstable_by(|a, b| b.cmp(a));

    let has_terminator = |blocks: &[Block]| blocks.iter().any(|b| b.is_terminator);
    let has_contiguous_seq_nos = |blocks: &[Block]| {
        let mut seqs: Vec<u32> = blocks.iter().filter(|b| !b.is_terminator).map(|b| b.seq_no).collect();
        seqs.sort_unstable();
        seqs.dedup();
        seqs.iter().enumerate().all(|(i, &s)| s == i as u32)
    };

    for attempt in &attempt_numbers {
        let blocks = &attempts[attempt];
        if has_terminator(blocks) {
            return Some(attempts[attempt].clone());
        }
    }
    for attempt in &attempt_numbers {
        let blocks = &attempts[attempt];
        if has_contiguous_seq_nos(blocks) {
            return Some(attempts[attempt].clone());
        }
    }
    attempt_numbers.first().map(|a| attempts[a].clone())
}

fn concat_payloads(blocks: Vec<Block>) -> Vec<u8> {
    let mut out = Vec::new();
    for block in blocks {
        out.extend_from_slice(&block.payload);
    }
    out
}

fn chunk_bytes(bytes: Vec<u8>, chunk_size: u64) -> Vec<Vec<u8>> {
    if bytes.is_empty() {
        return Vec::new();
    }
    let chunk_size = (chunk_size.max(1)) as usize;
    bytes.chunks(chunk_size).map(|c| c.to_vec()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rss_common::model::StageShuffleId;

    fn stage() -> StageShuffleId {
        StageShuffleId::new("app-1", 0, 0, 0)
    }

    fn block(map_id: u32, attempt: u16, seq: u32, payload: &[u8], terminator: bool) -> Block {
        Block {
            stage: stage(),
            map_id,
            map_attempt: attempt,
            partition_id: 0,
            seq_no: seq,
            payload: payload.to_vec(),
            is_terminator: terminator,
        }
    }

    #[test]
    fn winning_attempt_prefers_one_with_a_terminator() {
        let blocks = vec![
            block(1, 0, 0, b"stale", false),
            block(1, 1, 0, b"fresh", false),
            block(1, 1, 1, b"", true),
        ];
        let resolved = resolve_winning_blocks(blocks, 0, 10);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].payload, b"fresh");
    }

    #[test]
    fn winning_attempt_falls_back_to_contiguous_seq_nos_without_terminator() {
        let blocks = vec![
            block(1, 0, 0, b"a", false),
            block(1, 0, 1, b"b", false),
            block(1, 1, 0, b"x", false),
            // attempt 1 is missing seq 1, so it's not contiguous; attempt 0 wins
        ];
        let resolved = resolve_winning_blocks(blocks, 0, 10);
        let payload: Vec<u8> = resolved.iter().flat_map(|b| b.payload.clone()).collect();
        assert_eq!(payload, b"ab");
    }

    #[test]
    fn duplicate_fingerprint_is_deduplicated() {
        let blocks = vec![
            block(1, 0, 0, b"a", false),
            block(1, 0, 0, b"a", false),
            block(1, 0, 1, b"", true),
        ];
        let resolved = resolve_winning_blocks(blocks, 0, 10);
        assert_eq!(resolved.len(), 1);
    }

    #[test]
    fn map_id_filtering_excludes_out_of_range_maps() {
        let blocks = vec![block(5, 0, 0, b"a", false), block(6, 0, 0, b"b", false)];
        let resolved = resolve_winning_blocks(blocks, 0, 6);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].map_id, 5);
    }

    #[test]
    fn chunk_bytes_splits_on_boundary() {
        let chunks = chunk_bytes(vec![1, 2, 3, 4, 5], 2);
        assert_eq!(chunks, vec![vec![1, 2], vec![3, 4], vec![5]]);
    }
}
