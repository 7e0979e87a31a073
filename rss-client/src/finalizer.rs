//! Stage Finalizer (§4.7 ambient): writes/deletes the `_SUCCESS`/`_FAILED`
//! markers through the `Dfs` trait and drives the `FinalizeStage` RPC
//! fan-out across a shuffle's Worker groups.

use rss_common::error::RssError;
use rss_common::model::{ShuffleHandle, StageMarker, StageMarkerStatus, WorkerDetail};
use rss_dfs::Dfs;
use rss_proto::worker_data_service_client::WorkerDataServiceClient;
use rss_proto::FinalizeStageRequest;
use std::collections::HashMap;

fn http_endpoint(endpoint: &str) -> String {
    format!("http://{endpoint}")
}

/// Every distinct Worker referenced by any group in the handle — a shuffle's
/// partitions can share Workers across groups, so this is deduplicated by
/// `(host, dataPort)`.
fn distinct_workers(handle: &ShuffleHandle) -> Vec<WorkerDetail> {
    let mut seen: HashMap<String, WorkerDetail> = HashMap::new();
    for group in &handle.groups {
        for worker in &group.workers {
            seen.entry(worker.key()).or_insert_with(|| worker.clone());
        }
    }
    seen.into_values().collect()
}

/// Call `FinalizeStage` on every Worker that served this shuffle, then write
/// `_SUCCESS` on full success or `_FAILED` if any Worker failed to finalize.
pub async fn finalize_stage(dfs: &dyn Dfs, handle: &ShuffleHandle, root_dir: &str) -> Result<(), RssError> {
    let mut first_err = None;

    for worker in distinct_workers(handle) {
        if let Err(e) = finalize_on_worker(&worker, handle).await {
            tracing::warn!(worker = %worker.key(), error = %e, "FinalizeStage rpc failed");
            first_err.get_or_insert(e);
        }
    }

    match first_err {
        None => write_marker(dfs, handle, root_dir, StageMarkerStatus::Success).await,
        Some(e) => {
            write_marker(dfs, handle, root_dir, StageMarkerStatus::Aborted).await.ok();
            Err(e)
        }
    }
}

async fn finalize_on_worker(worker: &WorkerDetail, handle: &ShuffleHandle) -> Result<(), RssError> {
    let mut client = WorkerDataServiceClient::connect(http_endpoint(&worker.data_endpoint()))
        .await
        .map_err(|e| RssError::ProtocolError {
            message: format!("connecting to {} for FinalizeStage: {e}", worker.data_endpoint()),
        })?;

    let stage = &handle.stage;
    let reply = client
        .finalize_stage(FinalizeStageRequest {
            request_id: rss_proto::new_request_id(),
            stage: Some(rss_proto::StageShuffleId {
                app_id: stage.app_id.clone(),
                app_attempt: stage.app_attempt,
                stage_attempt: stage.stage_attempt,
                shuffle_id: stage.shuffle_id,
            }),
        })
        .await
        .map_err(|e| RssError::ProtocolError {
            message: format!("FinalizeStage rpc failed: {e}"),
        })?
        .into_inner();

    if reply.error != rss_proto::ErrorKind::None as i32 {
        return Err(RssError::ProtocolError {
            message: reply.error_message,
        });
    }
    Ok(())
}

async fn write_marker(
    dfs: &dyn Dfs,
    handle: &ShuffleHandle,
    root_dir: &str,
    status: StageMarkerStatus,
) -> Result<(), RssError> {
    let _marker = StageMarker {
        stage: handle.stage.clone(),
        status,
    };
    let prefix = handle.stage.dfs_prefix(root_dir);
    let final_path = format!("{}/{}", prefix, StageMarker::file_name(status));
    let tmp_path = format!("{final_path}.tmp");
    dfs.write_new(&tmp_path, &[]).await?;
    dfs.atomic_rename(&tmp_path, &final_path).await
}

/// Delete any markers left by a previous (failed) attempt at this exact
/// `StageShuffleId` before a retry begins, per §7: "the driver listener
/// deletes the previous success marker before retry."
pub async fn delete_stale_markers(dfs: &dyn Dfs, handle: &ShuffleHandle, root_dir: &str) -> Result<(), RssError> {
    let prefix = handle.stage.dfs_prefix(root_dir);
    dfs.delete_tree(&prefix).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use rss_common::model::{ClusterConf, ServerGroup, StageShuffleId};

    fn stage() -> StageShuffleId {
        StageShuffleId::new("app-1", 0, 0, 0)
    }

    fn handle_with_no_workers() -> ShuffleHandle {
        ShuffleHandle {
            stage: stage(),
            num_partitions: 1,
            partition_to_group: vec![0],
            groups: vec![ServerGroup::new(vec![])],
            cluster_conf: ClusterConf {
                root_dir: "/rss".to_string(),
                datacenter: "dc1".to_string(),
                cluster: "prod".to_string(),
                dfs_site: vec![],
            },
        }
    }

    #[tokio::test]
    async fn finalize_with_no_workers_writes_success_marker() {
        let (_dir, dfs) = rss_dfs::local_fs_for_test();
        let handle = handle_with_no_workers();
        finalize_stage(&dfs, &handle, "").await.unwrap();
        assert!(dfs.exists("app-1/0/0/stage-0/_SUCCESS").await.unwrap());
    }

    #[tokio::test]
    async fn delete_stale_markers_removes_the_stage_tree() {
        let (_dir, dfs) = rss_dfs::local_fs_for_test();
        let handle = handle_with_no_workers();
        finalize_stage(&dfs, &handle, "").await.unwrap();
        delete_stale_markers(&dfs, &handle, "").await.unwrap();
        assert!(!dfs.exists("app-1/0/0/stage-0/_SUCCESS").await.unwrap());
    }
}
