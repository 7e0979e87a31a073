use clap::Parser;
use rss_common::config::RssConfig;
use rss_common::model::WorkerDetail;
use rss_dfs::{Dfs, LocalFsDfs};
use rss_proto::worker_control_service_server::WorkerControlServiceServer;
use rss_proto::worker_data_service_server::WorkerDataServiceServer;
use rss_registry::{GossipCoordinationClient, Registry};
use rss_worker::memory::MemoryGovernor;
use rss_worker::server::{new_token_ledger, ShuffleWorkerControlService, ShuffleWorkerDataService};
use rss_worker::storage::Storage;
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tonic::transport::Server;

#[derive(Parser, Debug)]
#[command(name = "rss-worker", about = "Remote Shuffle Service: Shuffle Worker")]
struct Args {
    /// Path to the RSS TOML config file.
    #[arg(long, default_value = "rss.toml")]
    config: String,

    /// Address the gRPC WorkerControlService listens on.
    #[arg(long, default_value = "0.0.0.0:17750")]
    control_bind: SocketAddr,

    /// Address the gRPC WorkerDataService listens on.
    #[arg(long, default_value = "0.0.0.0:17751")]
    data_bind: SocketAddr,

    /// Address this node's gossip layer binds to.
    #[arg(long, default_value = "0.0.0.0:17752")]
    gossip_bind: SocketAddr,

    /// Seed gossip addresses of other cluster members ("host:port", repeatable).
    #[arg(long = "seed")]
    seeds: Vec<SocketAddr>,

    /// Relative load weight advertised to the Master's weighted sampling.
    #[arg(long, default_value_t = 1)]
    weight: u32,

    /// Local base directory for this node's DFS-backed storage. Only used
    /// when no real DFS endpoint is configured; production deployments
    /// should point `root_dir` at an HDFS- or S3-backed `Dfs` impl instead.
    #[arg(long, default_value = "./rss-data")]
    local_dfs_base: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config = match RssConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "failed to load config");
            return ExitCode::from(4);
        }
    };

    let dfs: Arc<dyn Dfs> = Arc::new(LocalFsDfs::new(args.local_dfs_base.clone()));
    if let Err(e) = dfs.exists("").await {
        tracing::error!(error = %e, "dfs root unreachable");
        return ExitCode::from(3);
    }

    let coordination = match GossipCoordinationClient::start(
        args.gossip_bind,
        &format!("{}/{}", config.datacenter, config.cluster),
        args.seeds,
        vec![("rss_role_hint".to_string(), "worker".to_string())],
    )
    .await
    {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "failed to start gossip coordination client");
            return ExitCode::from(1);
        }
    };

    let registry = Arc::new(Registry::new(Arc::new(coordination), &config.datacenter, &config.cluster));

    let detail = WorkerDetail {
        host: args.data_bind.ip().to_string(),
        data_port: args.data_bind.port(),
        control_port: args.control_bind.port(),
        weight: args.weight.max(1),
        datacenter: config.datacenter.clone(),
        cluster: config.cluster.clone(),
        last_heartbeat_millis: WorkerDetail::now_millis(),
    };

    if let Err(e) = registry.register_worker(&detail).await {
        tracing::error!(error = %e, "failed to register worker");
        return ExitCode::from(1);
    }

    let heartbeat_registry = Arc::clone(&registry);
    let heartbeat_detail = detail.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(5));
        loop {
            ticker.tick().await;
            let mut refreshed = heartbeat_detail.clone();
            refreshed.last_heartbeat_millis = WorkerDetail::now_millis();
            if let Err(e) = heartbeat_registry.refresh_worker_heartbeat(&refreshed).await {
                tracing::warn!(error = %e, "heartbeat refresh failed");
            }
        }
    });

    let memory = Arc::new(MemoryGovernor::new(config.memory_control_size_threshold, config.memory_low_water_pct));
    let storage = Storage::new(
        Arc::clone(&dfs),
        config.root_dir.clone(),
        detail.key(),
        Arc::clone(&memory),
        config.dumper_threads,
        config.dumper_queue_size,
        config.blocks_per_flush,
        config.app_obj_retention_millis,
        config.partition_idle_millis,
    );

    let sweep_storage = Arc::clone(&storage);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(10));
        loop {
            ticker.tick().await;
            sweep_storage.sweep_once().await;
        }
    });

    let pressure_memory = Arc::clone(&memory);
    tokio::spawn(async move {
        loop {
            pressure_memory.notified_below_low_water().await;
            tracing::debug!(used_bytes = pressure_memory.used_bytes(), "memory pressure relieved");
        }
    });

    let tokens = new_token_ledger(config.base_connections, config.total_connections);

    let control_service = ShuffleWorkerControlService::new(Arc::clone(&tokens), config.network_timeout_millis);
    let data_service = ShuffleWorkerDataService::new(storage, tokens);

    let control_bind = args.control_bind;
    let control_serve = tokio::spawn(async move {
        Server::builder()
            .add_service(WorkerControlServiceServer::new(control_service))
            .serve(control_bind)
            .await
    });

    tracing::info!(control = %args.control_bind, data = %args.data_bind, "Shuffle Worker listening");

    let data_serve = Server::builder()
        .add_service(WorkerDataServiceServer::new(data_service))
        .serve(args.data_bind);

    tokio::select! {
        res = data_serve => {
            if let Err(e) = res {
                tracing::error!(error = %e, "data server exited with error");
                return ExitCode::from(2);
            }
        }
        res = control_serve => {
            match res {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "control server exited with error");
                    return ExitCode::from(2);
                }
                Err(e) => {
                    tracing::error!(error = %e, "control server task panicked");
                    return ExitCode::from(2);
                }
            }
        }
    }

    ExitCode::SUCCESS
}
