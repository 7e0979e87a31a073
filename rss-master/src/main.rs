use clap::Parser;
use rss_common::config::RssConfig;
use rss_master::ShuffleMasterService;
use rss_proto::master_service_server::MasterServiceServer;
use rss_registry::{GossipCoordinationClient, Registry};
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tonic::transport::Server;

#[derive(Parser, Debug)]
#[command(name = "rss-master", about = "Remote Shuffle Service: Shuffle Master")]
struct Args {
    /// Path to the RSS TOML config file.
    #[arg(long, default_value = "rss.toml")]
    config: String,

    /// Address the gRPC MasterService listens on.
    #[arg(long, default_value = "0.0.0.0:17650")]
    bind: SocketAddr,

    /// Address this node's gossip layer binds to.
    #[arg(long, default_value = "0.0.0.0:17651")]
    gossip_bind: SocketAddr,

    /// Seed gossip addresses of other cluster members ("host:port", repeatable).
    #[arg(long = "seed")]
    seeds: Vec<SocketAddr>,
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

    let self_addr = format!("{}", args.bind);
    let initial_kv = vec![
        ("rss_role_hint".to_string(), "master".to_string()),
        ("rss_master_bind".to_string(), self_addr.clone()),
    ];

    let coordination = match GossipCoordinationClient::start(
        args.gossip_bind,
        &format!("{}/{}", config.datacenter, config.cluster),
        args.seeds,
        initial_kv,
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

    let election_registry = Arc::clone(&registry);
    let election_addr = self_addr.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            ticker.tick().await;
            match election_registry.elect_master(&election_addr).await {
                Ok(true) => tracing::debug!("holding master leadership"),
                Ok(false) => tracing::debug!("standing by as master candidate"),
                Err(e) => tracing::warn!(error = %e, "master election attempt failed"),
            }
        }
    });

    tracing::info!(bind = %args.bind, "Shuffle Master listening");

    let service = ShuffleMasterService::new(Arc::clone(&registry), config);
    let serve = Server::builder()
        .add_service(MasterServiceServer::new(service))
        .serve(args.bind);

    if let Err(e) = serve.await {
        tracing::error!(error = %e, "master server exited with error");
        return ExitCode::from(2);
    }

    ExitCode::SUCCESS
}
