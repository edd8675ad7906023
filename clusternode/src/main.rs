use clap::Parser;
use clusternode::chunk_service::ChunkService;
use clusternode::reactor::{self, Reactor};
use clusternode::resource::{ResourceSampler, ResourceUsage, StaticSampler};
use clusternode::sender::HeartbeatSender;
use clusternode::config;
use std::sync::Arc;
use std::time::Duration;
use storage::chunk_store::FileChunkStore;
use tokio::time::sleep;
use utilities::logger::{error, info, init_logger};
use utilities::result::Result;
use utilities::retry_policy::retry_with_backoff;
use utilities::shutdown::{Shutdown, wait_for_signal};

/// Cluster server: persists chunks and reports liveness to the head.
#[derive(Parser)]
#[command(name = "clusternode", version, about = "Distributed file grid cluster server")]
struct Cli {
    #[arg(long)]
    server_id: Option<u64>,
    #[arg(long)]
    ip: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(short, long, env = "CONFIG_PATH")]
    config: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = config::load(cli.config)?;
    if let Some(server_id) = cli.server_id {
        config.server_id = server_id;
    }
    if let Some(ip) = cli.ip {
        config.ip = ip;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }

    let _gaurd = init_logger(
        "ClusterServer",
        &config.server_id.to_string(),
        &config.log_base,
    );
    info!(server_id = config.server_id, ip = %config.ip, port = config.port, "starting cluster server");

    let shutdown = Shutdown::new();
    let reactor = Reactor::new()?;

    {
        let shutdown = shutdown.clone();
        reactor.spawn(async move { wait_for_signal(shutdown).await });
    }
    {
        let config = config.clone();
        let shutdown = shutdown.clone();
        reactor.spawn(async move {
            let store = Arc::new(FileChunkStore::new(&config.chunk_root).await?);
            let service =
                ChunkService::bind(&format!("{}:{}", config.ip, config.port), store).await?;
            service.run(shutdown).await
        });
    }
    {
        let shutdown = shutdown.clone();
        reactor.spawn(async move { heartbeat_supervisor(config, shutdown).await });
    }

    reactor.run();
    info!("cluster server stopped");
    Ok(())
}

/// Keeps one heartbeat stream alive towards the head, reconnecting with
/// backoff whenever the sender exits on a terminal failure.
async fn heartbeat_supervisor(config: config::Config, shutdown: Shutdown) -> Result<()> {
    let sampler: Arc<dyn ResourceSampler> = Arc::new(StaticSampler::new(ResourceUsage::default()));
    let sender = HeartbeatSender::new(
        config.server_id,
        config.ip.clone(),
        Duration::from_millis(config.heartbeat_interval_ms),
        sampler,
    );
    let mut stop = shutdown.subscribe();
    loop {
        if shutdown.is_triggered() {
            return Ok(());
        }
        let head_addr = config.head_addr.clone();
        let stream = retry_with_backoff(
            || async { reactor::connect(&head_addr).await },
            config.connect_retries,
        )
        .await
        .map_err(|e| format!("giving up on health checker at {}: {e}", config.head_addr))?;
        info!(addr = %config.head_addr, "connected to health checker");
        tokio::select! {
            res = sender.run(&stream) => {
                if let Err(e) = res {
                    error!(error = %e, "heartbeat stream failed, reconnecting");
                }
            }
            _ = stop.changed() => return Ok(()),
        }
        sleep(Duration::from_secs(1)).await;
    }
}
