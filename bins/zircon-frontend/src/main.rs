use std::sync::Arc;

use clap::Parser;

use zircon_kv::{KvStore, MemKv};
use zircon_lease::{LeaseAgent, LeaseConfig, SyncCoordinator};
use zircon_logging::LogConfig;
use zircon_metadata_cache::{CacheConfig, MetadataCache};
use zircon_rpc::{publish, ServiceRegistry, SyncService, TcpListener};
use zircon_types::ServerName;

/// Zircon metadata frontend daemon.
///
/// Runs a lease agent and metadata cache over the consensus KV and
/// publishes the sync service. The in-memory KV backend makes this a
/// single-frontend deployment; pointing it at the real consensus store is
/// a wiring change behind the `KvStore` trait.
#[derive(Parser, Debug)]
#[command(name = "zircon-frontend", version, about)]
struct Args {
    /// Address to listen on.
    #[arg(short, long, default_value = "0.0.0.0:7200")]
    listen: String,

    /// Name this frontend is redirected to by its peers.
    #[arg(short, long)]
    name: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _log_guard = zircon_logging::init_logging(&LogConfig::default());

    let kv = Arc::new(MemKv::new()) as Arc<dyn KvStore>;
    let agent = Arc::new(LeaseAgent::new(
        kv,
        ServerName::from(args.name.as_str()),
        LeaseConfig::default(),
    ));
    agent.start();

    // The cache serves in-process callers (namespace layer, tests); the
    // sync service exposes lease coordination to remote frontends.
    let _cache = MetadataCache::new(Arc::clone(&agent), CacheConfig::default());

    let registry = ServiceRegistry::new();
    registry.register(Arc::new(SyncService::new(
        Arc::clone(&agent) as Arc<dyn SyncCoordinator>
    )));

    let listener = TcpListener::bind(&args.listen).await?;
    let handle = publish(listener, Arc::new(registry));
    tracing::info!(listen = %handle.local_addr(), name = %args.name, "frontend up");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    handle.teardown(false).await?;
    agent.stop().await;
    Ok(())
}
