use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use zircon_chunkserver::{
    Chunkserver, ChunkserverChatter, EngineConfig, MemoryStorage, ReplicaEngine, StorageDriver,
};
use zircon_logging::LogConfig;
use zircon_rpc::{
    publish, ChunkserverService, Listener, RpcConnectionCache, ServiceRegistry, TcpListener,
};
use zircon_types::ServerAddress;

/// Zircon chunkserver daemon.
#[derive(Parser, Debug)]
#[command(name = "zircon-chunkserver", version, about)]
struct Args {
    /// Address to listen on.
    #[arg(short, long, default_value = "0.0.0.0:7100")]
    listen: String,

    /// Address other replicas reach this server at; defaults to the bound
    /// listen address.
    #[arg(long)]
    advertise: Option<String>,

    /// Per-call RPC deadline in milliseconds for peer connections.
    #[arg(long, default_value_t = 5000)]
    rpc_timeout_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _log_guard = zircon_logging::init_logging(&LogConfig::default());

    let listener = TcpListener::bind(&args.listen).await?;
    let advertise = args
        .advertise
        .map(ServerAddress::from)
        .unwrap_or_else(|| listener.local_addr());

    let storage = Arc::new(MemoryStorage::new()) as Arc<dyn StorageDriver>;
    let engine = Arc::new(ReplicaEngine::new(storage, EngineConfig::default()));
    let connections = Arc::new(RpcConnectionCache::new(Duration::from_millis(
        args.rpc_timeout_ms,
    )));
    let server = Arc::new(ChunkserverChatter::new(engine, connections, advertise.clone()));

    let registry = ServiceRegistry::new();
    registry.register(Arc::new(ChunkserverService::new(
        server as Arc<dyn Chunkserver>,
    )));

    let handle = publish(listener, Arc::new(registry));
    tracing::info!(listen = %handle.local_addr(), %advertise, "chunkserver up");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    handle.teardown(false).await?;
    Ok(())
}
