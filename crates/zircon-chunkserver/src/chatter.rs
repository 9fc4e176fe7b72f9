//! The coordinator side of the replication protocol.
//!
//! [`ChunkserverChatter`] wraps a local [`ReplicaEngine`] and implements
//! the full [`Chunkserver`] capability: local operations delegate to the
//! engine, `start_write_replicated` fans the prepare out to every replica
//! concurrently, and `replicate` pulls committed bytes from a peer for
//! catch-up. Peers are resolved by address at call time through a
//! [`ConnectionCache`].

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use zircon_types::{ChunkNum, CommitHash, Result, ServerAddress, Version, ZirconError};

use crate::engine::ReplicaEngine;
use crate::Chunkserver;

/// Resolves a server address to a chunkserver capability.
///
/// Implementations may dial RPC connections or hand back in-process
/// servers; the chatter does not care which.
#[async_trait]
pub trait ConnectionCache: Send + Sync {
    async fn chunkserver(&self, address: &ServerAddress) -> Result<Arc<dyn Chunkserver>>;
}

/// Connection cache over a fixed registry of in-process servers.
///
/// Used by tests and single-process deployments where every "peer" lives
/// in the same address space.
#[derive(Default)]
pub struct StaticConnectionCache {
    servers: DashMap<ServerAddress, Arc<dyn Chunkserver>>,
}

impl StaticConnectionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a server under its address, replacing any previous one.
    pub fn register(&self, address: ServerAddress, server: Arc<dyn Chunkserver>) {
        self.servers.insert(address, server);
    }
}

#[async_trait]
impl ConnectionCache for StaticConnectionCache {
    async fn chunkserver(&self, address: &ServerAddress) -> Result<Arc<dyn Chunkserver>> {
        self.servers
            .get(address)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ZirconError::Transport(format!("no route to {address}")))
    }
}

/// Replication coordinator over a local replica engine.
pub struct ChunkserverChatter {
    engine: Arc<ReplicaEngine>,
    connections: Arc<dyn ConnectionCache>,
    local_address: ServerAddress,
}

impl ChunkserverChatter {
    pub fn new(
        engine: Arc<ReplicaEngine>,
        connections: Arc<dyn ConnectionCache>,
        local_address: ServerAddress,
    ) -> Self {
        Self {
            engine,
            connections,
            local_address,
        }
    }

    pub fn engine(&self) -> &Arc<ReplicaEngine> {
        &self.engine
    }

    pub fn local_address(&self) -> &ServerAddress {
        &self.local_address
    }
}

#[async_trait]
impl Chunkserver for ChunkserverChatter {
    async fn start_write_replicated(
        &self,
        chunk: ChunkNum,
        offset: u32,
        data: Vec<u8>,
        replicas: Vec<ServerAddress>,
    ) -> Result<()> {
        debug!(%chunk, offset, replicas = replicas.len(), "start_write_replicated");

        let mut tasks = JoinSet::new();
        for replica in replicas {
            let engine = Arc::clone(&self.engine);
            let connections = Arc::clone(&self.connections);
            let local = self.local_address.clone();
            let data = data.clone();
            tasks.spawn(async move {
                let result = if replica == local {
                    engine.start_write(chunk, offset, &data)
                } else {
                    match connections.chunkserver(&replica).await {
                        Ok(peer) => peer.start_write(chunk, offset, data).await,
                        Err(e) => Err(e),
                    }
                };
                (replica, result)
            });
        }

        // All replicas must acknowledge the prepare; the first failure
        // aborts the whole write so the caller never reaches commit.
        let mut failure = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((replica, Err(e))) => {
                    warn!(%chunk, %replica, error = %e, "replica failed to stage write");
                    failure.get_or_insert(e);
                }
                Err(join_err) => {
                    failure.get_or_insert(ZirconError::internal(format!(
                        "fan-out task failed: {join_err}"
                    )));
                }
            }
        }
        match failure {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    async fn replicate(
        &self,
        chunk: ChunkNum,
        source: ServerAddress,
        version: Version,
    ) -> Result<()> {
        if self.engine.has_version(chunk, version) {
            return Ok(());
        }
        debug!(%chunk, %source, %version, "replicate");

        let peer = self.connections.chunkserver(&source).await?;
        let max = self.engine.config().max_chunk_size;
        let (data, read_version) = peer.read(chunk, 0, max, version).await?;
        self.engine.install_committed(chunk, read_version, &data)
    }

    async fn read(
        &self,
        chunk: ChunkNum,
        offset: u32,
        length: u32,
        min_version: Version,
    ) -> Result<(Vec<u8>, Version)> {
        self.engine.read(chunk, offset, length, min_version)
    }

    async fn start_write(&self, chunk: ChunkNum, offset: u32, data: Vec<u8>) -> Result<()> {
        self.engine.start_write(chunk, offset, &data)
    }

    async fn commit_write(
        &self,
        chunk: ChunkNum,
        hash: CommitHash,
        old_version: Version,
        new_version: Version,
    ) -> Result<()> {
        self.engine.commit_write(chunk, &hash, old_version, new_version)
    }

    async fn update_latest_version(
        &self,
        chunk: ChunkNum,
        old_version: Version,
        new_version: Version,
    ) -> Result<()> {
        self.engine.update_latest_version(chunk, old_version, new_version)
    }

    async fn add(&self, chunk: ChunkNum, initial_data: Vec<u8>, version: Version) -> Result<()> {
        self.engine.add(chunk, &initial_data, version)
    }

    async fn delete(&self, chunk: ChunkNum, version: Version) -> Result<()> {
        self.engine.delete(chunk, version)
    }

    async fn list_all_chunks(&self) -> Result<Vec<(ChunkNum, Version)>> {
        Ok(self.engine.list_all_chunks())
    }
}
