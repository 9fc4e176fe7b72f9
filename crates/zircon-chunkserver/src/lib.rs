//! Chunkserver crate: the replica engine and the replication coordinator.
//!
//! The [`ReplicaEngine`] is the single-node versioned chunk store: it
//! stages prepared writes, commits them by fingerprint, and serves reads
//! with freshness guarantees. The [`ChunkserverChatter`] wraps an engine
//! and adds the coordinator side of the replication protocol (fan-out
//! prepares, pull-based catch-up); it is what gets published over RPC.
//!
//! "Chunkserver" is a capability: the chatter implements it directly, and
//! the RPC layer provides a wire-client implementation, so callers hold an
//! `Arc<dyn Chunkserver>` without caring which side of the network the
//! server lives on.

pub mod chatter;
pub mod engine;
pub mod storage;
pub mod testing;

use async_trait::async_trait;

use zircon_types::{ChunkNum, CommitHash, Result, ServerAddress, Version};

pub use chatter::{ChunkserverChatter, ConnectionCache, StaticConnectionCache};
pub use engine::{EngineConfig, ReplicaEngine};
pub use storage::{MemoryStorage, StorageDriver};

/// The chunkserver capability.
///
/// Every operation is safe to call concurrently; per-chunk mutations
/// serialize inside the engine.
#[async_trait]
pub trait Chunkserver: Send + Sync {
    /// Stage `(offset, data)` on every replica in `replicas` (including
    /// this server). All replicas must acknowledge; any failure is
    /// surfaced so the caller can abort without committing.
    async fn start_write_replicated(
        &self,
        chunk: ChunkNum,
        offset: u32,
        data: Vec<u8>,
        replicas: Vec<ServerAddress>,
    ) -> Result<()>;

    /// Pull committed bytes for `chunk` at `version` from `source` and
    /// install them locally. Idempotent if the version is already present.
    async fn replicate(&self, chunk: ChunkNum, source: ServerAddress, version: Version)
        -> Result<()>;

    /// Read up to `length` bytes at `offset` from the highest committed
    /// version that is at least `min_version`. Returns the bytes and the
    /// version they were read at; a replica that is behind fails with
    /// `StaleReplica` carrying its current committed version.
    async fn read(
        &self,
        chunk: ChunkNum,
        offset: u32,
        length: u32,
        min_version: Version,
    ) -> Result<(Vec<u8>, Version)>;

    /// Stage `(offset, data)` as the single prepared buffer for `chunk`,
    /// replacing any previous uncommitted one.
    async fn start_write(&self, chunk: ChunkNum, offset: u32, data: Vec<u8>) -> Result<()>;

    /// Atomically verify the prepared buffer against `hash` and the
    /// committed version against `old_version`, then commit the staged
    /// write as `new_version`. Any failed check is `PreconditionFailed`.
    async fn commit_write(
        &self,
        chunk: ChunkNum,
        hash: CommitHash,
        old_version: Version,
        new_version: Version,
    ) -> Result<()>;

    /// Advance the highest version known to be committed somewhere in the
    /// replica set, iff it currently equals `old_version`.
    async fn update_latest_version(
        &self,
        chunk: ChunkNum,
        old_version: Version,
        new_version: Version,
    ) -> Result<()>;

    /// Create a chunk with committed content `initial_data` at `version`.
    async fn add(&self, chunk: ChunkNum, initial_data: Vec<u8>, version: Version) -> Result<()>;

    /// Remove chunk content, only if the committed version equals `version`.
    async fn delete(&self, chunk: ChunkNum, version: Version) -> Result<()>;

    /// Snapshot of currently committed chunks and their versions.
    async fn list_all_chunks(&self) -> Result<Vec<(ChunkNum, Version)>>;
}
