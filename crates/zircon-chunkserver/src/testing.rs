//! Construction helpers for chunkserver tests.

use std::sync::Arc;

use zircon_types::ServerAddress;

use crate::chatter::{ChunkserverChatter, StaticConnectionCache};
use crate::engine::{EngineConfig, ReplicaEngine};
use crate::storage::MemoryStorage;
use crate::Chunkserver;

/// Build an in-memory chunkserver (storage + engine + chatter), register
/// it in `cache` under `address`, and return it with its storage so tests
/// can inspect usage.
pub fn test_chunkserver(
    cache: &Arc<StaticConnectionCache>,
    address: ServerAddress,
) -> (Arc<ChunkserverChatter>, Arc<MemoryStorage>) {
    let storage = Arc::new(MemoryStorage::new());
    let engine = Arc::new(ReplicaEngine::new(
        Arc::clone(&storage) as Arc<dyn crate::StorageDriver>,
        EngineConfig::default(),
    ));
    let server = Arc::new(ChunkserverChatter::new(
        engine,
        Arc::clone(cache) as Arc<dyn crate::ConnectionCache>,
        address.clone(),
    ));
    cache.register(address, Arc::clone(&server) as Arc<dyn Chunkserver>);
    (server, storage)
}
