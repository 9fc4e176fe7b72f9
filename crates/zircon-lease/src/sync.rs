//! The sync capability: lease coordination state exposed to external
//! frontends.

use async_trait::async_trait;

use zircon_kv::NO_VERSION;
use zircon_types::{BlockId, Result, ZirconError};

use crate::agent::LeaseAgent;

const FS_ROOT_KEY: &[u8] = b"meta/fsroot";

/// Lease coordination surface consumed by frontends over RPC.
#[async_trait]
pub trait SyncCoordinator: Send + Sync {
    /// Take (or join) the lease on a block.
    async fn start_sync(&self, block: BlockId) -> Result<()>;

    /// Renew the lease on a block immediately, confirming write ownership.
    async fn upgrade_sync(&self, block: BlockId) -> Result<()>;

    /// Give the lease on a block back.
    async fn release_sync(&self, block: BlockId) -> Result<()>;

    /// Whether this agent currently holds a live lease on the block.
    async fn confirm_sync(&self, block: BlockId) -> Result<bool>;

    /// The root metadata block of the namespace, created on first ask.
    async fn get_fs_root(&self) -> Result<BlockId>;
}

#[async_trait]
impl SyncCoordinator for LeaseAgent {
    async fn start_sync(&self, block: BlockId) -> Result<()> {
        let (_, _) = self.read(block).await?;
        Ok(())
    }

    async fn upgrade_sync(&self, block: BlockId) -> Result<()> {
        self.renew(block).await
    }

    async fn release_sync(&self, block: BlockId) -> Result<()> {
        self.release(block).await
    }

    async fn confirm_sync(&self, block: BlockId) -> Result<bool> {
        Ok(self.holds(block))
    }

    async fn get_fs_root(&self) -> Result<BlockId> {
        if let Some(versioned) = self.kv().get(FS_ROOT_KEY).await? {
            let root: u64 = serde_json::from_slice(&versioned.value)
                .map_err(|e| ZirconError::internal(format!("fs root decode: {e}")))?;
            return Ok(BlockId(root));
        }
        // First ask anywhere: the root is block 1 (block 0 is reserved).
        let root = BlockId(1);
        let encoded = serde_json::to_vec(&root.0)
            .map_err(|e| ZirconError::internal(format!("fs root encode: {e}")))?;
        match self.kv().put(FS_ROOT_KEY, NO_VERSION, &encoded).await {
            Ok(_) => Ok(root),
            // Raced another frontend; theirs won, read it back.
            Err(ZirconError::VersionMismatch { .. }) => {
                let versioned = self
                    .kv()
                    .get(FS_ROOT_KEY)
                    .await?
                    .ok_or_else(|| ZirconError::internal("fs root vanished after race"))?;
                let root: u64 = serde_json::from_slice(&versioned.value)
                    .map_err(|e| ZirconError::internal(format!("fs root decode: {e}")))?;
                Ok(BlockId(root))
            }
            Err(e) => Err(e),
        }
    }
}
