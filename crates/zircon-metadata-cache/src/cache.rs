//! The metadata cache proper.

use std::sync::Arc;

use tracing::debug;

use zircon_lease::LeaseAgent;
use zircon_types::layout::{
    block_and_offset, compose_chunk, entry_index, BITSET_SIZE, ENTRY_SIZE,
};
use zircon_types::{BlockId, ChunkNum, MetadataEntry, Result, ZirconError};

use crate::bitset;
use crate::entry::{deserialize_entry, serialize_entry};

/// Metadata cache tunables.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Cap on allocation restarts after clobbered bitset writes.
    pub allocate_attempts: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            allocate_attempts: 16,
        }
    }
}

/// Reads and updates per-chunk metadata entries packed into leased blocks.
///
/// Instantiable: a process may run several caches over distinct agents.
pub struct MetadataCache {
    agent: Arc<LeaseAgent>,
    config: CacheConfig,
}

impl MetadataCache {
    pub fn new(agent: Arc<LeaseAgent>, config: CacheConfig) -> Self {
        Self { agent, config }
    }

    pub fn agent(&self) -> &Arc<LeaseAgent> {
        &self.agent
    }

    /// Read the metadata entry of a chunk.
    ///
    /// `NotOwner` carries the owner of the chunk's block when another
    /// frontend holds it; `NotFound` means the entry is not allocated.
    pub async fn read_entry(&self, chunk: ChunkNum) -> Result<MetadataEntry> {
        let (block, offset) = block_and_offset(chunk);
        let (data, _) = self.agent.read(block).await?;

        if !bitset::get_bit(&data[..BITSET_SIZE], entry_index(chunk)) {
            return Err(ZirconError::NotFound);
        }
        deserialize_entry(&data[offset..offset + ENTRY_SIZE])
    }

    /// Replace the entry of a chunk, expecting the stored entry to equal
    /// `previous`.
    ///
    /// Runs an optimistic CAS loop on the block version. Every retry
    /// re-reads the block and re-checks `previous`: an entry that drifted
    /// in the meantime fails `PreconditionFailed` instead of looping.
    pub async fn update_entry(
        &self,
        chunk: ChunkNum,
        previous: &MetadataEntry,
        next: &MetadataEntry,
    ) -> Result<()> {
        let (block, offset) = block_and_offset(chunk);
        let index = entry_index(chunk);

        loop {
            let (data, version) = self.agent.read(block).await?;
            self.check_slot(&data, index, offset, previous)?;

            let encoded = serialize_entry(next)?;
            debug_assert_eq!(encoded.len(), ENTRY_SIZE);

            match self.agent.write(block, version, offset as u32, &encoded).await {
                Ok(_) => return Ok(()),
                Err(ZirconError::VersionMismatch { .. }) if version != 0 => {
                    // Lost the block-version race; re-read and re-check.
                    debug!(%chunk, %block, "update_entry retrying after version mismatch");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Unallocate the entry of a chunk, expecting the stored entry to
    /// equal `previous`. Clears the allocation bit with a one-byte write;
    /// the slot content is left behind and overwritten by the next
    /// allocation of the same index.
    pub async fn delete_entry(&self, chunk: ChunkNum, previous: &MetadataEntry) -> Result<()> {
        let (block, offset) = block_and_offset(chunk);
        let index = entry_index(chunk);

        loop {
            let (data, version) = self.agent.read(block).await?;
            self.check_slot(&data, index, offset, previous)?;

            let (cell_offset, cell) = bitset::clear_bit(&data[..BITSET_SIZE], index);
            match self.agent.write(block, version, cell_offset, &[cell]).await {
                Ok(_) => return Ok(()),
                Err(ZirconError::VersionMismatch { .. }) if version != 0 => {
                    debug!(%chunk, %block, "delete_entry retrying after version mismatch");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Allocate a new metadata entry and return its chunk number.
    ///
    /// Finds the lowest free index in a block this agent leases (taking an
    /// unleased or fresh block when none has room), then CAS-sets the
    /// allocation bit. A bit that was already set (or a lost CAS) means
    /// another allocator clobbered the slot, and the search restarts.
    pub async fn new_entry(&self) -> Result<ChunkNum> {
        for _ in 0..self.config.allocate_attempts {
            let (block, index) = self.find_any_free().await?;
            if self.try_set_bit(block, index).await? {
                let chunk = compose_chunk(block, index);
                debug!(%chunk, %block, index, "allocated entry");
                return Ok(chunk);
            }
            // Clobbered; someone else took the slot. Go around again.
        }
        Err(ZirconError::Unavailable(
            "allocation kept getting clobbered".into(),
        ))
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Common precondition for entry mutations: the bit must be set and
    /// the stored entry must equal `previous`.
    fn check_slot(
        &self,
        data: &[u8],
        index: usize,
        offset: usize,
        previous: &MetadataEntry,
    ) -> Result<()> {
        if !bitset::get_bit(&data[..BITSET_SIZE], index) {
            return Err(ZirconError::NotFound);
        }
        let current = deserialize_entry(&data[offset..offset + ENTRY_SIZE])?;
        if current != *previous {
            return Err(ZirconError::precondition(
                "entry does not match expected previous entry",
            ));
        }
        Ok(())
    }

    async fn try_set_bit(&self, block: BlockId, index: usize) -> Result<bool> {
        let (data, version) = self.agent.read(block).await?;
        if bitset::get_bit(&data[..BITSET_SIZE], index) {
            return Ok(false);
        }
        let (cell_offset, cell) = bitset::set_bit(&data[..BITSET_SIZE], index);
        match self.agent.write(block, version, cell_offset, &[cell]).await {
            Ok(_) => Ok(true),
            // A concurrent block write beat us; treat it as a clobber.
            Err(ZirconError::VersionMismatch { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn find_free_in(&self, block: BlockId) -> Result<Option<usize>> {
        let (data, _) = self.agent.read(block).await?;
        Ok(bitset::find_free_index(&data[..BITSET_SIZE]))
    }

    /// A candidate `(block, free index)`: leased blocks first, then
    /// unleased ones, then a freshly allocated block id.
    async fn find_any_free(&self) -> Result<(BlockId, usize)> {
        for block in self.agent.list_leases() {
            if let Some(index) = self.find_free_in(block).await? {
                return Ok((block, index));
            }
        }

        for _ in 0..self.config.allocate_attempts {
            let block = match self.agent.get_any_unleased().await {
                Ok(block) => block,
                Err(ZirconError::NotFound) => self.agent.acquire_fresh().await?,
                Err(e) => return Err(e),
            };
            if let Some(index) = self.find_free_in(block).await? {
                return Ok((block, index));
            }
            // This block is full; look for another.
        }
        Err(ZirconError::Unavailable(
            "every reachable metadata block is full".into(),
        ))
    }
}
