//! The storage driver seam beneath the replica engine.
//!
//! The real deployment backs this with a disk engine; [`MemoryStorage`]
//! holds chunk bytes in a concurrent map and is used by tests and
//! single-process setups. Content is keyed `(chunk, version)`; which old
//! versions to retain is the driver's concern, and the in-memory driver
//! keeps them all.

use std::collections::BTreeMap;

use dashmap::DashMap;

use zircon_types::{ChunkNum, Result, Version, ZirconError};

/// Versioned chunk content store.
pub trait StorageDriver: Send + Sync {
    /// Create a chunk with its first committed version. Fails with
    /// `AlreadyExists` if the chunk is present at any version.
    fn add(&self, chunk: ChunkNum, version: Version, data: &[u8]) -> Result<()>;

    /// Full committed bytes of `chunk` at exactly `version`.
    fn read(&self, chunk: ChunkNum, version: Version) -> Result<Vec<u8>>;

    /// Install another committed version of an existing or new chunk.
    /// Durable before return.
    fn commit(&self, chunk: ChunkNum, version: Version, data: &[u8]) -> Result<()>;

    /// Drop all versions of a chunk.
    fn delete(&self, chunk: ChunkNum) -> Result<()>;
}

/// In-memory storage driver backed by a concurrent hash map.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    chunks: DashMap<ChunkNum, BTreeMap<Version, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of chunks currently stored.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Rough count of bytes held, across all retained versions.
    pub fn bytes_used(&self) -> usize {
        self.chunks
            .iter()
            .map(|entry| entry.value().values().map(Vec::len).sum::<usize>())
            .sum()
    }
}

impl StorageDriver for MemoryStorage {
    fn add(&self, chunk: ChunkNum, version: Version, data: &[u8]) -> Result<()> {
        match self.chunks.entry(chunk) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(ZirconError::AlreadyExists),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let mut versions = BTreeMap::new();
                versions.insert(version, data.to_vec());
                slot.insert(versions);
                Ok(())
            }
        }
    }

    fn read(&self, chunk: ChunkNum, version: Version) -> Result<Vec<u8>> {
        let entry = self.chunks.get(&chunk).ok_or(ZirconError::NotFound)?;
        entry
            .value()
            .get(&version)
            .cloned()
            .ok_or(ZirconError::NotFound)
    }

    fn commit(&self, chunk: ChunkNum, version: Version, data: &[u8]) -> Result<()> {
        self.chunks
            .entry(chunk)
            .or_default()
            .insert(version, data.to_vec());
        Ok(())
    }

    fn delete(&self, chunk: ChunkNum) -> Result<()> {
        self.chunks
            .remove(&chunk)
            .map(|_| ())
            .ok_or(ZirconError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_read() {
        let storage = MemoryStorage::new();
        storage.add(ChunkNum(1), Version(1), b"hello").unwrap();
        assert_eq!(storage.read(ChunkNum(1), Version(1)).unwrap(), b"hello");
    }

    #[test]
    fn test_add_twice_fails() {
        let storage = MemoryStorage::new();
        storage.add(ChunkNum(1), Version(1), b"a").unwrap();
        let err = storage.add(ChunkNum(1), Version(2), b"b").unwrap_err();
        assert!(matches!(err, ZirconError::AlreadyExists));
    }

    #[test]
    fn test_read_missing_version() {
        let storage = MemoryStorage::new();
        storage.add(ChunkNum(1), Version(1), b"a").unwrap();
        assert!(storage.read(ChunkNum(1), Version(2)).is_err());
        assert!(storage.read(ChunkNum(2), Version(1)).is_err());
    }

    #[test]
    fn test_commit_retains_old_versions() {
        let storage = MemoryStorage::new();
        storage.add(ChunkNum(1), Version(1), b"hello").unwrap();
        storage.commit(ChunkNum(1), Version(2), b"hAllo").unwrap();

        assert_eq!(storage.read(ChunkNum(1), Version(1)).unwrap(), b"hello");
        assert_eq!(storage.read(ChunkNum(1), Version(2)).unwrap(), b"hAllo");
    }

    #[test]
    fn test_delete() {
        let storage = MemoryStorage::new();
        storage.add(ChunkNum(1), Version(1), b"a").unwrap();
        storage.delete(ChunkNum(1)).unwrap();
        assert!(storage.read(ChunkNum(1), Version(1)).is_err());
        assert!(storage.delete(ChunkNum(1)).is_err());
    }

    #[test]
    fn test_bytes_used() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.bytes_used(), 0);
        storage.add(ChunkNum(1), Version(1), b"12345").unwrap();
        storage.commit(ChunkNum(1), Version(2), b"123456").unwrap();
        assert_eq!(storage.bytes_used(), 11);
    }
}
