//! The replica engine: a single node's versioned chunk store.
//!
//! Committed bytes live in the storage driver keyed by version; the engine
//! owns the per-chunk control state (current committed version, highest
//! version known committed anywhere, the single prepared buffer) behind a
//! per-chunk mutex, so StartWrite and CommitWrite for the same chunk
//! serialize and concurrent committers for the same version slot cannot
//! both win.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use zircon_types::{ChunkNum, CommitHash, Result, Version, ZirconError};

use crate::storage::StorageDriver;

/// Replica engine tunables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Ceiling on a chunk's byte size; writes past it are rejected.
    pub max_chunk_size: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: 4 * 1024 * 1024,
        }
    }
}

/// A staged write awaiting commit or discard.
#[derive(Debug, Clone)]
struct PreparedWrite {
    offset: u32,
    data: Vec<u8>,
}

#[derive(Debug)]
struct ChunkState {
    /// Version of the bytes this replica has committed.
    committed: Version,
    /// Highest version known committed somewhere in the replica set. May
    /// exceed `committed`, which marks this replica for catch-up.
    latest: Version,
    prepared: Option<PreparedWrite>,
}

/// Single-node versioned chunk store over a [`StorageDriver`].
pub struct ReplicaEngine {
    storage: Arc<dyn StorageDriver>,
    chunks: DashMap<ChunkNum, Arc<Mutex<ChunkState>>>,
    config: EngineConfig,
}

impl ReplicaEngine {
    pub fn new(storage: Arc<dyn StorageDriver>, config: EngineConfig) -> Self {
        Self {
            storage,
            chunks: DashMap::new(),
            config,
        }
    }

    fn state_of(&self, chunk: ChunkNum) -> Result<Arc<Mutex<ChunkState>>> {
        self.chunks
            .get(&chunk)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(ZirconError::NotFound)
    }

    /// Create a chunk with committed content `initial_data` at `version`.
    pub fn add(&self, chunk: ChunkNum, initial_data: &[u8], version: Version) -> Result<()> {
        if initial_data.len() > self.config.max_chunk_size as usize {
            return Err(ZirconError::precondition(format!(
                "initial data exceeds max chunk size ({} > {})",
                initial_data.len(),
                self.config.max_chunk_size
            )));
        }
        match self.chunks.entry(chunk) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(ZirconError::AlreadyExists),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                self.storage.add(chunk, version, initial_data)?;
                slot.insert(Arc::new(Mutex::new(ChunkState {
                    committed: version,
                    latest: version,
                    prepared: None,
                })));
                debug!(%chunk, %version, len = initial_data.len(), "add");
                Ok(())
            }
        }
    }

    /// Read from the highest committed version that is at least
    /// `min_version`. Returns the bytes and the version they came from.
    pub fn read(
        &self,
        chunk: ChunkNum,
        offset: u32,
        length: u32,
        min_version: Version,
    ) -> Result<(Vec<u8>, Version)> {
        let state = self.state_of(chunk)?;
        let state = state.lock();
        if state.committed < min_version {
            return Err(ZirconError::StaleReplica {
                version: state.committed,
            });
        }
        let data = self.storage.read(chunk, state.committed)?;
        let start = offset as usize;
        if start >= data.len() {
            // Offset past the end reads as empty.
            return Ok((Vec::new(), state.committed));
        }
        let end = std::cmp::min(start + length as usize, data.len());
        Ok((data[start..end].to_vec(), state.committed))
    }

    /// Stage `(offset, data)` as the single prepared buffer, replacing any
    /// previous uncommitted one. No durability promise before commit.
    pub fn start_write(&self, chunk: ChunkNum, offset: u32, data: &[u8]) -> Result<()> {
        let end = offset as usize + data.len();
        if end > self.config.max_chunk_size as usize {
            return Err(ZirconError::precondition(format!(
                "write to chunk {} would exceed max size ({} > {})",
                chunk, end, self.config.max_chunk_size
            )));
        }
        let state = self.state_of(chunk)?;
        let mut state = state.lock();
        state.prepared = Some(PreparedWrite {
            offset,
            data: data.to_vec(),
        });
        debug!(%chunk, offset, len = data.len(), "start_write");
        Ok(())
    }

    /// Verify and apply the staged write, producing `new_version`.
    ///
    /// All three checks (buffer present, fingerprint matches, committed
    /// version equals `old_version`) fail as `PreconditionFailed`; a
    /// failed commit leaves both the committed state and the prepared
    /// buffer untouched, so the replica can be caught up via Replicate.
    pub fn commit_write(
        &self,
        chunk: ChunkNum,
        hash: &CommitHash,
        old_version: Version,
        new_version: Version,
    ) -> Result<()> {
        let state = self.state_of(chunk)?;
        let mut state = state.lock();

        let prepared = state
            .prepared
            .as_ref()
            .ok_or_else(|| ZirconError::precondition("no prepared write to commit"))?;
        if &CommitHash::of(&prepared.data) != hash {
            return Err(ZirconError::precondition(
                "prepared data does not match commit hash",
            ));
        }
        if state.committed != old_version {
            return Err(ZirconError::precondition(format!(
                "committed version is {}, not {}",
                state.committed, old_version
            )));
        }

        let mut content = self.storage.read(chunk, state.committed)?;
        let start = prepared.offset as usize;
        let end = start + prepared.data.len();
        if end > content.len() {
            content.resize(end, 0);
        }
        content[start..end].copy_from_slice(&prepared.data);

        self.storage.commit(chunk, new_version, &content)?;
        state.committed = new_version;
        if state.latest < new_version {
            state.latest = new_version;
        }
        state.prepared = None;
        debug!(%chunk, %old_version, %new_version, "commit_write");
        Ok(())
    }

    /// Advance the highest-known-anywhere version, iff it currently equals
    /// `old_version`. Does not move committed data.
    pub fn update_latest_version(
        &self,
        chunk: ChunkNum,
        old_version: Version,
        new_version: Version,
    ) -> Result<()> {
        let state = self.state_of(chunk)?;
        let mut state = state.lock();
        if state.latest != old_version {
            return Err(ZirconError::precondition(format!(
                "latest version is {}, not {}",
                state.latest, old_version
            )));
        }
        state.latest = new_version;
        Ok(())
    }

    /// Install fully committed bytes at `version`, as pulled from another
    /// replica. Installing a version at or below the current committed one
    /// is a no-op, which makes Replicate idempotent.
    pub fn install_committed(&self, chunk: ChunkNum, version: Version, data: &[u8]) -> Result<()> {
        let state = match self.chunks.entry(chunk) {
            dashmap::mapref::entry::Entry::Occupied(slot) => Arc::clone(slot.get()),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                self.storage.commit(chunk, version, data)?;
                slot.insert(Arc::new(Mutex::new(ChunkState {
                    committed: version,
                    latest: version,
                    prepared: None,
                })));
                debug!(%chunk, %version, "install_committed (new chunk)");
                return Ok(());
            }
        };
        let mut state = state.lock();
        if version <= state.committed {
            return Ok(());
        }
        self.storage.commit(chunk, version, data)?;
        state.committed = version;
        if state.latest < version {
            state.latest = version;
        }
        debug!(%chunk, %version, "install_committed");
        Ok(())
    }

    /// Whether this replica already has `version` (or newer) committed.
    pub fn has_version(&self, chunk: ChunkNum, version: Version) -> bool {
        match self.state_of(chunk) {
            Ok(state) => state.lock().committed >= version,
            Err(_) => false,
        }
    }

    /// Remove chunk content, only if the committed version equals `version`.
    pub fn delete(&self, chunk: ChunkNum, version: Version) -> Result<()> {
        let state = self.state_of(chunk)?;
        let mut state = state.lock();
        if state.committed != version {
            return Err(ZirconError::precondition(format!(
                "committed version is {}, not {}",
                state.committed, version
            )));
        }
        self.storage.delete(chunk)?;
        // Invalidate the state under its own lock before unmapping it, so
        // a racing op that cloned the Arc sees the chunk gone.
        state.committed = Version::NONE;
        state.prepared = None;
        drop(state);
        self.chunks.remove(&chunk);
        debug!(%chunk, %version, "delete");
        Ok(())
    }

    /// Chunks whose highest-known-anywhere version exceeds what this
    /// replica has committed, i.e. the candidates a background reconciler
    /// feeds to Replicate. Returns `(chunk, committed, latest)`.
    pub fn lagging_chunks(&self) -> Vec<(ChunkNum, Version, Version)> {
        self.chunks
            .iter()
            .filter_map(|entry| {
                let state = entry.value().lock();
                (state.latest > state.committed)
                    .then_some((*entry.key(), state.committed, state.latest))
            })
            .collect()
    }

    /// Snapshot of `(chunk, committed version)` pairs.
    pub fn list_all_chunks(&self) -> Vec<(ChunkNum, Version)> {
        self.chunks
            .iter()
            .filter_map(|entry| {
                let committed = entry.value().lock().committed;
                (committed != Version::NONE).then_some((*entry.key(), committed))
            })
            .collect()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn engine() -> ReplicaEngine {
        ReplicaEngine::new(Arc::new(MemoryStorage::new()), EngineConfig::default())
    }

    #[test]
    fn test_add_then_read() {
        let eng = engine();
        eng.add(ChunkNum(7), b"hello", Version(1)).unwrap();

        let (data, version) = eng.read(ChunkNum(7), 0, 5, Version(1)).unwrap();
        assert_eq!(data, b"hello");
        assert_eq!(version, Version(1));
    }

    #[test]
    fn test_add_existing_fails() {
        let eng = engine();
        eng.add(ChunkNum(7), b"hello", Version(1)).unwrap();
        assert!(matches!(
            eng.add(ChunkNum(7), b"again", Version(1)),
            Err(ZirconError::AlreadyExists)
        ));
    }

    #[test]
    fn test_read_missing_chunk() {
        let eng = engine();
        assert!(matches!(
            eng.read(ChunkNum(1), 0, 4, Version(1)),
            Err(ZirconError::NotFound)
        ));
    }

    #[test]
    fn test_stale_read_reports_current_version() {
        let eng = engine();
        eng.add(ChunkNum(7), b"hello", Version(1)).unwrap();

        match eng.read(ChunkNum(7), 0, 5, Version(2)) {
            Err(ZirconError::StaleReplica { version }) => assert_eq!(version, Version(1)),
            other => panic!("expected StaleReplica, got {other:?}"),
        }
    }

    #[test]
    fn test_two_phase_write() {
        let eng = engine();
        eng.add(ChunkNum(7), b"hello", Version(1)).unwrap();

        eng.start_write(ChunkNum(7), 1, b"A").unwrap();
        eng.commit_write(ChunkNum(7), &CommitHash::of(b"A"), Version(1), Version(2))
            .unwrap();

        let (data, version) = eng.read(ChunkNum(7), 0, 5, Version(2)).unwrap();
        assert_eq!(data, b"hAllo");
        assert_eq!(version, Version(2));
    }

    #[test]
    fn test_commit_without_prepare_fails() {
        let eng = engine();
        eng.add(ChunkNum(7), b"hello", Version(1)).unwrap();

        let err = eng
            .commit_write(ChunkNum(7), &CommitHash::of(b"A"), Version(1), Version(2))
            .unwrap_err();
        assert!(matches!(err, ZirconError::PreconditionFailed(_)));
    }

    #[test]
    fn test_commit_with_wrong_hash_fails_and_preserves_state() {
        let eng = engine();
        eng.add(ChunkNum(7), b"hello", Version(1)).unwrap();
        eng.start_write(ChunkNum(7), 1, b"A").unwrap();

        let err = eng
            .commit_write(ChunkNum(7), &CommitHash::of(b"B"), Version(1), Version(2))
            .unwrap_err();
        assert!(matches!(err, ZirconError::PreconditionFailed(_)));

        // Content is as if the commit never happened.
        let (data, version) = eng.read(ChunkNum(7), 0, 5, Version(1)).unwrap();
        assert_eq!(data, b"hello");
        assert_eq!(version, Version(1));

        // The prepared buffer lingers and can still be committed correctly.
        eng.commit_write(ChunkNum(7), &CommitHash::of(b"A"), Version(1), Version(2))
            .unwrap();
        let (data, _) = eng.read(ChunkNum(7), 0, 5, Version(2)).unwrap();
        assert_eq!(data, b"hAllo");
    }

    #[test]
    fn test_losing_writer_gets_precondition_failed() {
        let eng = engine();
        eng.add(ChunkNum(7), b"hello", Version(1)).unwrap();
        eng.start_write(ChunkNum(7), 1, b"A").unwrap();

        let hash = CommitHash::of(b"A");
        let first = eng.commit_write(ChunkNum(7), &hash, Version(1), Version(2));
        let second = eng.commit_write(ChunkNum(7), &hash, Version(1), Version(2));

        assert!(first.is_ok());
        assert!(matches!(second, Err(ZirconError::PreconditionFailed(_))));
    }

    #[test]
    fn test_concurrent_committers_single_winner() {
        let eng = Arc::new(engine());
        eng.add(ChunkNum(7), b"hello", Version(1)).unwrap();
        eng.start_write(ChunkNum(7), 1, b"A").unwrap();

        let hash = CommitHash::of(b"A");
        let mut handles = Vec::new();
        for _ in 0..4 {
            let eng = Arc::clone(&eng);
            let hash = hash.clone();
            handles.push(std::thread::spawn(move || {
                eng.commit_write(ChunkNum(7), &hash, Version(1), Version(2))
                    .is_ok()
            }));
        }
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);

        let (data, version) = eng.read(ChunkNum(7), 0, 5, Version(2)).unwrap();
        assert_eq!(data, b"hAllo");
        assert_eq!(version, Version(2));
    }

    #[test]
    fn test_start_write_overwrites_previous_prepared() {
        let eng = engine();
        eng.add(ChunkNum(7), b"hello", Version(1)).unwrap();

        eng.start_write(ChunkNum(7), 0, b"X").unwrap();
        eng.start_write(ChunkNum(7), 4, b"Y").unwrap();

        // Only the second staged write is committable.
        assert!(eng
            .commit_write(ChunkNum(7), &CommitHash::of(b"X"), Version(1), Version(2))
            .is_err());
        eng.commit_write(ChunkNum(7), &CommitHash::of(b"Y"), Version(1), Version(2))
            .unwrap();
        let (data, _) = eng.read(ChunkNum(7), 0, 5, Version(2)).unwrap();
        assert_eq!(data, b"hellY");
    }

    #[test]
    fn test_write_extends_chunk() {
        let eng = engine();
        eng.add(ChunkNum(1), b"ab", Version(1)).unwrap();
        eng.start_write(ChunkNum(1), 4, b"cd").unwrap();
        eng.commit_write(ChunkNum(1), &CommitHash::of(b"cd"), Version(1), Version(2))
            .unwrap();

        let (data, _) = eng.read(ChunkNum(1), 0, 6, Version(2)).unwrap();
        assert_eq!(data, b"ab\0\0cd");
    }

    #[test]
    fn test_write_past_max_size_rejected() {
        let eng = ReplicaEngine::new(
            Arc::new(MemoryStorage::new()),
            EngineConfig { max_chunk_size: 8 },
        );
        eng.add(ChunkNum(1), b"ab", Version(1)).unwrap();
        assert!(eng.start_write(ChunkNum(1), 6, b"xyz").is_err());
        assert!(eng.add(ChunkNum(2), &[0u8; 16], Version(1)).is_err());
    }

    #[test]
    fn test_update_latest_version_cas() {
        let eng = engine();
        eng.add(ChunkNum(7), b"hello", Version(1)).unwrap();

        eng.update_latest_version(ChunkNum(7), Version(1), Version(3))
            .unwrap();
        // Stale old version loses.
        assert!(eng
            .update_latest_version(ChunkNum(7), Version(1), Version(4))
            .is_err());
    }

    #[test]
    fn test_lagging_chunks_after_latest_bump() {
        let eng = engine();
        eng.add(ChunkNum(7), b"hello", Version(1)).unwrap();
        eng.add(ChunkNum(8), b"world", Version(1)).unwrap();
        assert!(eng.lagging_chunks().is_empty());

        eng.update_latest_version(ChunkNum(7), Version(1), Version(2))
            .unwrap();
        assert_eq!(
            eng.lagging_chunks(),
            vec![(ChunkNum(7), Version(1), Version(2))]
        );

        // Catching up clears the lag.
        eng.install_committed(ChunkNum(7), Version(2), b"hAllo").unwrap();
        assert!(eng.lagging_chunks().is_empty());
    }

    #[test]
    fn test_install_committed_is_idempotent() {
        let eng = engine();
        eng.install_committed(ChunkNum(9), Version(2), b"data").unwrap();
        eng.install_committed(ChunkNum(9), Version(2), b"data").unwrap();
        eng.install_committed(ChunkNum(9), Version(1), b"older").unwrap();

        let (data, version) = eng.read(ChunkNum(9), 0, 4, Version(2)).unwrap();
        assert_eq!(data, b"data");
        assert_eq!(version, Version(2));
        assert!(eng.has_version(ChunkNum(9), Version(2)));
        assert!(!eng.has_version(ChunkNum(9), Version(3)));
    }

    #[test]
    fn test_delete_requires_matching_version() {
        let eng = engine();
        eng.add(ChunkNum(7), b"hello", Version(1)).unwrap();

        assert!(eng.delete(ChunkNum(7), Version(2)).is_err());
        eng.delete(ChunkNum(7), Version(1)).unwrap();
        assert!(matches!(
            eng.read(ChunkNum(7), 0, 5, Version(1)),
            Err(ZirconError::NotFound)
        ));
    }

    #[test]
    fn test_list_all_chunks() {
        let eng = engine();
        eng.add(ChunkNum(1), b"a", Version(1)).unwrap();
        eng.add(ChunkNum(2), b"b", Version(5)).unwrap();

        let mut chunks = eng.list_all_chunks();
        chunks.sort();
        assert_eq!(chunks, vec![(ChunkNum(1), Version(1)), (ChunkNum(2), Version(5))]);
    }

    #[test]
    fn test_version_monotonicity_over_commits() {
        let eng = engine();
        eng.add(ChunkNum(3), b"....", Version(1)).unwrap();

        let mut seen = vec![Version(1)];
        for v in 2..6u64 {
            let byte = [b'a' + v as u8];
            eng.start_write(ChunkNum(3), 0, &byte).unwrap();
            eng.commit_write(ChunkNum(3), &CommitHash::of(&byte), Version(v - 1), Version(v))
                .unwrap();
            let (_, version) = eng.read(ChunkNum(3), 0, 4, Version(v)).unwrap();
            seen.push(version);
        }
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }
}
