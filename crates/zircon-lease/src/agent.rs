//! The lease agent.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use zircon_kv::{KvStore, NO_VERSION};
use zircon_types::{BlockId, Result, ServerName, ZirconError};

use crate::config::LeaseConfig;

const LEASE_PREFIX: &str = "meta/lease/";
const BLOCK_PREFIX: &str = "meta/block/";

fn lease_key(block: BlockId) -> Vec<u8> {
    // Zero-padded so lexicographic key order matches numeric block order.
    format!("{LEASE_PREFIX}{:020}", block.0).into_bytes()
}

fn block_key(block: BlockId) -> Vec<u8> {
    format!("{BLOCK_PREFIX}{:020}", block.0).into_bytes()
}

fn parse_id(key: &[u8], prefix: &str) -> Option<BlockId> {
    let rest = key.strip_prefix(prefix.as_bytes())?;
    std::str::from_utf8(rest).ok()?.parse().ok().map(BlockId)
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Lease record stored in the KV under the block's lease key.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LeaseRecord {
    holder: ServerName,
    expires_at_ms: i64,
}

impl LeaseRecord {
    fn is_live(&self, now: i64) -> bool {
        self.expires_at_ms > now
    }
}

/// Local bookkeeping for a lease this agent holds.
#[derive(Debug, Clone)]
struct HeldLease {
    /// KV version of the lease key, used for CAS renewal and release.
    lease_version: u64,
    expires_at_ms: i64,
}

/// Block bytes cached under a held lease.
#[derive(Debug, Clone)]
struct CachedBlock {
    data: Vec<u8>,
    version: u64,
}

/// Acquires, renews, and releases block leases, and performs conditional
/// block reads and sub-range writes under them.
///
/// Instantiable: test harnesses construct several agents over one KV in a
/// single process.
pub struct LeaseAgent {
    kv: Arc<dyn KvStore>,
    identity: ServerName,
    config: LeaseConfig,
    leases: Mutex<HashMap<BlockId, HeldLease>>,
    blocks: DashMap<BlockId, CachedBlock>,
    shutdown: Arc<Notify>,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
}

impl LeaseAgent {
    pub fn new(kv: Arc<dyn KvStore>, identity: ServerName, config: LeaseConfig) -> Self {
        Self {
            kv,
            identity,
            config,
            leases: Mutex::new(HashMap::new()),
            blocks: DashMap::new(),
            shutdown: Arc::new(Notify::new()),
            refresh_task: Mutex::new(None),
        }
    }

    pub fn identity(&self) -> &ServerName {
        &self.identity
    }

    /// The underlying consensus KV handle.
    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.kv
    }

    /// Start the background renewal task. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.refresh_task.lock();
        if task.is_some() {
            return;
        }
        let agent = Arc::clone(self);
        let shutdown = Arc::clone(&self.shutdown);
        let interval = self.config.refresh_interval;
        info!(identity = %self.identity, "lease agent starting");
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;

                    _ = shutdown.notified() => break,
                    _ = ticker.tick() => agent.refresh_all().await,
                }
            }
        }));
    }

    /// Stop the renewal task and explicitly release every held lease.
    pub async fn stop(&self) {
        self.shutdown.notify_waiters();
        let task = self.refresh_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        let held: Vec<(BlockId, HeldLease)> = self.leases.lock().drain().collect();
        for (block, lease) in held {
            self.blocks.remove(&block);
            if let Err(e) = self.kv.delete(&lease_key(block), lease.lease_version).await {
                debug!(%block, error = %e, "lease already gone at release");
            }
        }
        info!(identity = %self.identity, "lease agent stopped");
    }

    /// Whether this agent currently holds a live lease on `block`.
    pub fn holds(&self, block: BlockId) -> bool {
        self.leases
            .lock()
            .get(&block)
            .map(|l| l.expires_at_ms > now_ms())
            .unwrap_or(false)
    }

    /// Blocks this agent currently owns, in ascending order. Expired
    /// entries are purged on the way.
    pub fn list_leases(&self) -> Vec<BlockId> {
        let now = now_ms();
        let mut leases = self.leases.lock();
        leases.retain(|block, held| {
            let live = held.expires_at_ms > now;
            if !live {
                self.blocks.remove(block);
            }
            live
        });
        let mut ids: Vec<BlockId> = leases.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Read a block under this agent's lease, acquiring the lease on
    /// demand if nobody holds it. Returns the block bytes and the block
    /// version; a block never written reads as zeros at version 0.
    pub async fn read(&self, block: BlockId) -> Result<(Vec<u8>, u64)> {
        self.ensure_held(block).await?;

        if let Some(cached) = self.blocks.get(&block) {
            return Ok((cached.data.clone(), cached.version));
        }
        let (data, version) = self.read_through(block).await?;
        Ok((data, version))
    }

    /// Conditional sub-range write under this agent's lease.
    ///
    /// Fails `VersionMismatch` if `expected_version` is no longer the
    /// block's version, `NotOwner` if the lease is held elsewhere. On
    /// success the whole modified block is committed with an incremented
    /// block version, which is returned.
    pub async fn write(
        &self,
        block: BlockId,
        expected_version: u64,
        offset: u32,
        bytes: &[u8],
    ) -> Result<u64> {
        self.ensure_held(block).await?;

        let end = offset as usize + bytes.len();
        if end > self.config.block_size {
            return Err(ZirconError::internal(format!(
                "sub-range write past block end ({end} > {})",
                self.config.block_size
            )));
        }

        let cached = self
            .blocks
            .get(&block)
            .map(|c| (c.data.clone(), c.version));
        let (mut data, version) = match cached {
            Some(found) => found,
            None => self.read_through(block).await?,
        };
        if version != expected_version {
            return Err(ZirconError::VersionMismatch {
                expected: expected_version,
                actual: version,
            });
        }

        data[offset as usize..end].copy_from_slice(bytes);
        match self.kv.put(&block_key(block), expected_version, &data).await {
            Ok(new_version) => {
                self.blocks.insert(
                    block,
                    CachedBlock {
                        data,
                        version: new_version,
                    },
                );
                debug!(%block, new_version, offset, len = bytes.len(), "block write");
                Ok(new_version)
            }
            Err(e) => {
                // The cache no longer reflects the store; drop it so the
                // next read re-fetches.
                self.blocks.remove(&block);
                Err(e)
            }
        }
    }

    /// Find some block with no live lease-holder and acquire it.
    ///
    /// `NotFound` means every known block is leased (the caller may
    /// allocate a fresh one); `Unavailable` means the attempt cap was hit
    /// while losing races and the caller should back off.
    pub async fn get_any_unleased(&self) -> Result<BlockId> {
        for _ in 0..self.config.acquire_attempts {
            let candidates = self.unleased_candidates().await?;
            if candidates.is_empty() {
                return Err(ZirconError::NotFound);
            }
            for block in candidates {
                match self.try_acquire(block).await {
                    Ok(()) => return Ok(block),
                    Err(ZirconError::NotOwner { .. }) => continue,
                    Err(e) => return Err(e),
                }
            }
        }
        Err(ZirconError::Unavailable(
            "kept losing acquisition races for unleased blocks".into(),
        ))
    }

    /// Allocate the next unused block id (never 0) and acquire its lease.
    pub async fn acquire_fresh(&self) -> Result<BlockId> {
        for _ in 0..self.config.acquire_attempts {
            let known = self.known_blocks().await?;
            let candidate = BlockId(known.last().map_or(1, |id| id.0 + 1));
            match self.try_acquire(candidate).await {
                Ok(()) => return Ok(candidate),
                // Someone else claimed it first; recompute and go again.
                Err(ZirconError::NotOwner { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(ZirconError::Unavailable(
            "kept losing races for fresh block ids".into(),
        ))
    }

    /// Renew a held lease immediately. `NotOwner` if it was lost.
    pub async fn renew(&self, block: BlockId) -> Result<()> {
        let held = self
            .leases
            .lock()
            .get(&block)
            .cloned();
        match held {
            Some(held) => self.renew_with(block, held).await,
            None => self.try_acquire(block).await,
        }
    }

    /// Release a single lease, dropping its cached block.
    pub async fn release(&self, block: BlockId) -> Result<()> {
        let held = self.leases.lock().remove(&block);
        self.blocks.remove(&block);
        if let Some(held) = held {
            if let Err(e) = self.kv.delete(&lease_key(block), held.lease_version).await {
                debug!(%block, error = %e, "lease already gone at release");
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Make sure this agent holds a live lease on `block`, acquiring on
    /// demand. Fails `NotOwner(holder)` when someone else does.
    async fn ensure_held(&self, block: BlockId) -> Result<()> {
        if self.holds(block) {
            return Ok(());
        }
        self.try_acquire(block).await
    }

    async fn try_acquire(&self, block: BlockId) -> Result<()> {
        let key = lease_key(block);
        for _ in 0..self.config.acquire_attempts {
            let now = now_ms();
            let record = LeaseRecord {
                holder: self.identity.clone(),
                expires_at_ms: now + self.config.lease_ttl.as_millis() as i64,
            };
            let encoded = serde_json::to_vec(&record)
                .map_err(|e| ZirconError::internal(format!("lease record encode: {e}")))?;

            let current = self.kv.get(&key).await?;
            let expected = match &current {
                None => NO_VERSION,
                Some(versioned) => {
                    let existing: LeaseRecord = serde_json::from_slice(&versioned.value)
                        .map_err(|e| ZirconError::internal(format!("lease record decode: {e}")))?;
                    if existing.is_live(now) && existing.holder != self.identity {
                        return Err(ZirconError::NotOwner {
                            owner: Some(existing.holder),
                        });
                    }
                    versioned.version
                }
            };

            match self.kv.put(&key, expected, &encoded).await {
                Ok(lease_version) => {
                    self.leases.lock().insert(
                        block,
                        HeldLease {
                            lease_version,
                            expires_at_ms: record.expires_at_ms,
                        },
                    );
                    debug!(%block, identity = %self.identity, "lease acquired");
                    return Ok(());
                }
                // Lost the CAS race; re-read and retry.
                Err(ZirconError::VersionMismatch { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        // Exhausted: report whoever holds it now, if anyone.
        let owner = match self.kv.get(&key).await? {
            Some(versioned) => serde_json::from_slice::<LeaseRecord>(&versioned.value)
                .ok()
                .filter(|r| r.is_live(now_ms()))
                .map(|r| r.holder),
            None => None,
        };
        Err(ZirconError::NotOwner { owner })
    }

    async fn renew_with(&self, block: BlockId, held: HeldLease) -> Result<()> {
        let record = LeaseRecord {
            holder: self.identity.clone(),
            expires_at_ms: now_ms() + self.config.lease_ttl.as_millis() as i64,
        };
        let encoded = serde_json::to_vec(&record)
            .map_err(|e| ZirconError::internal(format!("lease record encode: {e}")))?;
        match self
            .kv
            .put(&lease_key(block), held.lease_version, &encoded)
            .await
        {
            Ok(lease_version) => {
                self.leases.lock().insert(
                    block,
                    HeldLease {
                        lease_version,
                        expires_at_ms: record.expires_at_ms,
                    },
                );
                Ok(())
            }
            Err(ZirconError::VersionMismatch { .. }) => {
                // The lease moved under us: it expired and someone else
                // claimed it. Drop local state.
                warn!(%block, identity = %self.identity, "lease lost");
                self.leases.lock().remove(&block);
                self.blocks.remove(&block);
                let owner = match self.kv.get(&lease_key(block)).await? {
                    Some(versioned) => serde_json::from_slice::<LeaseRecord>(&versioned.value)
                        .ok()
                        .filter(|r| r.is_live(now_ms()))
                        .map(|r| r.holder),
                    None => None,
                };
                Err(ZirconError::NotOwner { owner })
            }
            Err(e) => Err(e),
        }
    }

    /// Renew every held lease. Runs over a snapshot so the lease table
    /// lock is never held across KV I/O.
    async fn refresh_all(&self) {
        let snapshot: Vec<(BlockId, HeldLease)> = self
            .leases
            .lock()
            .iter()
            .map(|(block, held)| (*block, held.clone()))
            .collect();
        for (block, held) in snapshot {
            if let Err(e) = self.renew_with(block, held).await {
                warn!(%block, error = %e, "lease renewal failed");
            }
        }
    }

    async fn read_through(&self, block: BlockId) -> Result<(Vec<u8>, u64)> {
        match self.kv.get(&block_key(block)).await? {
            Some(versioned) => {
                let mut data = versioned.value;
                // Normalize to the fixed block size; sub-range callers
                // index into the full extent.
                data.resize(self.config.block_size, 0);
                self.blocks.insert(
                    block,
                    CachedBlock {
                        data: data.clone(),
                        version: versioned.version,
                    },
                );
                Ok((data, versioned.version))
            }
            None => Ok((vec![0; self.config.block_size], NO_VERSION)),
        }
    }

    /// Every block id the keyspace knows about, leased or not.
    async fn known_blocks(&self) -> Result<BTreeSet<BlockId>> {
        let mut ids = BTreeSet::new();
        for (key, _) in self.kv.list_prefix(BLOCK_PREFIX.as_bytes()).await? {
            if let Some(id) = parse_id(&key, BLOCK_PREFIX) {
                ids.insert(id);
            }
        }
        for (key, _) in self.kv.list_prefix(LEASE_PREFIX.as_bytes()).await? {
            if let Some(id) = parse_id(&key, LEASE_PREFIX) {
                ids.insert(id);
            }
        }
        Ok(ids)
    }

    /// Known blocks with no live lease, ascending.
    async fn unleased_candidates(&self) -> Result<Vec<BlockId>> {
        let now = now_ms();
        let known = self.known_blocks().await?;
        let mut leased = BTreeSet::new();
        for (key, versioned) in self.kv.list_prefix(LEASE_PREFIX.as_bytes()).await? {
            if let Some(id) = parse_id(&key, LEASE_PREFIX) {
                if let Ok(record) = serde_json::from_slice::<LeaseRecord>(&versioned.value) {
                    if record.is_live(now) {
                        leased.insert(id);
                    }
                }
            }
        }
        Ok(known.into_iter().filter(|id| !leased.contains(id)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use zircon_kv::MemKv;

    fn fast_config() -> LeaseConfig {
        LeaseConfig {
            lease_ttl: Duration::from_millis(100),
            refresh_interval: Duration::from_millis(25),
            acquire_attempts: 4,
            block_size: 64,
        }
    }

    fn agent(kv: &MemKv, name: &str) -> Arc<LeaseAgent> {
        Arc::new(LeaseAgent::new(
            Arc::new(kv.clone()),
            ServerName::from(name),
            fast_config(),
        ))
    }

    #[tokio::test]
    async fn test_read_unwritten_block_is_zeroed() {
        let kv = MemKv::new();
        let a = agent(&kv, "frontend-a");

        let (data, version) = a.read(BlockId(1)).await.unwrap();
        assert_eq!(data, vec![0u8; 64]);
        assert_eq!(version, 0);
        assert!(a.holds(BlockId(1)));
    }

    #[tokio::test]
    async fn test_write_then_read_roundtrip() {
        let kv = MemKv::new();
        let a = agent(&kv, "frontend-a");

        let v1 = a.write(BlockId(1), 0, 4, b"abcd").await.unwrap();
        assert_eq!(v1, 1);

        let (data, version) = a.read(BlockId(1)).await.unwrap();
        assert_eq!(&data[4..8], b"abcd");
        assert_eq!(&data[..4], &[0, 0, 0, 0]);
        assert_eq!(version, v1);

        // Every committed write bumps the block version.
        let v2 = a.write(BlockId(1), v1, 0, b"zz").await.unwrap();
        assert_eq!(v2, v1 + 1);
    }

    #[tokio::test]
    async fn test_write_with_stale_version_fails() {
        let kv = MemKv::new();
        let a = agent(&kv, "frontend-a");

        let v1 = a.write(BlockId(1), 0, 0, b"x").await.unwrap();
        let err = a.write(BlockId(1), v1 + 7, 0, b"y").await.unwrap_err();
        assert!(err.is_version_mismatch());
    }

    #[tokio::test]
    async fn test_write_past_block_end_is_internal_error() {
        let kv = MemKv::new();
        let a = agent(&kv, "frontend-a");
        let err = a.write(BlockId(1), 0, 62, b"abcd").await.unwrap_err();
        assert!(matches!(err, ZirconError::Internal(_)));
    }

    #[tokio::test]
    async fn test_second_agent_is_redirected() {
        let kv = MemKv::new();
        let a = agent(&kv, "frontend-a");
        let b = agent(&kv, "frontend-b");

        a.read(BlockId(1)).await.unwrap();

        let err = b.read(BlockId(1)).await.unwrap_err();
        match err {
            ZirconError::NotOwner { owner } => {
                assert_eq!(owner.unwrap().as_str(), "frontend-a");
            }
            other => panic!("expected NotOwner, got {other:?}"),
        }

        let err = b.write(BlockId(1), 0, 0, b"x").await.unwrap_err();
        assert!(err.is_not_owner());
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_stolen() {
        let kv = MemKv::new();
        let a = agent(&kv, "frontend-a");
        let b = agent(&kv, "frontend-b");

        a.read(BlockId(1)).await.unwrap();
        // No refresh task running for a; let the lease lapse.
        tokio::time::sleep(Duration::from_millis(150)).await;

        b.read(BlockId(1)).await.unwrap();
        assert!(b.holds(BlockId(1)));

        // a's next write discovers the loss and redirects to b.
        let err = a.write(BlockId(1), 0, 0, b"x").await.unwrap_err();
        match err {
            ZirconError::NotOwner { owner } => {
                assert_eq!(owner.unwrap().as_str(), "frontend-b")
            }
            other => panic!("expected NotOwner, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_refresh_task_keeps_lease_alive() {
        let kv = MemKv::new();
        let a = agent(&kv, "frontend-a");
        a.start();

        a.read(BlockId(1)).await.unwrap();
        // Far past the ttl; the refresher must have renewed several times.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(a.holds(BlockId(1)));

        let b = agent(&kv, "frontend-b");
        assert!(b.read(BlockId(1)).await.unwrap_err().is_not_owner());

        // Stop releases explicitly; the block becomes claimable at once.
        a.stop().await;
        b.read(BlockId(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_list_leases_sorted() {
        let kv = MemKv::new();
        let a = agent(&kv, "frontend-a");

        a.read(BlockId(3)).await.unwrap();
        a.read(BlockId(1)).await.unwrap();
        assert_eq!(a.list_leases(), vec![BlockId(1), BlockId(3)]);
    }

    #[tokio::test]
    async fn test_get_any_unleased() {
        let kv = MemKv::new();
        let a = agent(&kv, "frontend-a");
        let b = agent(&kv, "frontend-b");

        // a materializes two blocks, then walks away from both.
        a.write(BlockId(1), 0, 0, b"x").await.unwrap();
        a.write(BlockId(2), 0, 0, b"y").await.unwrap();
        a.release(BlockId(1)).await.unwrap();
        a.release(BlockId(2)).await.unwrap();

        // Lowest unleased block wins.
        assert_eq!(b.get_any_unleased().await.unwrap(), BlockId(1));
        assert_eq!(b.get_any_unleased().await.unwrap(), BlockId(2));

        // Everything is leased now.
        let err = a.get_any_unleased().await.unwrap_err();
        assert!(matches!(err, ZirconError::NotFound));
    }

    #[tokio::test]
    async fn test_acquire_fresh_never_returns_zero() {
        let kv = MemKv::new();
        let a = agent(&kv, "frontend-a");

        let first = a.acquire_fresh().await.unwrap();
        assert_eq!(first, BlockId(1));
        let second = a.acquire_fresh().await.unwrap();
        assert_eq!(second, BlockId(2));
    }

    #[tokio::test]
    async fn test_release_forgets_cache_and_lease() {
        let kv = MemKv::new();
        let a = agent(&kv, "frontend-a");
        let b = agent(&kv, "frontend-b");

        a.write(BlockId(1), 0, 0, b"x").await.unwrap();
        a.release(BlockId(1)).await.unwrap();
        assert!(!a.holds(BlockId(1)));

        // b can take over and sees a's committed write.
        let (data, version) = b.read(BlockId(1)).await.unwrap();
        assert_eq!(data[0], b'x');
        assert_eq!(version, 1);
    }
}
