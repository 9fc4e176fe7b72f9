//! The consensus-KV seam used for lease arbitration and metadata blocks.
//!
//! [`KvStore`] is the narrow surface zircon consumes from the external
//! strongly-consistent store: versioned reads, put-if-version (CAS),
//! delete-if-version, and prefix listing. Every key carries a version
//! token that starts at 1 on creation and increments on every successful
//! write; an expected version of [`NO_VERSION`] means "create, the key
//! must not exist yet".

mod memkv;

pub use memkv::MemKv;

use async_trait::async_trait;
use zircon_types::Result;

/// Version token meaning "the key does not exist".
pub const NO_VERSION: u64 = 0;

/// A value together with its version token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub value: Vec<u8>,
    /// Always > 0 for an existing key.
    pub version: u64,
}

/// Conditional-write key-value store with per-key version tokens.
///
/// Implementations must apply each operation atomically with respect to
/// concurrent callers; the CAS contract is what makes lease arbitration
/// and block-version optimistic concurrency sound.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read a key with its current version token.
    async fn get(&self, key: &[u8]) -> Result<Option<Versioned>>;

    /// Write `value` iff the key's current version equals `expected`
    /// ([`NO_VERSION`] to create). Returns the new version token; a stale
    /// expectation fails with `VersionMismatch { expected, actual }`.
    async fn put(&self, key: &[u8], expected: u64, value: &[u8]) -> Result<u64>;

    /// Delete a key iff its current version equals `expected`.
    async fn delete(&self, key: &[u8], expected: u64) -> Result<()>;

    /// All keys starting with `prefix`, in lexicographic order.
    async fn list_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Versioned)>>;
}
