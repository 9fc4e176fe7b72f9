//! In-memory KV store backed by a `BTreeMap`.
//!
//! A fully functional [`KvStore`] for tests and single-process
//! deployments. All data lives behind a `parking_lot::RwLock`; the handle
//! is cheaply cloneable and clones share the same map, so several agents
//! in one process can arbitrate leases against a common store.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use zircon_types::{Result, ZirconError};

use crate::{KvStore, Versioned, NO_VERSION};

/// In-memory conditional-write store.
#[derive(Clone, Default)]
pub struct MemKv {
    data: Arc<RwLock<BTreeMap<Vec<u8>, Versioned>>>,
}

impl MemKv {
    /// Create a new, empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Whether the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

#[async_trait]
impl KvStore for MemKv {
    async fn get(&self, key: &[u8]) -> Result<Option<Versioned>> {
        Ok(self.data.read().get(key).cloned())
    }

    async fn put(&self, key: &[u8], expected: u64, value: &[u8]) -> Result<u64> {
        let mut data = self.data.write();
        let actual = data.get(key).map_or(NO_VERSION, |v| v.version);
        if actual != expected {
            return Err(ZirconError::VersionMismatch { expected, actual });
        }
        let new_version = actual + 1;
        data.insert(
            key.to_vec(),
            Versioned {
                value: value.to_vec(),
                version: new_version,
            },
        );
        Ok(new_version)
    }

    async fn delete(&self, key: &[u8], expected: u64) -> Result<()> {
        let mut data = self.data.write();
        let actual = data.get(key).map_or(NO_VERSION, |v| v.version);
        if actual != expected {
            return Err(ZirconError::VersionMismatch { expected, actual });
        }
        data.remove(key);
        Ok(())
    }

    async fn list_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Versioned)>> {
        let data = self.data.read();
        Ok(data
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_and_get() {
        let kv = MemKv::new();
        assert!(kv.is_empty());

        let v = kv.put(b"k", NO_VERSION, b"hello").await.unwrap();
        assert_eq!(v, 1);

        let got = kv.get(b"k").await.unwrap().unwrap();
        assert_eq!(got.value, b"hello");
        assert_eq!(got.version, 1);
        assert_eq!(kv.get(b"missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_put_bumps_version() {
        let kv = MemKv::new();
        let v1 = kv.put(b"k", NO_VERSION, b"a").await.unwrap();
        let v2 = kv.put(b"k", v1, b"b").await.unwrap();
        assert_eq!(v2, v1 + 1);

        let got = kv.get(b"k").await.unwrap().unwrap();
        assert_eq!(got.value, b"b");
        assert_eq!(got.version, v2);
    }

    #[tokio::test]
    async fn test_put_stale_expectation_fails() {
        let kv = MemKv::new();
        kv.put(b"k", NO_VERSION, b"a").await.unwrap();

        let err = kv.put(b"k", NO_VERSION, b"b").await.unwrap_err();
        match err {
            ZirconError::VersionMismatch { expected, actual } => {
                assert_eq!(expected, 0);
                assert_eq!(actual, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
        // The losing write must not have applied.
        assert_eq!(kv.get(b"k").await.unwrap().unwrap().value, b"a");
    }

    #[tokio::test]
    async fn test_create_race_single_winner() {
        let kv = MemKv::new();
        let a = kv.put(b"k", NO_VERSION, b"a").await;
        let b = kv.put(b"k", NO_VERSION, b"b").await;
        assert!(a.is_ok());
        assert!(b.is_err());
    }

    #[tokio::test]
    async fn test_delete_requires_version() {
        let kv = MemKv::new();
        let v = kv.put(b"k", NO_VERSION, b"a").await.unwrap();

        assert!(kv.delete(b"k", v + 5).await.is_err());
        kv.delete(b"k", v).await.unwrap();
        assert_eq!(kv.get(b"k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_list_prefix() {
        let kv = MemKv::new();
        kv.put(b"lease/1", NO_VERSION, b"a").await.unwrap();
        kv.put(b"lease/2", NO_VERSION, b"b").await.unwrap();
        kv.put(b"block/1", NO_VERSION, b"c").await.unwrap();

        let leases = kv.list_prefix(b"lease/").await.unwrap();
        assert_eq!(leases.len(), 2);
        assert_eq!(leases[0].0, b"lease/1");
        assert_eq!(leases[1].0, b"lease/2");

        assert!(kv.list_prefix(b"none/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clones_share_data() {
        let kv = MemKv::new();
        let other = kv.clone();
        kv.put(b"k", NO_VERSION, b"v").await.unwrap();
        assert!(other.get(b"k").await.unwrap().is_some());
    }
}
