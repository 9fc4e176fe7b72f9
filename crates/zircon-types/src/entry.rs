use serde::{Deserialize, Serialize};

use crate::ids::{ServerAddress, Version};

/// Per-chunk metadata record: the ordered replica set and the most recently
/// known committed version.
///
/// An entry is stored in a fixed-width slot of its metadata block; the
/// slot codec lives with the metadata cache. The default entry (no
/// replicas, version 0) is what a freshly allocated, not-yet-written slot
/// decodes to.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MetadataEntry {
    /// Chunkservers holding this chunk, primary first.
    pub replicas: Vec<ServerAddress>,
    /// Most recently known committed version.
    pub version: Version,
}

impl MetadataEntry {
    pub fn new(replicas: Vec<ServerAddress>, version: Version) -> Self {
        Self { replicas, version }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_empty() {
        let entry = MetadataEntry::default();
        assert!(entry.replicas.is_empty());
        assert_eq!(entry.version, Version(0));
    }

    #[test]
    fn test_equality() {
        let a = MetadataEntry::new(vec![ServerAddress::from("cs-1:7000")], Version(3));
        let b = MetadataEntry::new(vec![ServerAddress::from("cs-1:7000")], Version(3));
        let c = MetadataEntry::new(vec![ServerAddress::from("cs-2:7000")], Version(3));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
