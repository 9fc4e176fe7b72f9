//! The metadata cache: per-chunk metadata entries packed into leased
//! blocks.
//!
//! Each metadata block holds an allocation bitset followed by fixed-width
//! entry slots; the cache locates a chunk's slot by decomposing its chunk
//! number, reads and writes the block through the lease agent, and drives
//! every mutation through an optimistic block-version CAS loop. Operations
//! on a block owned by another frontend fail with `NotOwner` carrying the
//! owner as a redirect.

pub mod bitset;
pub mod cache;
pub mod entry;

pub use cache::{CacheConfig, MetadataCache};
pub use entry::{deserialize_entry, serialize_entry};
