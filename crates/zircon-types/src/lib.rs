pub mod entry;
pub mod error;
pub mod ids;
pub mod layout;

// Re-export commonly used items at the crate root.
pub use entry::MetadataEntry;
pub use error::{Result, ZirconError};
pub use ids::{BlockId, ChunkNum, CommitHash, ServerAddress, ServerName, Version};
