use std::time::Duration;

use zircon_types::layout::BLOCK_SIZE;

/// Configuration for a lease agent.
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    /// How long a lease lives without renewal.
    pub lease_ttl: Duration,

    /// Interval of the background renewal task. Must be comfortably below
    /// `lease_ttl` or leases will be lost between refreshes.
    pub refresh_interval: Duration,

    /// Attempt cap for acquisition loops (CAS races, unleased-block
    /// scans). Exhaustion surfaces an `Unavailable` error rather than
    /// spinning.
    pub acquire_attempts: u32,

    /// Size of a metadata block in the KV layer. A block that has never
    /// been written reads as this many zero bytes at version 0.
    pub block_size: usize,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(10),
            refresh_interval: Duration::from_secs(3),
            acquire_attempts: 8,
            block_size: BLOCK_SIZE,
        }
    }
}
