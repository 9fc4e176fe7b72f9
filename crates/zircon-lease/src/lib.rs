//! Lease-coordinated ownership of metadata blocks.
//!
//! A [`LeaseAgent`] arbitrates block ownership through the external
//! consensus KV: each block has a lease record `(holder, expiry)` written
//! with compare-and-swap, a background task renews held leases before they
//! expire, and block contents are cached under the lease. The agent never
//! proxies for another holder: operations on a foreign block fail with
//! `NotOwner` carrying the holder's name as a redirect hint.

pub mod agent;
pub mod config;
pub mod sync;

pub use agent::LeaseAgent;
pub use config::LeaseConfig;
pub use sync::SyncCoordinator;
