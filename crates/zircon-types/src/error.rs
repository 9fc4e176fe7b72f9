use thiserror::Error;

use crate::ids::{ServerName, Version};

/// The standard result type used throughout zircon.
pub type Result<T, E = ZirconError> = std::result::Result<T, E>;

/// Errors shared by every zircon subsystem.
///
/// Variants carry their payloads so that callers can react structurally:
/// the metadata cache retries on [`ZirconError::VersionMismatch`], clients
/// re-dispatch on the owner inside [`ZirconError::NotOwner`], and readers
/// learn the replica's actual version from [`ZirconError::StaleReplica`].
#[derive(Debug, Clone, Error)]
pub enum ZirconError {
    /// The chunk or entry does not exist.
    #[error("not found")]
    NotFound,

    /// Creation of something that already exists.
    #[error("already exists")]
    AlreadyExists,

    /// An `(old_version, new_version)` or `previous`-entry check failed.
    /// Non-retryable without re-reading current state.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// An optimistic block-version CAS lost the race.
    #[error("version mismatch: expected {expected}, actual {actual}")]
    VersionMismatch { expected: u64, actual: u64 },

    /// The lease for the target block is not held here. `owner` is the
    /// redirect hint when a live holder was observed.
    #[error("not the lease owner (owner: {})", display_owner(.owner))]
    NotOwner { owner: Option<ServerName> },

    /// The replica's committed version is behind the requested minimum.
    #[error("stale replica at version {version}")]
    StaleReplica { version: Version },

    /// An RPC deadline expired.
    #[error("timeout")]
    Timeout,

    /// A network-layer failure. May be retried by the caller with backoff;
    /// never retried transparently, to keep mutations at-most-once.
    #[error("transport error: {0}")]
    Transport(String),

    /// An error string reported by a remote peer.
    #[error("remote error: {0}")]
    Remote(String),

    /// A retry-capped path (allocation, lease acquisition) ran out of
    /// attempts; the caller should back off.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Invariant violation. The only class that may crash the process.
    #[error("internal error: {0}")]
    Internal(String),
}

fn display_owner(owner: &Option<ServerName>) -> &str {
    match owner {
        Some(name) => name.as_str(),
        None => "unknown",
    }
}

impl ZirconError {
    pub fn is_version_mismatch(&self) -> bool {
        matches!(self, ZirconError::VersionMismatch { .. })
    }

    pub fn is_not_owner(&self) -> bool {
        matches!(self, ZirconError::NotOwner { .. })
    }

    /// The redirect hint, when this error carries one.
    pub fn redirect(&self) -> Option<&ServerName> {
        match self {
            ZirconError::NotOwner { owner } => owner.as_ref(),
            _ => None,
        }
    }

    pub fn precondition(msg: impl Into<String>) -> Self {
        ZirconError::PreconditionFailed(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        ZirconError::Internal(msg.into())
    }
}
