use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Defines an opaque 64-bit identifier.
///
/// Zircon ids are plain wrappers: construct with the tuple syntax, unwrap
/// with `get`. No deref or conversion sugar; code that wants the raw
/// value says so explicitly.
macro_rules! u64_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Clone,
            Copy,
            PartialEq,
            Eq,
            Hash,
            PartialOrd,
            Ord,
            Default,
            Serialize,
            Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            /// The raw 64-bit value.
            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }
    };
}

u64_id!(
    /// Opaque chunk identifier, decomposable into (block id, entry index).
    ChunkNum
);

u64_id!(
    /// Monotonic per-chunk version. 0 means "no committed content".
    Version
);

u64_id!(
    /// Metadata block identifier. Block 0 is reserved and never holds
    /// real chunks.
    BlockId
);

impl Version {
    /// The sentinel meaning "no committed content".
    pub const NONE: Version = Version(0);

    /// The next version in the per-chunk sequence.
    pub fn next(self) -> Version {
        Version(self.0 + 1)
    }
}

/// Network address of a chunkserver or frontend, in `host:port` form.
///
/// Replicas know each other only by address, resolved at call time, so this
/// stays a plain string rather than a parsed socket address.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerAddress(pub String);

/// Logical name of a frontend server, used in redirects.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerName(pub String);

macro_rules! string_newtype_impls {
    ($name:ident) => {
        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:?})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

string_newtype_impls!(ServerAddress);
string_newtype_impls!(ServerName);

/// Fingerprint binding a prepared write to its expected data.
///
/// Lowercase hex SHA-256 of the staged bytes; a commit whose hash does not
/// match the prepared buffer must fail.
#[derive(Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommitHash(pub String);

impl CommitHash {
    /// Compute the fingerprint of `data`.
    pub fn of(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        let mut hex = String::with_capacity(digest.len() * 2);
        for byte in digest.iter() {
            hex.push_str(&format!("{:02x}", byte));
        }
        CommitHash(hex)
    }
}

string_newtype_impls!(CommitHash);
