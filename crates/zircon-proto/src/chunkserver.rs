//! Chunkserver service wire types.
//!
//! One request/response pair per operation. Mutating responses are an
//! [`Empty`] carrying only the error string; `Read` responds with data,
//! the observed version, and the error string, so stale-replica callers
//! can diagnose even on failure.

use serde::{Deserialize, Serialize};

/// Numeric id of the chunkserver service in the request envelope.
pub const SERVICE_ID: u16 = 1;
pub const SERVICE_NAME: &str = "Chunkserver";

/// Method ids of the chunkserver service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MethodId {
    StartWriteReplicated = 1,
    Replicate = 2,
    Read = 3,
    StartWrite = 4,
    CommitWrite = 5,
    UpdateLatestVersion = 6,
    Add = 7,
    Delete = 8,
    ListAllChunks = 9,
}

impl MethodId {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            1 => Some(MethodId::StartWriteReplicated),
            2 => Some(MethodId::Replicate),
            3 => Some(MethodId::Read),
            4 => Some(MethodId::StartWrite),
            5 => Some(MethodId::CommitWrite),
            6 => Some(MethodId::UpdateLatestVersion),
            7 => Some(MethodId::Add),
            8 => Some(MethodId::Delete),
            9 => Some(MethodId::ListAllChunks),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

/// Response for operations that return nothing but an outcome.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Empty {
    pub error: String,
}

impl Empty {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StartWriteReplicatedReq {
    pub chunk: u64,
    pub offset: u32,
    pub data: Vec<u8>,
    pub addresses: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReplicateReq {
    pub chunk: u64,
    pub server_address: String,
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReadReq {
    pub chunk: u64,
    pub offset: u32,
    pub length: u32,
    /// Minimum acceptable committed version.
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReadRsp {
    pub data: Vec<u8>,
    /// The version observed at the replica, meaningful even when `error`
    /// is non-empty.
    pub version: u64,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StartWriteReq {
    pub chunk: u64,
    pub offset: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CommitWriteReq {
    pub chunk: u64,
    pub hash: String,
    pub old_version: u64,
    pub new_version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UpdateLatestVersionReq {
    pub chunk: u64,
    pub old_version: u64,
    pub new_version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AddReq {
    pub chunk: u64,
    pub initial_data: Vec<u8>,
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeleteReq {
    pub chunk: u64,
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChunkVersion {
    pub chunk: u64,
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ListAllChunksRsp {
    pub chunks: Vec<ChunkVersion>,
    pub error: String,
}
