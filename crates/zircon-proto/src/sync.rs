//! Sync (lease coordination) service wire types.

use serde::{Deserialize, Serialize};

pub use crate::chunkserver::Empty;

/// Numeric id of the sync service in the request envelope.
pub const SERVICE_ID: u16 = 2;
pub const SERVICE_NAME: &str = "Sync";

/// Method ids of the sync service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MethodId {
    StartSync = 1,
    UpgradeSync = 2,
    ReleaseSync = 3,
    ConfirmSync = 4,
    GetFsRoot = 5,
}

impl MethodId {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            1 => Some(MethodId::StartSync),
            2 => Some(MethodId::UpgradeSync),
            3 => Some(MethodId::ReleaseSync),
            4 => Some(MethodId::ConfirmSync),
            5 => Some(MethodId::GetFsRoot),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BlockReq {
    pub block: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConfirmSyncRsp {
    pub held: bool,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GetFsRootRsp {
    pub block: u64,
    pub error: String,
}
