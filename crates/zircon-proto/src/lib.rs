//! On-wire request/response types for the zircon RPC services.
//!
//! Bodies are serde-encoded; the encoding itself is not load-bearing and
//! the adapters treat it as opaque. Every response type carries an `error`
//! string field: empty means success, non-empty is the peer's diagnostic.

pub mod chunkserver;
pub mod sync;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use zircon_types::{Result, ZirconError};

/// Encode a message body for the wire.
pub fn encode<T: Serialize>(msg: &T) -> Bytes {
    // Wire types are plain data; serialization cannot fail on them.
    Bytes::from(serde_json::to_vec(msg).expect("wire type serialization"))
}

/// Decode a message body from the wire.
pub fn decode<T: DeserializeOwned>(buf: &[u8]) -> Result<T> {
    serde_json::from_slice(buf)
        .map_err(|e| ZirconError::Transport(format!("malformed message body: {e}")))
}
