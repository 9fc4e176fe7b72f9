use thiserror::Error;

use zircon_types::ZirconError;

/// Why a frame was rejected before decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameDefect {
    /// The low checksum byte is not the zircon magic; this is not one of
    /// our frames.
    #[error("missing magic byte (saw {0:#04x})")]
    Magic(u8),

    /// CRC32C over the payload disagrees with the header.
    #[error("crc {got:#010x} does not match computed {want:#010x}")]
    Crc { want: u32, got: u32 },

    /// Declared or actual payload size is over the frame limit.
    #[error("{0} bytes exceeds the frame limit")]
    Oversize(usize),

    /// The frame ended before its declared extent.
    #[error("ended after {0} bytes")]
    Short(usize),
}

/// Errors of the RPC transport layer.
///
/// Domain failures never appear here; services carry those inside their
/// response bodies. This enum covers the exchange itself: dialing,
/// framing, dispatch, deadlines, and shutdown.
#[derive(Debug, Error)]
pub enum RpcError {
    /// The peer hung up, or the stream ended mid-exchange.
    #[error("peer disconnected")]
    Disconnected,

    /// The per-call deadline lapsed before a response arrived.
    #[error("deadline expired before a response arrived")]
    DeadlineExceeded,

    /// The address could not be parsed, resolved, or dialed.
    #[error("cannot reach {0}")]
    Unreachable(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A frame failed validation and was discarded.
    #[error("bad frame: {0}")]
    BadFrame(#[from] FrameDefect),

    /// No handler registered under the requested service id.
    #[error("no service with id {0}")]
    NoSuchService(u16),

    /// A dispatch-level failure reported by the peer.
    #[error("peer reported: {0}")]
    Remote(String),

    /// The server is draining and takes no new requests.
    #[error("draining, not accepting requests")]
    Draining,

    /// The serve loop itself panicked; converted to a value at teardown.
    #[error("serve loop panicked")]
    Panicked,
}

impl From<RpcError> for ZirconError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::DeadlineExceeded => ZirconError::Timeout,
            other => ZirconError::Transport(other.to_string()),
        }
    }
}
