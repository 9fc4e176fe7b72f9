//! Wire frames.
//!
//! Every message travels as `[checksum: u32 LE][size: u32 LE][payload]`.
//! The checksum is CRC32C over the payload with the zircon magic byte
//! spliced into the low byte, so a frame from a foreign protocol is
//! rejected before anything is decoded.

use crate::error::{FrameDefect, RpcError};

/// Size of the frame header in bytes.
pub const FRAME_HEADER_SIZE: usize = 8;

/// Magic byte identifying a zircon frame (low byte of the checksum).
pub const FRAME_MAGIC: u8 = 0x5A;

/// Maximum allowed payload size (64 MiB; chunks are capped well below).
pub const FRAME_MAX_SIZE: usize = 64 * 1024 * 1024;

/// Header prepended to every frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub checksum: u32,
    pub size: u32,
}

impl FrameHeader {
    /// Build the header for a payload.
    pub fn for_payload(payload: &[u8]) -> Self {
        Self {
            checksum: frame_checksum(payload),
            size: payload.len() as u32,
        }
    }

    pub fn from_bytes(data: &[u8; FRAME_HEADER_SIZE]) -> Self {
        Self {
            checksum: u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
            size: u32::from_le_bytes([data[4], data[5], data[6], data[7]]),
        }
    }

    pub fn to_bytes(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.checksum.to_le_bytes());
        buf[4..8].copy_from_slice(&self.size.to_le_bytes());
        buf
    }

    /// Reject frames without the magic byte, oversized frames, and
    /// payloads whose checksum does not match.
    pub fn validate(&self, payload: &[u8]) -> Result<(), RpcError> {
        if self.checksum & 0xFF != FRAME_MAGIC as u32 {
            return Err(FrameDefect::Magic((self.checksum & 0xFF) as u8).into());
        }
        let size = self.size as usize;
        if size > FRAME_MAX_SIZE {
            return Err(FrameDefect::Oversize(size).into());
        }
        let want = frame_checksum(payload);
        if self.checksum != want {
            return Err(FrameDefect::Crc {
                want,
                got: self.checksum,
            }
            .into());
        }
        Ok(())
    }
}

/// CRC32C of `payload` with the magic byte in the low byte.
pub fn frame_checksum(payload: &[u8]) -> u32 {
    (crc32c::crc32c(payload) & !0xFF) | FRAME_MAGIC as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = FrameHeader {
            checksum: 0xAABB_CC5A,
            size: 1024,
        };
        assert_eq!(FrameHeader::from_bytes(&header.to_bytes()), header);
    }

    #[test]
    fn test_checksum_carries_magic() {
        assert_eq!(frame_checksum(b"payload") & 0xFF, FRAME_MAGIC as u32);
    }

    #[test]
    fn test_validate_ok() {
        let payload = b"some payload";
        let header = FrameHeader::for_payload(payload);
        assert!(header.validate(payload).is_ok());
    }

    #[test]
    fn test_validate_rejects_foreign_magic() {
        let header = FrameHeader {
            checksum: 0x1234_5678,
            size: 4,
        };
        assert!(matches!(
            header.validate(b"1234"),
            Err(RpcError::BadFrame(FrameDefect::Magic(0x78)))
        ));
    }

    #[test]
    fn test_validate_rejects_corruption() {
        let payload = b"some payload";
        let mut header = FrameHeader::for_payload(payload);
        header.checksum ^= 0xFF00_0000;
        assert!(matches!(
            header.validate(payload),
            Err(RpcError::BadFrame(FrameDefect::Crc { .. }))
        ));
    }

    #[test]
    fn test_validate_rejects_oversize() {
        let header = FrameHeader {
            checksum: FRAME_MAGIC as u32,
            size: (FRAME_MAX_SIZE + 1) as u32,
        };
        assert!(matches!(
            header.validate(&[]),
            Err(RpcError::BadFrame(FrameDefect::Oversize(_)))
        ));
    }
}
