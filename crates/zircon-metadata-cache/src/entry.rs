//! Fixed-width entry slot codec.
//!
//! An entry serializes to exactly [`ENTRY_SIZE`] bytes: a little-endian
//! binary record (`version: u64`, `replica count: u16`, then each address
//! as `len: u16` + UTF-8 bytes) zero-padded to the slot width.
//! Deserialization reads the record prefix and ignores the padding, so any
//! slot whose prefix is a valid record decodes; the all-zero slot of a
//! freshly allocated entry decodes to the default entry.

use zircon_types::layout::ENTRY_SIZE;
use zircon_types::{MetadataEntry, Result, ServerAddress, Version, ZirconError};

/// Serialize an entry to exactly [`ENTRY_SIZE`] bytes.
///
/// A record that does not fit the slot (an oversized replica set) is a
/// caller bug and fails `Internal`.
pub fn serialize_entry(entry: &MetadataEntry) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(ENTRY_SIZE);
    buf.extend_from_slice(&entry.version.0.to_le_bytes());

    let count = u16::try_from(entry.replicas.len())
        .map_err(|_| ZirconError::internal("replica set too large to encode"))?;
    buf.extend_from_slice(&count.to_le_bytes());
    for replica in &entry.replicas {
        let bytes = replica.as_str().as_bytes();
        let len = u16::try_from(bytes.len())
            .map_err(|_| ZirconError::internal("replica address too long to encode"))?;
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(bytes);
    }

    if buf.len() > ENTRY_SIZE {
        return Err(ZirconError::internal(format!(
            "entry encodes to {} bytes, slot is {}",
            buf.len(),
            ENTRY_SIZE
        )));
    }
    buf.resize(ENTRY_SIZE, 0);
    Ok(buf)
}

/// Decode the record prefix of a slot.
pub fn deserialize_entry(slot: &[u8]) -> Result<MetadataEntry> {
    let mut cursor = Cursor { slot, pos: 0 };
    let version = Version(cursor.read_u64()?);
    let count = cursor.read_u16()?;

    let mut replicas = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let len = cursor.read_u16()? as usize;
        let bytes = cursor.read_bytes(len)?;
        let addr = std::str::from_utf8(bytes)
            .map_err(|_| ZirconError::internal("entry slot holds non-UTF-8 address"))?;
        replicas.push(ServerAddress::from(addr));
    }

    Ok(MetadataEntry { replicas, version })
}

struct Cursor<'a> {
    slot: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.slot.len() - self.pos < n {
            return Err(ZirconError::internal(format!(
                "truncated entry slot: need {} bytes at offset {}",
                n, self.pos
            )));
        }
        let bytes = &self.slot[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    fn read_u16(&mut self) -> Result<u16> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn read_u64(&mut self) -> Result<u64> {
        let bytes = self.read_bytes(8)?;
        Ok(u64::from_le_bytes(bytes.try_into().expect("length checked")))
    }
}
