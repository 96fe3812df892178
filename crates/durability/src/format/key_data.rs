//! On-disk layout of one key entry in a `.sfk` checkpoint file (spec.md §3,
//! §4.4):
//!
//! ```text
//! keySize: u32 | kind: u8 | pad[3] | lsn: i64
//! if kind == Deleted:
//!     logicalTimeStamp: i64
//! else:
//!     valueOffset: u64 | valueChecksum: u64 | valueSize: u32 | pad[4]
//! serializedKey: [u8; keySize]
//! pad to the next 8-byte boundary
//! ```

use tstore_core::error::{Error, Result};
use tstore_core::types::{Lsn, RecordKind};

/// One decoded key entry, with its serialized key bytes still in hand (the
/// caller deserializes with whatever `StateSerializer` the store was opened
/// with).
#[derive(Debug, Clone)]
pub struct KeyEntry {
    /// The record kind.
    pub kind: RecordKind,
    /// The LSN this version was applied at.
    pub lsn: Lsn,
    /// Present only for non-`Deleted` entries.
    pub value_offset: u64,
    /// Present only for non-`Deleted` entries.
    pub value_checksum: u64,
    /// Present only for non-`Deleted` entries.
    pub value_size: u32,
    /// Present only for `Deleted` entries: when the tombstone was written,
    /// used by merge to decide whether it can be dropped (spec.md §4.8).
    pub logical_timestamp: i64,
    /// The serialized key bytes.
    pub key_bytes: Vec<u8>,
}

impl KeyEntry {
    /// Encode this entry, 8-byte aligned, ready to hand to
    /// [`super::chunk::BlockAlignedWriter::write_item`].
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(40 + self.key_bytes.len() + 8);
        out.extend_from_slice(&(self.key_bytes.len() as u32).to_le_bytes());
        out.push(self.kind as u8);
        out.extend_from_slice(&[0u8; 3]);
        out.extend_from_slice(&self.lsn.0.to_le_bytes());
        if self.kind.is_deleted() {
            out.extend_from_slice(&self.logical_timestamp.to_le_bytes());
        } else {
            out.extend_from_slice(&self.value_offset.to_le_bytes());
            out.extend_from_slice(&self.value_checksum.to_le_bytes());
            out.extend_from_slice(&self.value_size.to_le_bytes());
            out.extend_from_slice(&[0u8; 4]);
        }
        out.extend_from_slice(&self.key_bytes);
        while out.len() % 8 != 0 {
            out.push(0);
        }
        out
    }

    /// Decode an entry previously written by [`Self::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 16 {
            return Err(Error::corrupted("key entry", "truncated fixed header"));
        }
        let key_size = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
        let kind = RecordKind::from_u8(bytes[4])
            .ok_or_else(|| Error::corrupted("key entry", "unrecognized record kind tag"))?;
        let lsn = Lsn(u64::from_le_bytes(bytes[8..16].try_into().unwrap()));

        let (variant_len, value_offset, value_checksum, value_size, logical_timestamp) =
            if kind.is_deleted() {
                if bytes.len() < 24 {
                    return Err(Error::corrupted("key entry", "truncated deleted-variant header"));
                }
                let ts = i64::from_le_bytes(bytes[16..24].try_into().unwrap());
                (8, 0, 0, 0, ts)
            } else {
                if bytes.len() < 40 {
                    return Err(Error::corrupted("key entry", "truncated live-variant header"));
                }
                let offset = u64::from_le_bytes(bytes[16..24].try_into().unwrap());
                let checksum = u64::from_le_bytes(bytes[24..32].try_into().unwrap());
                let size = u32::from_le_bytes(bytes[32..36].try_into().unwrap());
                (24, offset, checksum, size, 0)
            };

        let key_start = 16 + variant_len;
        let key_end = key_start + key_size;
        if bytes.len() < key_end {
            return Err(Error::corrupted("key entry", "truncated key bytes"));
        }

        Ok(KeyEntry {
            kind,
            lsn,
            value_offset,
            value_checksum,
            value_size,
            logical_timestamp,
            key_bytes: bytes[key_start..key_end].to_vec(),
        })
    }

    /// The fixed (pre-key) header length this entry will encode to.
    pub fn header_len(&self) -> usize {
        if self.kind.is_deleted() {
            24
        } else {
            40
        }
    }
}
