//! Volatile copy: for a memory-only store (no checkpoint files at all),
//! stream every live key/value pair directly instead of file bytes (spec.md
//! §4.9).

use tstore_core::error::{Error, Result};
use tstore_core::types::{Lsn, RecordKind};
use tstore_storage::{ConsolidatedStoreComponent, VersionedItem};

/// Version 2: the volatile (memory-only) copy protocol.
pub const VOLATILE_COPY_PROTOCOL_VERSION: u32 = 2;

/// One key's metadata within a `Data` frame: `{keySize, kind, lsn,
/// valueSize, optionalFlags}`. The serialized key and value bytes
/// themselves live in the frame's companion buffers, at the position
/// implied by iterating records in order.
#[derive(Debug, Clone)]
pub struct KeyMetadataRecord {
    /// The record kind.
    pub kind: RecordKind,
    /// The LSN this version was applied at.
    pub lsn: Lsn,
    /// Length of this key's serialized bytes in the key buffer.
    pub key_size: u32,
    /// Length of this key's value bytes in the value buffer (`0` for
    /// tombstones).
    pub value_size: u32,
}

impl KeyMetadataRecord {
    fn to_bytes(&self) -> [u8; 21] {
        let mut out = [0u8; 21];
        out[0..4].copy_from_slice(&self.key_size.to_le_bytes());
        out[4] = self.kind as u8;
        out[5..13].copy_from_slice(&self.lsn.0.to_le_bytes());
        out[13..17].copy_from_slice(&self.value_size.to_le_bytes());
        out
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 17 {
            return Err(Error::corrupted("volatile copy metadata record", "truncated"));
        }
        let key_size = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let kind = RecordKind::from_u8(bytes[4])
            .ok_or_else(|| Error::corrupted("volatile copy metadata record", "unrecognized kind"))?;
        let lsn = Lsn(u64::from_le_bytes(bytes[5..13].try_into().unwrap()));
        let value_size = u32::from_le_bytes(bytes[13..17].try_into().unwrap());
        Ok(KeyMetadataRecord { kind, lsn, key_size, value_size })
    }
}

const RECORD_LEN: usize = 21;

/// One `Data` frame: a batch of key-metadata records plus their key bytes
/// and value bytes, concatenated.
pub struct DataFrame {
    /// Per-key metadata, in the same order the key/value buffers hold
    /// their bytes.
    pub records: Vec<KeyMetadataRecord>,
    /// Concatenated serialized key bytes, in record order.
    pub key_buffer: Vec<u8>,
    /// Concatenated value bytes, in record order (empty slices for
    /// tombstones).
    pub value_buffer: Vec<u8>,
}

impl DataFrame {
    /// Encode to the wire form: record count, then the metadata records,
    /// then the key buffer length and bytes, then the value buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(self.records.len() as u32).to_le_bytes());
        for r in &self.records {
            out.extend_from_slice(&r.to_bytes());
        }
        out.extend_from_slice(&(self.key_buffer.len() as u64).to_le_bytes());
        out.extend_from_slice(&self.key_buffer);
        out.extend_from_slice(&(self.value_buffer.len() as u64).to_le_bytes());
        out.extend_from_slice(&self.value_buffer);
        out
    }

    /// Decode a frame previously produced by [`Self::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 4 {
            return Err(Error::corrupted("volatile copy data frame", "truncated record count"));
        }
        let count = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
        let mut pos = 4usize;
        let mut records = Vec::with_capacity(count);
        for _ in 0..count {
            if bytes.len() < pos + RECORD_LEN {
                return Err(Error::corrupted("volatile copy data frame", "truncated record"));
            }
            records.push(KeyMetadataRecord::from_bytes(&bytes[pos..pos + RECORD_LEN])?);
            pos += RECORD_LEN;
        }

        if bytes.len() < pos + 8 {
            return Err(Error::corrupted("volatile copy data frame", "truncated key buffer length"));
        }
        let key_len = u64::from_le_bytes(bytes[pos..pos + 8].try_into().unwrap()) as usize;
        pos += 8;
        if bytes.len() < pos + key_len {
            return Err(Error::corrupted("volatile copy data frame", "truncated key buffer"));
        }
        let key_buffer = bytes[pos..pos + key_len].to_vec();
        pos += key_len;

        if bytes.len() < pos + 8 {
            return Err(Error::corrupted("volatile copy data frame", "truncated value buffer length"));
        }
        let value_len = u64::from_le_bytes(bytes[pos..pos + 8].try_into().unwrap()) as usize;
        pos += 8;
        if bytes.len() < pos + value_len {
            return Err(Error::corrupted("volatile copy data frame", "truncated value buffer"));
        }
        let value_buffer = bytes[pos..pos + value_len].to_vec();

        Ok(DataFrame { records, key_buffer, value_buffer })
    }
}

/// Sender side: batches a memory-only consolidated component's entries
/// into `Data` frames of at most `batch_size` keys each, deduplicating by
/// key (a `ConsolidatedStoreComponent` already holds at most one version
/// per key, so this is naturally satisfied).
pub struct VolatileCopyManager {
    batch_size: usize,
}

impl Default for VolatileCopyManager {
    fn default() -> Self {
        VolatileCopyManager { batch_size: 4096 }
    }
}

impl VolatileCopyManager {
    /// Batch at most `batch_size` keys per `Data` frame.
    pub fn new(batch_size: usize) -> Self {
        VolatileCopyManager { batch_size: batch_size.max(1) }
    }

    /// Build the frame sequence for `component`, using `encode_key` to
    /// serialize each key with the store's configured `StateSerializer`.
    pub fn build_frames<K>(
        &self,
        component: &ConsolidatedStoreComponent<K>,
        mut encode_key: impl FnMut(&K) -> Vec<u8>,
    ) -> Vec<u8>
    where
        K: Ord + Clone,
    {
        let mut batches: Vec<DataFrame> = Vec::new();
        let mut current = DataFrame { records: Vec::new(), key_buffer: Vec::new(), value_buffer: Vec::new() };

        component.for_each(|key, item: &VersionedItem| {
            if current.records.len() >= self.batch_size {
                batches.push(std::mem::replace(
                    &mut current,
                    DataFrame { records: Vec::new(), key_buffer: Vec::new(), value_buffer: Vec::new() },
                ));
            }
            let key_bytes = encode_key(key);
            let value_bytes = if item.in_memory() {
                item.lock().value().map(|v| v.to_vec()).unwrap_or_default()
            } else {
                Vec::new()
            };
            current.records.push(KeyMetadataRecord {
                kind: item.kind(),
                lsn: item.lsn(),
                key_size: key_bytes.len() as u32,
                value_size: value_bytes.len() as u32,
            });
            current.key_buffer.extend_from_slice(&key_bytes);
            current.value_buffer.extend_from_slice(&value_bytes);
        });
        if !current.records.is_empty() {
            batches.push(current);
        }

        let mut out = Vec::new();
        out.extend_from_slice(&VOLATILE_COPY_PROTOCOL_VERSION.to_le_bytes());
        out.extend_from_slice(&(batches.len() as u32).to_le_bytes());
        for batch in &batches {
            let bytes = batch.to_bytes();
            out.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
            out.extend_from_slice(&bytes);
        }
        out
    }
}

/// Receiver side: consumes the byte stream produced by
/// [`VolatileCopyManager::build_frames`] and inserts each key directly into
/// a fresh consolidated component.
pub struct VolatileCopyStream;

impl VolatileCopyStream {
    /// Decode `bytes` and insert every entry into `component`, using
    /// `decode_key` to turn serialized key bytes back into `K`.
    pub fn apply<K>(
        bytes: &[u8],
        component: &ConsolidatedStoreComponent<K>,
        mut decode_key: impl FnMut(&[u8]) -> Result<K>,
    ) -> Result<()>
    where
        K: Ord + Clone,
    {
        if bytes.len() < 8 {
            return Err(Error::corrupted("volatile copy stream", "truncated header"));
        }
        let version = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        if version != VOLATILE_COPY_PROTOCOL_VERSION {
            return Err(Error::corrupted(
                "volatile copy stream",
                format!("unsupported volatile copy protocol version {version}"),
            ));
        }
        let batch_count = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        let mut pos = 8usize;
        for _ in 0..batch_count {
            if bytes.len() < pos + 8 {
                return Err(Error::corrupted("volatile copy stream", "truncated frame length"));
            }
            let len = u64::from_le_bytes(bytes[pos..pos + 8].try_into().unwrap()) as usize;
            pos += 8;
            if bytes.len() < pos + len {
                return Err(Error::corrupted("volatile copy stream", "truncated frame body"));
            }
            let frame = DataFrame::from_bytes(&bytes[pos..pos + len])?;
            pos += len;
            apply_frame(&frame, component, &mut decode_key)?;
        }
        Ok(())
    }
}

fn apply_frame<K>(
    frame: &DataFrame,
    component: &ConsolidatedStoreComponent<K>,
    decode_key: &mut impl FnMut(&[u8]) -> Result<K>,
) -> Result<()>
where
    K: Ord + Clone,
{
    let mut key_pos = 0usize;
    let mut value_pos = 0usize;
    for record in &frame.records {
        let key_end = key_pos + record.key_size as usize;
        let key_bytes = &frame.key_buffer[key_pos..key_end];
        key_pos = key_end;

        let value_end = value_pos + record.value_size as usize;
        let value_bytes = &frame.value_buffer[value_pos..value_end];
        value_pos = value_end;

        let key = decode_key(key_bytes)?;
        let item = if record.kind.is_deleted() {
            VersionedItem::new_deleted(record.lsn)
        } else {
            VersionedItem::new_memory(record.kind, record.lsn, std::sync::Arc::from(value_bytes))
        };
        component.insert(key, item);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_small_component() {
        let src: ConsolidatedStoreComponent<String> = ConsolidatedStoreComponent::new();
        src.insert("a".to_string(), VersionedItem::new_memory(RecordKind::Inserted, Lsn(1), std::sync::Arc::from(&b"alpha"[..])));
        src.insert("b".to_string(), VersionedItem::new_memory(RecordKind::Inserted, Lsn(2), std::sync::Arc::from(&b"beta"[..])));

        let bytes = VolatileCopyManager::default().build_frames(&src, |k| k.as_bytes().to_vec());

        let dst: ConsolidatedStoreComponent<String> = ConsolidatedStoreComponent::new();
        VolatileCopyStream::apply(&bytes, &dst, |bytes| Ok(String::from_utf8(bytes.to_vec()).unwrap())).unwrap();

        assert_eq!(dst.len(), 2);
        let a = dst.read(&"a".to_string(), Lsn(10)).unwrap();
        assert_eq!(a.lsn, Lsn(1));
    }

    #[test]
    fn rejects_mismatched_version() {
        let dst: ConsolidatedStoreComponent<String> = ConsolidatedStoreComponent::new();
        let mut bad = VOLATILE_COPY_PROTOCOL_VERSION.wrapping_add(1).to_le_bytes().to_vec();
        bad.extend_from_slice(&0u32.to_le_bytes());
        assert!(VolatileCopyStream::apply(&bad, &dst, |b| Ok(String::from_utf8(b.to_vec()).unwrap())).is_err());
    }
}
