//! `CheckpointFile`: the `.sfk`/`.sfv` pair that holds one on-disk
//! generation of consolidated state (spec.md §3, §4.4).
//!
//! Keys and values are split into separate files so that key-only scans
//! (recovery merge, enumeration without values, `MergeHelper` bookkeeping)
//! never touch value bytes. Each file is independently chunked and
//! checksummed (`format::chunk`) and ends in a properties section plus the
//! shared [`Footer`](crate::format::Footer).

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tstore_core::error::{Error, Result};
use tstore_core::types::{Lsn, RecordKind};

use crate::format::chunk::{crc64, BlockAlignedReader, BlockAlignedWriter};
use crate::format::footer::{FileKind, Footer, FOOTER_LEN};
use crate::format::key_data::KeyEntry;

/// Default chunk size, matching spec.md §4.4's 4 KiB default.
pub const DEFAULT_CHUNK_SIZE: u64 = 4096;

fn align8(n: usize) -> usize {
    (n + 7) & !7
}

/// File-name pair for one checkpoint generation.
pub fn key_file_path(dir: &Path, file_id: u32) -> PathBuf {
    dir.join(format!("{file_id:020}.sfk"))
}

/// File-name pair for one checkpoint generation.
pub fn value_file_path(dir: &Path, file_id: u32) -> PathBuf {
    dir.join(format!("{file_id:020}.sfv"))
}

/// Summary produced once a checkpoint file pair is fully written, recorded
/// into the owning `FileMetadata` entry (spec.md §4.5).
#[derive(Debug, Clone, Copy)]
pub struct CheckpointFileProperties {
    /// The file-id this checkpoint generation was written under.
    pub file_id: u32,
    /// Total entries written, live and deleted.
    pub key_count: u64,
    /// Entries written to the value file (all non-`Deleted` entries).
    pub value_count: u64,
    /// Entries whose kind is `Deleted`.
    pub deleted_count: u64,
    /// Total byte length of the `.sfk` file.
    pub key_file_size: u64,
    /// Total byte length of the `.sfv` file.
    pub value_file_size: u64,
}

/// Where [`CheckpointFileWriter::add_live`] placed one entry's value bytes,
/// returned so a caller replacing an in-memory item with a disk-backed one
/// (checkpoint, spec.md §4.1 `PerformCheckpointAsync`) can build the
/// matching `VersionedItem` without re-reading the file.
#[derive(Debug, Clone, Copy)]
pub struct LiveEntryLocation {
    /// Byte offset the value was written at in the `.sfv` file.
    pub offset: u64,
    /// Length of the value in bytes.
    pub value_size: u32,
    /// CRC64 checksum of the value bytes.
    pub value_checksum: u64,
}

/// Streams key/value pairs into a fresh checkpoint file pair. Used by
/// consolidation (§4.3), merge (§4.8), and recovery (§4.11) alike — all
/// three produce a sorted, deduplicated stream of entries to persist.
pub struct CheckpointFileWriter {
    file_id: u32,
    key_writer: BlockAlignedWriter<File>,
    value_writer: BlockAlignedWriter<File>,
    key_count: u64,
    value_count: u64,
    deleted_count: u64,
    key_path: PathBuf,
    value_path: PathBuf,
}

impl CheckpointFileWriter {
    /// Create the `.sfk`/`.sfv` pair for `file_id` in `dir`.
    pub fn create(dir: &Path, file_id: u32, chunk_size: u64) -> Result<Self> {
        let key_path = key_file_path(dir, file_id);
        let value_path = value_file_path(dir, file_id);
        let key_file = File::create(&key_path)?;
        let value_file = File::create(&value_path)?;
        Ok(CheckpointFileWriter {
            file_id,
            key_writer: BlockAlignedWriter::new(key_file, chunk_size, 0),
            value_writer: BlockAlignedWriter::new(value_file, chunk_size, 0),
            key_count: 0,
            value_count: 0,
            deleted_count: 0,
            key_path,
            value_path,
        })
    }

    /// Append a live entry with its value bytes.
    pub fn add_live(&mut self, kind: RecordKind, lsn: Lsn, key_bytes: &[u8], value_bytes: &[u8]) -> Result<LiveEntryLocation> {
        debug_assert!(!kind.is_deleted());
        let checksum = crc64(value_bytes);
        let offset = self.value_writer.write_item(value_bytes)?;
        let entry = KeyEntry {
            kind,
            lsn,
            value_offset: offset,
            value_checksum: checksum,
            value_size: value_bytes.len() as u32,
            logical_timestamp: 0,
            key_bytes: key_bytes.to_vec(),
        };
        self.key_writer.write_item(&entry.to_bytes())?;
        self.key_count += 1;
        self.value_count += 1;
        Ok(LiveEntryLocation { offset, value_size: value_bytes.len() as u32, value_checksum: checksum })
    }

    /// Append a tombstone (no value bytes).
    pub fn add_tombstone(&mut self, lsn: Lsn, key_bytes: &[u8], logical_timestamp: i64) -> Result<()> {
        let entry = KeyEntry {
            kind: RecordKind::Deleted,
            lsn,
            value_offset: 0,
            value_checksum: 0,
            value_size: 0,
            logical_timestamp,
            key_bytes: key_bytes.to_vec(),
        };
        self.key_writer.write_item(&entry.to_bytes())?;
        self.key_count += 1;
        self.deleted_count += 1;
        Ok(())
    }

    /// Finalize both files: flush the last chunk, write properties and the
    /// footer, and fsync (spec.md §4.4's durability contract for a
    /// completed checkpoint file).
    pub fn finish(self) -> Result<CheckpointFileProperties> {
        let (mut key_file, key_items_end) = self.key_writer.finish()?;
        let (mut value_file, value_items_end) = self.value_writer.finish()?;

        let key_props = encode_key_properties(self.file_id, self.key_count, self.deleted_count);
        key_file.write_all(&key_props)?;
        let key_footer = Footer::new(FileKind::KeyCheckpoint, key_items_end, key_props.len() as u64);
        key_file.write_all(&key_footer.to_bytes())?;
        key_file.sync_all()?;

        let value_props = encode_value_properties(self.file_id, self.value_count);
        value_file.write_all(&value_props)?;
        let value_footer = Footer::new(FileKind::ValueCheckpoint, value_items_end, value_props.len() as u64);
        value_file.write_all(&value_footer.to_bytes())?;
        value_file.sync_all()?;

        Ok(CheckpointFileProperties {
            file_id: self.file_id,
            key_count: self.key_count,
            value_count: self.value_count,
            deleted_count: self.deleted_count,
            key_file_size: key_file.metadata().map(|m| m.len()).unwrap_or(0),
            value_file_size: value_file.metadata().map(|m| m.len()).unwrap_or(0),
        })
    }

    /// Path of the `.sfk` file being written.
    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    /// Path of the `.sfv` file being written.
    pub fn value_path(&self) -> &Path {
        &self.value_path
    }
}

fn encode_key_properties(file_id: u32, key_count: u64, deleted_count: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(16);
    out.extend_from_slice(&file_id.to_le_bytes());
    out.extend_from_slice(&key_count.to_le_bytes());
    out.extend_from_slice(&deleted_count.to_le_bytes());
    out
}

fn decode_key_properties(bytes: &[u8]) -> Result<(u32, u64, u64)> {
    if bytes.len() < 20 {
        return Err(Error::corrupted("key checkpoint properties", "truncated"));
    }
    let file_id = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
    let key_count = u64::from_le_bytes(bytes[4..12].try_into().unwrap());
    let deleted_count = u64::from_le_bytes(bytes[12..20].try_into().unwrap());
    Ok((file_id, key_count, deleted_count))
}

fn encode_value_properties(file_id: u32, value_count: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(12);
    out.extend_from_slice(&file_id.to_le_bytes());
    out.extend_from_slice(&value_count.to_le_bytes());
    out
}

fn decode_value_properties(bytes: &[u8]) -> Result<(u32, u64)> {
    if bytes.len() < 12 {
        return Err(Error::corrupted("value checkpoint properties", "truncated"));
    }
    let file_id = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
    let value_count = u64::from_le_bytes(bytes[4..12].try_into().unwrap());
    Ok((file_id, value_count))
}

/// Sequential reader over a `.sfk` file's entries, used by recovery and
/// merge's k-way scan (§4.8, §4.11). Does not resolve value bytes — use
/// [`ValueCheckpointFileReader`] with the entry's `value_offset`/`value_size`
/// for that.
pub struct KeyCheckpointFileEnumerator {
    reader: BlockAlignedReader<File>,
    remaining: u64,
}

impl KeyCheckpointFileEnumerator {
    /// Open `path` for sequential entry enumeration, validating its footer.
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let len = file.metadata()?.len();
        if len < FOOTER_LEN as u64 {
            return Err(Error::corrupted(path.display().to_string(), "file shorter than footer"));
        }
        file.seek(SeekFrom::End(-(FOOTER_LEN as i64)))?;
        let mut footer_bytes = [0u8; FOOTER_LEN];
        file.read_exact(&mut footer_bytes)?;
        let footer = Footer::from_bytes(&footer_bytes, FileKind::KeyCheckpoint)?;

        file.seek(SeekFrom::Start(footer.properties_offset))?;
        let mut props_bytes = vec![0u8; footer.properties_size as usize];
        file.read_exact(&mut props_bytes)?;
        let (_, key_count, _) = decode_key_properties(&props_bytes)?;

        file.seek(SeekFrom::Start(0))?;
        Ok(KeyCheckpointFileEnumerator {
            reader: BlockAlignedReader::new(file),
            remaining: key_count,
        })
    }

    /// Read the next entry, or `None` once the recorded key count is
    /// exhausted.
    pub fn next_entry(&mut self) -> Result<Option<KeyEntry>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        let header = self.reader.read_item(16)?;
        let key_size = u32::from_le_bytes(header[0..4].try_into().unwrap()) as usize;
        let kind = RecordKind::from_u8(header[4])
            .ok_or_else(|| Error::corrupted("key checkpoint entry", "unrecognized record kind"))?;
        let variant_len = if kind.is_deleted() { 8 } else { 24 };
        let variant = self.reader.read_item(variant_len)?;
        let key_bytes = self.reader.read_item(key_size)?;

        let mut full = header;
        full.extend(variant);
        full.extend_from_slice(&key_bytes);
        let pad = align8(full.len()) - full.len();
        self.reader.skip(pad)?;

        self.remaining -= 1;
        Ok(Some(KeyEntry::from_bytes(&full)?))
    }
}

/// Random-access reader for value bytes in a `.sfv` file, given the
/// `(offset, size, checksum)` recorded on a `VersionedItem` (§4.1's
/// on-demand value materialization path).
pub struct ValueCheckpointFileReader {
    file: File,
}

impl ValueCheckpointFileReader {
    /// Open `path` for random-access value reads.
    pub fn open(path: &Path) -> Result<Self> {
        Ok(ValueCheckpointFileReader { file: File::open(path)? })
    }

    /// Read and checksum-validate the value at `offset`/`size`.
    pub fn read_value(&mut self, offset: u64, size: u32, expected_checksum: u64) -> Result<Vec<u8>> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut bytes = vec![0u8; size as usize];
        self.file.read_exact(&mut bytes)?;
        let actual = crc64(&bytes);
        if actual != expected_checksum {
            return Err(Error::corrupted("value checkpoint file", "value checksum mismatch"));
        }
        Ok(bytes)
    }
}
