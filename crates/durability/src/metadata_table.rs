//! `FileMetadata` and `MetadataTable`: the durable record of which
//! checkpoint files exist, how full they are, and who is still using them
//! (spec.md §4.5).
//!
//! A `FileMetadata` entry outlives the `MetadataTable` row that names it
//! whenever a snapshot has pinned it (§4.7) — deletion is therefore gated on
//! a reference count, not on unlinking the table row. The table itself is
//! persisted as a `current`/`next` file pair: writes go to `next`, are
//! fsynced, then atomically renamed over `current` (the same write-fsync-
//! rename shape the checkpoint files use, generalized to a whole table).

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use tstore_core::error::{Error, Result};

use crate::checkpoint_file::CheckpointFileProperties;
use crate::format::footer::{FileKind, Footer, FOOTER_LEN};

/// One checkpoint file generation's bookkeeping row.
///
/// `number_of_valid_entries` is decremented as consolidation/merge discovers
/// that an entry's key now has a newer version elsewhere, without rewriting
/// the file in place — it only goes to zero (and the file becomes eligible
/// for deletion once its reference count also reaches zero) when a merge
/// pass actually rewrites the survivors into a new generation.
#[derive(Debug)]
pub struct FileMetadata {
    /// Uniquely identifies this checkpoint generation; `0` is reserved for
    /// "no file" / memory-only.
    pub file_id: u32,
    /// Directory the `.sfk`/`.sfv` pair lives in.
    pub directory: PathBuf,
    /// Total entries originally written (live and deleted).
    pub total_number_of_entries: u64,
    number_of_valid_entries: AtomicU64,
    /// Entries whose kind was `Deleted` at write time.
    pub number_of_deleted_entries: u64,
    /// Logical clock value assigned when the file was produced, used to
    /// order generations during merge tombstone collapsing (§4.8).
    pub logical_timestamp: u64,
    /// Combined `.sfk`+`.sfv` size in bytes, used to bucket this generation
    /// into a size tier for the `FileCount` merge policy (§4.8) and to sum
    /// the store's total on-disk footprint for the `SizeOnDisk` policy.
    pub size_on_disk_bytes: u64,
    reference_count: AtomicU32,
    can_be_deleted: AtomicBool,
    is_closed: AtomicBool,
}

impl FileMetadata {
    /// Build the row for a just-written checkpoint file, starting with a
    /// reference count of 1 (held by the metadata table itself).
    pub fn from_properties(directory: PathBuf, props: &CheckpointFileProperties, logical_timestamp: u64) -> Self {
        FileMetadata {
            file_id: props.file_id,
            directory,
            total_number_of_entries: props.key_count,
            number_of_valid_entries: AtomicU64::new(props.key_count - props.deleted_count),
            number_of_deleted_entries: props.deleted_count,
            logical_timestamp,
            size_on_disk_bytes: props.key_file_size + props.value_file_size,
            reference_count: AtomicU32::new(1),
            can_be_deleted: AtomicBool::new(false),
            is_closed: AtomicBool::new(false),
        }
    }

    /// Reconstruct a row read back from the metadata table file.
    #[allow(clippy::too_many_arguments)]
    fn from_persisted(
        file_id: u32,
        directory: PathBuf,
        total_number_of_entries: u64,
        number_of_valid_entries: u64,
        number_of_deleted_entries: u64,
        logical_timestamp: u64,
        size_on_disk_bytes: u64,
    ) -> Self {
        FileMetadata {
            file_id,
            directory,
            total_number_of_entries,
            number_of_valid_entries: AtomicU64::new(number_of_valid_entries),
            number_of_deleted_entries,
            logical_timestamp,
            size_on_disk_bytes,
            reference_count: AtomicU32::new(1),
            can_be_deleted: AtomicBool::new(false),
            is_closed: AtomicBool::new(false),
        }
    }

    /// Entries still considered live (not yet superseded by a newer
    /// generation).
    pub fn number_of_valid_entries(&self) -> u64 {
        self.number_of_valid_entries.load(Ordering::Acquire)
    }

    /// Record that one fewer entry in this file is still live.
    pub fn decrement_valid_entries(&self) {
        self.number_of_valid_entries.fetch_sub(1, Ordering::AcqRel);
    }

    /// Attempt to pin this file for continued use (a read in flight, or a
    /// snapshot). Fails once the count has already dropped to zero and the
    /// file is being torn down (spec.md §4.7, §4.5).
    pub fn try_add_ref(&self) -> bool {
        let mut current = self.reference_count.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return false;
            }
            match self.reference_count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Release a reference taken by [`Self::try_add_ref`] (or the initial
    /// implicit one). Returns `true` if this release dropped the count to
    /// zero, meaning the caller may now physically delete the files if
    /// [`Self::mark_can_be_deleted`] has also been called.
    pub fn release_ref(&self) -> bool {
        let prev = self.reference_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "release_ref underflow");
        prev == 1
    }

    /// Mark this generation as logically superseded: once the reference
    /// count reaches zero, its files may be deleted.
    pub fn mark_can_be_deleted(&self) {
        self.can_be_deleted.store(true, Ordering::Release);
    }

    /// `true` once [`Self::mark_can_be_deleted`] has been called.
    pub fn can_be_deleted(&self) -> bool {
        self.can_be_deleted.load(Ordering::Acquire)
    }

    /// `true` once this generation is no longer accepting new pins.
    pub fn is_closed(&self) -> bool {
        self.is_closed.load(Ordering::Acquire)
    }

    /// Mark this generation closed (no further `try_add_ref` callers are
    /// expected; existing references still drain normally).
    pub fn mark_closed(&self) {
        self.is_closed.store(true, Ordering::Release);
    }

    /// `true` if every reference has drained and deletion has been
    /// authorized — the file is ready for physical removal.
    pub fn is_ready_for_deletion(&self) -> bool {
        self.can_be_deleted() && self.reference_count.load(Ordering::Acquire) == 0
    }

    /// Remove the `.sfk`/`.sfv` pair from disk. Callers must only do this
    /// after [`Self::is_ready_for_deletion`] is `true`.
    pub fn delete_files(&self) -> Result<()> {
        let key = crate::checkpoint_file::key_file_path(&self.directory, self.file_id);
        let value = crate::checkpoint_file::value_file_path(&self.directory, self.file_id);
        if key.exists() {
            std::fs::remove_file(&key)?;
        }
        if value.exists() {
            std::fs::remove_file(&value)?;
        }
        Ok(())
    }
}

/// The table of all known checkpoint file generations, persisted as a
/// `current`/`next` pair under the store's working directory (§4.5).
pub struct MetadataTable {
    directory: PathBuf,
    entries: BTreeMap<u32, FileMetadata>,
}

fn current_path(dir: &Path) -> PathBuf {
    dir.join("metadata.current")
}

fn next_path(dir: &Path) -> PathBuf {
    dir.join("metadata.next")
}

impl MetadataTable {
    /// An empty table rooted at `directory`.
    pub fn new(directory: PathBuf) -> Self {
        MetadataTable { directory, entries: BTreeMap::new() }
    }

    /// Load the table from `directory`: tries `current` first, falling back
    /// to `next` if `current` is missing or fails checksum validation (a
    /// crash can land between the `next` write and the rename, or between
    /// the rename and unlinking the stale `next`).
    pub fn open(directory: PathBuf) -> Result<Self> {
        let cur = current_path(&directory);
        if cur.exists() {
            match Self::read_file(&cur) {
                Ok(entries) => return Ok(MetadataTable { directory, entries }),
                Err(e) if e.is_corruption() => {
                    tracing::warn!(error = %e, "metadata.current failed validation, falling back to metadata.next");
                }
                Err(e) => return Err(e),
            }
        }
        let next = next_path(&directory);
        if next.exists() {
            let entries = Self::read_file(&next)?;
            return Ok(MetadataTable { directory, entries });
        }
        Ok(MetadataTable { directory, entries: BTreeMap::new() })
    }

    fn read_file(path: &Path) -> Result<BTreeMap<u32, FileMetadata>> {
        let mut file = File::open(path)?;
        let len = file.metadata()?.len();
        if len < FOOTER_LEN as u64 {
            return Err(Error::corrupted(path.display().to_string(), "file shorter than footer"));
        }
        file.seek(SeekFrom::End(-(FOOTER_LEN as i64)))?;
        let mut footer_bytes = [0u8; FOOTER_LEN];
        file.read_exact(&mut footer_bytes)?;
        let footer = Footer::from_bytes(&footer_bytes, FileKind::MetadataTable)?;

        file.seek(SeekFrom::Start(footer.properties_offset))?;
        let mut body = vec![0u8; footer.properties_size as usize];
        file.read_exact(&mut body)?;

        let directory = path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
        decode_entries(&body, directory)
    }

    /// Persist the table: write to `next`, fsync, then atomically rename
    /// over `current`.
    pub fn persist(&self) -> Result<()> {
        std::fs::create_dir_all(&self.directory)?;
        let body = encode_entries(&self.entries);
        let next = next_path(&self.directory);
        let mut file = File::create(&next)?;
        file.write_all(&body)?;
        let footer = Footer::new(FileKind::MetadataTable, 0, body.len() as u64);
        file.write_all(&footer.to_bytes())?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&next, current_path(&self.directory))?;
        Ok(())
    }

    /// Insert a newly written checkpoint generation's row.
    pub fn insert(&mut self, metadata: FileMetadata) {
        self.entries.insert(metadata.file_id, metadata);
    }

    /// Look up a generation's row by file-id.
    pub fn get(&self, file_id: u32) -> Option<&FileMetadata> {
        self.entries.get(&file_id)
    }

    /// Remove a generation's row (used once its files have actually been
    /// deleted).
    pub fn remove(&mut self, file_id: u32) -> Option<FileMetadata> {
        self.entries.remove(&file_id)
    }

    /// All generations currently tracked, in file-id order.
    pub fn entries(&self) -> impl Iterator<Item = &FileMetadata> {
        self.entries.values()
    }

    /// The highest file-id in use, or `0` if the table is empty.
    pub fn max_file_id(&self) -> u32 {
        self.entries.keys().next_back().copied().unwrap_or(0)
    }

    /// The directory this table (and its checkpoint files) lives in.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Serialize the table's entries for the copy protocol's
    /// `MetadataTable` frame (spec.md §4.9) — the same encoding used on
    /// disk, without the footer.
    pub fn to_wire_bytes(&self) -> Vec<u8> {
        encode_entries(&self.entries)
    }

    /// Rebuild a table from bytes produced by [`Self::to_wire_bytes`],
    /// rooted at `directory` (the copy receiver's working directory).
    pub fn from_wire_bytes(bytes: &[u8], directory: PathBuf) -> Result<Self> {
        let entries = decode_entries(bytes, directory.clone())?;
        Ok(MetadataTable { directory, entries })
    }
}

fn encode_entries(entries: &BTreeMap<u32, FileMetadata>) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(entries.len() as u64).to_le_bytes());
    for m in entries.values() {
        out.extend_from_slice(&m.file_id.to_le_bytes());
        out.extend_from_slice(&m.total_number_of_entries.to_le_bytes());
        out.extend_from_slice(&m.number_of_valid_entries().to_le_bytes());
        out.extend_from_slice(&m.number_of_deleted_entries.to_le_bytes());
        out.extend_from_slice(&m.logical_timestamp.to_le_bytes());
        out.extend_from_slice(&m.size_on_disk_bytes.to_le_bytes());
    }
    out
}

fn decode_entries(bytes: &[u8], directory: PathBuf) -> Result<BTreeMap<u32, FileMetadata>> {
    if bytes.len() < 8 {
        return Err(Error::corrupted("metadata table", "truncated entry count"));
    }
    let count = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
    let mut map = BTreeMap::new();
    let mut pos = 8usize;
    for _ in 0..count {
        if bytes.len() < pos + 44 {
            return Err(Error::corrupted("metadata table", "truncated entry"));
        }
        let file_id = u32::from_le_bytes(bytes[pos..pos + 4].try_into().unwrap());
        let total = u64::from_le_bytes(bytes[pos + 4..pos + 12].try_into().unwrap());
        let valid = u64::from_le_bytes(bytes[pos + 12..pos + 20].try_into().unwrap());
        let deleted = u64::from_le_bytes(bytes[pos + 20..pos + 28].try_into().unwrap());
        let ts = u64::from_le_bytes(bytes[pos + 28..pos + 36].try_into().unwrap());
        let size_on_disk = u64::from_le_bytes(bytes[pos + 36..pos + 44].try_into().unwrap());
        pos += 44;
        map.insert(
            file_id,
            FileMetadata::from_persisted(file_id, directory.clone(), total, valid, deleted, ts, size_on_disk),
        );
    }
    Ok(map)
}
