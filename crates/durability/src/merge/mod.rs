//! File-level merge: rewriting a selected set of checkpoint generations
//! into one new generation (spec.md §4.8).

pub mod helper;

use std::collections::BinaryHeap;
use std::path::Path;

use tstore_core::error::Result;

use crate::checkpoint_file::{CheckpointFileWriter, KeyCheckpointFileEnumerator, key_file_path, value_file_path};
use crate::format::key_data::KeyEntry;
use crate::metadata_table::{FileMetadata, MetadataTable};

pub use helper::{should_merge, MergePolicy, MergeSelection};

/// Result of a completed merge pass, applied to the metadata table under
/// the store's prime lock (spec.md §4.8 step 6).
pub struct PostMergeMetadataTableInformation {
    /// Generations that were rewritten and should be dropped once their
    /// reference counts reach zero.
    pub merged_away_file_ids: Vec<u32>,
    /// The new generation produced by the merge, already written to disk.
    pub new_file_metadata: FileMetadata,
}

/// One heap entry during the k-way merge: the next still-unread entry from
/// one input file, tagged by the file's recency so ties resolve
/// newest-first (higher file-id wins, matching file-ids being assigned in
/// creation order).
struct HeapItem {
    key_bytes: Vec<u8>,
    entry: KeyEntry,
    file_id: u32,
    source_index: usize,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.key_bytes == other.key_bytes && self.file_id == other.file_id
    }
}
impl Eq for HeapItem {}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; reverse key order to pop smallest key
        // first, and newest file-id first among equal keys.
        other
            .key_bytes
            .cmp(&self.key_bytes)
            .then_with(|| self.file_id.cmp(&other.file_id))
    }
}

struct MergeSource {
    enumerator: KeyCheckpointFileEnumerator,
    file_id: u32,
}

/// Rewrite the checkpoint generations named in `selection` into a single new
/// generation with `new_file_id`, dropping superseded entries: a live entry
/// whose key also appears in a newer generation is skipped, and a tombstone
/// is dropped once every remaining (not-yet-merged) older generation has
/// already been rewritten past it, i.e. once no older generation can still
/// be read for that key. Since merge here always subsumes *all* currently
/// tracked generations for any tombstoned key that survives to the merge
/// set, a tombstone only needs to be kept when a generation *outside*
/// `selection` still exists and might be older (`logical_timestamp` less
/// than the tombstone's own).
pub fn run_merge(
    dir: &Path,
    table: &MetadataTable,
    selection: &MergeSelection,
    new_file_id: u32,
    chunk_size: u64,
) -> Result<PostMergeMetadataTableInformation> {
    let oldest_surviving_timestamp = table
        .entries()
        .filter(|m| !selection.file_ids.contains(&m.file_id))
        .map(|m| m.logical_timestamp)
        .min();

    let mut sources = Vec::new();
    for &file_id in &selection.file_ids {
        let path = key_file_path(dir, file_id);
        sources.push(MergeSource { enumerator: KeyCheckpointFileEnumerator::open(&path)?, file_id });
    }

    let mut value_readers: Vec<crate::checkpoint_file::ValueCheckpointFileReader> = selection
        .file_ids
        .iter()
        .map(|&id| crate::checkpoint_file::ValueCheckpointFileReader::open(&value_file_path(dir, id)))
        .collect::<Result<Vec<_>>>()?;

    let mut heap: BinaryHeap<HeapItem> = BinaryHeap::new();
    for (idx, source) in sources.iter_mut().enumerate() {
        if let Some(entry) = source.enumerator.next_entry()? {
            heap.push(HeapItem {
                key_bytes: entry.key_bytes.clone(),
                entry,
                file_id: source.file_id,
                source_index: idx,
            });
        }
    }

    let mut writer = CheckpointFileWriter::create(dir, new_file_id, chunk_size)?;
    let max_timestamp = selection
        .file_ids
        .iter()
        .filter_map(|id| table.get(*id).map(|m| m.logical_timestamp))
        .max()
        .unwrap_or(0);

    while let Some(top) = heap.pop() {
        // Pull (and discard) every older duplicate of this key from the
        // other sources before deciding what to write — only the
        // newest-file-id version of a key survives the merge.
        let mut duplicates = Vec::new();
        while let Some(next) = heap.peek() {
            if next.key_bytes == top.key_bytes {
                duplicates.push(heap.pop().unwrap());
            } else {
                break;
            }
        }

        if top.entry.kind.is_deleted() {
            let keep = match oldest_surviving_timestamp {
                Some(oldest) => top.entry.logical_timestamp >= oldest,
                None => false,
            };
            if keep {
                writer.add_tombstone(top.entry.lsn, &top.key_bytes, top.entry.logical_timestamp)?;
            }
        } else {
            let reader_idx = selection
                .file_ids
                .iter()
                .position(|&id| id == top.file_id)
                .expect("merge source file-id must be in selection");
            let value = value_readers[reader_idx].read_value(
                top.entry.value_offset,
                top.entry.value_size,
                top.entry.value_checksum,
            )?;
            writer.add_live(top.entry.kind, top.entry.lsn, &top.key_bytes, &value)?;
        }

        for dup in &duplicates {
            advance(&mut sources, &mut heap, dup.source_index)?;
        }
        advance(&mut sources, &mut heap, top.source_index)?;
    }

    let props = writer.finish()?;
    let new_file_metadata = FileMetadata::from_properties(dir.to_path_buf(), &props, max_timestamp + 1);

    Ok(PostMergeMetadataTableInformation {
        merged_away_file_ids: selection.file_ids.clone(),
        new_file_metadata,
    })
}

fn advance(sources: &mut [MergeSource], heap: &mut BinaryHeap<HeapItem>, idx: usize) -> Result<()> {
    if let Some(entry) = sources[idx].enumerator.next_entry()? {
        heap.push(HeapItem {
            key_bytes: entry.key_bytes.clone(),
            entry,
            file_id: sources[idx].file_id,
            source_index: idx,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint_file::DEFAULT_CHUNK_SIZE;
    use tempfile::tempdir;
    use tstore_core::types::{Lsn, RecordKind};

    fn write_generation(dir: &Path, file_id: u32, entries: &[(&str, u64, Option<&str>)]) -> FileMetadata {
        let mut writer = CheckpointFileWriter::create(dir, file_id, DEFAULT_CHUNK_SIZE).unwrap();
        for &(key, lsn, value) in entries {
            match value {
                Some(v) => writer.add_live(RecordKind::Updated, Lsn(lsn), key.as_bytes(), v.as_bytes()).unwrap(),
                None => writer.add_tombstone(Lsn(lsn), key.as_bytes(), lsn as i64).unwrap(),
            }
        }
        let props = writer.finish().unwrap();
        FileMetadata::from_properties(dir.to_path_buf(), &props, file_id as u64)
    }

    #[test]
    fn merge_keeps_newest_version_and_drops_superseded() {
        let dir = tempdir().unwrap();
        let mut table = MetadataTable::new(dir.path().to_path_buf());

        let m1 = write_generation(dir.path(), 1, &[("a", 1, Some("old-a")), ("b", 1, Some("b"))]);
        let m2 = write_generation(dir.path(), 2, &[("a", 2, Some("new-a"))]);
        table.insert(m1);
        table.insert(m2);

        let selection = MergeSelection { file_ids: vec![1, 2], policies: vec![MergePolicy::FileCount] };
        let result = run_merge(dir.path(), &table, &selection, 3, DEFAULT_CHUNK_SIZE).unwrap();

        assert_eq!(result.merged_away_file_ids, vec![1, 2]);
        let mut enumerator =
            KeyCheckpointFileEnumerator::open(&key_file_path(dir.path(), 3)).unwrap();
        let mut seen = Vec::new();
        while let Some(e) = enumerator.next_entry().unwrap() {
            seen.push((String::from_utf8(e.key_bytes).unwrap(), e.lsn));
        }
        seen.sort();
        assert_eq!(seen, vec![("a".to_string(), Lsn(2)), ("b".to_string(), Lsn(1))]);
    }

    #[test]
    fn tombstone_with_no_older_generation_is_dropped() {
        let dir = tempdir().unwrap();
        let mut table = MetadataTable::new(dir.path().to_path_buf());
        let m1 = write_generation(dir.path(), 1, &[("a", 1, None)]);
        table.insert(m1);

        let selection = MergeSelection { file_ids: vec![1], policies: vec![MergePolicy::DeletedEntries] };
        let result = run_merge(dir.path(), &table, &selection, 2, DEFAULT_CHUNK_SIZE).unwrap();
        assert_eq!(result.new_file_metadata.total_number_of_entries, 0);
    }

    #[test]
    fn tombstone_survives_while_an_older_generation_remains_unmerged() {
        let dir = tempdir().unwrap();
        let mut table = MetadataTable::new(dir.path().to_path_buf());

        let m1 = write_generation(dir.path(), 1, &[("a", 1, Some("a"))]);
        let m2 = write_generation(dir.path(), 2, &[("a", 5, None)]);
        let m3 = write_generation(dir.path(), 3, &[("z", 9, Some("z"))]);
        table.insert(m1);
        table.insert(m2);
        table.insert(m3);

        // Only file 2 (the tombstone) is merged; files 1 and 3 are left in
        // place, and file 1 is older than the tombstone.
        let selection = MergeSelection { file_ids: vec![2], policies: vec![MergePolicy::DeletedEntries] };
        let result = run_merge(dir.path(), &table, &selection, 4, DEFAULT_CHUNK_SIZE).unwrap();
        assert_eq!(result.new_file_metadata.total_number_of_entries, 1);
        assert_eq!(result.new_file_metadata.number_of_deleted_entries, 1);
    }
}
