//! `RecoveryStoreComponent`: rebuilds the consolidated state from the
//! on-disk checkpoint file generations named in the metadata table
//! (spec.md §4.11).
//!
//! This is the same k-way merge shape as [`crate::merge`], but across every
//! tracked generation rather than a selected subset, and it never consults
//! value bytes for the decision of which version survives — only the last
//! replicated LSN matters, which the replicator provides out of band once
//! recovery produces the component.

use std::collections::BinaryHeap;
use std::path::Path;

use tstore_core::error::Result;
use tstore_core::types::Lsn;
use tstore_storage::{ConsolidatedStoreComponent, VersionedItem};

use crate::checkpoint_file::{key_file_path, KeyCheckpointFileEnumerator};
use crate::format::key_data::KeyEntry;
use crate::metadata_table::MetadataTable;

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
        other.key_bytes.cmp(&self.key_bytes).then_with(|| self.file_id.cmp(&other.file_id))
    }
}

/// Outcome of a recovery pass: the rebuilt consolidated component plus the
/// summary statistics recovery is expected to report (spec.md §4.11).
pub struct RecoveryResult<K> {
    /// The rebuilt consolidated component, ready to become the store's
    /// aggregated state's `consolidated` half.
    pub consolidated: ConsolidatedStoreComponent<K>,
    /// Total live keys recovered.
    pub total_key_count: u64,
    /// Sum of resident value sizes for keys recovered with on-disk
    /// backing (value bytes themselves are not loaded unless
    /// `should_load_values_on_recovery` is set).
    pub total_key_size_bytes: u64,
    /// The highest file-id seen across all recovered generations, so new
    /// checkpoint files can be numbered past it.
    pub max_file_id: u32,
}

/// Rebuild a consolidated component from every checkpoint generation in
/// `table`, merging on key order and keeping only the newest live version
/// (or dropping the key entirely if its newest version is a tombstone).
///
/// `decode_key` turns serialized key bytes back into `K` using the store's
/// configured `StateSerializer`.
pub fn recover<K: Ord + Clone>(
    dir: &Path,
    table: &MetadataTable,
    mut decode_key: impl FnMut(&[u8]) -> Result<K>,
) -> Result<RecoveryResult<K>> {
    let mut sources = Vec::new();
    for meta in table.entries() {
        let path = key_file_path(dir, meta.file_id);
        sources.push((KeyCheckpointFileEnumerator::open(&path)?, meta.file_id));
    }

    let mut heap: BinaryHeap<HeapItem> = BinaryHeap::new();
    for (idx, (enumerator, file_id)) in sources.iter_mut().enumerate() {
        if let Some(entry) = enumerator.next_entry()? {
            heap.push(HeapItem { key_bytes: entry.key_bytes.clone(), entry, file_id: *file_id, source_index: idx });
        }
    }

    let mut items = Vec::new();
    let mut total_key_size_bytes = 0u64;

    while let Some(top) = heap.pop() {
        let mut duplicates = Vec::new();
        while let Some(next) = heap.peek() {
            if next.key_bytes == top.key_bytes {
                duplicates.push(heap.pop().unwrap());
            } else {
                break;
            }
        }

        if !top.entry.kind.is_deleted() {
            let key = decode_key(&top.key_bytes)?;
            let item = VersionedItem::new_disk(
                top.entry.kind,
                top.entry.lsn,
                top.file_id,
                top.entry.value_offset,
                top.entry.value_size,
                top.entry.value_checksum,
            );
            total_key_size_bytes += top.entry.value_size as u64;
            items.push((key, item));
        }

        for dup in &duplicates {
            advance(&mut sources, &mut heap, dup.source_index)?;
        }
        advance(&mut sources, &mut heap, top.source_index)?;
    }

    let total_key_count = items.len() as u64;
    let max_file_id = table.max_file_id();
    let consolidated = ConsolidatedStoreComponent::from_sorted(items);

    Ok(RecoveryResult { consolidated, total_key_count, total_key_size_bytes, max_file_id })
}

fn advance(
    sources: &mut [(KeyCheckpointFileEnumerator, u32)],
    heap: &mut BinaryHeap<HeapItem>,
    idx: usize,
) -> Result<()> {
    if let Some(entry) = sources[idx].0.next_entry()? {
        heap.push(HeapItem {
            key_bytes: entry.key_bytes.clone(),
            entry,
            file_id: sources[idx].1,
            source_index: idx,
        });
    }
    Ok(())
}

/// Highest LSN recovered across the component, used to validate against the
/// replicator's last stable LSN before the store is considered caught up
/// (spec.md §4.11's "must not exceed the replicator's recovered LSN"
/// invariant).
pub fn max_recovered_lsn<K>(result: &RecoveryResult<K>) -> Lsn {
    let mut max = Lsn::ZERO;
    result.consolidated.for_each(|_, item| {
        if item.lsn() > max {
            max = item.lsn();
        }
    });
    max
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint_file::{CheckpointFileWriter, DEFAULT_CHUNK_SIZE};
    use crate::metadata_table::FileMetadata;
    use tempfile::tempdir;
    use tstore_core::types::RecordKind;

    #[test]
    fn recovery_merges_generations_newest_wins() {
        let dir = tempdir().unwrap();
        let mut table = MetadataTable::new(dir.path().to_path_buf());

        let mut w1 = CheckpointFileWriter::create(dir.path(), 1, DEFAULT_CHUNK_SIZE).unwrap();
        w1.add_live(RecordKind::Inserted, Lsn(1), b"a", b"old").unwrap();
        w1.add_live(RecordKind::Inserted, Lsn(1), b"b", b"b-value").unwrap();
        let p1 = w1.finish().unwrap();
        table.insert(FileMetadata::from_properties(dir.path().to_path_buf(), &p1, 1));

        let mut w2 = CheckpointFileWriter::create(dir.path(), 2, DEFAULT_CHUNK_SIZE).unwrap();
        w2.add_live(RecordKind::Updated, Lsn(2), b"a", b"new").unwrap();
        w2.add_tombstone(Lsn(3), b"b", 3).unwrap();
        let p2 = w2.finish().unwrap();
        table.insert(FileMetadata::from_properties(dir.path().to_path_buf(), &p2, 2));

        let result = recover(dir.path(), &table, |bytes| {
            Ok(String::from_utf8(bytes.to_vec()).unwrap())
        })
        .unwrap();

        assert_eq!(result.total_key_count, 1);
        assert_eq!(result.max_file_id, 2);
        assert_eq!(max_recovered_lsn(&result), Lsn(2));
        let item = result.consolidated.with_item(&"a".to_string(), |i| i.lsn()).unwrap();
        assert_eq!(item, Lsn(2));
        assert!(result.consolidated.with_item(&"b".to_string(), |_| ()).is_none());
    }

    #[test]
    fn recovery_over_many_generations_in_random_order_keeps_latest_per_key() {
        use rand::seq::SliceRandom;
        use rand::SeedableRng;

        let dir = tempdir().unwrap();
        let mut table = MetadataTable::new(dir.path().to_path_buf());
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);

        let keys: Vec<String> = (0..50).map(|i| format!("key{i:03}")).collect();
        let mut expected_lsn = std::collections::HashMap::new();
        let mut lsn = 1u64;

        // 5 generations, each touching a random subset of keys with a
        // strictly increasing lsn, so the last generation to touch a key
        // always wins.
        for file_id in 1..=5u32 {
            let mut shuffled = keys.clone();
            shuffled.shuffle(&mut rng);
            let mut writer = CheckpointFileWriter::create(dir.path(), file_id, DEFAULT_CHUNK_SIZE).unwrap();
            let mut touched: Vec<&String> = shuffled.iter().take(20).collect();
            touched.sort();
            for key in touched {
                writer.add_live(RecordKind::Updated, Lsn(lsn), key.as_bytes(), format!("v{lsn}").as_bytes()).unwrap();
                expected_lsn.insert(key.clone(), lsn);
                lsn += 1;
            }
            let props = writer.finish().unwrap();
            table.insert(FileMetadata::from_properties(dir.path().to_path_buf(), &props, file_id as u64));
        }

        let result = recover(dir.path(), &table, |bytes| Ok(String::from_utf8(bytes.to_vec()).unwrap())).unwrap();

        for (key, expected) in &expected_lsn {
            let actual = result.consolidated.with_item(key, |i| i.lsn()).unwrap();
            assert_eq!(actual, Lsn(*expected), "key {key} recovered with wrong lsn");
        }
        assert_eq!(result.total_key_count, expected_lsn.len() as u64);
    }
}
