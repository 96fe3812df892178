//! `SnapshotContainer`: keeps old versions (in-memory and on-disk) alive for
//! as long as a snapshot-isolation reader or the copy protocol might still
//! need them (spec.md §3, §4.7).
//!
//! Consolidation and merge are free to produce new generations, retire old
//! ones, and evict a differential's `previous` version at any time; a
//! long-lived snapshot transaction reading at an old `visibility_lsn` must
//! still be able to resolve both disk-backed `VersionedItem`s that point at
//! a file the metadata table no longer lists, and the exact in-memory
//! version that existed at that LSN before it was pushed out of the
//! differential. The container is keyed by visibility LSN (spec.md §3:
//! `Map<visibilityLsn, SnapshotComponent>`) since every reader opened at the
//! same LSN needs the same evicted versions and the same pinned files.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use tstore_core::types::Lsn;
use tstore_storage::VersionedItem;

use crate::metadata_table::FileMetadata;

/// One visibility LSN's pinned set: every evicted `(key, version)` still
/// needed at that LSN, plus every file generation that was live as of that
/// LSN and must not be deleted until this component drops.
pub struct SnapshotComponent<K> {
    /// The visibility LSN this snapshot was opened at.
    pub visibility_lsn: Lsn,
    pinned_files: RwLock<Vec<Arc<FileMetadata>>>,
    versions: RwLock<BTreeMap<K, VersionedItem>>,
}

impl<K: Ord> SnapshotComponent<K> {
    fn new(visibility_lsn: Lsn) -> Self {
        SnapshotComponent {
            visibility_lsn,
            pinned_files: RwLock::new(Vec::new()),
            versions: RwLock::new(BTreeMap::new()),
        }
    }

    /// Pin `file`, taking a reference on it (spec.md §4.7
    /// `TryAddFileMetadata`). Returns `false` if the file's reference count
    /// had already reached zero — the caller must fall back to whatever
    /// state produced the reference in the first place.
    pub fn try_add_file_metadata(&self, file: Arc<FileMetadata>) -> bool {
        if !file.try_add_ref() {
            return false;
        }
        self.pinned_files.write().push(file);
        true
    }

    /// Stash an evicted version for `key` so reads at this snapshot's LSN
    /// can still resolve it after it has been pushed out of the
    /// differential or consolidated state (spec.md §4.7 `Add`).
    pub fn add_version(&self, key: K, item: VersionedItem) {
        self.versions.write().insert(key, item);
    }

    /// Run `f` with the evicted version stashed for `key`, if any.
    pub fn with_version<R>(&self, key: &K, f: impl FnOnce(&VersionedItem) -> R) -> Option<R> {
        self.versions.read().get(key).map(f)
    }

    /// The files pinned by this snapshot.
    pub fn pinned_files(&self) -> Vec<Arc<FileMetadata>> {
        self.pinned_files.read().clone()
    }

    /// Number of evicted versions currently stashed.
    pub fn version_count(&self) -> usize {
        self.versions.read().len()
    }
}

impl<K> Drop for SnapshotComponent<K> {
    fn drop(&mut self) {
        for file in self.pinned_files.get_mut().iter() {
            file.release_ref();
        }
    }
}

/// The set of open snapshots, keyed by visibility LSN (spec.md §3, §4.7).
/// Consolidation, merge, and the differential's eviction path consult this
/// before dropping a superseded version or generation: it stays reachable
/// until every snapshot that might still read it has been removed.
#[derive(Default)]
pub struct SnapshotContainer<K> {
    components: RwLock<BTreeMap<u64, Arc<SnapshotComponent<K>>>>,
}

impl<K: Ord> SnapshotContainer<K> {
    /// An empty container.
    pub fn new() -> Self {
        SnapshotContainer { components: RwLock::new(BTreeMap::new()) }
    }

    /// Lazily allocate (or return the existing) component for
    /// `visibility_lsn` (spec.md §4.7 `GetOrAdd`).
    pub fn get_or_add(&self, visibility_lsn: Lsn) -> Arc<SnapshotComponent<K>> {
        if let Some(existing) = self.components.read().get(&visibility_lsn.0) {
            return existing.clone();
        }
        self.components
            .write()
            .entry(visibility_lsn.0)
            .or_insert_with(|| Arc::new(SnapshotComponent::new(visibility_lsn)))
            .clone()
    }

    /// Stash `item` for `key` under `visibility_lsn` (spec.md §4.7 `Add`).
    pub fn add(&self, visibility_lsn: Lsn, key: K, item: VersionedItem) {
        self.get_or_add(visibility_lsn).add_version(key, item);
    }

    /// Pin `file` under `visibility_lsn` (spec.md §4.7
    /// `TryAddFileMetadata`).
    pub fn try_add_file_metadata(&self, visibility_lsn: Lsn, file: Arc<FileMetadata>) -> bool {
        self.get_or_add(visibility_lsn).try_add_file_metadata(file)
    }

    /// The component registered at `visibility_lsn`, if any, without
    /// allocating one.
    pub fn get(&self, visibility_lsn: Lsn) -> Option<Arc<SnapshotComponent<K>>> {
        self.components.read().get(&visibility_lsn.0).cloned()
    }

    /// Drop the component at `visibility_lsn`, releasing every file
    /// reference it held (spec.md §4.7 `RemoveAsync`, called once the
    /// replicator signals the last transaction at that LSN has completed).
    pub fn remove(&self, visibility_lsn: Lsn) {
        self.components.write().remove(&visibility_lsn.0);
    }

    /// Number of currently open snapshot LSNs.
    pub fn open_count(&self) -> usize {
        self.components.read().len()
    }

    /// The oldest visibility LSN among open snapshots, i.e. the earliest
    /// point anything still needs to be able to read — sweep and merge use
    /// this as a lower bound on what they may reclaim.
    pub fn oldest_visibility_lsn(&self) -> Option<Lsn> {
        self.components.read().keys().next().map(|&v| Lsn(v))
    }

    /// Open visibility LSNs in `[low, high)` — the window a version at `low`
    /// remains the correct read for before something newer supersedes it.
    /// Used by eviction (differential `Add`, spec.md §4.2) and consolidation
    /// (spec.md §4.3 step 5) to learn which open snapshots a version about to
    /// be dropped must be pinned for instead.
    pub fn visibility_lsns_in_range(&self, low: Lsn, high_exclusive: Lsn) -> Vec<Lsn> {
        self.components.read().range(low.0..high_exclusive.0).map(|(&v, _)| Lsn(v)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint_file::CheckpointFileProperties;
    use std::path::PathBuf;
    use tstore_core::types::RecordKind;

    fn file_metadata(file_id: u32) -> Arc<FileMetadata> {
        let props = CheckpointFileProperties {
            file_id,
            key_count: 1,
            value_count: 1,
            deleted_count: 0,
            key_file_size: 0,
            value_file_size: 0,
        };
        Arc::new(FileMetadata::from_properties(PathBuf::from("."), &props, 0))
    }

    #[test]
    fn pinned_file_stays_alive_past_container_removal() {
        let container: SnapshotContainer<String> = SnapshotContainer::new();
        let meta = file_metadata(1);
        meta.mark_can_be_deleted();

        assert!(container.try_add_file_metadata(Lsn(5), meta.clone()));
        assert!(!meta.is_ready_for_deletion());

        container.remove(Lsn(5));
        assert!(meta.is_ready_for_deletion());
    }

    #[test]
    fn container_tracks_oldest_visibility_lsn() {
        let container: SnapshotContainer<String> = SnapshotContainer::new();
        container.get_or_add(Lsn(10));
        container.get_or_add(Lsn(3));

        assert_eq!(container.oldest_visibility_lsn(), Some(Lsn(3)));
        container.remove(Lsn(3));
        assert_eq!(container.oldest_visibility_lsn(), Some(Lsn(10)));
        container.remove(Lsn(10));
        assert_eq!(container.open_count(), 0);
    }

    #[test]
    fn try_add_file_metadata_fails_if_already_fully_released() {
        let container: SnapshotContainer<String> = SnapshotContainer::new();
        let meta = file_metadata(1);
        meta.release_ref();
        assert!(!container.try_add_file_metadata(Lsn(1), meta));
    }

    #[test]
    fn stashed_version_is_readable_after_eviction() {
        let container: SnapshotContainer<String> = SnapshotContainer::new();
        let item = VersionedItem::new_memory(RecordKind::Inserted, Lsn(2), Arc::from(&b"v1"[..]));
        container.add(Lsn(5), "a".to_string(), item);

        let comp = container.get(Lsn(5)).unwrap();
        let lsn = comp.with_version(&"a".to_string(), |i| i.lsn()).unwrap();
        assert_eq!(lsn, Lsn(2));
    }
}
