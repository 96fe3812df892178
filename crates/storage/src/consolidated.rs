//! `ConsolidatedStoreComponent`: the read-fast-path map produced by merging
//! past differentials (spec.md §3, §4.3).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::RwLock;
use tstore_core::types::Lsn;

use crate::versioned_item::VersionedItem;

/// Sorted map `K -> VersionedItem` holding the latest non-deleted committed
/// version as of the last successful consolidation (spec.md §3).
pub struct ConsolidatedStoreComponent<K> {
    items: RwLock<BTreeMap<K, VersionedItem>>,
    approx_memory_bytes: AtomicI64,
}

impl<K> Default for ConsolidatedStoreComponent<K>
where
    K: Ord + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> ConsolidatedStoreComponent<K>
where
    K: Ord + Clone,
{
    /// An empty consolidated component.
    pub fn new() -> Self {
        ConsolidatedStoreComponent {
            items: RwLock::new(BTreeMap::new()),
            approx_memory_bytes: AtomicI64::new(0),
        }
    }

    /// Build a consolidated component directly from an already-sorted,
    /// deduplicated iterator of `(key, item)` pairs. Used by
    /// `ConsolidationManager` (§4.3) and `RecoveryStoreComponent` (§4.11),
    /// both of which produce such an iterator via k-way merge.
    pub fn from_sorted(items: impl IntoIterator<Item = (K, VersionedItem)>) -> Self {
        let comp = Self::new();
        let mut map = comp.items.write();
        let mut bytes = 0i64;
        for (k, v) in items {
            if v.in_memory() {
                bytes += v.value_size() as i64;
            }
            map.insert(k, v);
        }
        drop(map);
        comp.approx_memory_bytes.store(bytes, Ordering::Relaxed);
        comp
    }

    /// Insert (or replace) the entry for `key`. Only non-deleted, live
    /// entries belong here — deletes are elided during consolidation
    /// (spec.md §4.3 step 4, Open Questions).
    pub fn insert(&self, key: K, item: VersionedItem) {
        let delta = if item.in_memory() {
            item.value_size() as i64
        } else {
            0
        };
        let mut items = self.items.write();
        if let Some(old) = items.insert(key, item) {
            if old.in_memory() {
                self.approx_memory_bytes
                    .fetch_sub(old.value_size() as i64, Ordering::Relaxed);
            }
        }
        if delta != 0 {
            self.approx_memory_bytes.fetch_add(delta, Ordering::Relaxed);
        }
    }

    /// Remove the entry for `key`, if present.
    pub fn remove(&self, key: &K) -> Option<VersionedItem> {
        let removed = self.items.write().remove(key);
        if let Some(item) = &removed {
            if item.in_memory() {
                self.approx_memory_bytes
                    .fetch_sub(item.value_size() as i64, Ordering::Relaxed);
            }
        }
        removed
    }

    /// Look up the committed version of `key`, if it is visible at
    /// `visibility_lsn`.
    pub fn read(&self, key: &K, visibility_lsn: Lsn) -> Option<ConsolidatedReadResult> {
        let items = self.items.read();
        let item = items.get(key)?;
        if item.lsn() <= visibility_lsn {
            Some(ConsolidatedReadResult {
                kind: item.kind(),
                lsn: item.lsn(),
            })
        } else {
            None
        }
    }

    /// Run `f` with the item for `key`, if present, without cloning it.
    pub fn with_item<R>(&self, key: &K, f: impl FnOnce(&VersionedItem) -> R) -> Option<R> {
        let items = self.items.read();
        items.get(key).map(f)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    /// `true` if empty.
    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }

    /// Approximate resident-value bytes currently tracked (spec.md §3:
    /// "tracks approximate in-memory byte size").
    pub fn approx_memory_bytes(&self) -> i64 {
        self.approx_memory_bytes.load(Ordering::Relaxed)
    }

    /// Iterate all entries in key order, for sweep and enumeration.
    pub fn for_each(&self, mut f: impl FnMut(&K, &VersionedItem)) {
        let items = self.items.read();
        for (k, v) in items.iter() {
            f(k, v);
        }
    }

    /// Snapshot all keys, in order, with kind/lsn — used as a merge input
    /// by consolidation.
    pub fn snapshot(&self) -> Vec<(K, tstore_core::types::RecordKind, Lsn)> {
        self.items
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.kind(), v.lsn()))
            .collect()
    }
}

/// Lightweight read result, mirroring [`crate::differential::DifferentialReadResult`].
#[derive(Debug, Clone, Copy)]
pub struct ConsolidatedReadResult {
    /// The record kind of the visible version.
    pub kind: tstore_core::types::RecordKind,
    /// The LSN of the visible version.
    pub lsn: Lsn,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tstore_core::types::RecordKind;

    fn mem_item(lsn: u64, bytes: &[u8]) -> VersionedItem {
        VersionedItem::new_memory(RecordKind::Inserted, Lsn(lsn), Arc::from(bytes))
    }

    #[test]
    fn insert_and_read() {
        let comp: ConsolidatedStoreComponent<String> = ConsolidatedStoreComponent::new();
        comp.insert("a".into(), mem_item(1, b"hello"));
        let r = comp.read(&"a".to_string(), Lsn(10)).unwrap();
        assert_eq!(r.lsn, Lsn(1));
        assert_eq!(comp.approx_memory_bytes(), 5);
    }

    #[test]
    fn replacing_entry_updates_memory_accounting() {
        let comp: ConsolidatedStoreComponent<String> = ConsolidatedStoreComponent::new();
        comp.insert("a".into(), mem_item(1, b"hello"));
        comp.insert("a".into(), mem_item(2, b"hi"));
        assert_eq!(comp.approx_memory_bytes(), 2);
    }

    #[test]
    fn remove_updates_memory_accounting() {
        let comp: ConsolidatedStoreComponent<String> = ConsolidatedStoreComponent::new();
        comp.insert("a".into(), mem_item(1, b"hello"));
        comp.remove(&"a".to_string());
        assert_eq!(comp.approx_memory_bytes(), 0);
        assert!(comp.is_empty());
    }

    #[test]
    fn read_respects_visibility_lsn() {
        let comp: ConsolidatedStoreComponent<String> = ConsolidatedStoreComponent::new();
        comp.insert("a".into(), mem_item(10, b"v"));
        assert!(comp.read(&"a".to_string(), Lsn(5)).is_none());
        assert!(comp.read(&"a".to_string(), Lsn(10)).is_some());
    }

    #[test]
    fn from_sorted_builds_consistent_component() {
        let comp = ConsolidatedStoreComponent::from_sorted(vec![
            ("a".to_string(), mem_item(1, b"aa")),
            ("b".to_string(), mem_item(1, b"bbb")),
        ]);
        assert_eq!(comp.len(), 2);
        assert_eq!(comp.approx_memory_bytes(), 5);
    }
}
