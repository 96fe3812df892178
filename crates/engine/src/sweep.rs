//! `SweepManager`: the clock-hand pass that evicts resident values of
//! disk-backed items under memory pressure (spec.md §3, §4.10).
//!
//! A sweep pass never touches memory-only items (they have nowhere to page
//! back in from) or items another thread currently holds locked — it only
//! acts on disk-backed, currently-resident items. An item gets one second
//! chance (`in_use` cleared, value kept) before a subsequent pass evicts it,
//! mirroring the classic clock/second-chance page replacement algorithm
//! referenced in DESIGN NOTES §9.

use tracing::instrument;

use tstore_storage::ConsolidatedStoreComponent;

/// Counts from one [`SweepManager::sweep`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Resident disk-backed items whose cached value was dropped this pass.
    pub evicted: u64,
    /// Resident disk-backed items given a second chance (marked not-in-use)
    /// instead of being evicted this pass.
    pub given_second_chance: u64,
}

/// Runs the clock-hand sweep over a store's consolidated component.
///
/// Stateless: all clock-hand state (the `in_use`/`in_memory` bits) lives on
/// each `VersionedItem` itself, so a single `SweepManager` can run repeated
/// passes without tracking its own cursor.
#[derive(Debug, Default, Clone, Copy)]
pub struct SweepManager;

impl SweepManager {
    /// A sweep manager with no configuration of its own.
    pub fn new() -> Self {
        SweepManager
    }

    /// One full clock-hand pass over `consolidated` (spec.md §4.10):
    ///
    /// - memory-only items (`!has_disk_backing()`) are skipped — sweep only
    ///   reclaims values that can be reloaded from disk;
    /// - non-resident disk-backed items are skipped — nothing to reclaim;
    /// - a resident disk-backed item with `in_use` set is given a second
    ///   chance: `in_use` is cleared but the value stays cached;
    /// - a resident disk-backed item with `in_use` already clear is
    ///   evicted: its cached value is dropped and `in_memory` cleared.
    #[instrument(skip(self, consolidated))]
    pub fn sweep<K>(&self, consolidated: &ConsolidatedStoreComponent<K>) -> SweepStats
    where
        K: Ord + Clone,
    {
        let mut stats = SweepStats::default();
        consolidated.for_each(|_key, item| {
            if !item.has_disk_backing() || !item.in_memory() {
                return;
            }
            if item.in_use() {
                item.clear_in_use();
                stats.given_second_chance += 1;
            } else {
                item.lock().evict();
                stats.evicted += 1;
            }
        });
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tstore_core::types::{Lsn, RecordKind};
    use tstore_storage::VersionedItem;

    fn disk_item_resident(file_id: u32, offset: u64) -> VersionedItem {
        let item = VersionedItem::new_disk(RecordKind::Inserted, Lsn(1), file_id, offset, 2, 0);
        item.lock().install(Arc::from(&b"hi"[..]));
        item
    }

    #[test]
    fn first_pass_gives_in_use_items_a_second_chance() {
        let comp: ConsolidatedStoreComponent<String> = ConsolidatedStoreComponent::new();
        let item = disk_item_resident(1, 0);
        item.mark_in_use();
        comp.insert("a".into(), item);

        let stats = SweepManager::new().sweep(&comp);
        assert_eq!(stats.given_second_chance, 1);
        assert_eq!(stats.evicted, 0);
        comp.with_item(&"a".to_string(), |i| assert!(i.in_memory()));
    }

    #[test]
    fn second_pass_evicts_when_not_reused() {
        let comp: ConsolidatedStoreComponent<String> = ConsolidatedStoreComponent::new();
        comp.insert("a".into(), disk_item_resident(1, 0));

        let manager = SweepManager::new();
        manager.sweep(&comp);
        let stats = manager.sweep(&comp);
        assert_eq!(stats.evicted, 1);
        comp.with_item(&"a".to_string(), |i| assert!(!i.in_memory()));
    }

    #[test]
    fn memory_only_items_are_never_touched() {
        let comp: ConsolidatedStoreComponent<String> = ConsolidatedStoreComponent::new();
        comp.insert("a".into(), VersionedItem::new_memory(RecordKind::Inserted, Lsn(1), Arc::from(&b"v"[..])));

        let stats = SweepManager::new().sweep(&comp);
        assert_eq!(stats, SweepStats::default());
    }
}
