//! `ConsolidationManager`: folds sealed deltas into the consolidated
//! component in memory, shrinking the read cascade's delta chain
//! (spec.md §3, §4.3).
//!
//! This is purely an in-memory merge — it never touches disk. Checkpointing
//! (writing a new `.sfk`/`.sfv` generation and updating the metadata table)
//! is a separate step the engine's `Store` drives after consolidation, using
//! `tstore-durability`'s `CheckpointFileWriter` directly against the newly
//! consolidated component.

use std::collections::BTreeMap;

use tracing::instrument;

use tstore_core::types::Lsn;
use tstore_durability::MetadataTable;
use tstore_storage::{AggregatedStoreComponent, ConsolidatedStoreComponent, VersionedItem};

/// A version superseded during a fold — returned by
/// [`ConsolidationManager::consolidate`] so the caller can ask the
/// replicator whether it is actually safe to drop (spec.md §4.3 step 5),
/// without this module needing to know about the replicator or run
/// anything asynchronously.
pub struct SupersededVersion<K> {
    /// The key the version belonged to.
    pub key: K,
    /// The version that was pushed out of the consolidated map.
    pub version: VersionedItem,
    /// The LSN of whatever now supersedes it — the upper bound of the
    /// window in which `version` is still the correct read.
    pub upper: Lsn,
}

/// Rebuild a `VersionedItem` with the same identity (kind, lsn, disk/memory
/// backing) as `item`, for moving a version from one component's map into
/// another's without disturbing the original (which may still be reachable
/// through an `Arc`'d sealed delta elsewhere).
pub(crate) fn rebuild(item: &VersionedItem) -> VersionedItem {
    if item.kind().is_deleted() {
        return VersionedItem::new_deleted(item.lsn());
    }
    if item.has_disk_backing() {
        VersionedItem::new_disk(item.kind(), item.lsn(), item.file_id(), item.offset(), item.value_size(), item.value_checksum())
    } else {
        let value = item.lock().value().expect("resident memory item must carry a value");
        VersionedItem::new_memory(item.kind(), item.lsn(), value)
    }
}

/// Decides when enough sealed deltas have accumulated to be worth folding
/// together, and performs that fold (spec.md §4.3).
pub struct ConsolidationManager {
    deltas_to_consolidate: u64,
}

impl ConsolidationManager {
    /// Build a manager using `number_of_deltas_to_be_consolidated` from the
    /// store's configuration as the trigger threshold.
    pub fn new(deltas_to_consolidate: u64) -> Self {
        ConsolidationManager { deltas_to_consolidate }
    }

    /// `true` once the aggregated state has accumulated enough sealed
    /// deltas to warrant a consolidation pass.
    pub fn should_consolidate<K>(&self, aggregated: &AggregatedStoreComponent<K>) -> bool {
        aggregated.sealed_delta_count() as u64 >= self.deltas_to_consolidate
    }

    /// Merge every currently sealed delta into the consolidated component
    /// and publish the result (spec.md §4.3 steps 2–7).
    ///
    /// Deletes encountered during the fold remove the key from the merged
    /// map rather than being carried forward as tombstones: a consolidated
    /// component only ever holds live, non-deleted versions (spec.md §4.3
    /// step 4, Open Questions — a checkpoint-time tombstone still needs to
    /// suppress an older on-disk generation, which is `run_merge`'s job,
    /// not consolidation's).
    ///
    /// Whenever a fold step supersedes a disk-backed version (an overwrite
    /// or a delete), the superseded generation's `number_of_valid_entries`
    /// is decremented in `table` (spec.md §4.3 step 4, §4.5) — this is what
    /// lets the `InvalidEntries` merge policy (§4.8) ever fire.
    ///
    /// Whether a superseded version is still needed by some active snapshot
    /// is the replicator's call, not this store's (spec.md §4.3 step 5,
    /// §4.7, §9 Open Questions: its registered-snapshot set is external, so
    /// this function has no local basis to decide on its own). Every
    /// superseded version is therefore returned for the caller to settle via
    /// `try_remove_version` before pinning into the snapshot container or
    /// letting it drop.
    #[instrument(skip(self, aggregated, table))]
    pub fn consolidate<K>(&self, aggregated: &AggregatedStoreComponent<K>, table: &MetadataTable) -> Vec<SupersededVersion<K>>
    where
        K: Ord + Clone + std::hash::Hash,
    {
        let state = aggregated.snapshot();
        if state.deltas.is_empty() {
            return Vec::new();
        }
        let consolidated_up_to_index = state.deltas.last().expect("checked non-empty above").index;

        let mut needs_pin_check: Vec<SupersededVersion<K>> = Vec::new();
        let mut supersede = |key: &K, old: VersionedItem, upper: Lsn| {
            if old.has_disk_backing() {
                if let Some(meta) = table.get(old.file_id()) {
                    meta.decrement_valid_entries();
                }
            }
            needs_pin_check.push(SupersededVersion { key: key.clone(), version: old, upper });
        };

        let mut merged: BTreeMap<K, VersionedItem> = BTreeMap::new();
        state.consolidated.for_each(|k, v| {
            merged.insert(k.clone(), rebuild(v));
        });

        for sealed in &state.deltas {
            for (key, kind, lsn) in sealed.delta.snapshot_current() {
                if kind.is_deleted() {
                    if let Some(old) = merged.remove(&key) {
                        supersede(&key, old, lsn);
                    }
                    continue;
                }
                let rebuilt = sealed.delta.with_slot(&key, |slot| slot.current.as_ref().map(rebuild));
                if let Some(Some(item)) = rebuilt {
                    let upper = item.lsn();
                    if let Some(old) = merged.insert(key.clone(), item) {
                        supersede(&key, old, upper);
                    }
                }
            }
        }
        drop(supersede);

        let new_consolidated = ConsolidatedStoreComponent::from_sorted(merged);
        aggregated.publish_consolidated(new_consolidated, consolidated_up_to_index);

        needs_pin_check
    }
}
