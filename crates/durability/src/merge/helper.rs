//! `MergeHelper`: decides which checkpoint file generations are worth
//! rewriting together, per the four policies in spec.md §4.8.

use std::collections::{BTreeMap, BTreeSet};

use tstore_core::config::StoreConfiguration;

use crate::metadata_table::MetadataTable;

/// Which policy triggered a merge selection, recorded for logging/metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePolicy {
    /// Too many small generations have accumulated.
    FileCount,
    /// A generation's live-entry ratio has dropped too low.
    InvalidEntries,
    /// A generation carries too many tombstones relative to its size.
    DeletedEntries,
    /// Total on-disk size has crossed the configured ceiling.
    SizeOnDisk,
}

/// One merge candidacy: the file-ids to rewrite together and why.
#[derive(Debug, Clone)]
pub struct MergeSelection {
    /// The file-ids selected for this merge pass.
    pub file_ids: Vec<u32>,
    /// Which policies contributed to the selection (a file can be pulled in
    /// by more than one).
    pub policies: Vec<MergePolicy>,
}

/// Evaluate all four merge policies against the current table and return a
/// single deduplicated selection, or `None` if nothing warrants a merge
/// right now.
///
/// Each policy independently proposes a set of file-ids; the union of every
/// non-empty proposal becomes the pass's input (spec.md §4.8: "ShouldMerge
/// returns a set of file-ids" — the policies are evaluated together rather
/// than gated on only the first match, so a borderline table that's both
/// fragmented and full of tombstones merges everything relevant in one
/// pass instead of dribbling out repeated small merges).
pub fn should_merge(table: &MetadataTable, config: &StoreConfiguration) -> Option<MergeSelection> {
    let policy = config.merge_policy;
    let mut selected = BTreeSet::new();
    let mut policies = Vec::new();

    if policy.file_count {
        if let Some(ids) = file_count_policy(table, config) {
            selected.extend(ids);
            policies.push(MergePolicy::FileCount);
        }
    }
    if policy.invalid_entries {
        let ids = invalid_entries_policy(table, config);
        if !ids.is_empty() {
            selected.extend(ids);
            policies.push(MergePolicy::InvalidEntries);
        }
    }
    if policy.deleted_entries {
        let ids = deleted_entries_policy(table, config);
        if !ids.is_empty() {
            selected.extend(ids);
            policies.push(MergePolicy::DeletedEntries);
        }
    }
    if policy.size_on_disk {
        if let Some(ids) = size_on_disk_policy(table, config) {
            selected.extend(ids);
            policies.push(MergePolicy::SizeOnDisk);
        }
    }

    if selected.len() < 2 {
        return None;
    }
    Some(MergeSelection { file_ids: selected.into_iter().collect(), policies })
}

/// Bucket index for a file of `size_on_disk_bytes` given the configured
/// ascending size-tier boundaries: bucket 0 is "< thresholds[0]", bucket
/// `thresholds.len()` is "≥ the last threshold" (spec.md §4.8).
fn size_tier(size_on_disk_bytes: u64, thresholds: &[u64; 4]) -> usize {
    thresholds.iter().position(|&t| size_on_disk_bytes < t).unwrap_or(thresholds.len())
}

fn file_count_policy(table: &MetadataTable, config: &StoreConfiguration) -> Option<Vec<u32>> {
    let mut buckets: BTreeMap<usize, Vec<u32>> = BTreeMap::new();
    for m in table.entries() {
        let tier = size_tier(m.size_on_disk_bytes, &config.size_tier_thresholds);
        buckets.entry(tier).or_default().push(m.file_id);
    }

    let mut selected = Vec::new();
    for ids in buckets.values() {
        if ids.len() as u32 >= config.file_count_merge_threshold {
            selected.extend(ids.iter().copied());
        }
    }
    if selected.is_empty() {
        None
    } else {
        Some(selected)
    }
}

fn invalid_entries_policy(table: &MetadataTable, config: &StoreConfiguration) -> Vec<u32> {
    table
        .entries()
        .filter(|m| {
            if m.total_number_of_entries == 0 {
                return false;
            }
            let invalid = m.total_number_of_entries - m.number_of_valid_entries();
            if config.number_of_invalid_entries > 0 {
                invalid >= config.number_of_invalid_entries
            } else {
                let percentage = invalid * 100 / m.total_number_of_entries;
                percentage >= config.percentage_of_invalid_entries_per_file as u64
            }
        })
        .map(|m| m.file_id)
        .collect()
}

fn deleted_entries_policy(table: &MetadataTable, config: &StoreConfiguration) -> Vec<u32> {
    table
        .entries()
        .filter(|m| {
            if m.total_number_of_entries == 0 {
                return false;
            }
            let percentage = m.number_of_deleted_entries * 100 / m.total_number_of_entries;
            percentage >= config.percentage_of_deleted_entries_per_file as u64
        })
        .map(|m| m.file_id)
        .collect()
}

fn size_on_disk_policy(table: &MetadataTable, config: &StoreConfiguration) -> Option<Vec<u32>> {
    let total_bytes: u64 = table.entries().map(|m| m.size_on_disk_bytes).sum();
    let has_reclaimable = table
        .entries()
        .any(|m| m.number_of_deleted_entries > 0 || m.number_of_valid_entries() < m.total_number_of_entries);
    if total_bytes >= config.size_on_disk_threshold && has_reclaimable {
        Some(table.entries().map(|m| m.file_id).collect())
    } else {
        None
    }
}
