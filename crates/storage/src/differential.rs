//! `DifferentialStoreComponent`: the in-memory, writer-side MVCC map that
//! accepts per-apply versioned writes in LSN order and serves reads
//! (spec.md §3, §4.2).

use std::collections::{BTreeMap, HashMap, HashSet};

use parking_lot::RwLock;
use tstore_core::types::Lsn;

use crate::versioned_item::VersionedItem;

/// At most the latest and one prior version of a key since the last
/// consolidation (spec.md §3).
#[derive(Default)]
pub struct DifferentialStateVersions {
    /// The newest version.
    pub current: Option<VersionedItem>,
    /// The version immediately before `current`, if still retained.
    pub previous: Option<VersionedItem>,
}

/// Outcome of [`DifferentialStoreComponent::add`]: whether a prior `previous`
/// was evicted out of the component and, if so, what the caller must do
/// with it (hand to the snapshot container, or drop).
pub enum EvictedVersion {
    /// Nothing was evicted.
    None,
    /// This version was pushed out of the two-version window and must be
    /// routed to the snapshot container or dropped by the caller.
    Evicted(VersionedItem),
}

/// Errors from [`DifferentialStoreComponent::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DifferentialAddError {
    /// The incoming LSN regressed past the current version — applies on a
    /// single replica must be serialized by LSN (spec.md §4.2, §5).
    #[error("out-of-order apply: incoming lsn {incoming} < current lsn {current}")]
    OutOfOrderApply {
        /// The LSN already installed as `current`.
        current: Lsn,
        /// The LSN of the rejected apply.
        incoming: Lsn,
    },
}

/// Sorted map `K -> DifferentialStateVersions`, plus an `lsn -> {K}` index
/// for LSN-ordered scanning during apply/commit callbacks (spec.md §3).
pub struct DifferentialStoreComponent<K> {
    versions: RwLock<BTreeMap<K, DifferentialStateVersions>>,
    by_lsn: RwLock<HashMap<Lsn, HashSet<K>>>,
}

impl<K> Default for DifferentialStoreComponent<K>
where
    K: Ord + std::hash::Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> DifferentialStoreComponent<K>
where
    K: Ord + std::hash::Hash + Clone,
{
    /// An empty component, sealed at sealing-index `0` by the caller.
    pub fn new() -> Self {
        DifferentialStoreComponent {
            versions: RwLock::new(BTreeMap::new()),
            by_lsn: RwLock::new(HashMap::new()),
        }
    }

    /// Install `item` for `key` (spec.md §4.2 `Add`).
    ///
    /// If the key is new, `item` becomes `current`. Otherwise `item.lsn`
    /// must be `>=` the existing `current.lsn`; equal LSNs are tolerated
    /// only as an idempotent re-apply of a delete (legal re-application of
    /// the same redo record). Anything older is rejected as out-of-order.
    pub fn add(&self, key: K, item: VersionedItem) -> Result<EvictedVersion, DifferentialAddError> {
        let lsn = item.lsn();
        let mut versions = self.versions.write();
        let evicted = match versions.get_mut(&key) {
            None => {
                versions.insert(
                    key.clone(),
                    DifferentialStateVersions {
                        current: Some(item),
                        previous: None,
                    },
                );
                EvictedVersion::None
            }
            Some(slot) => {
                let current_lsn = slot.current.as_ref().map(|c| c.lsn());
                match current_lsn {
                    Some(cur) if lsn < cur => {
                        return Err(DifferentialAddError::OutOfOrderApply {
                            current: cur,
                            incoming: lsn,
                        });
                    }
                    Some(cur) if lsn == cur => {
                        // Idempotent re-apply of the same delete; replace in place.
                        slot.current = Some(item);
                        EvictedVersion::None
                    }
                    _ => {
                        let pushed_out = slot.previous.take();
                        slot.previous = slot.current.take();
                        slot.current = Some(item);
                        match pushed_out {
                            Some(v) => EvictedVersion::Evicted(v),
                            None => EvictedVersion::None,
                        }
                    }
                }
            }
        };
        drop(versions);
        self.by_lsn.write().entry(lsn).or_default().insert(key);
        Ok(evicted)
    }

    /// Undo a previously applied write for `key` at `lsn` (false progress,
    /// spec.md §4.2 `Undo`). If `current.lsn == lsn`, `current` is replaced
    /// by `previous` (which is cleared). Otherwise this is a no-op — it is
    /// a caller bug to undo a version that is not `current`.
    pub fn undo(&self, key: &K, lsn: Lsn) {
        let mut versions = self.versions.write();
        if let Some(slot) = versions.get_mut(key) {
            if slot.current.as_ref().map(|c| c.lsn()) == Some(lsn) {
                debug_assert_ne!(
                    slot.previous.as_ref().map(|p| p.lsn()),
                    Some(lsn),
                    "previous must never carry the same lsn being undone"
                );
                slot.current = slot.previous.take();
            }
        }
    }

    /// Read the version of `key` visible at `visibility_lsn` (spec.md §4.2
    /// `Read`): `current` if visible, else `previous` if visible, else
    /// nothing in this component.
    pub fn read(&self, key: &K, visibility_lsn: Lsn) -> Option<DifferentialReadResult> {
        let versions = self.versions.read();
        let slot = versions.get(key)?;
        if let Some(current) = &slot.current {
            if current.lsn() <= visibility_lsn {
                return Some(DifferentialReadResult {
                    kind: current.kind(),
                    lsn: current.lsn(),
                    is_current: true,
                });
            }
        }
        if let Some(previous) = &slot.previous {
            if previous.lsn() <= visibility_lsn {
                return Some(DifferentialReadResult {
                    kind: previous.kind(),
                    lsn: previous.lsn(),
                    is_current: false,
                });
            }
        }
        None
    }

    /// Run `f` with a read-locked view of the slot for `key`, if present.
    /// Used where the caller needs the actual `VersionedItem` (to load its
    /// value) rather than just kind/lsn.
    pub fn with_slot<R>(&self, key: &K, f: impl FnOnce(&DifferentialStateVersions) -> R) -> Option<R> {
        let versions = self.versions.read();
        versions.get(key).map(f)
    }

    /// `true` if `key` has any version recorded in this component.
    pub fn contains_key(&self, key: &K) -> bool {
        self.versions.read().contains_key(key)
    }

    /// Number of distinct keys touched in this component.
    pub fn len(&self) -> usize {
        self.versions.read().len()
    }

    /// `true` if no keys have been touched.
    pub fn is_empty(&self) -> bool {
        self.versions.read().is_empty()
    }

    /// All keys applied at exactly `lsn`, used by apply/commit callbacks
    /// that need to notify per-key listeners in LSN order.
    pub fn keys_at_lsn(&self, lsn: Lsn) -> Vec<K> {
        self.by_lsn
            .read()
            .get(&lsn)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Iterate all `(key, current-kind, current-lsn)` triples in key order.
    /// Used by consolidation and enumeration to build a merge input.
    pub fn snapshot_current(&self) -> Vec<(K, tstore_core::types::RecordKind, Lsn)> {
        self.versions
            .read()
            .iter()
            .filter_map(|(k, v)| v.current.as_ref().map(|c| (k.clone(), c.kind(), c.lsn())))
            .collect()
    }
}

/// A lightweight read result carrying just kind/lsn/slot-identity; the
/// caller fetches the value separately via [`DifferentialStoreComponent::with_slot`]
/// when it needs the bytes, to avoid holding the component lock across I/O.
#[derive(Debug, Clone, Copy)]
pub struct DifferentialReadResult {
    /// The record kind of the visible version.
    pub kind: tstore_core::types::RecordKind,
    /// The LSN of the visible version.
    pub lsn: Lsn,
    /// `true` if the visible version was `current` rather than `previous`.
    pub is_current: bool,
}
