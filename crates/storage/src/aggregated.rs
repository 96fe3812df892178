//! `AggregatedStoreComponent`: the pair {sealed deltas, consolidated}, and
//! the read cascade over them (spec.md §2, §3).
//!
//! The live, still-writable differential is *not* part of the aggregated
//! state — it belongs to whichever engine holds it (see `tstore-engine`'s
//! `Store`). `AggregatedStoreComponent` only holds deltas that have been
//! **sealed** (closed off from further writes, pending consolidation) plus
//! the current consolidated component, and is swapped as a single atomic
//! unit when consolidation completes (spec.md §4.3 step 7), mirroring the
//! source's `ThreadSafeSPtrCache` swap (DESIGN NOTES §9) as a
//! `parking_lot::RwLock<Arc<_>>` — the idiomatic safe-Rust read-mostly
//! equivalent of an atomic shared-pointer cache.

use std::sync::Arc;

use parking_lot::RwLock;
use tstore_core::types::Lsn;

use crate::consolidated::ConsolidatedStoreComponent;
use crate::differential::DifferentialStoreComponent;

/// One sealed delta, tagged with the monotonically increasing sealing index
/// it was assigned when sealed (spec.md §3: "index is a monotonically
/// increasing sealing counter").
pub struct SealedDelta<K> {
    /// The sealing index, used to order deltas newest-to-oldest.
    pub index: u64,
    /// The sealed (no longer writable) delta itself.
    pub delta: Arc<DifferentialStoreComponent<K>>,
}

/// An immutable snapshot of {sealed deltas, consolidated}, published as one
/// unit on every swap.
pub struct AggregatedState<K> {
    /// Sealed deltas, ordered oldest-first (iterate `.rev()` for
    /// newest-first merge/read order).
    pub deltas: Vec<SealedDelta<K>>,
    /// The consolidated component as of the last successful consolidation.
    pub consolidated: Arc<ConsolidatedStoreComponent<K>>,
}

impl<K> AggregatedState<K> {
    fn empty() -> Self {
        AggregatedState {
            deltas: Vec::new(),
            consolidated: Arc::new(ConsolidatedStoreComponent::new()),
        }
    }
}

/// The pair {sealed deltas, consolidated}, swapped atomically by
/// consolidation (spec.md §2, §4.3).
pub struct AggregatedStoreComponent<K> {
    state: RwLock<Arc<AggregatedState<K>>>,
    next_seal_index: std::sync::atomic::AtomicU64,
}

impl<K> Default for AggregatedStoreComponent<K>
where
    K: Ord + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> AggregatedStoreComponent<K>
where
    K: Ord + Clone,
{
    /// An empty aggregated state.
    pub fn new() -> Self {
        AggregatedStoreComponent {
            state: RwLock::new(Arc::new(AggregatedState::empty())),
            next_seal_index: std::sync::atomic::AtomicU64::new(1),
        }
    }

    /// Construct directly from an already-recovered consolidated component
    /// (used by recovery, spec.md §4.11), with no sealed deltas.
    pub fn from_consolidated(consolidated: ConsolidatedStoreComponent<K>) -> Self {
        let comp = Self::new();
        *comp.state.write() = Arc::new(AggregatedState {
            deltas: Vec::new(),
            consolidated: Arc::new(consolidated),
        });
        comp
    }

    /// A cheap `Arc` clone of the current state, to read from without
    /// holding the lock across I/O or long iteration.
    pub fn snapshot(&self) -> Arc<AggregatedState<K>> {
        self.state.read().clone()
    }

    /// Seal `delta` (the engine's current, no-longer-writable differential)
    /// into the aggregated state, assigning it the next sealing index.
    /// Returns the assigned index.
    pub fn seal(&self, delta: Arc<DifferentialStoreComponent<K>>) -> u64 {
        let index = self
            .next_seal_index
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let mut state = self.state.write();
        let mut deltas = Vec::with_capacity(state.deltas.len() + 1);
        for d in &state.deltas {
            deltas.push(SealedDelta {
                index: d.index,
                delta: d.delta.clone(),
            });
        }
        deltas.push(SealedDelta { index, delta });
        *state = Arc::new(AggregatedState {
            deltas,
            consolidated: state.consolidated.clone(),
        });
        index
    }

    /// Number of sealed deltas currently pending consolidation.
    pub fn sealed_delta_count(&self) -> usize {
        self.state.read().deltas.len()
    }

    /// Atomically publish the result of a consolidation pass (spec.md §4.3
    /// step 7): a freshly merged consolidated component, plus any deltas
    /// that were sealed *after* the consolidation's input snapshot was
    /// taken (so concurrently-sealed deltas are not lost).
    pub fn publish_consolidated(
        &self,
        new_consolidated: ConsolidatedStoreComponent<K>,
        consolidated_up_to_index: u64,
    ) {
        let mut state = self.state.write();
        let surviving: Vec<SealedDelta<K>> = state
            .deltas
            .iter()
            .filter(|d| d.index > consolidated_up_to_index)
            .map(|d| SealedDelta {
                index: d.index,
                delta: d.delta.clone(),
            })
            .collect();
        *state = Arc::new(AggregatedState {
            deltas: surviving,
            consolidated: Arc::new(new_consolidated),
        });
    }

    /// The read cascade over sealed deltas (newest-first) and consolidated
    /// (spec.md §4.1 steps 3–4): does *not* include the live current
    /// differential, the transaction write-set, or the snapshot container —
    /// those are the engine's responsibility, checked before and after this
    /// call respectively.
    pub fn read(&self, key: &K, visibility_lsn: Lsn) -> Option<AggregatedReadResult> {
        let state = self.snapshot();
        for sealed in state.deltas.iter().rev() {
            if let Some(r) = sealed.delta.read(key, visibility_lsn) {
                return Some(AggregatedReadResult {
                    kind: r.kind,
                    lsn: r.lsn,
                    source: ReadSource::SealedDelta(sealed.index),
                });
            }
        }
        state
            .consolidated
            .read(key, visibility_lsn)
            .map(|r| AggregatedReadResult {
                kind: r.kind,
                lsn: r.lsn,
                source: ReadSource::Consolidated,
            })
    }
}

/// Where an [`AggregatedReadResult`] was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadSource {
    /// Found in a sealed delta, identified by its sealing index.
    SealedDelta(u64),
    /// Found in the consolidated component.
    Consolidated,
}

/// Result of [`AggregatedStoreComponent::read`].
#[derive(Debug, Clone, Copy)]
pub struct AggregatedReadResult {
    /// The record kind of the visible version.
    pub kind: tstore_core::types::RecordKind,
    /// The LSN of the visible version.
    pub lsn: Lsn,
    /// Which component the version was found in.
    pub source: ReadSource,
}
