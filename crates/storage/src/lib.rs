//! In-memory storage components for TStore: the versioned item, the
//! differential (writer-side) and consolidated (read-fast-path) maps, and
//! the aggregated pair that swaps them atomically on consolidation
//! (spec.md §2–§4.3).
//!
//! On-disk formats, the metadata table, merge, recovery, copy, and the
//! snapshot container (which pins both on-disk file metadata and evicted
//! in-memory versions) live in `tstore-durability`, which depends on this
//! crate.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod aggregated;
pub mod consolidated;
pub mod differential;
pub mod versioned_item;

pub use aggregated::{AggregatedReadResult, AggregatedState, AggregatedStoreComponent, ReadSource, SealedDelta};
pub use consolidated::{ConsolidatedReadResult, ConsolidatedStoreComponent};
pub use differential::{
    DifferentialAddError, DifferentialReadResult, DifferentialStateVersions,
    DifferentialStoreComponent, EvictedVersion,
};
pub use versioned_item::{VersionedItem, VersionedItemGuard, MAX_OFFSET};
