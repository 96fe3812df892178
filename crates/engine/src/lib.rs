//! The `Store` facade and its background passes: checkpoint, consolidation,
//! and sweep orchestration for TStore (spec.md §4).
//!
//! This crate is the only one that touches every other layer at once: it
//! drives `tstore-storage`'s in-memory components, persists through
//! `tstore-durability`'s on-disk formats, and stages transactions through
//! `tstore-concurrency`'s write-set and prime lock.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod consolidation;
pub mod store;
pub mod sweep;

pub use consolidation::ConsolidationManager;
pub use store::{CheckpointStats, Store};
pub use sweep::{SweepManager, SweepStats};
