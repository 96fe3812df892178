//! Core types and traits shared by every TStore crate.
//!
//! This crate has no I/O and no locking of its own: it defines the vocabulary
//! (`Lsn`, `RecordKind`, `ApplyContext`, ...), the serializer/comparer seams
//! user code plugs into, the external replicator contract TStore depends on
//! (§6 of the design), and the unified error type every other crate returns.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod replicator;
pub mod traits;
pub mod types;

pub use config::{ConfigError, MergePolicyFlags, StoreConfiguration};
pub use error::{Error, Result};
pub use replicator::{OperationContext, Replicator, TryRemoveVersionResult};
pub use traits::{KeyComparer, StateSerializer};
pub use types::{ApplyContext, IsolationLevel, Lsn, ReadMode, RecordKind, Role};
