//! # TStore
//!
//! A transactional, versioned, log-structured sorted key/value store, in the
//! shape Service Fabric's `ReliableDictionary`/`ReliableConcurrentQueue`
//! replicas sit on top of: MVCC writes staged per-transaction, a sealed
//! chain of on-disk checkpoint generations consolidated and merged in the
//! background, and a `Role`-gated write path so only a primary accepts new
//! transactions while secondaries redo what the primary replicates.
//!
//! This crate is a thin facade over the workspace's real crates — it exists
//! so a consumer depends on one name (`tstore`) instead of wiring up
//! `tstore-core`, `tstore-storage`, `tstore-durability`, `tstore-concurrency`,
//! and `tstore-engine` directly. [`Store`] is the entry point; everything
//! else re-exported here is a type that appears in its method signatures.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tstore::{IsolationLevel, NaturalOrderComparer, Role, Store, StoreConfiguration};
//! use tstore::traits::BytesSerializer;
//!
//! # async fn run(replicator: Arc<dyn tstore::Replicator>) -> tstore::Result<()> {
//! let store = Store::new(
//!     "./data".into(),
//!     StoreConfiguration::default(),
//!     NaturalOrderComparer,
//!     BytesSerializer,
//!     BytesSerializer,
//!     replicator,
//! )?;
//! store.change_role(Role::Primary)?;
//!
//! let mut txn = store.create_transaction(IsolationLevel::ReadRepeatable).await?;
//! store.add(&mut txn, b"k".to_vec(), b"v".to_vec())?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Key comparer, (de)serializer, and external replicator contracts user code
/// implements to plug a key/value pair into [`Store`].
pub mod traits {
    pub use tstore_core::traits::*;
}

pub use tstore_core::config::{ConfigError, MergePolicyFlags, StoreConfiguration};
pub use tstore_core::error::{Error, Result};
pub use tstore_core::replicator::{OperationContext, Replicator, TryRemoveVersionResult};
pub use tstore_core::traits::{KeyComparer, NaturalOrderComparer, StateSerializer};
pub use tstore_core::types::{ApplyContext, IsolationLevel, Lsn, ReadMode, RecordKind, Role};

pub use tstore_concurrency::{PrimeLock, StoreTransaction, TransactionStatus, WriteOp};

pub use tstore_durability::{CopyManager, Frame, FrameKind, MetadataTable, StoreCopyStream, VolatileCopyManager, VolatileCopyStream};

pub use tstore_engine::store::{CopyReceiver, StoreEnumerator};
pub use tstore_engine::{CheckpointStats, ConsolidationManager, Store, SweepStats};
