//! The prime lock and `StoreTransaction` write-set staging (spec.md §4.6,
//! §5).
//!
//! Everything here is orchestration: no on-disk format, no in-memory
//! component storage. The prime lock arbitrates between concurrent applies
//! and the exclusive checkpoint/consolidation window; `StoreTransaction`
//! buffers a transaction's writes until the replicator assigns a commit LSN
//! and the engine flushes them into the live differential.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod prime_lock;
pub mod transaction;

pub use prime_lock::{PrimeLock, PrimeReadGuard, PrimeWriteGuard};
pub use transaction::{StoreTransaction, TransactionStatus, WriteOp, WriteSetItemContext};
