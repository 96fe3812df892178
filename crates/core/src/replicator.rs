//! The contract TStore depends on from its external collaborator: the
//! transactional replicator (spec.md §1, §6).
//!
//! TStore never talks to the replication wire protocol directly — it is
//! deliberately out of scope (spec.md §1). This module only captures the
//! narrow interface the core *consumes*: apply ordering, snapshot visibility
//! registration, and the version-removal handshake used by the snapshot
//! container (§4.7) to know when an evicted version is safe to drop.

use std::future::Future;
use std::pin::Pin;

use crate::error::Result;
use crate::types::{ApplyContext, Lsn};

/// An opaque token the replicator hands back from `ApplyAsync` and expects
/// to see again in `Unlock`. TStore never inspects its contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationContext(pub u64);

/// The result of asking the replicator whether a version can be removed
/// (§4.7, §6).
#[derive(Debug)]
pub struct TryRemoveVersionResult {
    /// `true` if no active snapshot needs the version; it may be dropped
    /// immediately.
    pub can_be_removed: bool,
    /// The visibility LSNs of snapshots that still need the version, when
    /// `can_be_removed` is `false`.
    pub enumeration_set: Vec<Lsn>,
    /// One completion notification per entry in `enumeration_set`, resolving
    /// when the snapshot at that visibility LSN ends. A caller that pinned
    /// the version into the snapshot container may use these to react as
    /// soon as it is safe to drop the pin, rather than polling.
    pub enumeration_completion_notifications: Vec<tokio::sync::oneshot::Receiver<()>>,
}

/// A future boxed for trait-object use, since `async fn` in traits is not
/// yet object-safe without help.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The transactional replicator's contract, as consumed by TStore (§6).
///
/// A real implementation lives in the replication engine (out of scope for
/// this crate, per spec.md §1); tests and the copy/recovery paths exercised
/// in isolation use a stub implementation.
pub trait Replicator: Send + Sync {
    /// Apply one operation at `lsn` under `apply_context`, given its
    /// metadata and redo payloads. Returns an opaque context to be released
    /// via `unlock` once the owning transaction ends.
    fn apply<'a>(
        &'a self,
        lsn: Lsn,
        apply_context: ApplyContext,
        metadata: &'a [u8],
        redo: &'a [u8],
    ) -> BoxFuture<'a, Result<Option<OperationContext>>>;

    /// Release a previously returned [`OperationContext`].
    fn unlock(&self, context: OperationContext);

    /// Register a new snapshot reader and receive its visibility LSN.
    fn register<'a>(&'a self) -> BoxFuture<'a, Result<Lsn>>;

    /// Unregister a snapshot reader previously returned by `register`.
    fn unregister(&self, visibility_lsn: Lsn);

    /// Ask whether the version at `remove_lsn` for a given key can be
    /// dropped now that `next_lsn` has superseded it.
    fn try_remove_version<'a>(
        &'a self,
        remove_lsn: Lsn,
        next_lsn: Lsn,
    ) -> BoxFuture<'a, TryRemoveVersionResult>;
}
