//! `StoreTransaction`: per-transaction write-set staging and isolation
//! (spec.md §4.6).
//!
//! A transaction never touches the store's components directly. It buffers
//! every `Add`/`Update`/`Remove` into a write-set keyed by `K`, coalescing
//! repeat writes to the same key, and hands that write-set to the engine at
//! commit time once the replicator has assigned a commit LSN. Reads
//! consult the write-set first (read-your-writes) before falling through to
//! the engine's read cascade.

use std::collections::BTreeMap;

use tstore_core::types::{IsolationLevel, Lsn, RecordKind};

/// One staged write. `Insert`/`Update` carry the value to install;
/// `Delete` stages a tombstone.
#[derive(Debug, Clone)]
pub enum WriteOp<V> {
    /// Stage an insert.
    Insert(V),
    /// Stage an update.
    Update(V),
    /// Stage a delete.
    Delete,
}

impl<V> WriteOp<V> {
    /// The [`RecordKind`] this write op will install at commit.
    pub fn kind(&self) -> RecordKind {
        match self {
            WriteOp::Insert(_) => RecordKind::Inserted,
            WriteOp::Update(_) => RecordKind::Updated,
            WriteOp::Delete => RecordKind::Deleted,
        }
    }

    /// The staged value, if this op carries one.
    pub fn value(&self) -> Option<&V> {
        match self {
            WriteOp::Insert(v) | WriteOp::Update(v) => Some(v),
            WriteOp::Delete => None,
        }
    }
}

/// A write-set entry for one key (spec.md §4.6): the kind of the first
/// write staged against this key this transaction, the LSN the key was
/// read at when the write was validated against the committed state (if
/// any), and the most recently staged write, which is what actually gets
/// applied at commit.
#[derive(Debug, Clone)]
pub struct WriteSetItemContext<V> {
    /// The record kind of the first write staged for this key.
    pub first_version_kind: RecordKind,
    /// The LSN observed as current for this key when the write was staged,
    /// if the write was conditional or built on a prior read.
    pub create_lsn: Option<Lsn>,
    /// The write that will actually be applied at commit — later writes to
    /// the same key replace this, per spec.md §4.6's coalescing rule.
    pub latest_value: WriteOp<V>,
}

/// A transaction's lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Open for reads and writes.
    Active,
    /// Write-set has been handed to the engine; awaiting the replicator's
    /// commit LSN.
    Committing,
    /// Applied under a commit LSN; terminal.
    Committed,
    /// Rolled back; terminal.
    Aborted,
}

/// Per-transaction isolation and write-set staging (spec.md §4.6).
///
/// Generic over the key type `K` (must order the same way the store's
/// components do) and the value type `V` staged in the write-set.
pub struct StoreTransaction<K, V> {
    id: u64,
    isolation_level: IsolationLevel,
    visibility_lsn: Lsn,
    write_set: BTreeMap<K, WriteSetItemContext<V>>,
    status: TransactionStatus,
    /// Set once this transaction has registered a snapshot with the
    /// replicator (§4.6, §4.7) — released on commit/abort.
    snapshot_registration: Option<u64>,
}

impl<K, V> StoreTransaction<K, V>
where
    K: Ord + Clone,
{
    /// Begin a new transaction, reading at `visibility_lsn` under
    /// `isolation_level`.
    pub fn new(id: u64, isolation_level: IsolationLevel, visibility_lsn: Lsn) -> Self {
        StoreTransaction {
            id,
            isolation_level,
            visibility_lsn,
            write_set: BTreeMap::new(),
            status: TransactionStatus::Active,
            snapshot_registration: None,
        }
    }

    /// This transaction's id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The isolation level this transaction was opened with.
    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    /// The LSN this transaction's reads are pinned to (for `Snapshot`
    /// isolation) or were current as of transaction start (otherwise).
    pub fn visibility_lsn(&self) -> Lsn {
        self.visibility_lsn
    }

    /// Current lifecycle state.
    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    /// Record that the replicator has registered a snapshot for this
    /// transaction (spec.md §4.7), to be released on commit/abort.
    pub fn set_snapshot_registration(&mut self, handle: u64) {
        self.snapshot_registration = Some(handle);
    }

    /// The registered snapshot handle, if any.
    pub fn snapshot_registration(&self) -> Option<u64> {
        self.snapshot_registration
    }

    /// Read-your-writes: the most recently staged write for `key`, if any.
    pub fn read_own_write(&self, key: &K) -> Option<&WriteOp<V>> {
        self.write_set.get(key).map(|ctx| &ctx.latest_value)
    }

    /// Every key with a staged write, in key order — used by
    /// `CreateEnumerator` (spec.md §4.1) to fold the write-set into the
    /// enumerated key range before consulting committed state.
    pub fn write_set_keys(&self) -> impl Iterator<Item = &K> {
        self.write_set.keys()
    }

    /// Stage a write for `key`, coalescing with any prior write staged for
    /// the same key this transaction (spec.md §4.6: "duplicate writes on
    /// the same key coalesce; apply replaces latestValue").
    ///
    /// Must only be called on an [`TransactionStatus::Active`] transaction.
    pub fn stage(&mut self, key: K, op: WriteOp<V>, create_lsn: Option<Lsn>) {
        debug_assert_eq!(self.status, TransactionStatus::Active, "cannot stage on a non-active transaction");
        match self.write_set.get_mut(&key) {
            Some(existing) => existing.latest_value = op,
            None => {
                let first_version_kind = op.kind();
                self.write_set.insert(key, WriteSetItemContext { first_version_kind, create_lsn, latest_value: op });
            }
        }
    }

    /// `true` if no writes have been staged.
    pub fn is_write_set_empty(&self) -> bool {
        self.write_set.is_empty()
    }

    /// Number of distinct keys staged.
    pub fn write_set_len(&self) -> usize {
        self.write_set.len()
    }

    /// Mark the write-set as handed off to the engine for commit.
    pub fn mark_committing(&mut self) {
        self.status = TransactionStatus::Committing;
    }

    /// Mark the transaction committed and return its write-set in key
    /// order, ready for the engine to fold into the current differential
    /// under the assigned commit LSN.
    pub fn into_committed(mut self) -> Vec<(K, WriteSetItemContext<V>)> {
        self.status = TransactionStatus::Committed;
        std::mem::take(&mut self.write_set).into_iter().collect()
    }

    /// Abort the transaction, discarding the write-set.
    pub fn abort(&mut self) {
        self.write_set.clear();
        self.status = TransactionStatus::Aborted;
    }
}
