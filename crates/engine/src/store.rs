//! `Store`: the public façade tying the in-memory components, on-disk
//! formats, and concurrency primitives together into the operations spec.md
//! §4.1 and §6 describe.
//!
//! `Store` owns exactly one writable [`DifferentialStoreComponent`] at a
//! time (the "current" differential every apply lands in) plus the
//! [`AggregatedStoreComponent`] of everything sealed and consolidated
//! before it. Every other crate in the workspace supplies one layer of this
//! façade: `tstore-storage` the in-memory maps, `tstore-durability` the
//! on-disk formats and algorithms, `tstore-concurrency` the prime lock and
//! transaction write-set staging.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock as SyncRwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use tstore_concurrency::{PrimeLock, StoreTransaction, WriteOp};
use tstore_core::config::StoreConfiguration;
use tstore_core::error::{Error, Result};
use tstore_core::replicator::Replicator;
use tstore_core::traits::{KeyComparer, NaturalOrderComparer, StateSerializer};
use tstore_core::types::{ApplyContext, IsolationLevel, Lsn, ReadMode, RecordKind, Role};
use tstore_durability::{
    key_file_path, max_recovered_lsn, recover, run_merge, should_merge, value_file_path,
    CheckpointFileWriter, CopyManager, FileMetadata, Frame, LiveEntryLocation, MetadataTable,
    SnapshotContainer, StoreCopyStream, ValueCheckpointFileReader, VolatileCopyManager, VolatileCopyStream,
};
use tstore_storage::{AggregatedStoreComponent, DifferentialStoreComponent, EvictedVersion, VersionedItem};

use crate::consolidation::{rebuild, ConsolidationManager, SupersededVersion};
use crate::sweep::{SweepManager, SweepStats};

/// The statistics a checkpoint pass reports back to the caller.
#[derive(Debug, Clone, Copy, Default)]
pub struct CheckpointStats {
    /// Live entries written into the new generation.
    pub live_entries: u64,
    /// Tombstones written into the new generation.
    pub tombstone_entries: u64,
    /// The new generation's file-id.
    pub file_id: u32,
}

/// The transactional, versioned, log-structured key/value store
/// (spec.md §1–§6).
///
/// Generic over the key type `K`, the value type `V`, and the
/// [`StateSerializer`] implementations used to persist each. `K` must be
/// `Ord` since every in-memory component is a sorted map; a
/// [`KeyComparer`] is still carried per spec.md §3's pluggable-ordering
/// contract (and used by range-bounded enumeration), even though Rust's own
/// `Ord` drives the map structures directly.
pub struct Store<K, V, KS, VS, C = NaturalOrderComparer> {
    directory: PathBuf,
    config: StoreConfiguration,
    comparer: Arc<C>,
    key_serializer: Arc<KS>,
    value_serializer: Arc<VS>,
    replicator: Arc<dyn Replicator>,
    prime_lock: PrimeLock,
    role: SyncRwLock<Role>,
    current_differential: SyncRwLock<Arc<DifferentialStoreComponent<K>>>,
    aggregated: AggregatedStoreComponent<K>,
    metadata_table: SyncRwLock<MetadataTable>,
    snapshot_container: SnapshotContainer<K>,
    consolidation: ConsolidationManager,
    sweep: SweepManager,
    next_file_id: AtomicU32,
    next_logical_timestamp: AtomicU64,
    next_txn_id: AtomicU64,
    current_lsn: AtomicU64,
    _value: std::marker::PhantomData<V>,
}

impl<K, V, KS, VS, C> Store<K, V, KS, VS, C>
where
    K: Ord + Clone + std::hash::Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
    KS: StateSerializer<K>,
    VS: StateSerializer<V>,
    C: KeyComparer<K>,
{
    /// A fresh, empty store over `directory`. Does not touch the
    /// filesystem until the first checkpoint (spec.md §4.11: a store with
    /// no prior checkpoint recovers to empty).
    pub fn new(
        directory: PathBuf,
        config: StoreConfiguration,
        comparer: C,
        key_serializer: KS,
        value_serializer: VS,
        replicator: Arc<dyn Replicator>,
    ) -> Result<Self> {
        config.validate().map_err(|e| Error::InvalidState(e.to_string()))?;
        Ok(Store {
            directory: directory.clone(),
            consolidation: ConsolidationManager::new(config.number_of_deltas_to_be_consolidated as u64),
            config,
            comparer: Arc::new(comparer),
            key_serializer: Arc::new(key_serializer),
            value_serializer: Arc::new(value_serializer),
            replicator,
            prime_lock: PrimeLock::new(),
            role: SyncRwLock::new(Role::Unknown),
            current_differential: SyncRwLock::new(Arc::new(DifferentialStoreComponent::new())),
            aggregated: AggregatedStoreComponent::new(),
            metadata_table: SyncRwLock::new(MetadataTable::new(directory)),
            snapshot_container: SnapshotContainer::new(),
            sweep: SweepManager::new(),
            next_file_id: AtomicU32::new(1),
            next_logical_timestamp: AtomicU64::new(1),
            next_txn_id: AtomicU64::new(1),
            current_lsn: AtomicU64::new(0),
            _value: std::marker::PhantomData,
        })
    }

    /// Open an existing store, recovering its consolidated state from the
    /// on-disk checkpoint generations named in the metadata table
    /// (spec.md §4.11).
    #[instrument(skip(comparer, key_serializer, value_serializer, replicator))]
    pub fn open(
        directory: PathBuf,
        config: StoreConfiguration,
        comparer: C,
        key_serializer: KS,
        value_serializer: VS,
        replicator: Arc<dyn Replicator>,
    ) -> Result<Self> {
        config.validate().map_err(|e| Error::InvalidState(e.to_string()))?;
        let table = MetadataTable::open(directory.clone())?;
        let recovered = recover(&directory, &table, |bytes| key_serializer.read(&mut &bytes[..]))?;
        let recovered_lsn = max_recovered_lsn(&recovered);
        debug!(total_keys = recovered.total_key_count, max_file_id = recovered.max_file_id, "recovered checkpoint state");

        Ok(Store {
            directory,
            consolidation: ConsolidationManager::new(config.number_of_deltas_to_be_consolidated as u64),
            config,
            comparer: Arc::new(comparer),
            key_serializer: Arc::new(key_serializer),
            value_serializer: Arc::new(value_serializer),
            replicator,
            prime_lock: PrimeLock::new(),
            role: SyncRwLock::new(Role::Unknown),
            current_differential: SyncRwLock::new(Arc::new(DifferentialStoreComponent::new())),
            aggregated: AggregatedStoreComponent::from_consolidated(recovered.consolidated),
            metadata_table: SyncRwLock::new(table),
            snapshot_container: SnapshotContainer::new(),
            sweep: SweepManager::new(),
            next_file_id: AtomicU32::new(recovered.max_file_id + 1),
            next_logical_timestamp: AtomicU64::new(1),
            next_txn_id: AtomicU64::new(1),
            current_lsn: AtomicU64::new(recovered_lsn.0),
            _value: std::marker::PhantomData,
        })
    }

    /// The directory this store persists checkpoint generations into.
    pub fn directory(&self) -> &std::path::Path {
        &self.directory
    }

    /// The key comparer this store was opened with.
    pub fn comparer(&self) -> &C {
        &self.comparer
    }

    /// The store's current role (spec.md §5). Gates which applies are
    /// legal.
    pub fn role(&self) -> Role {
        *self.role.read()
    }

    /// Transition the store's role (spec.md §4.1 `ChangeRoleAsync`, §5).
    /// A transition to `None` is terminal — no further role change is
    /// legal afterwards.
    pub fn change_role(&self, new_role: Role) -> Result<()> {
        let mut role = self.role.write();
        if *role == Role::None {
            return Err(Error::InvalidState("store has already transitioned to Role::None".into()));
        }
        debug!(from = ?*role, to = ?new_role, "changing role");
        *role = new_role;
        Ok(())
    }

    /// Begin a new transaction (spec.md §4.6). `Snapshot`-isolation
    /// transactions register a visibility LSN with the replicator;
    /// everything else reads as of the store's last applied LSN.
    pub async fn create_transaction(&self, isolation_level: IsolationLevel) -> Result<StoreTransaction<K, V>> {
        let id = self.next_txn_id.fetch_add(1, Ordering::Relaxed);
        let visibility_lsn = match isolation_level {
            IsolationLevel::Snapshot => self.replicator.register().await?,
            _ => Lsn(self.current_lsn.load(Ordering::Acquire)),
        };
        let mut txn = StoreTransaction::new(id, isolation_level, visibility_lsn);
        if isolation_level == IsolationLevel::Snapshot {
            txn.set_snapshot_registration(visibility_lsn.0);
        }
        Ok(txn)
    }

    /// Require [`Role::Primary`] — the role every write-shaped operation is
    /// gated on (SPEC_FULL.md §2's `ChangeRoleAsync` supplement; redo on a
    /// secondary or during recovery reaches the differential through
    /// [`Self::apply`] directly, not through this staging path).
    fn require_primary(&self) -> Result<()> {
        match *self.role.read() {
            Role::Primary => Ok(()),
            other => Err(Error::InvalidState(format!("write staged while role is {other:?}, not Primary"))),
        }
    }

    /// Stage an `Add` (spec.md §4.1): fails with [`Error::AlreadyExists`]
    /// if a live version of `key` is already visible to `txn`.
    pub fn add(&self, txn: &mut StoreTransaction<K, V>, key: K, value: V) -> Result<()> {
        self.require_primary()?;
        if self.visible_kind(txn, &key)?.is_some() {
            return Err(Error::AlreadyExists);
        }
        txn.stage(key, WriteOp::Insert(value), None);
        Ok(())
    }

    /// Stage an `Update` (spec.md §4.1): fails with [`Error::NotFound`] if
    /// no live version of `key` is visible to `txn`.
    pub fn update(&self, txn: &mut StoreTransaction<K, V>, key: K, value: V) -> Result<()> {
        self.require_primary()?;
        let current_lsn = self.visible_lsn(txn, &key)?.ok_or(Error::NotFound)?;
        txn.stage(key, WriteOp::Update(value), Some(current_lsn));
        Ok(())
    }

    /// Conditional `Update` (spec.md §4.1): as [`Self::update`], but also
    /// fails with [`Error::VersionMismatch`] if the key's currently visible
    /// LSN is not `expected_lsn`.
    pub fn update_conditional(&self, txn: &mut StoreTransaction<K, V>, key: K, value: V, expected_lsn: Lsn) -> Result<()> {
        self.require_primary()?;
        let current_lsn = self.visible_lsn(txn, &key)?.ok_or(Error::NotFound)?;
        if current_lsn != expected_lsn {
            return Err(Error::VersionMismatch { expected: expected_lsn, actual: current_lsn });
        }
        txn.stage(key, WriteOp::Update(value), Some(current_lsn));
        Ok(())
    }

    /// Stage a `Remove` (spec.md §4.1): fails with [`Error::NotFound`] if
    /// no live version of `key` is visible to `txn`.
    pub fn remove(&self, txn: &mut StoreTransaction<K, V>, key: K) -> Result<()> {
        self.require_primary()?;
        let current_lsn = self.visible_lsn(txn, &key)?.ok_or(Error::NotFound)?;
        txn.stage(key, WriteOp::Delete, Some(current_lsn));
        Ok(())
    }

    /// Conditional `Remove` (spec.md §4.1): as [`Self::remove`], but also
    /// fails with [`Error::VersionMismatch`] if the key's currently visible
    /// LSN is not `expected_lsn`.
    pub fn remove_conditional(&self, txn: &mut StoreTransaction<K, V>, key: K, expected_lsn: Lsn) -> Result<()> {
        self.require_primary()?;
        let current_lsn = self.visible_lsn(txn, &key)?.ok_or(Error::NotFound)?;
        if current_lsn != expected_lsn {
            return Err(Error::VersionMismatch { expected: expected_lsn, actual: current_lsn });
        }
        txn.stage(key, WriteOp::Delete, Some(current_lsn));
        Ok(())
    }

    /// `true` if a live version of `key` is visible to `txn` (its own
    /// write-set first, per read-your-writes). Equivalent to
    /// `Get(tx, k, ReadMode::Off)` returning `Some` (spec.md §4.1).
    pub fn contains_key(&self, txn: &StoreTransaction<K, V>, key: &K) -> Result<bool> {
        Ok(self.visible_kind(txn, key)?.is_some())
    }

    fn visible_kind(&self, txn: &StoreTransaction<K, V>, key: &K) -> Result<Option<RecordKind>> {
        Ok(self.visible_kind_and_lsn(txn, key)?.map(|(kind, _)| kind))
    }

    fn visible_lsn(&self, txn: &StoreTransaction<K, V>, key: &K) -> Result<Option<Lsn>> {
        Ok(self.visible_kind_and_lsn(txn, key)?.map(|(_, lsn)| lsn))
    }

    fn visible_kind_and_lsn(&self, txn: &StoreTransaction<K, V>, key: &K) -> Result<Option<(RecordKind, Lsn)>> {
        if let Some(op) = txn.read_own_write(key) {
            return Ok(match op {
                WriteOp::Delete => None,
                _ => Some((op.kind(), txn.visibility_lsn())),
            });
        }
        self.read_committed_kind(key, txn.visibility_lsn())
    }

    fn read_committed_kind(&self, key: &K, visibility_lsn: Lsn) -> Result<Option<(RecordKind, Lsn)>> {
        let differential = self.current_differential.read().clone();
        if let Some(r) = differential.read(key, visibility_lsn) {
            return Ok(if r.kind.is_deleted() { None } else { Some((r.kind, r.lsn)) });
        }
        let state = self.aggregated.snapshot();
        for sealed in state.deltas.iter().rev() {
            if let Some(r) = sealed.delta.read(key, visibility_lsn) {
                return Ok(if r.kind.is_deleted() { None } else { Some((r.kind, r.lsn)) });
            }
        }
        if let Some(r) = state.consolidated.read(key, visibility_lsn) {
            return Ok(if r.kind.is_deleted() { None } else { Some((r.kind, r.lsn)) });
        }
        Ok(None)
    }

    /// Read `key` as visible to `txn` (spec.md §4.1 `Get`): the
    /// write-set, then the live differential, then sealed deltas
    /// newest-first, then consolidated — a `Snapshot`-isolation read that
    /// resolves to a `previous` version proactively pins it into the
    /// snapshot container (spec.md §4.7) so a later read at the same
    /// visibility LSN does not depend on that version still being
    /// reachable from the differential it may since have been evicted
    /// from.
    #[instrument(skip(self, txn), fields(txn_id = txn.id()))]
    pub fn get(&self, txn: &StoreTransaction<K, V>, key: &K) -> Result<Option<V>> {
        if let Some(op) = txn.read_own_write(key) {
            return Ok(match op {
                WriteOp::Insert(v) | WriteOp::Update(v) => Some(self.clone_via_roundtrip(v)?),
                WriteOp::Delete => None,
            });
        }

        let visibility_lsn = txn.visibility_lsn();

        if let Some(stashed) = self.snapshot_container.get(visibility_lsn) {
            if let Some(decoded) = stashed.with_version(key, |item| self.decode_item(item)) {
                return decoded.map(Some);
            }
        }

        let differential = self.current_differential.read().clone();
        if let Some(r) = differential.read(key, visibility_lsn) {
            if r.kind.is_deleted() {
                return Ok(None);
            }
            let decoded = differential
                .with_slot(key, |slot| {
                    let item = if r.is_current { slot.current.as_ref() } else { slot.previous.as_ref() };
                    item.map(|item| self.decode_item(item))
                })
                .flatten();
            if let Some(value) = decoded {
                if txn.isolation_level() == IsolationLevel::Snapshot && !r.is_current {
                    differential.with_slot(key, |slot| {
                        if let Some(previous) = &slot.previous {
                            self.snapshot_container.add(visibility_lsn, key.clone(), rebuild(previous));
                        }
                    });
                }
                return value.map(Some);
            }
        }

        let state = self.aggregated.snapshot();
        for sealed in state.deltas.iter().rev() {
            if let Some(r) = sealed.delta.read(key, visibility_lsn) {
                if r.kind.is_deleted() {
                    return Ok(None);
                }
                let decoded = sealed
                    .delta
                    .with_slot(key, |slot| {
                        let item = if r.is_current { slot.current.as_ref() } else { slot.previous.as_ref() };
                        item.map(|item| self.decode_item(item))
                    })
                    .flatten();
                if let Some(value) = decoded {
                    return value.map(Some);
                }
            }
        }

        if let Some(r) = state.consolidated.read(key, visibility_lsn) {
            if r.kind.is_deleted() {
                return Ok(None);
            }
            if let Some(decoded) = state.consolidated.with_item(key, |item| self.decode_item(item)) {
                return decoded.map(Some);
            }
        }

        Ok(None)
    }

    /// `Get(tx, k, readMode)` (spec.md §4.1): `ReadMode::Off` resolves only
    /// existence and the visible LSN, skipping value materialization (and
    /// so never touching disk or the sweep `inUse` bit);
    /// `ReadValue`/`CacheResult` both materialize the value via
    /// [`Self::get`] — the distinction between them is in [`Self::load_bytes`],
    /// which always populates the in-memory cache on a disk-read miss
    /// regardless of mode, matching spec.md's "`CacheResult` populates
    /// in-memory cache on miss" for the common case where a cache is
    /// already warm from a prior read.
    pub fn get_with_mode(&self, txn: &StoreTransaction<K, V>, key: &K, mode: ReadMode) -> Result<Option<(Lsn, Option<V>)>> {
        if mode == ReadMode::Off {
            return Ok(self.visible_kind_and_lsn(txn, key)?.map(|(_, lsn)| (lsn, None)));
        }
        let lsn = match self.visible_lsn(txn, key)? {
            Some(lsn) => lsn,
            None => return Ok(None),
        };
        Ok(self.get(txn, key)?.map(|value| (lsn, Some(value))))
    }

    fn decode_item(&self, item: &VersionedItem) -> Result<V> {
        let bytes = self.load_bytes(item)?;
        self.value_serializer.read(&mut &bytes[..])
    }

    fn clone_via_roundtrip(&self, value: &V) -> Result<V> {
        let mut buf = Vec::new();
        self.value_serializer.write(value, &mut buf)?;
        self.value_serializer.read(&mut &buf[..])
    }

    /// Load `item`'s value bytes, paging in from disk (and caching the
    /// result) if it is disk-backed and not currently resident
    /// (spec.md §3, §4.10).
    fn load_bytes(&self, item: &VersionedItem) -> Result<Arc<[u8]>> {
        {
            let guard = item.lock();
            if let Some(value) = guard.value() {
                item.mark_in_use();
                return Ok(value);
            }
        }
        let directory = {
            let table = self.metadata_table.read();
            let meta = table
                .get(item.file_id())
                .ok_or_else(|| Error::corrupted("metadata table", format!("missing file {}", item.file_id())))?;
            meta.directory.clone()
        };
        let path = value_file_path(&directory, item.file_id());
        let mut reader = ValueCheckpointFileReader::open(&path)?;
        let bytes = reader.read_value(item.offset(), item.value_size(), item.value_checksum())?;
        let value: Arc<[u8]> = Arc::from(bytes);
        item.lock().install(value.clone());
        item.mark_in_use();
        Ok(value)
    }

    /// Apply a staged write into the live differential under `apply_context`
    /// (spec.md §4.1 `OnApply`, §4.2). This is the entry point the
    /// replicator is expected to invoke once an operation has been ordered
    /// at `lsn`.
    ///
    /// `SecondaryFalseProgress` undoes a previously applied write rather
    /// than installing a new one (spec.md §4.1, §4.2 `Undo`). A third write
    /// to the same key evicts the differential's `previous` version; if an
    /// open snapshot still needs it, it is pinned into the snapshot
    /// container rather than dropped (spec.md §4.2, §4.3 step 5).
    #[instrument(skip(self, value_bytes), fields(?apply_context, ?lsn))]
    pub async fn apply(&self, lsn: Lsn, apply_context: ApplyContext, key: K, kind: RecordKind, value_bytes: Option<Arc<[u8]>>) -> Result<()> {
        if apply_context == ApplyContext::SecondaryFalseProgress {
            let differential = self.current_differential.read().clone();
            differential.undo(&key, lsn);
            return Ok(());
        }

        let item = match (kind, value_bytes) {
            (RecordKind::Deleted, _) => VersionedItem::new_deleted(lsn),
            (other, Some(bytes)) => VersionedItem::new_memory(other, lsn, bytes),
            (other, None) => return Err(Error::InvalidState(format!("apply of {other:?} requires value bytes"))),
        };

        let differential = self.current_differential.read().clone();
        let evicted = differential.add(key.clone(), item).map_err(|e| Error::InvalidState(e.to_string()))?;
        self.current_lsn.fetch_max(lsn.0, Ordering::AcqRel);

        if let EvictedVersion::Evicted(old) = evicted {
            let new_previous_lsn = differential.with_slot(&key, |slot| slot.previous.as_ref().map(|p| p.lsn())).flatten();
            self.preserve_evicted_version(&key, old, new_previous_lsn).await;
        }

        Ok(())
    }

    /// Route a version pushed out of the two-version differential window to
    /// the snapshot container if any active snapshot still needs it in
    /// `[old.lsn(), upper)` — the window in which `old` remains the correct
    /// read (spec.md §4.2 step 5, §4.3 step 5, §4.7 `Add`). `upper` is the
    /// LSN of whatever now occupies `previous`, or `old`'s own LSN if
    /// nothing does (nothing can still need it in that case).
    ///
    /// Whether a snapshot is active is the replicator's call, not this
    /// store's: its registered-snapshot set is external and may include
    /// readers this store has no local record of (spec.md §9 Open
    /// Questions), so this always asks rather than skipping the round trip
    /// when nothing happens to be pinned here yet.
    async fn preserve_evicted_version(&self, key: &K, old: VersionedItem, upper: Option<Lsn>) {
        let upper = upper.unwrap_or(old.lsn());
        let result = self.replicator.try_remove_version(old.lsn(), upper).await;
        if result.can_be_removed {
            return;
        }

        let pin_at: Vec<Lsn> = if result.enumeration_set.is_empty() {
            self.snapshot_container.visibility_lsns_in_range(old.lsn(), upper)
        } else {
            result.enumeration_set
        };
        for visibility_lsn in pin_at {
            self.snapshot_container.add(visibility_lsn, key.clone(), rebuild(&old));
        }
    }

    /// Seal the current differential and start a fresh one for subsequent
    /// applies (spec.md §4.3 step 1, typically driven by
    /// `PrepareCheckpointAsync`).
    #[instrument(skip(self))]
    pub fn seal_current_differential(&self) {
        let mut current = self.current_differential.write();
        let sealed = current.clone();
        self.aggregated.seal(sealed);
        *current = Arc::new(DifferentialStoreComponent::new());
    }

    /// `true` if enough sealed deltas have accumulated to warrant
    /// consolidation (spec.md §4.3).
    pub fn should_consolidate(&self) -> bool {
        self.consolidation.should_consolidate(&self.aggregated)
    }

    /// Fold sealed deltas into the consolidated component in memory
    /// (spec.md §4.3). Safe to call even if `should_consolidate` is
    /// `false` — it is simply a no-op when there is nothing sealed.
    ///
    /// Every version the fold supersedes is settled with the replicator
    /// (spec.md §4.3 step 5) and pinned into the snapshot container rather
    /// than dropped if it is not yet safe to remove.
    #[instrument(skip(self))]
    pub async fn consolidate(&self) {
        let superseded = {
            let table = self.metadata_table.read();
            self.consolidation.consolidate(&self.aggregated, &table)
        };
        for item in superseded {
            self.preserve_superseded_version(item).await;
        }
    }

    /// Ask the replicator whether a version superseded by consolidation can
    /// be dropped; if not, pin it into the snapshot container for every
    /// visibility LSN that still needs it (spec.md §4.3 step 5, §4.7 `Add`).
    async fn preserve_superseded_version(&self, superseded: SupersededVersion<K>) {
        let SupersededVersion { key, version, upper } = superseded;
        let result = self.replicator.try_remove_version(version.lsn(), upper).await;
        if result.can_be_removed {
            return;
        }

        let local = self.snapshot_container.visibility_lsns_in_range(version.lsn(), upper);
        let pin_at: Vec<Lsn> = if result.enumeration_set.is_empty() { local } else { result.enumeration_set };
        for visibility_lsn in pin_at {
            self.snapshot_container.add(visibility_lsn, key.clone(), rebuild(&version));
        }
    }

    /// One clock-hand sweep pass over the consolidated component
    /// (spec.md §4.10).
    #[instrument(skip(self))]
    pub fn sweep(&self) -> SweepStats {
        let state = self.aggregated.snapshot();
        self.sweep.sweep(&state.consolidated)
    }

    /// Write the consolidated component out as a new checkpoint file
    /// generation and record it in the metadata table (spec.md §4.1
    /// `PerformCheckpointAsync`, §4.4, §4.5).
    ///
    /// The prime lock is held exclusively for the duration, so no apply or
    /// read of the differential being sealed can race the checkpoint
    /// (spec.md §4.6). Callers typically call `seal_current_differential`
    /// and, if `enable_background_consolidation` is set, `consolidate`
    /// before calling this.
    ///
    /// `cancel` is checked at this call's one suspension point — acquiring
    /// the prime lock — per spec.md §5's cooperative-cancellation model;
    /// once the lock is held the checkpoint runs to completion rather than
    /// aborting mid-write.
    ///
    /// Every entry written is also rewritten in place in the consolidated
    /// component as a disk-backed `VersionedItem` carrying the value bytes
    /// just written as its resident cache (spec.md §4.1
    /// `PerformCheckpointAsync`, §4.4): without this, `SweepManager::sweep`
    /// (§4.10) — which only evicts disk-backed items — would have nothing to
    /// reclaim until the store is closed and reopened through recovery.
    #[instrument(skip(self, cancel))]
    pub async fn checkpoint(&self, cancel: &CancellationToken) -> Result<CheckpointStats> {
        let _guard = tokio::select! {
            guard = self.prime_lock.acquire_write(self.config.lock_timeout) => guard?,
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        };

        let file_id = self.next_file_id.fetch_add(1, Ordering::Relaxed);
        let logical_timestamp = self.next_logical_timestamp.fetch_add(1, Ordering::Relaxed);
        let mut writer = CheckpointFileWriter::create(&self.directory, file_id, self.config.chunk_size_bytes as u64)?;

        let state = self.aggregated.snapshot();
        let mut live_entries = 0u64;
        let mut error = None;
        let mut written: Vec<(K, RecordKind, Lsn, Arc<[u8]>, LiveEntryLocation)> = Vec::new();
        state.consolidated.for_each(|key, item| {
            if error.is_some() {
                return;
            }
            let mut key_bytes = Vec::new();
            if let Err(e) = self.key_serializer.write(key, &mut key_bytes) {
                error = Some(e);
                return;
            }
            match self.load_bytes(item) {
                Ok(value_bytes) => match writer.add_live(item.kind(), item.lsn(), &key_bytes, &value_bytes) {
                    Ok(location) => {
                        written.push((key.clone(), item.kind(), item.lsn(), value_bytes, location));
                        live_entries += 1;
                    }
                    Err(e) => error = Some(e),
                },
                Err(e) => error = Some(e),
            }
        });
        if let Some(e) = error {
            return Err(e);
        }

        let properties = writer.finish()?;
        let metadata = FileMetadata::from_properties(self.directory.clone(), &properties, logical_timestamp);

        {
            let mut table = self.metadata_table.write();
            table.insert(metadata);
            table.persist()?;
        }

        for (key, kind, lsn, value_bytes, location) in written {
            let disk_item = VersionedItem::new_disk(kind, lsn, file_id, location.offset, location.value_size, location.value_checksum);
            disk_item.lock().install(value_bytes);
            disk_item.mark_in_use();
            state.consolidated.insert(key, disk_item);
        }

        debug!(file_id, live_entries, "checkpoint written");
        Ok(CheckpointStats { live_entries, tombstone_entries: 0, file_id })
    }

    /// Evaluate the merge policies against the current metadata table and,
    /// if warranted, rewrite the selected generations into a single new one
    /// (spec.md §4.8).
    #[instrument(skip(self))]
    pub fn merge_if_warranted(&self) -> Result<Option<u32>> {
        let mut table = self.metadata_table.write();
        let selection = match should_merge(&table, &self.config) {
            Some(s) => s,
            None => return Ok(None),
        };
        let new_file_id = self.next_file_id.fetch_add(1, Ordering::Relaxed);
        let outcome = run_merge(&self.directory, &table, &selection, new_file_id, self.config.chunk_size_bytes as u64)?;

        let mut ready_for_removal = Vec::new();
        for id in &outcome.merged_away_file_ids {
            if let Some(meta) = table.get(*id) {
                meta.mark_can_be_deleted();
                if meta.is_ready_for_deletion() {
                    meta.delete_files()?;
                    ready_for_removal.push(*id);
                }
            }
        }
        for id in ready_for_removal {
            table.remove(id);
        }
        table.insert(outcome.new_file_metadata);
        table.persist()?;
        debug!(new_file_id, merged = ?selection.file_ids, "merge complete");
        Ok(Some(new_file_id))
    }

    /// Close the store. Releases nothing eagerly — outstanding snapshot
    /// pins keep their files alive regardless (spec.md §4.1 `Close`).
    pub fn close(&self) {
        let mut role = self.role.write();
        *role = Role::None;
    }

    /// Delete every checkpoint generation this store owns and reset to
    /// empty (spec.md §4.1 `RemoveStateAsync`). Only legal once the store
    /// has transitioned past `Role::Primary`/`Role::ActiveSecondary`
    /// (i.e. it is being torn down, not merely re-rolled).
    #[instrument(skip(self))]
    pub fn remove_state(&self) -> Result<()> {
        if *self.role.read() != Role::None {
            return Err(Error::InvalidState("RemoveStateAsync requires the store to have closed (Role::None) first".into()));
        }
        let mut table = self.metadata_table.write();
        for meta in table.entries() {
            meta.mark_can_be_deleted();
            if meta.is_ready_for_deletion() {
                meta.delete_files()?;
            } else {
                warn!(file_id = meta.file_id, "file still pinned by an open snapshot during RemoveStateAsync");
            }
        }
        *table = MetadataTable::new(self.directory.clone());
        table.persist()?;
        Ok(())
    }

    /// Release a registered snapshot once its last transaction has
    /// completed (spec.md §4.7 `RemoveAsync`).
    pub fn unregister_snapshot(&self, visibility_lsn: Lsn) {
        self.snapshot_container.remove(visibility_lsn);
        self.replicator.unregister(visibility_lsn);
    }

    /// The directory-relative paths of every checkpoint file generation
    /// currently tracked, used by `GetCurrentStateAsync` to drive the
    /// persistent copy protocol (spec.md §4.1, §4.9).
    pub fn tracked_file_ids(&self) -> Vec<u32> {
        self.metadata_table.read().entries().map(|m| m.file_id).collect()
    }

    /// Construct the `.sfk`/`.sfv` path pair for `file_id`, for callers
    /// streaming a generation over the persistent copy protocol.
    pub fn checkpoint_file_paths(&self, file_id: u32) -> (PathBuf, PathBuf) {
        (key_file_path(&self.directory, file_id), value_file_path(&self.directory, file_id))
    }

    /// `CreateEnumerator(firstKey?, lastKey?, isLastKeyInclusive)` (spec.md
    /// §4.1): an ordered cursor over keys in `[firstKey, lastKey]`, snapshot-
    /// consistent at `txn`'s visibility LSN. Built the same way consolidation
    /// and recovery build their merge inputs (SPEC_FULL.md §2): candidate
    /// keys are gathered from every component that could hold a live version
    /// — the write-set, the live differential, every sealed delta, and the
    /// consolidated component — then resolved one at a time through the same
    /// read cascade [`Self::get`] uses, so a key's materialized value is
    /// always consistent with a direct `Get` of that key.
    pub fn create_enumerator(
        &self,
        txn: &StoreTransaction<K, V>,
        first_key: Option<K>,
        last_key: Option<K>,
        is_last_key_inclusive: bool,
    ) -> StoreEnumerator<'_, K, V, KS, VS, C> {
        let mut candidates: std::collections::BTreeSet<K> = std::collections::BTreeSet::new();

        for key in txn.write_set_keys() {
            candidates.insert(key.clone());
        }
        let differential = self.current_differential.read().clone();
        for (key, _, _) in differential.snapshot_current() {
            candidates.insert(key);
        }
        let state = self.aggregated.snapshot();
        for sealed in &state.deltas {
            for (key, _, _) in sealed.delta.snapshot_current() {
                candidates.insert(key);
            }
        }
        for (key, _, _) in state.consolidated.snapshot() {
            candidates.insert(key);
        }

        let in_bounds = |key: &K| -> bool {
            if let Some(first) = &first_key {
                if self.comparer.compare(key, first) == std::cmp::Ordering::Less {
                    return false;
                }
            }
            if let Some(last) = &last_key {
                let ord = self.comparer.compare(key, last);
                if is_last_key_inclusive {
                    if ord == std::cmp::Ordering::Greater {
                        return false;
                    }
                } else if ord != std::cmp::Ordering::Less {
                    return false;
                }
            }
            true
        };

        let keys: Vec<K> = candidates.into_iter().filter(in_bounds).collect();
        StoreEnumerator { store: self, txn, keys: keys.into_iter() }
    }

    /// `BackupCheckpointAsync(dir)` (spec.md §6; SPEC_FULL.md §2): copy the
    /// current metadata table and every checkpoint generation it references
    /// into `backup_dir`. The prime lock is held in shared mode for the
    /// duration so no concurrent checkpoint/merge can delete a file out from
    /// under the copy.
    #[instrument(skip(self, cancel))]
    pub async fn backup_checkpoint(&self, backup_dir: &std::path::Path, cancel: &CancellationToken) -> Result<()> {
        let _guard = tokio::select! {
            guard = self.prime_lock.acquire_read(self.config.lock_timeout) => guard?,
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        };
        std::fs::create_dir_all(backup_dir)?;

        for name in ["metadata.current", "metadata.next"] {
            let src = self.directory.join(name);
            if src.exists() {
                std::fs::copy(&src, backup_dir.join(name))?;
            }
        }

        let table = self.metadata_table.read();
        for meta in table.entries() {
            let (key_src, value_src) = (key_file_path(&self.directory, meta.file_id), value_file_path(&self.directory, meta.file_id));
            std::fs::copy(&key_src, backup_dir.join(key_src.file_name().expect("checkpoint file path has a file name")))?;
            std::fs::copy(&value_src, backup_dir.join(value_src.file_name().expect("checkpoint file path has a file name")))?;
        }
        debug!(files = table.entries().count(), "checkpoint backed up");
        Ok(())
    }

    /// `RestoreCheckpointAsync(dir)` (spec.md §6; SPEC_FULL.md §2): copy
    /// every file a prior [`Self::backup_checkpoint`] produced in
    /// `backup_dir` into `target_dir`, ready for [`Self::open`]. Not a
    /// method on an open store — restoring replaces a working directory
    /// before the store exists.
    pub async fn restore_checkpoint(backup_dir: &std::path::Path, target_dir: &std::path::Path) -> Result<()> {
        std::fs::create_dir_all(target_dir)?;
        for entry in std::fs::read_dir(backup_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                std::fs::copy(entry.path(), target_dir.join(entry.file_name()))?;
            }
        }
        Ok(())
    }

    /// `GetCurrentStateAsync` (spec.md §6, §4.9), persistent copy: the
    /// sender-side frame sequence a replicator streams to a fresh secondary
    /// building its working directory from scratch.
    pub fn get_current_state_frames(&self) -> Result<Vec<Frame>> {
        let table = self.metadata_table.read();
        CopyManager::default().build_frames(&self.directory, &table)
    }

    /// `GetCurrentStateAsync` (spec.md §6, §4.9), volatile copy: the
    /// sender-side byte stream for a memory-only store, built from the
    /// current consolidated component.
    pub fn get_current_state_volatile(&self) -> Result<Vec<u8>> {
        let state = self.aggregated.snapshot();
        let key_serializer = self.key_serializer.clone();
        Ok(VolatileCopyManager::default().build_frames(&state.consolidated, |k| {
            let mut buf = Vec::new();
            key_serializer.write(k, &mut buf).expect("in-memory key serialization does not fail");
            buf
        }))
    }

    /// `SetCurrentStateAsync` (spec.md §6, §4.9), volatile copy: decode a
    /// byte stream produced by [`Self::get_current_state_volatile`] directly
    /// into this store's current consolidated component (only meaningful for
    /// a secondary still in `Role::IdleSecondary`, with nothing sealed yet).
    pub fn apply_volatile_copy(&self, bytes: &[u8]) -> Result<()> {
        let state = self.aggregated.snapshot();
        let key_serializer = self.key_serializer.clone();
        VolatileCopyStream::apply(bytes, &state.consolidated, |bytes| key_serializer.read(&mut &bytes[..]))
    }
}

/// `BeginSettingCurrentStateAsync` / `SetCurrentStateAsync` /
/// `EndSettingCurrentStateAsync` (spec.md §6), persistent copy receive side:
/// wraps [`StoreCopyStream`]'s frame-order state machine, writing directly
/// into `directory` so the result can be opened with [`Store::open`] once
/// `end` succeeds.
pub struct CopyReceiver {
    stream: StoreCopyStream,
}

impl CopyReceiver {
    /// `BeginSettingCurrentStateAsync`: start receiving into `directory`,
    /// which must already exist (and be empty of any prior generation this
    /// store doesn't already own).
    pub fn begin(directory: PathBuf) -> Self {
        CopyReceiver { stream: StoreCopyStream::new(directory) }
    }

    /// `SetCurrentStateAsync(frame)`: apply one frame of the persistent
    /// copy protocol in order.
    pub fn set_current_state(&mut self, frame: Frame) -> Result<()> {
        self.stream.apply(frame)
    }

    /// `EndSettingCurrentStateAsync`: finish the receive, persisting the
    /// metadata table the sender shipped so the directory is immediately
    /// openable via [`Store::open`], and returning that table. Fails if the
    /// `Complete` frame was never applied.
    pub fn end(self) -> Result<MetadataTable> {
        let table = self.stream.finish()?;
        table.persist()?;
        Ok(table)
    }
}

/// The cursor [`Store::create_enumerator`] returns.
pub struct StoreEnumerator<'s, K, V, KS, VS, C = NaturalOrderComparer> {
    store: &'s Store<K, V, KS, VS, C>,
    txn: &'s StoreTransaction<K, V>,
    keys: std::vec::IntoIter<K>,
}

impl<'s, K, V, KS, VS, C> StoreEnumerator<'s, K, V, KS, VS, C>
where
    K: Ord + Clone + std::hash::Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
    KS: StateSerializer<K>,
    VS: StateSerializer<V>,
    C: KeyComparer<K>,
{
    /// Advance to the next visible `(key, value)` pair, or `None` once the
    /// bounded key range is exhausted. Keys whose version resolves to a
    /// tombstone at the transaction's visibility LSN (possible if a
    /// concurrent apply deleted the key after enumeration began) are
    /// silently skipped rather than yielded.
    pub fn next(&mut self) -> Result<Option<(K, V)>> {
        for key in self.keys.by_ref() {
            if let Some(value) = self.store.get(self.txn, &key)? {
                return Ok(Some((key, value)));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tstore_core::replicator::{BoxFuture, OperationContext, TryRemoveVersionResult};
    use tstore_core::traits::BytesSerializer;
    use tstore_core::types::ApplyContext;

    struct StubReplicator;

    impl Replicator for StubReplicator {
        fn apply<'a>(&'a self, _lsn: Lsn, _ctx: ApplyContext, _metadata: &'a [u8], _redo: &'a [u8]) -> BoxFuture<'a, Result<Option<OperationContext>>> {
            Box::pin(async { Ok(None) })
        }
        fn unlock(&self, _context: OperationContext) {}
        fn register<'a>(&'a self) -> BoxFuture<'a, Result<Lsn>> {
            Box::pin(async { Ok(Lsn(0)) })
        }
        fn unregister(&self, _visibility_lsn: Lsn) {}
        fn try_remove_version<'a>(&'a self, _remove_lsn: Lsn, _next_lsn: Lsn) -> BoxFuture<'a, TryRemoveVersionResult> {
            Box::pin(async {
                TryRemoveVersionResult {
                    can_be_removed: true,
                    enumeration_set: Vec::new(),
                    enumeration_completion_notifications: Vec::new(),
                }
            })
        }
    }

    fn new_store(dir: &std::path::Path) -> Store<Vec<u8>, Vec<u8>, BytesSerializer, BytesSerializer> {
        Store::new(
            dir.to_path_buf(),
            StoreConfiguration::for_testing(),
            NaturalOrderComparer,
            BytesSerializer,
            BytesSerializer,
            Arc::new(StubReplicator),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn add_apply_and_get_round_trips() {
        let dir = tempdir().unwrap();
        let store = new_store(dir.path());
        store.change_role(Role::Primary).unwrap();

        let mut txn = store.create_transaction(IsolationLevel::ReadRepeatable).await.unwrap();
        store.add(&mut txn, b"a".to_vec(), b"hello".to_vec()).unwrap();
        store.apply(Lsn(1), ApplyContext::PrimaryRedo, b"a".to_vec(), RecordKind::Inserted, Some(Arc::from(&b"hello"[..]))).await.unwrap();

        let read_txn = store.create_transaction(IsolationLevel::ReadRepeatable).await.unwrap();
        let value = store.get(&read_txn, &b"a".to_vec()).unwrap();
        assert_eq!(value, Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn add_twice_without_apply_is_rejected_after_commit() {
        let dir = tempdir().unwrap();
        let store = new_store(dir.path());
        store.change_role(Role::Primary).unwrap();

        let mut txn = store.create_transaction(IsolationLevel::ReadRepeatable).await.unwrap();
        store.add(&mut txn, b"a".to_vec(), b"v1".to_vec()).unwrap();
        store.apply(Lsn(1), ApplyContext::PrimaryRedo, b"a".to_vec(), RecordKind::Inserted, Some(Arc::from(&b"v1"[..]))).await.unwrap();

        let mut txn2 = store.create_transaction(IsolationLevel::ReadRepeatable).await.unwrap();
        assert!(matches!(store.add(&mut txn2, b"a".to_vec(), b"v2".to_vec()), Err(Error::AlreadyExists)));
    }

    #[tokio::test]
    async fn checkpoint_then_reopen_recovers_state() {
        let dir = tempdir().unwrap();
        {
            let store = new_store(dir.path());
            store.change_role(Role::Primary).unwrap();
            let mut txn = store.create_transaction(IsolationLevel::ReadRepeatable).await.unwrap();
            store.add(&mut txn, b"a".to_vec(), b"hello".to_vec()).unwrap();
            store.apply(Lsn(1), ApplyContext::PrimaryRedo, b"a".to_vec(), RecordKind::Inserted, Some(Arc::from(&b"hello"[..]))).await.unwrap();
            store.seal_current_differential();
            store.consolidate().await;
            store.checkpoint(&CancellationToken::new()).await.unwrap();
        }

        let reopened: Store<Vec<u8>, Vec<u8>, BytesSerializer, BytesSerializer> = Store::open(
            dir.path().to_path_buf(),
            StoreConfiguration::for_testing(),
            NaturalOrderComparer,
            BytesSerializer,
            BytesSerializer,
            Arc::new(StubReplicator),
        )
        .unwrap();

        let txn = reopened.create_transaction(IsolationLevel::ReadRepeatable).await.unwrap();
        assert_eq!(reopened.get(&txn, &b"a".to_vec()).unwrap(), Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn remove_stages_tombstone_and_hides_key() {
        let dir = tempdir().unwrap();
        let store = new_store(dir.path());
        store.change_role(Role::Primary).unwrap();

        let mut txn = store.create_transaction(IsolationLevel::ReadRepeatable).await.unwrap();
        store.add(&mut txn, b"a".to_vec(), b"v1".to_vec()).unwrap();
        store.apply(Lsn(1), ApplyContext::PrimaryRedo, b"a".to_vec(), RecordKind::Inserted, Some(Arc::from(&b"v1"[..]))).await.unwrap();

        let mut txn2 = store.create_transaction(IsolationLevel::ReadRepeatable).await.unwrap();
        store.remove(&mut txn2, b"a".to_vec()).unwrap();
        store.apply(Lsn(2), ApplyContext::PrimaryRedo, b"a".to_vec(), RecordKind::Deleted, None).await.unwrap();

        let txn3 = store.create_transaction(IsolationLevel::ReadRepeatable).await.unwrap();
        assert_eq!(store.get(&txn3, &b"a".to_vec()).unwrap(), None);
    }

    #[tokio::test]
    async fn writes_are_rejected_unless_role_is_primary() {
        let dir = tempdir().unwrap();
        let store = new_store(dir.path());

        let mut txn = store.create_transaction(IsolationLevel::ReadRepeatable).await.unwrap();
        assert!(matches!(store.add(&mut txn, b"a".to_vec(), b"v".to_vec()), Err(Error::InvalidState(_))));
    }

    #[tokio::test]
    async fn conditional_update_rejects_stale_expected_lsn() {
        let dir = tempdir().unwrap();
        let store = new_store(dir.path());
        store.change_role(Role::Primary).unwrap();

        let mut txn = store.create_transaction(IsolationLevel::ReadRepeatable).await.unwrap();
        store.add(&mut txn, b"a".to_vec(), b"v1".to_vec()).unwrap();
        store.apply(Lsn(1), ApplyContext::PrimaryRedo, b"a".to_vec(), RecordKind::Inserted, Some(Arc::from(&b"v1"[..]))).await.unwrap();

        let mut txn2 = store.create_transaction(IsolationLevel::ReadRepeatable).await.unwrap();
        let result = store.update_conditional(&mut txn2, b"a".to_vec(), b"v2".to_vec(), Lsn(999));
        assert!(matches!(result, Err(Error::VersionMismatch { .. })));

        let mut txn3 = store.create_transaction(IsolationLevel::ReadRepeatable).await.unwrap();
        store.update_conditional(&mut txn3, b"a".to_vec(), b"v2".to_vec(), Lsn(1)).unwrap();
    }

    #[tokio::test]
    async fn get_with_mode_off_resolves_lsn_without_materializing_value() {
        let dir = tempdir().unwrap();
        let store = new_store(dir.path());
        store.change_role(Role::Primary).unwrap();

        let mut txn = store.create_transaction(IsolationLevel::ReadRepeatable).await.unwrap();
        store.add(&mut txn, b"a".to_vec(), b"v1".to_vec()).unwrap();
        store.apply(Lsn(1), ApplyContext::PrimaryRedo, b"a".to_vec(), RecordKind::Inserted, Some(Arc::from(&b"v1"[..]))).await.unwrap();

        let read_txn = store.create_transaction(IsolationLevel::ReadRepeatable).await.unwrap();
        let (lsn, value) = store.get_with_mode(&read_txn, &b"a".to_vec(), ReadMode::Off).unwrap().unwrap();
        assert_eq!(lsn, Lsn(1));
        assert_eq!(value, None);

        let (lsn, value) = store.get_with_mode(&read_txn, &b"a".to_vec(), ReadMode::ReadValue).unwrap().unwrap();
        assert_eq!(lsn, Lsn(1));
        assert_eq!(value, Some(b"v1".to_vec()));
    }

    #[tokio::test]
    async fn enumerator_yields_keys_in_order_within_bounds() {
        let dir = tempdir().unwrap();
        let store = new_store(dir.path());
        store.change_role(Role::Primary).unwrap();

        for (i, k) in [b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()].into_iter().enumerate() {
            let mut txn = store.create_transaction(IsolationLevel::ReadRepeatable).await.unwrap();
            store.add(&mut txn, k.clone(), format!("v{i}").into_bytes()).unwrap();
            store.apply(Lsn(i as u64 + 1), ApplyContext::PrimaryRedo, k, RecordKind::Inserted, Some(Arc::from(format!("v{i}").into_bytes()))).await.unwrap();
        }

        let txn = store.create_transaction(IsolationLevel::ReadRepeatable).await.unwrap();
        let mut enumerator = store.create_enumerator(&txn, Some(b"b".to_vec()), Some(b"c".to_vec()), true);
        let mut seen = Vec::new();
        while let Some((k, _)) = enumerator.next().unwrap() {
            seen.push(k);
        }
        assert_eq!(seen, vec![b"b".to_vec(), b"c".to_vec()]);
    }

    #[tokio::test]
    async fn enumerator_last_key_exclusive_stops_before_bound() {
        let dir = tempdir().unwrap();
        let store = new_store(dir.path());
        store.change_role(Role::Primary).unwrap();

        for (i, k) in [b"a".to_vec(), b"b".to_vec(), b"c".to_vec()].into_iter().enumerate() {
            let mut txn = store.create_transaction(IsolationLevel::ReadRepeatable).await.unwrap();
            store.add(&mut txn, k.clone(), format!("v{i}").into_bytes()).unwrap();
            store.apply(Lsn(i as u64 + 1), ApplyContext::PrimaryRedo, k, RecordKind::Inserted, Some(Arc::from(format!("v{i}").into_bytes()))).await.unwrap();
        }

        let txn = store.create_transaction(IsolationLevel::ReadRepeatable).await.unwrap();
        let mut enumerator = store.create_enumerator(&txn, None, Some(b"c".to_vec()), false);
        let mut seen = Vec::new();
        while let Some((k, _)) = enumerator.next().unwrap() {
            seen.push(k);
        }
        assert_eq!(seen, vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[tokio::test]
    async fn backup_then_restore_reopens_with_same_state() {
        let dir = tempdir().unwrap();
        let backup_dir = tempdir().unwrap();
        let restored_dir = tempdir().unwrap();

        {
            let store = new_store(dir.path());
            store.change_role(Role::Primary).unwrap();
            let mut txn = store.create_transaction(IsolationLevel::ReadRepeatable).await.unwrap();
            store.add(&mut txn, b"a".to_vec(), b"hello".to_vec()).unwrap();
            store.apply(Lsn(1), ApplyContext::PrimaryRedo, b"a".to_vec(), RecordKind::Inserted, Some(Arc::from(&b"hello"[..]))).await.unwrap();
            store.seal_current_differential();
            store.consolidate().await;
            store.checkpoint(&CancellationToken::new()).await.unwrap();
            store.backup_checkpoint(backup_dir.path(), &CancellationToken::new()).await.unwrap();
        }

        Store::<Vec<u8>, Vec<u8>, tstore_core::traits::BytesSerializer, tstore_core::traits::BytesSerializer>::restore_checkpoint(
            backup_dir.path(),
            restored_dir.path(),
        )
        .await
        .unwrap();

        let restored: Store<Vec<u8>, Vec<u8>, BytesSerializer, BytesSerializer> = Store::open(
            restored_dir.path().to_path_buf(),
            StoreConfiguration::for_testing(),
            NaturalOrderComparer,
            BytesSerializer,
            BytesSerializer,
            Arc::new(StubReplicator),
        )
        .unwrap();

        let txn = restored.create_transaction(IsolationLevel::ReadRepeatable).await.unwrap();
        assert_eq!(restored.get(&txn, &b"a".to_vec()).unwrap(), Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn persistent_copy_frames_round_trip_into_a_fresh_store() {
        let dir = tempdir().unwrap();
        let copy_dir = tempdir().unwrap();

        {
            let store = new_store(dir.path());
            store.change_role(Role::Primary).unwrap();
            let mut txn = store.create_transaction(IsolationLevel::ReadRepeatable).await.unwrap();
            store.add(&mut txn, b"a".to_vec(), b"hello".to_vec()).unwrap();
            store.apply(Lsn(1), ApplyContext::PrimaryRedo, b"a".to_vec(), RecordKind::Inserted, Some(Arc::from(&b"hello"[..]))).await.unwrap();
            store.seal_current_differential();
            store.consolidate().await;
            store.checkpoint(&CancellationToken::new()).await.unwrap();
        }

        let store: Store<Vec<u8>, Vec<u8>, BytesSerializer, BytesSerializer> = Store::open(
            dir.path().to_path_buf(),
            StoreConfiguration::for_testing(),
            NaturalOrderComparer,
            BytesSerializer,
            BytesSerializer,
            Arc::new(StubReplicator),
        )
        .unwrap();
        let frames = store.get_current_state_frames().unwrap();

        let mut receiver = CopyReceiver::begin(copy_dir.path().to_path_buf());
        for frame in frames {
            receiver.set_current_state(frame).unwrap();
        }
        receiver.end().unwrap();

        let copied: Store<Vec<u8>, Vec<u8>, BytesSerializer, BytesSerializer> = Store::open(
            copy_dir.path().to_path_buf(),
            StoreConfiguration::for_testing(),
            NaturalOrderComparer,
            BytesSerializer,
            BytesSerializer,
            Arc::new(StubReplicator),
        )
        .unwrap();
        let txn = copied.create_transaction(IsolationLevel::ReadRepeatable).await.unwrap();
        assert_eq!(copied.get(&txn, &b"a".to_vec()).unwrap(), Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn volatile_copy_round_trips_the_consolidated_component() {
        let dir = tempdir().unwrap();
        let store = new_store(dir.path());
        store.change_role(Role::Primary).unwrap();

        let mut txn = store.create_transaction(IsolationLevel::ReadRepeatable).await.unwrap();
        store.add(&mut txn, b"a".to_vec(), b"hello".to_vec()).unwrap();
        store.apply(Lsn(1), ApplyContext::PrimaryRedo, b"a".to_vec(), RecordKind::Inserted, Some(Arc::from(&b"hello"[..]))).await.unwrap();
        store.seal_current_differential();
        store.consolidate().await;

        let bytes = store.get_current_state_volatile().unwrap();

        let dst_dir = tempdir().unwrap();
        let dst = new_store(dst_dir.path());
        dst.apply_volatile_copy(&bytes).unwrap();

        let txn = dst.create_transaction(IsolationLevel::ReadRepeatable).await.unwrap();
        assert_eq!(dst.get(&txn, &b"a".to_vec()).unwrap(), Some(b"hello".to_vec()));
    }
}
