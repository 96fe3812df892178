//! End-to-end lifecycle scenarios against the public `Store` facade:
//! overwrite/snapshot interaction, checkpoint+recovery, consolidation
//! feeding a merge, tombstone elision, and sweep eviction followed by a
//! disk reload (spec.md §8's concrete scenarios).

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

use tstore_core::config::StoreConfiguration;
use tstore_core::error::Result;
use tstore_core::replicator::{BoxFuture, OperationContext, Replicator, TryRemoveVersionResult};
use tstore_core::traits::{BytesSerializer, NaturalOrderComparer};
use tstore_core::types::{ApplyContext, IsolationLevel, Lsn, RecordKind};
use tstore_engine::Store;

type TestStore = Store<Vec<u8>, Vec<u8>, BytesSerializer, BytesSerializer>;

/// A replicator stub whose `register()` reflects a test-controlled "current"
/// LSN, so a `Snapshot`-isolation transaction pins at whatever the test has
/// last advanced it to — standing in for the real replicator's committed-LSN
/// tracking, which this crate treats as an external collaborator (spec.md
/// §6). Also tracks every currently-registered visibility LSN so
/// `try_remove_version` can answer honestly: the store itself has no local
/// record of which snapshots are active (spec.md §9 Open Questions), so a
/// realistic stub — not just one that always says yes — is what actually
/// exercises the eviction/consolidation preservation paths.
struct TestReplicator {
    current_lsn: AtomicU64,
    registered: Mutex<BTreeSet<u64>>,
}

impl TestReplicator {
    fn new() -> Arc<Self> {
        Arc::new(TestReplicator { current_lsn: AtomicU64::new(0), registered: Mutex::new(BTreeSet::new()) })
    }

    fn advance(&self, lsn: Lsn) {
        self.current_lsn.fetch_max(lsn.0, Ordering::AcqRel);
    }
}

impl Replicator for TestReplicator {
    fn apply<'a>(&'a self, _lsn: Lsn, _ctx: ApplyContext, _metadata: &'a [u8], _redo: &'a [u8]) -> BoxFuture<'a, Result<Option<OperationContext>>> {
        Box::pin(async { Ok(None) })
    }
    fn unlock(&self, _context: OperationContext) {}
    fn register<'a>(&'a self) -> BoxFuture<'a, Result<Lsn>> {
        Box::pin(async {
            let lsn = Lsn(self.current_lsn.load(Ordering::Acquire));
            self.registered.lock().unwrap().insert(lsn.0);
            Ok(lsn)
        })
    }
    fn unregister(&self, visibility_lsn: Lsn) {
        self.registered.lock().unwrap().remove(&visibility_lsn.0);
    }
    fn try_remove_version<'a>(&'a self, remove_lsn: Lsn, next_lsn: Lsn) -> BoxFuture<'a, TryRemoveVersionResult> {
        Box::pin(async move {
            let needed: Vec<Lsn> = self.registered.lock().unwrap().range(remove_lsn.0..next_lsn.0).map(|&v| Lsn(v)).collect();
            TryRemoveVersionResult {
                can_be_removed: needed.is_empty(),
                enumeration_set: needed,
                enumeration_completion_notifications: Vec::new(),
            }
        })
    }
}

fn open_store(dir: &std::path::Path, config: StoreConfiguration, replicator: Arc<TestReplicator>) -> TestStore {
    let store = Store::new(dir.to_path_buf(), config, NaturalOrderComparer, BytesSerializer, BytesSerializer, replicator).unwrap();
    store.change_role(tstore_core::types::Role::Primary).unwrap();
    store
}

async fn add_and_apply(store: &TestStore, lsn: u64, key: &[u8], value: &[u8], replicator: &TestReplicator) {
    let mut txn = store.create_transaction(IsolationLevel::ReadRepeatable).await.unwrap();
    store.add(&mut txn, key.to_vec(), value.to_vec()).unwrap();
    store.apply(Lsn(lsn), ApplyContext::PrimaryRedo, key.to_vec(), RecordKind::Inserted, Some(Arc::from(value))).await.unwrap();
    replicator.advance(Lsn(lsn));
}

#[tokio::test]
async fn overwrite_preserves_prior_version_for_an_outstanding_snapshot() {
    let dir = tempdir().unwrap();
    let replicator = TestReplicator::new();
    let store = open_store(dir.path(), StoreConfiguration::for_testing(), replicator.clone());

    add_and_apply(&store, 1, b"a", b"v1", &replicator).await;

    let snapshot_txn = store.create_transaction(IsolationLevel::Snapshot).await.unwrap();
    assert_eq!(snapshot_txn.visibility_lsn(), Lsn(1));

    let mut update_txn = store.create_transaction(IsolationLevel::ReadRepeatable).await.unwrap();
    store.update(&mut update_txn, b"a".to_vec(), b"v2".to_vec()).unwrap();
    store.apply(Lsn(2), ApplyContext::PrimaryRedo, b"a".to_vec(), RecordKind::Updated, Some(Arc::from(&b"v2"[..]))).await.unwrap();
    replicator.advance(Lsn(2));

    assert_eq!(store.get(&snapshot_txn, &b"a".to_vec()).unwrap(), Some(b"v1".to_vec()));

    let latest_txn = store.create_transaction(IsolationLevel::ReadRepeatable).await.unwrap();
    assert_eq!(store.get(&latest_txn, &b"a".to_vec()).unwrap(), Some(b"v2".to_vec()));

    store.unregister_snapshot(snapshot_txn.visibility_lsn());
}

#[tokio::test]
async fn second_overwrite_still_preserves_the_version_an_outstanding_snapshot_needs() {
    let dir = tempdir().unwrap();
    let replicator = TestReplicator::new();
    let store = open_store(dir.path(), StoreConfiguration::for_testing(), replicator.clone());

    add_and_apply(&store, 1, b"a", b"v1", &replicator).await;

    let snapshot_txn = store.create_transaction(IsolationLevel::Snapshot).await.unwrap();
    assert_eq!(snapshot_txn.visibility_lsn(), Lsn(1));

    // Two more writes to the same key after the snapshot registers. The
    // first overwrite (lsn 2) only ever occupies the differential's
    // `previous` slot; the second (lsn 3) is the one that evicts it —
    // without preserving that eviction, `v1` would disappear from the
    // snapshot's read even though its visibility LSN is still open.
    let mut txn2 = store.create_transaction(IsolationLevel::ReadRepeatable).await.unwrap();
    store.update(&mut txn2, b"a".to_vec(), b"v2".to_vec()).unwrap();
    store.apply(Lsn(2), ApplyContext::PrimaryRedo, b"a".to_vec(), RecordKind::Updated, Some(Arc::from(&b"v2"[..]))).await.unwrap();
    replicator.advance(Lsn(2));

    let mut txn3 = store.create_transaction(IsolationLevel::ReadRepeatable).await.unwrap();
    store.update(&mut txn3, b"a".to_vec(), b"v3".to_vec()).unwrap();
    store.apply(Lsn(3), ApplyContext::PrimaryRedo, b"a".to_vec(), RecordKind::Updated, Some(Arc::from(&b"v3"[..]))).await.unwrap();
    replicator.advance(Lsn(3));

    assert_eq!(store.get(&snapshot_txn, &b"a".to_vec()).unwrap(), Some(b"v1".to_vec()));

    let latest_txn = store.create_transaction(IsolationLevel::ReadRepeatable).await.unwrap();
    assert_eq!(store.get(&latest_txn, &b"a".to_vec()).unwrap(), Some(b"v3".to_vec()));

    store.unregister_snapshot(snapshot_txn.visibility_lsn());
}

#[tokio::test]
async fn checkpoint_then_recovery_round_trips_multiple_keys() {
    let dir = tempdir().unwrap();
    let replicator = TestReplicator::new();

    {
        let store = open_store(dir.path(), StoreConfiguration::for_testing(), replicator.clone());
        add_and_apply(&store, 1, b"a", b"alpha", &replicator).await;
        add_and_apply(&store, 2, b"b", b"beta", &replicator).await;
        store.seal_current_differential();
        store.consolidate().await;
        store.checkpoint(&CancellationToken::new()).await.unwrap();
    }

    let reopened = Store::open(dir.path().to_path_buf(), StoreConfiguration::for_testing(), NaturalOrderComparer, BytesSerializer, BytesSerializer, TestReplicator::new())
        .unwrap();
    let txn = reopened.create_transaction(IsolationLevel::ReadRepeatable).await.unwrap();
    assert_eq!(reopened.get(&txn, &b"a".to_vec()).unwrap(), Some(b"alpha".to_vec()));
    assert_eq!(reopened.get(&txn, &b"b".to_vec()).unwrap(), Some(b"beta".to_vec()));
}

#[tokio::test]
async fn repeated_checkpoints_trigger_a_merge() {
    let dir = tempdir().unwrap();
    let replicator = TestReplicator::new();
    let config = StoreConfiguration::for_testing();
    let store = open_store(dir.path(), config.clone(), replicator.clone());

    for i in 0..3u64 {
        let key = format!("k{i}").into_bytes();
        let value = format!("v{i}").into_bytes();
        add_and_apply(&store, i + 1, &key, &value, &replicator).await;
        store.seal_current_differential();
        store.consolidate().await;
        store.checkpoint(&CancellationToken::new()).await.unwrap();
    }

    let merged = store.merge_if_warranted().unwrap();
    assert!(merged.is_some(), "three small generations under for_testing()'s threshold of 3 should trigger a merge");

    let txn = store.create_transaction(IsolationLevel::ReadRepeatable).await.unwrap();
    for i in 0..3u64 {
        let key = format!("k{i}").into_bytes();
        let value = format!("v{i}").into_bytes();
        assert_eq!(store.get(&txn, &key).unwrap(), Some(value));
    }
}

#[tokio::test]
async fn deleted_key_does_not_reappear_after_checkpoint_and_recovery() {
    let dir = tempdir().unwrap();
    let replicator = TestReplicator::new();

    {
        let store = open_store(dir.path(), StoreConfiguration::for_testing(), replicator.clone());
        add_and_apply(&store, 1, b"a", b"alpha", &replicator).await;

        let mut txn = store.create_transaction(IsolationLevel::ReadRepeatable).await.unwrap();
        store.remove(&mut txn, b"a".to_vec()).unwrap();
        store.apply(Lsn(2), ApplyContext::PrimaryRedo, b"a".to_vec(), RecordKind::Deleted, None).await.unwrap();
        replicator.advance(Lsn(2));

        store.seal_current_differential();
        store.consolidate().await;
        store.checkpoint(&CancellationToken::new()).await.unwrap();
    }

    let reopened = Store::open(dir.path().to_path_buf(), StoreConfiguration::for_testing(), NaturalOrderComparer, BytesSerializer, BytesSerializer, TestReplicator::new())
        .unwrap();
    let txn = reopened.create_transaction(IsolationLevel::ReadRepeatable).await.unwrap();
    assert_eq!(reopened.get(&txn, &b"a".to_vec()).unwrap(), None);
}

#[tokio::test]
async fn checkpoint_makes_an_entry_sweepable_in_the_same_process() {
    let dir = tempdir().unwrap();
    let replicator = TestReplicator::new();
    let store = open_store(dir.path(), StoreConfiguration::for_testing(), replicator.clone());
    add_and_apply(&store, 1, b"a", b"hello-from-disk", &replicator).await;
    store.seal_current_differential();
    store.consolidate().await;
    store.checkpoint(&CancellationToken::new()).await.unwrap();

    store.sweep();
    let stats = store.sweep();
    assert_eq!(stats.evicted, 1, "checkpoint's rewritten disk-backed item should be evictable without closing and reopening the store");

    let txn = store.create_transaction(IsolationLevel::ReadRepeatable).await.unwrap();
    assert_eq!(store.get(&txn, &b"a".to_vec()).unwrap(), Some(b"hello-from-disk".to_vec()));
}

#[tokio::test]
async fn sweep_evicts_then_a_later_read_pages_back_in_from_disk() {
    let dir = tempdir().unwrap();
    let replicator = TestReplicator::new();

    {
        let store = open_store(dir.path(), StoreConfiguration::for_testing(), replicator.clone());
        add_and_apply(&store, 1, b"a", b"hello-from-disk", &replicator).await;
        store.seal_current_differential();
        store.consolidate().await;
        store.checkpoint(&CancellationToken::new()).await.unwrap();
    }

    let reopened = Store::open(dir.path().to_path_buf(), StoreConfiguration::for_testing(), NaturalOrderComparer, BytesSerializer, BytesSerializer, TestReplicator::new())
        .unwrap();

    let txn = reopened.create_transaction(IsolationLevel::ReadRepeatable).await.unwrap();
    assert_eq!(reopened.get(&txn, &b"a".to_vec()).unwrap(), Some(b"hello-from-disk".to_vec()));

    reopened.sweep();
    let stats = reopened.sweep();
    assert_eq!(stats.evicted, 1, "second pass should evict the now-not-in_use resident item");

    let txn2 = reopened.create_transaction(IsolationLevel::ReadRepeatable).await.unwrap();
    assert_eq!(reopened.get(&txn2, &b"a".to_vec()).unwrap(), Some(b"hello-from-disk".to_vec()));
}
