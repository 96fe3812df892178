//! `VersionedItem`: an immutable (kind, lsn) record that either holds a
//! resident value or a disk reference, with three lock-free flag bits
//! packed into the offset word (spec.md §3, §5, §9).
//!
//! The flag word is the one piece of genuinely fine-grained concurrency in
//! the whole store: sweep (§4.10) must be able to drop a cached value while
//! a reader concurrently loads it, without blocking either side on an OS
//! mutex for the common case. Per DESIGN NOTES §9 this is kept as a
//! lock-free CAS loop rather than replaced with a `Mutex`.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tstore_core::types::{Lsn, RecordKind};

/// Offset occupies the low 61 bits; the upper 3 bits carry flags.
const OFFSET_BITS: u32 = 61;
const OFFSET_MASK: u64 = (1u64 << OFFSET_BITS) - 1;
const IN_MEMORY_BIT: u64 = 1 << 61;
const IN_USE_BIT: u64 = 1 << 62;
const LOCK_BIT: u64 = 1 << 63;

/// The maximum value offset representable alongside the flag bits.
pub const MAX_OFFSET: u64 = OFFSET_MASK;

/// An immutable (kind, lsn) record. Mutable only in its cache-state bits and
/// its resident value, both guarded by the lock bit.
///
/// `VersionedItem` is `Clone`-free by design: it is owned by whichever
/// component map currently holds it (differential, consolidated, or
/// snapshot container) and moved, never shared, on state transitions
/// (DESIGN NOTES §9) — except where an `Arc<VersionedItem>` is the
/// deliberate sharing point (e.g. a file-backed item pinned by a snapshot
/// while still live in consolidated state).
#[derive(Debug)]
pub struct VersionedItem {
    kind: RecordKind,
    lsn: Lsn,
    file_id: u32,
    value_size: u32,
    value_checksum: u64,
    flags: AtomicU64,
    value: UnsafeCell<Option<Arc<[u8]>>>,
}

// SAFETY: all access to `value` goes through `acquire` which serializes via
// the `LOCK_BIT` CAS loop; `flags` is itself atomic.
unsafe impl Send for VersionedItem {}
unsafe impl Sync for VersionedItem {}

impl VersionedItem {
    /// Construct a memory-only item (no disk backing): `file_id == 0`.
    pub fn new_memory(kind: RecordKind, lsn: Lsn, value: Arc<[u8]>) -> Self {
        let value_size = value.len() as u32;
        VersionedItem {
            kind,
            lsn,
            file_id: 0,
            value_size,
            value_checksum: 0,
            flags: AtomicU64::new(IN_MEMORY_BIT),
            value: UnsafeCell::new(Some(value)),
        }
    }

    /// Construct a disk-backed item: not resident until paged in.
    ///
    /// Panics if `offset` does not fit in 61 bits (spec.md §3 invariant).
    pub fn new_disk(
        kind: RecordKind,
        lsn: Lsn,
        file_id: u32,
        offset: u64,
        value_size: u32,
        value_checksum: u64,
    ) -> Self {
        assert!(offset <= MAX_OFFSET, "value offset exceeds 61 bits");
        assert!(file_id > 0, "disk-backed item must have file_id > 0");
        VersionedItem {
            kind,
            lsn,
            file_id,
            value_size,
            value_checksum,
            flags: AtomicU64::new(offset),
            value: UnsafeCell::new(None),
        }
    }

    /// Construct a tombstone: no value payload is meaningful (spec.md §3
    /// invariant: a `Deleted` item has no value payload).
    pub fn new_deleted(lsn: Lsn) -> Self {
        VersionedItem {
            kind: RecordKind::Deleted,
            lsn,
            file_id: 0,
            value_size: 0,
            value_checksum: 0,
            flags: AtomicU64::new(0),
            value: UnsafeCell::new(None),
        }
    }

    /// The record kind.
    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    /// The LSN this version was applied at.
    pub fn lsn(&self) -> Lsn {
        self.lsn
    }

    /// `0` for memory-only items.
    pub fn file_id(&self) -> u32 {
        self.file_id
    }

    /// Meaningful only for non-`Deleted` items.
    pub fn value_size(&self) -> u32 {
        self.value_size
    }

    /// Meaningful only for non-`Deleted` items.
    pub fn value_checksum(&self) -> u64 {
        self.value_checksum
    }

    /// `true` if this item has disk backing (`file_id > 0`).
    pub fn has_disk_backing(&self) -> bool {
        self.file_id > 0
    }

    /// The on-disk byte offset, if disk-backed.
    pub fn offset(&self) -> u64 {
        self.flags.load(Ordering::Acquire) & OFFSET_MASK
    }

    /// `true` if the value byte buffer is currently resident in memory.
    pub fn in_memory(&self) -> bool {
        self.flags.load(Ordering::Acquire) & IN_MEMORY_BIT != 0
    }

    /// `true` if a reader has marked this item used since the last sweep
    /// pass cleared the bit.
    pub fn in_use(&self) -> bool {
        self.flags.load(Ordering::Acquire) & IN_USE_BIT != 0
    }

    /// Set the `in_use` bit. Called by any reader that touches (or caches)
    /// this item's value.
    pub fn mark_in_use(&self) {
        self.flags.fetch_or(IN_USE_BIT, Ordering::AcqRel);
    }

    /// Clear the `in_use` bit. Called by sweep's clock hand.
    pub fn clear_in_use(&self) {
        self.flags.fetch_and(!IN_USE_BIT, Ordering::AcqRel);
    }

    /// Spin-acquire the per-item lock bit, serializing value load/drop
    /// against sweep. Returns a guard that releases the bit on drop.
    pub fn lock(&self) -> VersionedItemGuard<'_> {
        loop {
            let prev = self.flags.fetch_or(LOCK_BIT, Ordering::AcqRel);
            if prev & LOCK_BIT == 0 {
                return VersionedItemGuard { item: self };
            }
            std::hint::spin_loop();
        }
    }

    fn set_in_memory(&self, resident: bool) {
        if resident {
            self.flags.fetch_or(IN_MEMORY_BIT, Ordering::AcqRel);
        } else {
            self.flags.fetch_and(!IN_MEMORY_BIT, Ordering::AcqRel);
        }
    }
}

/// RAII guard for the per-item spin lock. Dereferences to the item for
/// read access and exposes `install`/`evict` for the two value-cache
/// transitions that require holding the lock.
pub struct VersionedItemGuard<'a> {
    item: &'a VersionedItem,
}

impl<'a> VersionedItemGuard<'a> {
    /// The currently cached value, if resident.
    pub fn value(&self) -> Option<Arc<[u8]>> {
        // SAFETY: the lock bit serializes all mutators of `value`.
        unsafe { (*self.item.value.get()).clone() }
    }

    /// Install a freshly loaded value and mark the item resident. Used by
    /// a read that pages a disk-backed value into memory.
    pub fn install(&self, value: Arc<[u8]>) {
        // SAFETY: guarded by the lock bit.
        unsafe {
            *self.item.value.get() = Some(value);
        }
        self.item.set_in_memory(true);
    }

    /// Drop the cached value and clear the resident bit. Used by sweep.
    /// No-op (and never called) for memory-only items — sweep checks
    /// `has_disk_backing` before acquiring the lock.
    pub fn evict(&self) {
        // SAFETY: guarded by the lock bit.
        unsafe {
            *self.item.value.get() = None;
        }
        self.item.set_in_memory(false);
    }
}

impl<'a> Drop for VersionedItemGuard<'a> {
    fn drop(&mut self) {
        self.item.flags.fetch_and(!LOCK_BIT, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_item_round_trips_value() {
        let item = VersionedItem::new_memory(RecordKind::Inserted, Lsn(1), Arc::from(&b"hi"[..]));
        assert!(item.in_memory());
        assert_eq!(item.file_id(), 0);
        let guard = item.lock();
        assert_eq!(guard.value().as_deref(), Some(&b"hi"[..]));
    }

    #[test]
    fn disk_item_starts_non_resident() {
        let item = VersionedItem::new_disk(RecordKind::Updated, Lsn(5), 7, 4096, 10, 0xABCD);
        assert!(!item.in_memory());
        assert_eq!(item.offset(), 4096);
        assert_eq!(item.file_id(), 7);
        let guard = item.lock();
        assert!(guard.value().is_none());
        guard.install(Arc::from(&b"0123456789"[..]));
        drop(guard);
        assert!(item.in_memory());
    }

    #[test]
    fn sweep_clears_in_memory_after_second_chance() {
        let item = VersionedItem::new_disk(RecordKind::Inserted, Lsn(1), 1, 0, 1, 0);
        item.lock().install(Arc::from(&b"x"[..]));
        item.mark_in_use();

        // First sweep pass: in_use set, gets a second chance.
        assert!(item.in_use());
        item.clear_in_use();
        assert!(item.in_memory());

        // Second sweep pass: in_use still clear, now evicted.
        assert!(!item.in_use());
        item.lock().evict();
        assert!(!item.in_memory());
    }

    #[test]
    #[should_panic]
    fn offset_overflow_panics() {
        VersionedItem::new_disk(RecordKind::Inserted, Lsn(1), 1, MAX_OFFSET + 1, 0, 0);
    }

    #[test]
    fn deleted_item_has_no_payload() {
        let item = VersionedItem::new_deleted(Lsn(9));
        assert!(item.kind().is_deleted());
        assert_eq!(item.value_size(), 0);
        assert_eq!(item.file_id(), 0);
    }
}
