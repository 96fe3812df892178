//! Fundamental vocabulary types used throughout TStore.

use serde::{Deserialize, Serialize};

/// Version sequence number: a monotone 64-bit identifier assigned by the
/// replicator to each applied operation.
///
/// `Lsn(0)` is reserved to mean "no version" / "invalid" and is never
/// assigned to a real applied operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Lsn(pub u64);

impl Lsn {
    /// The sentinel "no version" value.
    pub const ZERO: Lsn = Lsn(0);

    /// `true` if this is the sentinel "no version" value.
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for Lsn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Lsn {
    fn from(v: u64) -> Self {
        Lsn(v)
    }
}

/// The kind of a versioned record, matching the on-disk `kind: u8` tag in
/// `KeyData` (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum RecordKind {
    /// The key did not exist before this version.
    Inserted = 0,
    /// The key existed and this version overwrites it.
    Updated = 1,
    /// This version tombstones the key; it carries no value payload.
    Deleted = 2,
}

impl RecordKind {
    /// `true` for [`RecordKind::Deleted`].
    pub fn is_deleted(self) -> bool {
        matches!(self, RecordKind::Deleted)
    }

    /// Decode from the on-disk `u8` tag.
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(RecordKind::Inserted),
            1 => Some(RecordKind::Updated),
            2 => Some(RecordKind::Deleted),
            _ => None,
        }
    }
}

/// Why the replicator is asking the store to apply an operation (§4.1, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApplyContext {
    /// Redo on the primary, issued as the transaction commits.
    PrimaryRedo,
    /// Redo on a secondary, replicated from the primary.
    SecondaryRedo,
    /// Redo during log replay at recovery time.
    RecoveryRedo,
    /// Undo a previously applied secondary operation (false progress).
    SecondaryFalseProgress,
}

impl ApplyContext {
    /// `true` for the two contexts that install a new version rather than
    /// undo one (`PrimaryRedo`, `SecondaryRedo`, `RecoveryRedo`).
    pub fn is_redo(self) -> bool {
        !matches!(self, ApplyContext::SecondaryFalseProgress)
    }
}

/// Controls value materialization on a read (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReadMode {
    /// Read and return the value, without affecting the in-memory cache.
    #[default]
    ReadValue,
    /// Read the value and populate the in-memory cache on a disk read miss.
    CacheResult,
    /// Skip value materialization entirely; only the key's existence/LSN is
    /// resolved. Used by `ContainsKey`.
    Off,
}

/// Transaction isolation level, settable at `StoreTransaction` creation
/// (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IsolationLevel {
    /// Reads see a consistent view that does not change within the
    /// transaction, repeatable across re-reads of the same key.
    #[default]
    ReadRepeatable,
    /// Reads are pinned to the visibility LSN captured when the transaction
    /// began, including keys not yet read.
    Snapshot,
    /// Reads see the latest committed data at the time of each read.
    ReadCommitted,
}

/// Replica role, governing which operations are legal (§1 external
/// collaborator contract, supplemented in SPEC_FULL.md §2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Role {
    /// No replica role assigned yet (before `Open`/`ChangeRoleAsync`).
    #[default]
    Unknown,
    /// Accepts writes; replicates to secondaries.
    Primary,
    /// Receiving copy/replication but not yet eligible for reads.
    IdleSecondary,
    /// Caught up; serves reads, but not writes.
    ActiveSecondary,
    /// Quiesced; no further operations are legal until a role change.
    None,
}
