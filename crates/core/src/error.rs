//! The unified error type for TStore.
//!
//! Every fallible public operation returns [`Result<T>`]. The variants follow
//! the taxonomy in spec.md §7: business-level outcomes (`NotFound`,
//! `AlreadyExists`, `VersionMismatch`) are ordinary, expected results a
//! caller branches on; `Timeout`/`Cancelled` mean the caller should retry or
//! unwind; `CorruptedData` is fatal for the file it names; `Io` is the
//! replicator host's problem, not ours.

use thiserror::Error;

use crate::types::Lsn;

/// Result type alias used throughout TStore.
pub type Result<T> = std::result::Result<T, Error>;

/// The unified TStore error type.
#[derive(Debug, Error)]
pub enum Error {
    /// No live version of the key is visible to the caller.
    #[error("key not found")]
    NotFound,

    /// `Add` was called but a visible live version already exists.
    #[error("key already exists")]
    AlreadyExists,

    /// A conditional `Update`/`Remove` observed an LSN different from the
    /// one the caller expected.
    #[error("version mismatch: expected {expected}, found {actual}")]
    VersionMismatch {
        /// The LSN the caller expected to still be current.
        expected: Lsn,
        /// The LSN actually current for the key.
        actual: Lsn,
    },

    /// A lock acquisition (most commonly the prime lock) exceeded its
    /// configured timeout.
    #[error("lock acquisition timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The operation's cancellation token fired before completion.
    #[error("operation cancelled")]
    Cancelled,

    /// The operation is not legal in the store's current role or lifecycle
    /// state (e.g. a write while `Role::ActiveSecondary`).
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A checksum or footer/properties section failed validation. Fatal for
    /// the file named unless a redundant source exists.
    #[error("corrupted data in {location}: {detail}")]
    CorruptedData {
        /// What was being read (a file path, "metadata table", ...).
        location: String,
        /// Human-readable description of the mismatch.
        detail: String,
    },

    /// Underlying filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A user-supplied `StateSerializer` failed to encode or decode a value.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Construct a [`Error::CorruptedData`] with owned strings.
    pub fn corrupted(location: impl Into<String>, detail: impl Into<String>) -> Self {
        Error::CorruptedData {
            location: location.into(),
            detail: detail.into(),
        }
    }

    /// `true` if the replicator host is expected to retry the operation
    /// rather than treat it as a caller-visible failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }

    /// `true` for checksum/footer corruption — the replica should generally
    /// be faulted, per spec.md §7's propagation policy.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::CorruptedData { .. })
    }
}
