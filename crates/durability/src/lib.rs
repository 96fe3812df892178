//! On-disk formats and disk-level algorithms for TStore: the chunked,
//! checksummed `CheckpointFile` pair, the `FileMetadata`/`MetadataTable`
//! that tracks them, `MergeHelper` and the merge algorithm, recovery's
//! k-way rebuild, the snapshot container that pins old generations alive,
//! and the two copy protocols (spec.md §3, §4.4–§4.9, §4.11).
//!
//! Everything here is synchronous and does its own file I/O; the async
//! suspension points, locking, and transaction semantics that call into it
//! live in `tstore-concurrency` and `tstore-engine`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod checkpoint_file;
pub mod copy;
pub mod format;
pub mod merge;
pub mod metadata_table;
pub mod recovery;
pub mod snapshot_container;

pub use checkpoint_file::{
    key_file_path, value_file_path, CheckpointFileProperties, CheckpointFileWriter,
    KeyCheckpointFileEnumerator, LiveEntryLocation, ValueCheckpointFileReader, DEFAULT_CHUNK_SIZE,
};
pub use copy::{CopyManager, Frame, FrameKind, StoreCopyStream, VolatileCopyManager, VolatileCopyStream};
pub use merge::{run_merge, should_merge, MergePolicy, MergeSelection, PostMergeMetadataTableInformation};
pub use metadata_table::{FileMetadata, MetadataTable};
pub use recovery::{max_recovered_lsn, recover, RecoveryResult};
pub use snapshot_container::{SnapshotComponent, SnapshotContainer};
