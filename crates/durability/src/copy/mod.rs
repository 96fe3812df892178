//! The two copy protocols a replicator drives to build a secondary from a
//! primary's state (spec.md §4.9). Building the actual bytes onto a wire is
//! the replicator's job; these types produce and consume the frame
//! sequence, in order, the way the source's `CopyManager`/`VolatileCopyManager`
//! do.

pub mod persistent;
pub mod volatile;

pub use persistent::{CopyManager, Frame, FrameKind, StoreCopyStream, PERSISTENT_COPY_PROTOCOL_VERSION};
pub use volatile::{KeyMetadataRecord, VolatileCopyManager, VolatileCopyStream, VOLATILE_COPY_PROTOCOL_VERSION};
