//! Byte-level on-disk formats: chunking, the key-entry layout, and the
//! shared footer record (spec.md §4.4).

pub mod chunk;
pub mod footer;
pub mod key_data;

pub use chunk::{crc64, BlockAlignedReader, BlockAlignedWriter};
pub use footer::{FileKind, Footer, FOOTER_LEN};
pub use key_data::KeyEntry;
