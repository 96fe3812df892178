//! The fixed-size footer shared by every TStore on-disk file (checkpoint
//! key/value files, the metadata table) — spec.md §4.4, §4.5: a trailing
//! record naming where the properties section lives, plus a version tag and
//! magic for sanity-checking the file type on open.

use tstore_core::error::{Error, Result};

const MAGIC_KEY_FILE: [u8; 4] = *b"TSFK";
const MAGIC_VALUE_FILE: [u8; 4] = *b"TSFV";
const MAGIC_METADATA_TABLE: [u8; 4] = *b"TSMD";

pub const FOOTER_LEN: usize = 24;
const FORMAT_VERSION: u32 = 1;

/// Identifies which on-disk format a footer belongs to, so a reader can
/// reject a file opened under the wrong assumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// `.sfk` key checkpoint file.
    KeyCheckpoint,
    /// `.sfv` value checkpoint file.
    ValueCheckpoint,
    /// The metadata table's `current`/`next` file.
    MetadataTable,
}

impl FileKind {
    fn magic(self) -> [u8; 4] {
        match self {
            FileKind::KeyCheckpoint => MAGIC_KEY_FILE,
            FileKind::ValueCheckpoint => MAGIC_VALUE_FILE,
            FileKind::MetadataTable => MAGIC_METADATA_TABLE,
        }
    }
}

/// `{propertiesHandle: {offset: u64, size: u64}, version: u32, magic: [u8;
/// 4]}`, always the final 24 bytes of the file.
#[derive(Debug, Clone, Copy)]
pub struct Footer {
    /// Byte offset of the properties section.
    pub properties_offset: u64,
    /// Byte length of the properties section.
    pub properties_size: u64,
    kind: FileKind,
}

impl Footer {
    /// Construct a footer describing where the properties section lives.
    pub fn new(kind: FileKind, properties_offset: u64, properties_size: u64) -> Self {
        Footer { properties_offset, properties_size, kind }
    }

    /// Encode to the fixed 24-byte on-disk representation.
    pub fn to_bytes(&self) -> [u8; FOOTER_LEN] {
        let mut out = [0u8; FOOTER_LEN];
        out[0..8].copy_from_slice(&self.properties_offset.to_le_bytes());
        out[8..16].copy_from_slice(&self.properties_size.to_le_bytes());
        out[16..20].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        out[20..24].copy_from_slice(&self.kind.magic());
        out
    }

    /// Decode and validate against the expected file kind.
    pub fn from_bytes(bytes: &[u8], expected: FileKind) -> Result<Self> {
        if bytes.len() != FOOTER_LEN {
            return Err(Error::corrupted("footer", "wrong footer length"));
        }
        let properties_offset = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
        let properties_size = u64::from_le_bytes(bytes[8..16].try_into().unwrap());
        let version = u32::from_le_bytes(bytes[16..20].try_into().unwrap());
        let magic: [u8; 4] = bytes[20..24].try_into().unwrap();
        if version != FORMAT_VERSION {
            return Err(Error::corrupted("footer", format!("unsupported format version {version}")));
        }
        if magic != expected.magic() {
            return Err(Error::corrupted("footer", "magic does not match expected file kind"));
        }
        Ok(Footer { properties_offset, properties_size, kind: expected })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let footer = Footer::new(FileKind::KeyCheckpoint, 1000, 42);
        let bytes = footer.to_bytes();
        let back = Footer::from_bytes(&bytes, FileKind::KeyCheckpoint).unwrap();
        assert_eq!(back.properties_offset, 1000);
        assert_eq!(back.properties_size, 42);
    }

    #[test]
    fn rejects_wrong_kind() {
        let footer = Footer::new(FileKind::KeyCheckpoint, 0, 0);
        let bytes = footer.to_bytes();
        assert!(Footer::from_bytes(&bytes, FileKind::ValueCheckpoint).is_err());
    }
}
