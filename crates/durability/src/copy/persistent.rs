//! Persistent copy: stream raw `.sfk`/`.sfv` bytes plus the metadata table
//! to a secondary building its working directory from scratch (spec.md
//! §4.9).
//!
//! `CopyManager` (sender side) produces the frame sequence; `StoreCopyStream`
//! (receiver side) consumes it, enforcing the legal order
//! `Version → MetadataTable → (StartKeyFile, WriteKeyFile*, EndKeyFile,
//! StartValueFile, WriteValueFile*, EndValueFile)* → Complete` and writing
//! bytes into the working directory exactly as produced.

use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;

use tstore_core::error::{Error, Result};

use crate::checkpoint_file::{key_file_path, value_file_path};
use crate::metadata_table::MetadataTable;

/// Version 1: the persistent (on-disk) copy protocol.
pub const PERSISTENT_COPY_PROTOCOL_VERSION: u32 = 1;

const DEFAULT_FILE_CHUNK_SIZE: usize = 64 * 1024;

/// The frame kind tag, carried as the last byte of every frame on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Protocol version announcement; payload is a little-endian `u32`.
    Version = 0,
    /// Serialized `MetadataTable` entries.
    MetadataTable = 1,
    /// Announces the start of one generation's key file; payload is its
    /// `u32` file-id.
    StartKeyFile = 2,
    /// A chunk of raw `.sfk` bytes for the current key file.
    WriteKeyFile = 3,
    /// Ends the current key file.
    EndKeyFile = 4,
    /// Announces the start of one generation's value file; payload is its
    /// `u32` file-id.
    StartValueFile = 5,
    /// A chunk of raw `.sfv` bytes for the current value file.
    WriteValueFile = 6,
    /// Ends the current value file.
    EndValueFile = 7,
    /// Copy is complete; the receiver may now open the store.
    Complete = 8,
}

impl FrameKind {
    fn from_u8(tag: u8) -> Result<Self> {
        Ok(match tag {
            0 => FrameKind::Version,
            1 => FrameKind::MetadataTable,
            2 => FrameKind::StartKeyFile,
            3 => FrameKind::WriteKeyFile,
            4 => FrameKind::EndKeyFile,
            5 => FrameKind::StartValueFile,
            6 => FrameKind::WriteValueFile,
            7 => FrameKind::EndValueFile,
            8 => FrameKind::Complete,
            _ => return Err(Error::corrupted("copy frame", "unrecognized frame kind tag")),
        })
    }
}

/// One frame of the persistent copy protocol.
#[derive(Debug, Clone)]
pub struct Frame {
    /// The frame's kind.
    pub kind: FrameKind,
    /// The frame's payload (empty for `EndKeyFile`/`EndValueFile`/`Complete`).
    pub payload: Vec<u8>,
}

impl Frame {
    /// Encode to the wire form: `payload || tag_byte`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.payload.clone();
        out.push(self.kind as u8);
        out
    }

    /// Decode a frame previously produced by [`Self::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (payload, tag) = bytes
            .split_last()
            .ok_or_else(|| Error::corrupted("copy frame", "empty frame"))?;
        Ok(Frame { kind: FrameKind::from_u8(*tag)?, payload: payload.to_vec() })
    }
}

/// Sender side: builds the full frame sequence for copying every checkpoint
/// generation named in a metadata table.
pub struct CopyManager {
    file_chunk_size: usize,
}

impl Default for CopyManager {
    fn default() -> Self {
        Self::new(DEFAULT_FILE_CHUNK_SIZE)
    }
}

impl CopyManager {
    /// Use `file_chunk_size`-byte frames for raw file bytes.
    pub fn new(file_chunk_size: usize) -> Self {
        CopyManager { file_chunk_size }
    }

    /// Produce the full frame sequence for `table`'s generations, reading
    /// `.sfk`/`.sfv` files from `dir`.
    pub fn build_frames(&self, dir: &std::path::Path, table: &MetadataTable) -> Result<Vec<Frame>> {
        let mut frames = Vec::new();
        frames.push(Frame { kind: FrameKind::Version, payload: PERSISTENT_COPY_PROTOCOL_VERSION.to_le_bytes().to_vec() });
        frames.push(Frame { kind: FrameKind::MetadataTable, payload: table.to_wire_bytes() });

        let mut file_ids: Vec<u32> = table.entries().map(|m| m.file_id).collect();
        file_ids.sort_unstable();
        for file_id in file_ids {
            frames.push(Frame { kind: FrameKind::StartKeyFile, payload: file_id.to_le_bytes().to_vec() });
            self.stream_file(&key_file_path(dir, file_id), FrameKind::WriteKeyFile, &mut frames)?;
            frames.push(Frame { kind: FrameKind::EndKeyFile, payload: Vec::new() });

            frames.push(Frame { kind: FrameKind::StartValueFile, payload: file_id.to_le_bytes().to_vec() });
            self.stream_file(&value_file_path(dir, file_id), FrameKind::WriteValueFile, &mut frames)?;
            frames.push(Frame { kind: FrameKind::EndValueFile, payload: Vec::new() });
        }

        frames.push(Frame { kind: FrameKind::Complete, payload: Vec::new() });
        Ok(frames)
    }

    fn stream_file(&self, path: &std::path::Path, kind: FrameKind, frames: &mut Vec<Frame>) -> Result<()> {
        let mut file = File::open(path)?;
        let mut buf = vec![0u8; self.file_chunk_size];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            frames.push(Frame { kind, payload: buf[..n].to_vec() });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReceiveState {
    ExpectVersion,
    ExpectMetadataTable,
    ExpectFileOrComplete,
    InKeyFile(u32),
    InValueFile(u32),
    Done,
}

/// Receiver side: a state machine over the frame sequence that writes bytes
/// directly into `directory` and rejects out-of-order or mismatched-version
/// frames.
pub struct StoreCopyStream {
    directory: PathBuf,
    state: ReceiveState,
    current_file: Option<File>,
    metadata_table: Option<MetadataTable>,
}

impl StoreCopyStream {
    /// Begin receiving into `directory`, which must already exist.
    pub fn new(directory: PathBuf) -> Self {
        StoreCopyStream {
            directory,
            state: ReceiveState::ExpectVersion,
            current_file: None,
            metadata_table: None,
        }
    }

    /// Apply the next frame in sequence.
    pub fn apply(&mut self, frame: Frame) -> Result<()> {
        match (self.state, frame.kind) {
            (ReceiveState::ExpectVersion, FrameKind::Version) => {
                let version = u32::from_le_bytes(
                    frame.payload.as_slice().try_into().map_err(|_| Error::corrupted("copy stream", "malformed version payload"))?,
                );
                if version != PERSISTENT_COPY_PROTOCOL_VERSION {
                    return Err(Error::corrupted(
                        "copy stream",
                        format!("unsupported persistent copy protocol version {version}"),
                    ));
                }
                self.state = ReceiveState::ExpectMetadataTable;
                Ok(())
            }
            (ReceiveState::ExpectMetadataTable, FrameKind::MetadataTable) => {
                self.metadata_table = Some(MetadataTable::from_wire_bytes(&frame.payload, self.directory.clone())?);
                self.state = ReceiveState::ExpectFileOrComplete;
                Ok(())
            }
            (ReceiveState::ExpectFileOrComplete, FrameKind::StartKeyFile) => {
                let file_id = decode_file_id(&frame.payload)?;
                self.current_file = Some(File::create(key_file_path(&self.directory, file_id))?);
                self.state = ReceiveState::InKeyFile(file_id);
                Ok(())
            }
            (ReceiveState::InKeyFile(_), FrameKind::WriteKeyFile) => {
                self.write_current(&frame.payload)
            }
            (ReceiveState::InKeyFile(_), FrameKind::EndKeyFile) => {
                self.finish_current_file()?;
                self.state = ReceiveState::ExpectFileOrComplete;
                Ok(())
            }
            (ReceiveState::ExpectFileOrComplete, FrameKind::StartValueFile) => {
                let file_id = decode_file_id(&frame.payload)?;
                self.current_file = Some(File::create(value_file_path(&self.directory, file_id))?);
                self.state = ReceiveState::InValueFile(file_id);
                Ok(())
            }
            (ReceiveState::InValueFile(_), FrameKind::WriteValueFile) => {
                self.write_current(&frame.payload)
            }
            (ReceiveState::InValueFile(_), FrameKind::EndValueFile) => {
                self.finish_current_file()?;
                self.state = ReceiveState::ExpectFileOrComplete;
                Ok(())
            }
            (ReceiveState::ExpectFileOrComplete, FrameKind::Complete) => {
                self.state = ReceiveState::Done;
                Ok(())
            }
            (state, kind) => Err(Error::InvalidState(format!(
                "copy frame {kind:?} is not legal in state {state:?}"
            ))),
        }
    }

    fn write_current(&mut self, bytes: &[u8]) -> Result<()> {
        let file = self.current_file.as_mut().expect("write frame without an open file");
        file.write_all(bytes)?;
        Ok(())
    }

    fn finish_current_file(&mut self) -> Result<()> {
        if let Some(file) = self.current_file.take() {
            file.sync_all()?;
        }
        Ok(())
    }

    /// `true` once the `Complete` frame has been applied.
    pub fn is_complete(&self) -> bool {
        self.state == ReceiveState::Done
    }

    /// Consume the stream, returning the materialized metadata table. Fails
    /// if the `Complete` frame has not yet been applied.
    pub fn finish(self) -> Result<MetadataTable> {
        if self.state != ReceiveState::Done {
            return Err(Error::InvalidState("copy stream finished before Complete frame".into()));
        }
        self.metadata_table.ok_or_else(|| Error::InvalidState("copy stream never received a MetadataTable frame".into()))
    }
}

fn decode_file_id(bytes: &[u8]) -> Result<u32> {
    bytes
        .try_into()
        .map(u32::from_le_bytes)
        .map_err(|_| Error::corrupted("copy stream", "malformed file-id payload"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint_file::{CheckpointFileWriter, DEFAULT_CHUNK_SIZE};
    use crate::metadata_table::FileMetadata;
    use tempfile::tempdir;
    use tstore_core::types::{Lsn, RecordKind};

    #[test]
    fn full_copy_round_trips_into_a_fresh_directory() {
        let src_dir = tempdir().unwrap();
        let mut writer = CheckpointFileWriter::create(src_dir.path(), 1, DEFAULT_CHUNK_SIZE).unwrap();
        writer.add_live(RecordKind::Inserted, Lsn(1), b"a", b"alpha").unwrap();
        let props = writer.finish().unwrap();

        let mut table = MetadataTable::new(src_dir.path().to_path_buf());
        table.insert(FileMetadata::from_properties(src_dir.path().to_path_buf(), &props, 1));

        let frames = CopyManager::default().build_frames(src_dir.path(), &table).unwrap();

        let dst_dir = tempdir().unwrap();
        let mut stream = StoreCopyStream::new(dst_dir.path().to_path_buf());
        for frame in frames {
            stream.apply(frame).unwrap();
        }
        let received_table = stream.finish().unwrap();
        assert_eq!(received_table.max_file_id(), 1);
        assert!(key_file_path(dst_dir.path(), 1).exists());
        assert!(value_file_path(dst_dir.path(), 1).exists());
    }

    #[test]
    fn rejects_out_of_order_frame() {
        let dst_dir = tempdir().unwrap();
        let mut stream = StoreCopyStream::new(dst_dir.path().to_path_buf());
        let bad = Frame { kind: FrameKind::Complete, payload: Vec::new() };
        assert!(stream.apply(bad).is_err());
    }

    #[test]
    fn rejects_mismatched_version() {
        let dst_dir = tempdir().unwrap();
        let mut stream = StoreCopyStream::new(dst_dir.path().to_path_buf());
        let bad = Frame { kind: FrameKind::Version, payload: 99u32.to_le_bytes().to_vec() };
        assert!(stream.apply(bad).is_err());
    }
}
