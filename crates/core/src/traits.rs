//! User-pluggable seams: key ordering and value (de)serialization.
//!
//! TStore treats keys and values as opaque byte sequences ordered by a
//! user-supplied comparator (spec.md §3). These traits are the Rust
//! equivalent of the source's `IComparer<TKey>` and `IStateSerializer<T>`
//! COM interfaces (see DESIGN NOTES, §9): plain trait methods instead of
//! virtual dispatch through a serializer registry.

use std::cmp::Ordering;
use std::io::{Read, Write};

use crate::error::Result;

/// Orders keys of type `K`. Implemented for `K: Ord` by [`NaturalOrderComparer`]
/// for the common case; custom comparers (e.g. reversed, or comparing only a
/// prefix of a composite key) implement this directly.
pub trait KeyComparer<K>: Send + Sync {
    /// Compare two keys. Must be a total order and must agree with any
    /// comparer used previously against the same on-disk state — changing
    /// comparers on an existing store is undefined.
    fn compare(&self, a: &K, b: &K) -> Ordering;
}

/// The default comparer for naturally-ordered key types.
#[derive(Debug, Default, Clone, Copy)]
pub struct NaturalOrderComparer;

impl<K: Ord> KeyComparer<K> for NaturalOrderComparer {
    fn compare(&self, a: &K, b: &K) -> Ordering {
        a.cmp(b)
    }
}

/// Converts a value of type `T` to and from its on-disk byte representation.
///
/// Implementations must round-trip exactly: `read(&mut &write(v)[..]) == v`
/// for every `v`, since checkpoint files are read back bit-for-bit (spec.md
/// §8, round-trip laws).
pub trait StateSerializer<T>: Send + Sync {
    /// Serialize `value` onto `writer`.
    fn write(&self, value: &T, writer: &mut dyn Write) -> Result<()>;

    /// Deserialize a value from `reader`.
    fn read(&self, reader: &mut dyn Read) -> Result<T>;
}

/// A [`StateSerializer`] for `Vec<u8>` that writes/reads the bytes as-is,
/// length-prefixed. Used when keys or values are already raw bytes and no
/// further encoding is wanted.
#[derive(Debug, Default, Clone, Copy)]
pub struct BytesSerializer;

impl StateSerializer<Vec<u8>> for BytesSerializer {
    fn write(&self, value: &Vec<u8>, writer: &mut dyn Write) -> Result<()> {
        writer.write_all(&(value.len() as u32).to_le_bytes())?;
        writer.write_all(value)?;
        Ok(())
    }

    fn read(&self, reader: &mut dyn Read) -> Result<Vec<u8>> {
        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf)?;
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut buf = vec![0u8; len];
        reader.read_exact(&mut buf)?;
        Ok(buf)
    }
}
