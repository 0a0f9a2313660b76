//! Values stored against keys.
//!
//! Each value is a record pointer (an opaque byte string locating the indexed
//! record) followed by the entry's metadata keys, in the order the tree
//! declares its metadata key names:
//!
//! ```text
//! [rp_length: u8][record pointer bytes][metadata key]*
//! ```
//!
//! A non-unique tree stores a value list per key, prefixed by its length:
//!
//! ```text
//! [value_count: u32][value]*
//! ```

#![allow(clippy::cast_possible_truncation)]

use crate::key::{Key, KeyError};

/// Maximum length of a record pointer in bytes.
pub const MAX_RECORD_POINTER_LENGTH: usize = 255;

/// Size of the value-count prefix of a non-unique value list.
pub const VALUE_LIST_COUNT_SIZE: usize = 4;

/// Errors raised while encoding or decoding entry values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryError {
    /// Record pointer longer than 255 bytes.
    RecordPointerTooLong { length: usize },
    /// Value carries a different number of metadata keys than the tree declares.
    MetadataMismatch { expected: usize, actual: usize },
    /// Buffer ended in the middle of a value.
    UnexpectedEnd { needed: usize, available: usize },
    /// Metadata key could not be encoded or decoded.
    Key(KeyError),
}

impl std::fmt::Display for EntryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RecordPointerTooLong { length } => write!(
                f,
                "record pointer is {length} bytes, maximum is {MAX_RECORD_POINTER_LENGTH}"
            ),
            Self::MetadataMismatch { expected, actual } => write!(
                f,
                "value has {actual} metadata keys, tree declares {expected}"
            ),
            Self::UnexpectedEnd { needed, available } => write!(
                f,
                "unexpected end of value data: needed {needed} bytes, {available} available"
            ),
            Self::Key(e) => write!(f, "metadata key: {e}"),
        }
    }
}

impl std::error::Error for EntryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Key(e) => Some(e),
            _ => None,
        }
    }
}

impl From<KeyError> for EntryError {
    fn from(e: KeyError) -> Self {
        Self::Key(e)
    }
}

/// Opaque locator of an indexed record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordPointer(Vec<u8>);

impl RecordPointer {
    /// Creates a record pointer from raw bytes. Length is checked on encode.
    #[must_use]
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for RecordPointer {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl std::fmt::Display for RecordPointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/// One value stored against a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryValue {
    pub record_pointer: RecordPointer,
    /// Metadata keys, positionally aligned with the tree's metadata key names.
    pub metadata: Vec<Key>,
}

impl EntryValue {
    /// Creates a value without metadata.
    #[must_use]
    pub const fn new(record_pointer: RecordPointer) -> Self {
        Self {
            record_pointer,
            metadata: Vec::new(),
        }
    }

    #[must_use]
    pub const fn with_metadata(record_pointer: RecordPointer, metadata: Vec<Key>) -> Self {
        Self {
            record_pointer,
            metadata,
        }
    }

    /// Looks up a metadata key by name using the tree's declared names.
    #[must_use]
    pub fn metadata_value<'a>(&'a self, names: &[String], name: &str) -> Option<&'a Key> {
        names
            .iter()
            .position(|n| n == name)
            .and_then(|i| self.metadata.get(i))
    }

    /// Checks the value against the tree's metadata declaration.
    pub fn validate(&self, metadata_count: usize) -> Result<(), EntryError> {
        if self.record_pointer.0.len() > MAX_RECORD_POINTER_LENGTH {
            return Err(EntryError::RecordPointerTooLong {
                length: self.record_pointer.0.len(),
            });
        }
        if self.metadata.len() != metadata_count {
            return Err(EntryError::MetadataMismatch {
                expected: metadata_count,
                actual: self.metadata.len(),
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn encoded_len(&self) -> usize {
        1 + self.record_pointer.0.len() + self.metadata.iter().map(Key::encoded_len).sum::<usize>()
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) -> Result<(), EntryError> {
        let rp = &self.record_pointer.0;
        if rp.len() > MAX_RECORD_POINTER_LENGTH {
            return Err(EntryError::RecordPointerTooLong { length: rp.len() });
        }
        out.push(rp.len() as u8);
        out.extend_from_slice(rp);
        for key in &self.metadata {
            key.encode_into(out)?;
        }
        Ok(())
    }

    /// Decodes one value carrying `metadata_count` metadata keys.
    pub fn decode(bytes: &[u8], metadata_count: usize) -> Result<(Self, usize), EntryError> {
        let rp_len = *bytes.first().ok_or(EntryError::UnexpectedEnd {
            needed: 1,
            available: 0,
        })? as usize;
        let rp = bytes.get(1..=rp_len).ok_or(EntryError::UnexpectedEnd {
            needed: 1 + rp_len,
            available: bytes.len(),
        })?;
        let mut pos = 1 + rp_len;
        let mut metadata = Vec::with_capacity(metadata_count);
        for _ in 0..metadata_count {
            let (key, used) = Key::decode(&bytes[pos..])?;
            metadata.push(key);
            pos += used;
        }
        Ok((
            Self {
                record_pointer: RecordPointer(rp.to_vec()),
                metadata,
            },
            pos,
        ))
    }
}

/// A key with all of its values, as handed out by searches and builders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafEntry {
    pub key: Key,
    pub values: Vec<EntryValue>,
}

impl LeafEntry {
    #[must_use]
    pub const fn new(key: Key, values: Vec<EntryValue>) -> Self {
        Self { key, values }
    }

    /// Total record pointer count of this entry.
    #[must_use]
    pub const fn value_count(&self) -> usize {
        self.values.len()
    }
}

/// Sum of the encoded lengths of `values`, excluding any count prefix.
#[must_use]
pub fn values_len(values: &[EntryValue]) -> usize {
    values.iter().map(EntryValue::encoded_len).sum()
}

/// Encoded length of a value list, including the count prefix of non-unique trees.
#[must_use]
pub fn value_list_len(values: &[EntryValue], unique: bool) -> usize {
    values_len(values) + if unique { 0 } else { VALUE_LIST_COUNT_SIZE }
}

/// Appends a value list. Unique trees store their single value without a prefix.
pub fn encode_value_list(
    values: &[EntryValue],
    unique: bool,
    out: &mut Vec<u8>,
) -> Result<(), EntryError> {
    if !unique {
        out.extend_from_slice(&(values.len() as u32).to_be_bytes());
    }
    for value in values {
        value.encode_into(out)?;
    }
    Ok(())
}

/// Decodes a value list written by [`encode_value_list`].
pub fn decode_value_list(
    bytes: &[u8],
    unique: bool,
    metadata_count: usize,
) -> Result<Vec<EntryValue>, EntryError> {
    if unique {
        let (value, _) = EntryValue::decode(bytes, metadata_count)?;
        return Ok(vec![value]);
    }
    let count_bytes: [u8; 4] = bytes
        .get(..VALUE_LIST_COUNT_SIZE)
        .and_then(|b| b.try_into().ok())
        .ok_or(EntryError::UnexpectedEnd {
            needed: VALUE_LIST_COUNT_SIZE,
            available: bytes.len(),
        })?;
    let count = u32::from_be_bytes(count_bytes) as usize;
    let mut pos = VALUE_LIST_COUNT_SIZE;
    let mut values = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let (value, used) = EntryValue::decode(&bytes[pos..], metadata_count)?;
        values.push(value);
        pos += used;
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(rp: &str) -> EntryValue {
        EntryValue::new(RecordPointer::from(rp))
    }

    #[test]
    fn test_value_with_metadata() {
        let v = EntryValue::with_metadata(
            RecordPointer::from("users/ewout"),
            vec![Key::from(42), Key::from("nl")],
        );
        let mut buf = Vec::new();
        v.encode_into(&mut buf).expect("encode");
        assert_eq!(buf.len(), v.encoded_len());

        let (decoded, used) = EntryValue::decode(&buf, 2).expect("decode");
        assert_eq!(used, buf.len());
        assert_eq!(decoded, v);

        let names = vec!["age".to_string(), "country".to_string()];
        assert_eq!(decoded.metadata_value(&names, "country"), Some(&Key::from("nl")));
        assert_eq!(decoded.metadata_value(&names, "missing"), None);
    }

    #[test]
    fn test_value_list_prefix() {
        let values = vec![value("a"), value("bc")];
        let mut buf = Vec::new();
        encode_value_list(&values, false, &mut buf).expect("encode");
        assert_eq!(&buf[..4], &2u32.to_be_bytes());
        assert_eq!(buf.len(), value_list_len(&values, false));
        assert_eq!(decode_value_list(&buf, false, 0).expect("decode"), values);

        let mut single = Vec::new();
        encode_value_list(&values[..1], true, &mut single).expect("encode");
        assert_eq!(single, vec![1, b'a']);
    }

    #[test]
    fn test_validation() {
        let long = EntryValue::new(RecordPointer::new(vec![0u8; 256]));
        assert_eq!(
            long.validate(0),
            Err(EntryError::RecordPointerTooLong { length: 256 })
        );
        assert_eq!(
            value("a").validate(1),
            Err(EntryError::MetadataMismatch {
                expected: 1,
                actual: 0
            })
        );
    }

    #[test]
    fn test_truncated_value() {
        assert!(matches!(
            EntryValue::decode(&[5, b'a'], 0),
            Err(EntryError::UnexpectedEnd { .. })
        ));
    }
}
