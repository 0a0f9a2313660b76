//! Typed index keys, their total ordering and their binary encoding.
//!
//! Every key is encoded as `[type: u8][length: u8][data]`:
//!
//! | Type          | Tag | Data                                              |
//! |---------------|-----|---------------------------------------------------|
//! | absent        | 0   | none (length 0)                                   |
//! | string        | 1   | UTF-8 bytes, at most 255                          |
//! | number        | 2   | IEEE-754 double, big-endian, trailing zeros cut   |
//! | boolean       | 3   | one byte, 0 or 1                                  |
//! | date          | 4   | millisecond timestamp, encoded like a number      |
//!
//! # Ordering
//!
//! Keys of different types compare by a fixed rank:
//! absent < boolean < number/date < string. Numbers and dates share a rank
//! and compare by numeric value (dates by their millisecond timestamp).

#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]

use std::cmp::Ordering;

/// Maximum encoded length of a key's data section.
pub const MAX_KEY_DATA_LENGTH: usize = 255;

/// Maximum encoded length of a key (type + length + data).
pub const MAX_ENCODED_KEY_LENGTH: usize = 2 + MAX_KEY_DATA_LENGTH;

/// Errors raised while encoding or decoding keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    /// Unknown type tag.
    InvalidKeyType(u8),
    /// String key longer than 255 encoded bytes.
    KeyTooLong { length: usize },
    /// Buffer ended in the middle of a key.
    UnexpectedEnd { needed: usize, available: usize },
    /// Data section has an impossible length for its type.
    InvalidByteLength { key_type: KeyType, length: usize },
    /// String data is not valid UTF-8.
    InvalidUtf8,
}

impl std::fmt::Display for KeyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidKeyType(tag) => write!(f, "invalid key type tag {tag}"),
            Self::KeyTooLong { length } => write!(
                f,
                "key is {length} bytes, maximum is {MAX_KEY_DATA_LENGTH}"
            ),
            Self::UnexpectedEnd { needed, available } => write!(
                f,
                "unexpected end of key data: needed {needed} bytes, {available} available"
            ),
            Self::InvalidByteLength { key_type, length } => {
                write!(f, "invalid data length {length} for {key_type:?} key")
            }
            Self::InvalidUtf8 => write!(f, "string key is not valid UTF-8"),
        }
    }
}

impl std::error::Error for KeyError {}

/// Type tag stored in the first byte of an encoded key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KeyType {
    Undefined = 0,
    String = 1,
    Number = 2,
    Boolean = 3,
    Date = 4,
}

impl TryFrom<u8> for KeyType {
    type Error = KeyError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Undefined),
            1 => Ok(Self::String),
            2 => Ok(Self::Number),
            3 => Ok(Self::Boolean),
            4 => Ok(Self::Date),
            other => Err(KeyError::InvalidKeyType(other)),
        }
    }
}

/// An index key.
#[derive(Debug, Clone)]
pub enum Key {
    /// No value (an unset field). Sorts before everything else.
    Absent,
    Boolean(bool),
    Number(f64),
    String(String),
    /// Milliseconds since the Unix epoch.
    Date(i64),
}

impl Key {
    /// Creates a date key from a millisecond timestamp.
    #[must_use]
    pub const fn date(millis: i64) -> Self {
        Self::Date(millis)
    }

    /// Returns the type tag of this key.
    #[must_use]
    pub const fn key_type(&self) -> KeyType {
        match self {
            Self::Absent => KeyType::Undefined,
            Self::Boolean(_) => KeyType::Boolean,
            Self::Number(_) => KeyType::Number,
            Self::String(_) => KeyType::String,
            Self::Date(_) => KeyType::Date,
        }
    }

    /// Returns the string contents for string keys.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns true for the absent key.
    #[must_use]
    pub const fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }

    const fn rank(&self) -> u8 {
        match self {
            Self::Absent => 0,
            Self::Boolean(_) => 1,
            Self::Number(_) | Self::Date(_) => 2,
            Self::String(_) => 3,
        }
    }

    fn numeric(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Date(ms) => Some(*ms as f64),
            _ => None,
        }
    }

    /// Compares two keys using the index ordering.
    #[must_use]
    pub fn compare(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Absent, Self::Absent) => Ordering::Equal,
            (Self::Boolean(a), Self::Boolean(b)) => a.cmp(b),
            (Self::String(a), Self::String(b)) => a.cmp(b),
            _ => match (self.numeric(), other.numeric()) {
                (Some(a), Some(b)) => a.total_cmp(&b),
                _ => self.rank().cmp(&other.rank()),
            },
        }
    }

    /// Encoded data section, without the type and length bytes.
    fn data(&self) -> Result<Vec<u8>, KeyError> {
        match self {
            Self::Absent => Ok(Vec::new()),
            Self::Boolean(b) => Ok(vec![u8::from(*b)]),
            Self::Number(n) => Ok(encode_number(*n)),
            Self::Date(ms) => Ok(encode_number(*ms as f64)),
            Self::String(s) => {
                if s.len() > MAX_KEY_DATA_LENGTH {
                    return Err(KeyError::KeyTooLong { length: s.len() });
                }
                Ok(s.as_bytes().to_vec())
            }
        }
    }

    /// Appends the encoded key to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) -> Result<(), KeyError> {
        let data = self.data()?;
        out.push(self.key_type() as u8);
        out.push(data.len() as u8);
        out.extend_from_slice(&data);
        Ok(())
    }

    /// Encodes the key into a fresh buffer.
    pub fn to_bytes(&self) -> Result<Vec<u8>, KeyError> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut out)?;
        Ok(out)
    }

    /// Number of bytes the encoded key occupies.
    ///
    /// String keys over the maximum length report their full length; encoding
    /// them still fails.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        2 + match self {
            Self::Absent => 0,
            Self::Boolean(_) => 1,
            Self::Number(n) => number_data_len(*n),
            Self::Date(ms) => number_data_len(*ms as f64),
            Self::String(s) => s.len(),
        }
    }

    /// Decodes a key from `bytes`, returning the key and the bytes consumed.
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize), KeyError> {
        if bytes.len() < 2 {
            return Err(KeyError::UnexpectedEnd {
                needed: 2,
                available: bytes.len(),
            });
        }
        let key_type = KeyType::try_from(bytes[0])?;
        let length = bytes[1] as usize;
        let data = bytes
            .get(2..2 + length)
            .ok_or(KeyError::UnexpectedEnd {
                needed: 2 + length,
                available: bytes.len(),
            })?;

        let key = match key_type {
            KeyType::Undefined => {
                if length != 0 {
                    return Err(KeyError::InvalidByteLength { key_type, length });
                }
                Self::Absent
            }
            KeyType::Boolean => {
                if length != 1 {
                    return Err(KeyError::InvalidByteLength { key_type, length });
                }
                Self::Boolean(data[0] != 0)
            }
            KeyType::Number => Self::Number(decode_number(data, key_type)?),
            KeyType::Date => Self::Date(decode_number(data, key_type)? as i64),
            KeyType::String => Self::String(
                String::from_utf8(data.to_vec()).map_err(|_| KeyError::InvalidUtf8)?,
            ),
        };
        Ok((key, 2 + length))
    }
}

fn encode_number(value: f64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let len = number_data_len(value);
    bytes[..len].to_vec()
}

fn number_data_len(value: f64) -> usize {
    let bytes = value.to_be_bytes();
    bytes.iter().rposition(|b| *b != 0).map_or(0, |last| last + 1)
}

fn decode_number(data: &[u8], key_type: KeyType) -> Result<f64, KeyError> {
    if data.len() > 8 {
        return Err(KeyError::InvalidByteLength {
            key_type,
            length: data.len(),
        });
    }
    let mut bytes = [0u8; 8];
    bytes[..data.len()].copy_from_slice(data);
    Ok(f64::from_be_bytes(bytes))
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.compare(other) == Ordering::Equal
    }
}

impl Eq for Key {}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare(other)
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Absent => write!(f, "<absent>"),
            Self::Boolean(b) => write!(f, "{b}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s:?}"),
            Self::Date(ms) => write!(f, "date({ms})"),
        }
    }
}

impl From<bool> for Key {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<f64> for Key {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<i32> for Key {
    fn from(value: i32) -> Self {
        Self::Number(f64::from(value))
    }
}

impl From<u32> for Key {
    fn from(value: u32) -> Self {
        Self::Number(f64::from(value))
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for Key {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

/// The six ordering predicates over keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Less,
    LessOrEqual,
    Equal,
    NotEqual,
    Greater,
    GreaterOrEqual,
}

impl CompareOp {
    /// Evaluates `left <op> right`.
    #[must_use]
    pub fn evaluate(self, left: &Key, right: &Key) -> bool {
        let ord = left.compare(right);
        match self {
            Self::Less => ord == Ordering::Less,
            Self::LessOrEqual => ord != Ordering::Greater,
            Self::Equal => ord == Ordering::Equal,
            Self::NotEqual => ord != Ordering::Equal,
            Self::Greater => ord == Ordering::Greater,
            Self::GreaterOrEqual => ord != Ordering::Less,
        }
    }
}
