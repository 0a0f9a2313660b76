//! Crate-level error type.
//!
//! Every error exposes a stable machine-readable [`ErrorKind`] through
//! [`TreeError::kind`], a human readable message through `Display`, and where
//! relevant the underlying cause through `std::error::Error::source`.

use crate::config::ConfigError;
use crate::entry::{EntryError, RecordPointer};
use crate::key::{Key, KeyError};
use crate::layout::LayoutError;
use crate::lock::LockError;
use crate::storage::StorageError;
use crate::tree::commit::CommitError;

/// Stable classification of errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidKeyType,
    KeyTooLong,
    DuplicateKey,
    UniqueKeyViolation,
    DuplicateValue,
    KeyNotFound,
    ValueNotFound,
    LeafEmpty,
    InvalidByteLength,
    UnexpectedEnd,
    MaxLeafSizeReached,
    MaxNodeSizeReached,
    LeafTooSmallForExtData,
    TreeFullNoAutogrow,
    ReadOnlyLegacyFormat,
    TreeIdNotSet,
    LockTimeout,
    RolledBack,
    RollbackFailed,
    Storage,
    InvalidArgument,
    InvalidPattern,
    Config,
}

impl ErrorKind {
    /// Machine-readable code.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidKeyType => "invalid-key-type",
            Self::KeyTooLong => "key-too-long",
            Self::DuplicateKey => "duplicate-key",
            Self::UniqueKeyViolation => "unique-key-violation",
            Self::DuplicateValue => "duplicate-value",
            Self::KeyNotFound => "key-not-found",
            Self::ValueNotFound => "value-not-found",
            Self::LeafEmpty => "leaf-empty",
            Self::InvalidByteLength => "invalid-byte-length",
            Self::UnexpectedEnd => "unexpected-end",
            Self::MaxLeafSizeReached => "max-leaf-size-reached",
            Self::MaxNodeSizeReached => "max-node-size-reached",
            Self::LeafTooSmallForExtData => "leaf-too-small-for-extdata",
            Self::TreeFullNoAutogrow => "tree-full-no-autogrow",
            Self::ReadOnlyLegacyFormat => "read-only-legacy-format",
            Self::TreeIdNotSet => "tree-id-not-set",
            Self::LockTimeout => "lock-timeout",
            Self::RolledBack => "rolled-back",
            Self::RollbackFailed => "rollback-failed",
            Self::Storage => "storage",
            Self::InvalidArgument => "invalid-argument",
            Self::InvalidPattern => "invalid-pattern",
            Self::Config => "config",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl KeyError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidKeyType(_) => ErrorKind::InvalidKeyType,
            Self::KeyTooLong { .. } => ErrorKind::KeyTooLong,
            Self::UnexpectedEnd { .. } => ErrorKind::UnexpectedEnd,
            Self::InvalidByteLength { .. } | Self::InvalidUtf8 => ErrorKind::InvalidByteLength,
        }
    }
}

impl EntryError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::RecordPointerTooLong { .. } | Self::MetadataMismatch { .. } => {
                ErrorKind::InvalidArgument
            }
            Self::UnexpectedEnd { .. } => ErrorKind::UnexpectedEnd,
            Self::Key(e) => e.kind(),
        }
    }
}

impl LayoutError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::UnexpectedEnd { .. } => ErrorKind::UnexpectedEnd,
            Self::InvalidByteLength { .. }
            | Self::UnexpectedRecord { .. }
            | Self::OffsetOutOfRange { .. }
            | Self::InvalidMetadata(_) => ErrorKind::InvalidByteLength,
            Self::TooManyEntries { .. } | Self::LeafTooSmall { .. } | Self::NeedsExtData => {
                ErrorKind::MaxLeafSizeReached
            }
            Self::ExtTooSmall { .. } => ErrorKind::LeafTooSmallForExtData,
            Self::NodeTooSmall { .. } => ErrorKind::MaxNodeSizeReached,
            Self::Key(e) => e.kind(),
            Self::Entry(e) => e.kind(),
        }
    }
}

/// Errors raised by tree operations.
#[derive(Debug)]
pub enum TreeError {
    Key(KeyError),
    Entry(EntryError),
    Layout(LayoutError),
    Storage(StorageError),
    Lock(LockError),
    Commit(CommitError),
    Config(ConfigError),
    /// Key already present while building a unique tree.
    DuplicateKey(Key),
    /// Key already present in a unique binary tree.
    UniqueKeyViolation(Key),
    /// Record pointer already stored under the key.
    DuplicateValue {
        key: Key,
        record_pointer: RecordPointer,
    },
    KeyNotFound(Key),
    ValueNotFound {
        key: Key,
        record_pointer: RecordPointer,
    },
    /// Removing a leaf would leave its parent without entries; rebuild needed.
    LeafEmpty,
    /// Mutation needs more space and auto-grow is disabled.
    TreeFullNoAutogrow { requested: u64 },
    /// Tree uses 32-bit pointers and cannot be written.
    ReadOnlyLegacyFormat,
    InvalidArgument(String),
    InvalidPattern(String),
}

impl TreeError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Key(e) => e.kind(),
            Self::Entry(e) => e.kind(),
            Self::Layout(e) => e.kind(),
            Self::Storage(_) => ErrorKind::Storage,
            Self::Lock(e) => e.kind(),
            Self::Commit(e) => e.kind(),
            Self::Config(_) => ErrorKind::Config,
            Self::DuplicateKey(_) => ErrorKind::DuplicateKey,
            Self::UniqueKeyViolation(_) => ErrorKind::UniqueKeyViolation,
            Self::DuplicateValue { .. } => ErrorKind::DuplicateValue,
            Self::KeyNotFound(_) => ErrorKind::KeyNotFound,
            Self::ValueNotFound { .. } => ErrorKind::ValueNotFound,
            Self::LeafEmpty => ErrorKind::LeafEmpty,
            Self::TreeFullNoAutogrow { .. } => ErrorKind::TreeFullNoAutogrow,
            Self::ReadOnlyLegacyFormat => ErrorKind::ReadOnlyLegacyFormat,
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::InvalidPattern(_) => ErrorKind::InvalidPattern,
        }
    }
}

impl std::fmt::Display for TreeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Key(e) => write!(f, "key error: {e}"),
            Self::Entry(e) => write!(f, "value error: {e}"),
            Self::Layout(e) => write!(f, "layout error: {e}"),
            Self::Storage(e) => write!(f, "storage error: {e}"),
            Self::Lock(e) => write!(f, "lock error: {e}"),
            Self::Commit(e) => write!(f, "commit error: {e}"),
            Self::Config(e) => write!(f, "config error: {e}"),
            Self::DuplicateKey(key) => write!(f, "duplicate key {key}"),
            Self::UniqueKeyViolation(key) => {
                write!(f, "key {key} already exists in unique tree")
            }
            Self::DuplicateValue {
                key,
                record_pointer,
            } => write!(f, "value {record_pointer} already stored under key {key}"),
            Self::KeyNotFound(key) => write!(f, "key {key} not found"),
            Self::ValueNotFound {
                key,
                record_pointer,
            } => write!(f, "value {record_pointer} not found under key {key}"),
            Self::LeafEmpty => write!(
                f,
                "leaf is empty and its parent cannot lose another entry, rebuild the tree"
            ),
            Self::TreeFullNoAutogrow { requested } => write!(
                f,
                "tree has no room for {requested} bytes and auto-grow is disabled"
            ),
            Self::ReadOnlyLegacyFormat => {
                write!(f, "tree uses legacy 32-bit pointers and is read-only")
            }
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Self::InvalidPattern(msg) => write!(f, "invalid pattern: {msg}"),
        }
    }
}

impl std::error::Error for TreeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Key(e) => Some(e),
            Self::Entry(e) => Some(e),
            Self::Layout(e) => Some(e),
            Self::Storage(e) => Some(e),
            Self::Lock(e) => Some(e),
            Self::Commit(e) => Some(e),
            Self::Config(e) => Some(e),
            _ => None,
        }
    }
}

impl From<KeyError> for TreeError {
    fn from(e: KeyError) -> Self {
        Self::Key(e)
    }
}

impl From<EntryError> for TreeError {
    fn from(e: EntryError) -> Self {
        Self::Entry(e)
    }
}

impl From<LayoutError> for TreeError {
    fn from(e: LayoutError) -> Self {
        Self::Layout(e)
    }
}

impl From<StorageError> for TreeError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

impl From<LockError> for TreeError {
    fn from(e: LockError) -> Self {
        Self::Lock(e)
    }
}

impl From<CommitError> for TreeError {
    fn from(e: CommitError) -> Self {
        Self::Commit(e)
    }
}

impl From<ConfigError> for TreeError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}
