use std::path::PathBuf;

use tarn_changeset::ChangesetError;
use tarn_types::{ObjectKey, TypeError, Version};

/// Coarse classification of failures, for callers that branch on the kind of
/// failure rather than the exact variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Another writer holds the file; retry later.
    WouldBlock,
    /// The file is not a Tarn file or has an unsupported format.
    InvalidFile,
    /// The on-disk schema does not match and no migration resolved it.
    SchemaMismatch,
    /// A remote changeset conflicts with local state.
    MergeConflict,
    /// Integrity checks failed; the file must not be written further.
    Corruption,
    /// Operating-system I/O failure.
    Io,
    /// Misuse of the API: missing tables, bad indices, type errors.
    Logic,
}

/// Errors from versioned store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Another writer currently holds the file.
    #[error("another write transaction is in progress")]
    WouldBlock,

    /// The file is not a valid store file.
    #[error("invalid store file {path}: {reason}")]
    InvalidFile { path: PathBuf, reason: String },

    /// An integrity check failed.
    #[error("corruption detected: {0}")]
    Corruption(String),

    /// The store was opened read-only.
    #[error("store is read-only")]
    ReadOnly,

    /// The version is neither the latest nor pinned by a live reader.
    #[error("version {0} is not available")]
    VersionNotAvailable(Version),

    #[error("no such table: {0}")]
    NoSuchTable(String),

    #[error("no such object {table}{key}")]
    NoSuchObject { table: String, key: ObjectKey },

    #[error("no such property {table}.{property}")]
    NoSuchProperty { table: String, property: String },

    #[error("table already exists: {0}")]
    TableExists(String),

    #[error("object {table}{key} already exists")]
    ObjectExists { table: String, key: ObjectKey },

    /// A primary-key value is already used by another object.
    #[error("duplicate primary key {value} in {table}")]
    DuplicatePrimaryKey { table: String, value: String },

    /// A value does not match the property's declared type.
    #[error("type mismatch for {table}.{property}: expected {expected}, got {actual}")]
    TypeMismatch {
        table: String,
        property: String,
        expected: String,
        actual: String,
    },

    #[error("wrong number of values for {table}: expected {expected}, got {actual}")]
    ArityMismatch {
        table: String,
        expected: usize,
        actual: usize,
    },

    #[error("list index {index} out of bounds for {property} (len {len})")]
    IndexOutOfBounds {
        property: String,
        index: usize,
        len: usize,
    },

    /// Schema validation failed.
    #[error("schema error: {0}")]
    Schema(#[from] TypeError),

    #[error("changeset error: {0}")]
    Changeset(#[from] ChangesetError),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::WouldBlock => ErrorKind::WouldBlock,
            Self::InvalidFile { .. } => ErrorKind::InvalidFile,
            Self::Corruption(_) => ErrorKind::Corruption,
            Self::Io(_) => ErrorKind::Io,
            Self::Schema(_) => ErrorKind::SchemaMismatch,
            _ => ErrorKind::Logic,
        }
    }

    pub(crate) fn serialization(err: impl std::fmt::Display) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
