// error.rs — Error types for the data store.
//
// Every failure is returned synchronously to the caller. Nothing here is
// retried internally: a caller that hits an error aborts the transaction
// and opens a new one.

use std::path::PathBuf;
use thiserror::Error;

/// Coarse classification of a [`StoreError`].
///
/// Callers that only care about "was it missing?" or "was the handle bad?"
/// match on the kind instead of every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The transaction handle cannot be used for this operation.
    InvalidTransaction,
    /// A write would break a tree invariant or does not resolve.
    InvalidPatch,
    /// A read or policy lookup found nothing.
    NotFound,
    /// Store configuration could not be loaded.
    Config,
    /// The bulk update stream failed.
    Update,
}

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A write-only operation was attempted on a read transaction.
    #[error("transaction {txn_id} is not a write transaction")]
    WrongTransactionType { txn_id: u64 },

    /// The transaction was opened against a different store.
    #[error("unknown transaction {txn_id}: handle belongs to another store")]
    UnknownTransaction { txn_id: u64 },

    /// The transaction was already committed or aborted.
    #[error("stale transaction {txn_id}")]
    StaleTransaction { txn_id: u64 },

    /// The calling thread already holds the writer lock (for example a
    /// commit observer trying to open a nested write transaction).
    #[error("write transaction cannot be opened while transaction {held_by} holds the writer on this thread")]
    WriterReentry { held_by: u64 },

    /// A slash-separated path string could not be parsed.
    #[error("invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: &'static str },

    /// Add/Replace at the root with a non-object value.
    #[error("root must be object")]
    RootMustBeObject,

    /// Remove at the root.
    #[error("root cannot be removed")]
    RootCannotBeRemoved,

    /// A path segment did not resolve during Remove/Replace.
    #[error("path not found: {path}")]
    PathNotFound { path: String },

    /// A path walks through a value that cannot hold children.
    #[error("path {path} conflicts with existing non-object value")]
    PathConflict { path: String },

    /// Array index outside the array bounds.
    #[error("index {index} out of range at {path}")]
    IndexOutOfRange { path: String, index: String },

    /// Segment used against an array is not a valid index.
    #[error("invalid array index '{segment}' at {path}")]
    InvalidIndex { path: String, segment: String },

    /// Two bulk updates put incompatible values at the same location.
    #[error("failed to insert data file from path {path}")]
    MergeConflict { path: String },

    /// The value could not be round tripped through JSON.
    #[error("value is not serializable: {0}")]
    NonSerializable(#[from] serde_json::Error),

    /// Read of a path that does not exist.
    #[error("not found: {path}")]
    NotFound { path: String },

    /// Get or delete of a policy id that does not exist.
    #[error("policy not found: {id}")]
    PolicyNotFound { id: String },

    /// Failed to read the config file.
    #[error("I/O error reading config at {path}: {source}")]
    ConfigIo {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Config file is not valid TOML for [`crate::StoreConfig`].
    #[error("invalid store config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// The update iterator passed to truncate yielded an error.
    #[error("update stream failed: {0}")]
    Update(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl StoreError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::WrongTransactionType { .. }
            | StoreError::UnknownTransaction { .. }
            | StoreError::StaleTransaction { .. }
            | StoreError::WriterReentry { .. } => ErrorKind::InvalidTransaction,
            StoreError::InvalidPath { .. }
            | StoreError::RootMustBeObject
            | StoreError::RootCannotBeRemoved
            | StoreError::PathNotFound { .. }
            | StoreError::PathConflict { .. }
            | StoreError::IndexOutOfRange { .. }
            | StoreError::InvalidIndex { .. }
            | StoreError::MergeConflict { .. }
            | StoreError::NonSerializable(_) => ErrorKind::InvalidPatch,
            StoreError::NotFound { .. } | StoreError::PolicyNotFound { .. } => {
                ErrorKind::NotFound
            }
            StoreError::ConfigIo { .. } | StoreError::ConfigParse(_) => ErrorKind::Config,
            StoreError::Update(_) => ErrorKind::Update,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub fn is_invalid_transaction(&self) -> bool {
        self.kind() == ErrorKind::InvalidTransaction
    }

    pub fn is_invalid_patch(&self) -> bool {
        self.kind() == ErrorKind::InvalidPatch
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
