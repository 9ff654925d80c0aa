//! Error taxonomy for snapshot operations.
//!
//! Every variant raised by a handle operation names that operation, so a
//! caller can tell a failed store from a failed retrieve without parsing
//! messages. Nothing here is retried.

use crate::services::object_store::StorageError;
use std::{fmt, io, path::PathBuf};
use thiserror::Error;

/// The stage that produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Open,
    Store,
    Retrieve,
    Info,
    Delete,
    Verify,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Open => "open",
            Operation::Store => "store",
            Operation::Retrieve => "retrieve",
            Operation::Info => "info",
            Operation::Delete => "delete",
            Operation::Verify => "verify",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    /// The backing catalog could not be reached.
    #[error("{op}: cannot reach object store: {source}")]
    Connection {
        op: Operation,
        #[source]
        source: StorageError,
    },

    /// The bucket exists (or should) but cannot be created or opened.
    #[error("{op}: bucket `{bucket}` is unusable: {source}")]
    Bucket {
        op: Operation,
        bucket: String,
        #[source]
        source: StorageError,
    },

    #[error("invalid snapshot name `{0}`")]
    InvalidName(String),

    #[error("{op}: cannot read source file {}: {source}", path.display())]
    SourceFile {
        op: Operation,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{op}: cannot write destination {}: {source}", path.display())]
    Destination {
        op: Operation,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The transfer to or from the object store failed, possibly mid-stream.
    #[error("{op}: transfer of `{name}` failed: {source}")]
    Transport {
        op: Operation,
        name: String,
        #[source]
        source: StorageError,
    },

    #[error("{op}: snapshot `{name}` not found in bucket `{bucket}`")]
    NotFound {
        op: Operation,
        bucket: String,
        name: String,
    },

    #[error("cannot open {} as a database: {source}", path.display())]
    EngineOpen {
        path: PathBuf,
        #[source]
        source: sqlx::Error,
    },

    #[error("query `{query}` failed on {}: {source}", path.display())]
    Query {
        path: PathBuf,
        query: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("verify: query `{query}` returned {actual}, expected {expected}")]
    UnexpectedValue {
        query: String,
        expected: i64,
        actual: i64,
    },

    #[error("verify: digest of {} is {actual}, expected {expected}", path.display())]
    DigestMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },
}

pub type SnapshotResult<T> = Result<T, SnapshotError>;

impl SnapshotError {
    /// The operation that failed, when the error came from a handle call.
    pub fn operation(&self) -> Option<Operation> {
        match self {
            SnapshotError::Connection { op, .. }
            | SnapshotError::Bucket { op, .. }
            | SnapshotError::SourceFile { op, .. }
            | SnapshotError::Destination { op, .. }
            | SnapshotError::Transport { op, .. }
            | SnapshotError::NotFound { op, .. } => Some(*op),
            SnapshotError::UnexpectedValue { .. } | SnapshotError::DigestMismatch { .. } => {
                Some(Operation::Verify)
            }
            SnapshotError::InvalidName(_)
            | SnapshotError::EngineOpen { .. }
            | SnapshotError::Query { .. } => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, SnapshotError::NotFound { .. })
    }
}
