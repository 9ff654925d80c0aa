//! src/services/verifier.rs
//!
//! Round-trip checks for a retrieved snapshot: semantic (the file opens as a
//! database and a known query answers) and byte-level (the payload digest
//! matches what was recorded at store time).

use crate::{
    errors::{Operation, SnapshotError, SnapshotResult},
    models::object::ObjectInfo,
    services::{engine::SnapshotDatabase, object_store::format_digest},
};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::info;

pub const DEFAULT_VERIFY_QUERY: &str = "SELECT COUNT(*) FROM users";

/// Outcome of a successful semantic check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    pub path: PathBuf,
    pub query: String,
    pub value: i64,
}

#[derive(Debug, Clone)]
pub struct Verifier {
    query: String,
    expected: Option<i64>,
}

impl Default for Verifier {
    fn default() -> Self {
        Self::new(DEFAULT_VERIFY_QUERY)
    }
}

impl Verifier {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            expected: None,
        }
    }

    /// Fail verification unless the query returns exactly `value`.
    pub fn expecting(mut self, value: i64) -> Self {
        self.expected = Some(value);
        self
    }

    /// Open `path` read-only and run the verification query against it.
    pub async fn verify(&self, path: impl AsRef<Path>) -> SnapshotResult<Verification> {
        let mut db = SnapshotDatabase::open_read_only(path).await?;
        let value = db.query_scalar(&self.query).await?;
        let path = db.path().to_path_buf();
        db.close().await?;

        if let Some(expected) = self.expected {
            if expected != value {
                return Err(SnapshotError::UnexpectedValue {
                    query: self.query.clone(),
                    expected,
                    actual: value,
                });
            }
        }

        info!("Database verified: {} returned {}", self.query, value);
        Ok(Verification {
            path,
            query: self.query.clone(),
            value,
        })
    }
}

/// Compare the digest of a local file with the one recorded for the object.
pub async fn verify_digest(path: impl AsRef<Path>, info: &ObjectInfo) -> SnapshotResult<()> {
    let path = path.as_ref();
    let actual = file_digest(path).await?;
    if actual != info.digest {
        return Err(SnapshotError::DigestMismatch {
            path: path.to_path_buf(),
            expected: info.digest.clone(),
            actual,
        });
    }
    Ok(())
}

/// Digest of a local file in the same `MD5=<base64>` form the store records.
pub async fn file_digest(path: &Path) -> SnapshotResult<String> {
    let source_err = |source| SnapshotError::SourceFile {
        op: Operation::Verify,
        path: path.to_path_buf(),
        source,
    };

    let file = File::open(path).await.map_err(source_err)?;
    let mut stream = ReaderStream::new(file);
    let mut digest = md5::Context::new();
    while let Some(chunk) = stream.next().await {
        digest.consume(chunk.map_err(source_err)?);
    }
    Ok(format_digest(digest.compute()))
}
