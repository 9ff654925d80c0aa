//! src/services/object_store.rs
//!
//! The seam between the snapshot store and whatever durable key→blob store
//! backs it. `StorageService` is the implementation shipped with the crate;
//! tests plug in their own to inject transport failures.

use crate::models::{bucket::Bucket, object::ObjectInfo};
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use futures::stream::BoxStream;
use std::{collections::BTreeMap, future::Future, io};
use thiserror::Error;
use tokio::io::AsyncRead;

/// Payload handed to `put_object`, consumed chunk by chunk.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// Payload returned by `get_object`.
pub type ObjectReader = Box<dyn AsyncRead + Send + Unpin>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("bucket `{0}` not found")]
    BucketNotFound(String),
    #[error("bucket `{0}` already exists")]
    BucketAlreadyExists(String),
    #[error("bucket `{name}` invalid: {reason}")]
    InvalidBucketName { name: String, reason: String },
    #[error("object `{key}` not found in bucket `{bucket}`")]
    ObjectNotFound { bucket: String, key: String },
    #[error("invalid object key")]
    InvalidObjectKey,
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

impl StorageError {
    /// True when the catalog itself could not be reached, as opposed to a
    /// request it rejected.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            StorageError::Sqlx(
                sqlx::Error::Io(_)
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            )
        )
    }
}

/// Caller-settable metadata for a put.
#[derive(Debug, Clone, Default)]
pub struct ObjectMeta {
    pub description: Option<String>,
    pub headers: BTreeMap<String, String>,
}

impl ObjectMeta {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: Some(description.into()),
            headers: BTreeMap::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Durable key→blob store with per-object header metadata.
///
/// `put_object` must fully replace any previous object under the same key.
pub trait ObjectStore: Send + Sync {
    /// Reject a key this store could never hold. Accepts everything unless
    /// overridden.
    fn check_key(&self, key: &str) -> StorageResult<()> {
        let _ = key;
        Ok(())
    }

    /// Create a bucket. Fails with `BucketAlreadyExists` if the name is taken.
    fn create_bucket(
        &self,
        name: &str,
        description: &str,
    ) -> impl Future<Output = StorageResult<Bucket>> + Send;

    /// Open an existing bucket. Fails with `BucketNotFound` if it is absent.
    fn open_bucket(&self, name: &str) -> impl Future<Output = StorageResult<Bucket>> + Send;

    fn put_object(
        &self,
        bucket: &str,
        key: &str,
        meta: ObjectMeta,
        body: ByteStream,
    ) -> impl Future<Output = StorageResult<ObjectInfo>> + Send;

    fn get_object(
        &self,
        bucket: &str,
        key: &str,
    ) -> impl Future<Output = StorageResult<(ObjectInfo, ObjectReader)>> + Send;

    fn object_info(
        &self,
        bucket: &str,
        key: &str,
    ) -> impl Future<Output = StorageResult<ObjectInfo>> + Send;

    fn delete_object(
        &self,
        bucket: &str,
        key: &str,
    ) -> impl Future<Output = StorageResult<()>> + Send;
}

/// Render an MD5 digest the way it is recorded in object metadata.
pub fn format_digest(digest: md5::Digest) -> String {
    format!("MD5={}", general_purpose::STANDARD.encode(digest.0))
}
