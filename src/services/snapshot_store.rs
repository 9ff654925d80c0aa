//! src/services/snapshot_store.rs
//!
//! SnapshotStore binds one object store, one bucket and one logical
//! database name, and moves the database file in and out under that name.
//!
//! Each name holds exactly one object; `store` overwrites (last writer wins).
//! There is no locking across handles or processes: two handles storing the
//! same name concurrently race, and the backend decides who wins.

use crate::{
    errors::{Operation, SnapshotError, SnapshotResult},
    models::{
        bucket::Bucket,
        object::{CONTENT_TYPE_HEADER, ObjectInfo, TIMESTAMP_HEADER},
    },
    services::object_store::{ObjectMeta, ObjectReader, ObjectStore, StorageError},
};
use chrono::{SecondsFormat, Utc};
use futures::StreamExt;
use std::{
    io,
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const BUCKET_DESCRIPTION: &str = "SQLite database storage";
pub const SNAPSHOT_DESCRIPTION: &str = "SQLite database file";
pub const SNAPSHOT_CONTENT_TYPE: &str = "application/vnd.sqlite3";

/// Read size for streamed transfers.
const CHUNK_SIZE: usize = 64 * 1024;

/// How `ensure_bucket` found the bucket.
#[derive(Debug, Clone)]
pub enum BucketStatus {
    Created(Bucket),
    Existing(Bucket),
}

impl BucketStatus {
    pub fn into_bucket(self) -> Bucket {
        match self {
            BucketStatus::Created(bucket) | BucketStatus::Existing(bucket) => bucket,
        }
    }
}

/// Create the bucket, or open it if it already exists.
pub async fn ensure_bucket<S: ObjectStore>(
    store: &S,
    name: &str,
) -> SnapshotResult<BucketStatus> {
    let classify = |source: StorageError| {
        if source.is_connection_failure() {
            SnapshotError::Connection {
                op: Operation::Open,
                source,
            }
        } else {
            SnapshotError::Bucket {
                op: Operation::Open,
                bucket: name.to_string(),
                source,
            }
        }
    };

    match store.create_bucket(name, BUCKET_DESCRIPTION).await {
        Ok(bucket) => Ok(BucketStatus::Created(bucket)),
        Err(StorageError::BucketAlreadyExists(_)) => store
            .open_bucket(name)
            .await
            .map(BucketStatus::Existing)
            .map_err(classify),
        Err(err) => Err(classify(err)),
    }
}

pub struct SnapshotStore<S> {
    store: S,
    bucket: Bucket,
    name: String,
}

impl<S: ObjectStore> SnapshotStore<S> {
    /// Bind `name` in `bucket`, creating the bucket on first use.
    ///
    /// Blank or padded names, and names the store refuses as keys, fail here
    /// with `InvalidName` before any bucket is touched.
    pub async fn new(store: S, bucket: &str, name: &str) -> SnapshotResult<Self> {
        if name.trim().is_empty() || name.trim() != name || store.check_key(name).is_err() {
            return Err(SnapshotError::InvalidName(name.to_string()));
        }

        let status = ensure_bucket(&store, bucket).await?;
        match &status {
            BucketStatus::Created(b) => info!("created bucket {}", b.name),
            BucketStatus::Existing(b) => debug!("opened existing bucket {}", b.name),
        }

        Ok(Self {
            store,
            bucket: status.into_bucket(),
            name: name.to_string(),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket.name
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Upload the file at `path` as this handle's snapshot, replacing any
    /// previous one.
    ///
    /// A failed store leaves the remote object indeterminate; re-check with
    /// `info` or `retrieve` before trusting it.
    pub async fn store(&self, path: impl AsRef<Path>) -> SnapshotResult<ObjectInfo> {
        let path = path.as_ref();
        let source_err = |source| SnapshotError::SourceFile {
            op: Operation::Store,
            path: path.to_path_buf(),
            source,
        };

        let file = File::open(path).await.map_err(source_err)?;
        let local = file.metadata().await.map_err(source_err)?;
        if !local.is_file() {
            return Err(source_err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "not a regular file",
            )));
        }

        let meta = ObjectMeta::new(SNAPSHOT_DESCRIPTION)
            .with_header(CONTENT_TYPE_HEADER, SNAPSHOT_CONTENT_TYPE)
            .with_header(
                TIMESTAMP_HEADER,
                Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            );
        let body = ReaderStream::with_capacity(file, CHUNK_SIZE).boxed();

        debug!(
            "uploading {} ({} bytes) as {}/{}",
            path.display(),
            local.len(),
            self.bucket.name,
            self.name
        );
        let stored = self
            .store
            .put_object(&self.bucket.name, &self.name, meta, body)
            .await
            .map_err(|err| self.classify(Operation::Store, err))?;

        info!(
            "stored {} in {}/{} ({} bytes)",
            path.display(),
            self.bucket.name,
            self.name,
            stored.size
        );
        Ok(stored)
    }

    /// Materialize the snapshot at `path`.
    ///
    /// Bytes are staged in a hidden file next to `path` and renamed over it
    /// only once complete. On failure the staged file is removed and an
    /// existing file at `path` is left as it was.
    pub async fn retrieve(&self, path: impl AsRef<Path>) -> SnapshotResult<ObjectInfo> {
        let path = path.as_ref();
        let (info, reader) = self
            .store
            .get_object(&self.bucket.name, &self.name)
            .await
            .map_err(|err| self.classify(Operation::Retrieve, err))?;

        let dest_err = |source| SnapshotError::Destination {
            op: Operation::Retrieve,
            path: path.to_path_buf(),
            source,
        };

        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent).await.map_err(dest_err)?;

        let file_name = path
            .file_name()
            .ok_or_else(|| {
                dest_err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "destination has no file name",
                ))
            })?
            .to_string_lossy();
        let staged = parent.join(format!(".{}.tmp-{}", file_name, Uuid::new_v4()));

        let result = self.copy_to(reader, &staged, path, info.size).await;
        if result.is_err() {
            discard_staged(&staged).await;
        }
        result?;

        if let Err(err) = fs::rename(&staged, path).await {
            discard_staged(&staged).await;
            return Err(dest_err(err));
        }

        info!(
            "retrieved {}/{} to {} ({} bytes)",
            self.bucket.name,
            self.name,
            path.display(),
            info.size
        );
        Ok(info)
    }

    /// Stream `reader` into `staged`, checking the byte count against the
    /// size recorded for the object.
    async fn copy_to(
        &self,
        reader: ObjectReader,
        staged: &Path,
        dest: &Path,
        expected: u64,
    ) -> SnapshotResult<()> {
        let dest_err = |source| SnapshotError::Destination {
            op: Operation::Retrieve,
            path: dest.to_path_buf(),
            source,
        };
        let transport_err = |source: io::Error| SnapshotError::Transport {
            op: Operation::Retrieve,
            name: self.name.clone(),
            source: StorageError::Io(source),
        };

        let mut file = File::create(staged).await.map_err(dest_err)?;
        let mut stream = ReaderStream::with_capacity(reader, CHUNK_SIZE);
        let mut written: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(transport_err)?;
            written += chunk.len() as u64;
            file.write_all(&chunk).await.map_err(dest_err)?;
        }

        if written != expected {
            return Err(transport_err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("received {} of {} bytes", written, expected),
            )));
        }

        file.flush().await.map_err(dest_err)?;
        file.sync_all().await.map_err(dest_err)?;
        Ok(())
    }

    /// Metadata of the current snapshot, without its payload.
    pub async fn info(&self) -> SnapshotResult<ObjectInfo> {
        self.store
            .object_info(&self.bucket.name, &self.name)
            .await
            .map_err(|err| self.classify(Operation::Info, err))
    }

    /// Remove the snapshot. Later `info`/`retrieve` calls report `NotFound`
    /// until the next `store`.
    pub async fn delete(&self) -> SnapshotResult<()> {
        self.store
            .delete_object(&self.bucket.name, &self.name)
            .await
            .map_err(|err| self.classify(Operation::Delete, err))?;
        info!("deleted {}/{}", self.bucket.name, self.name);
        Ok(())
    }

    /// Map a backend failure onto the caller-facing taxonomy. Anything that
    /// is not a missing object or a bad name counts as a transport failure.
    fn classify(&self, op: Operation, err: StorageError) -> SnapshotError {
        match err {
            StorageError::ObjectNotFound { .. } => SnapshotError::NotFound {
                op,
                bucket: self.bucket.name.clone(),
                name: self.name.clone(),
            },
            StorageError::InvalidObjectKey => SnapshotError::InvalidName(self.name.clone()),
            err @ (StorageError::BucketNotFound(_) | StorageError::InvalidBucketName { .. }) => {
                SnapshotError::Bucket {
                    op,
                    bucket: self.bucket.name.clone(),
                    source: err,
                }
            }
            err => SnapshotError::Transport {
                op,
                name: self.name.clone(),
                source: err,
            },
        }
    }
}

async fn discard_staged(staged: &Path) {
    if let Err(err) = fs::remove_file(staged).await {
        if err.kind() != io::ErrorKind::NotFound {
            warn!("failed to remove staged file {}: {}", staged.display(), err);
        }
    }
}
