//! src/services/storage_service.rs
//!
//! StorageService: the local object store backend. Object metadata and
//! headers live in a SQLite catalog; payloads live on disk sharded beneath
//! `base_path/{bucket}/{shard}/{shard}/{key}`. Payload writes are staged to a
//! temp file and renamed into place, so a failed put never leaves a torn
//! payload behind.

use crate::{
    models::{
        bucket::Bucket,
        metadata::ObjectHeader,
        object::{CONTENT_TYPE_HEADER, Object, ObjectInfo},
    },
    services::object_store::{
        ByteStream, ObjectMeta, ObjectReader, ObjectStore, StorageError, StorageResult,
        format_digest,
    },
};
use chrono::Utc;
use futures::StreamExt;
use md5::Context;
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use std::{
    collections::BTreeMap,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

const MAX_OBJECT_KEY_LEN: usize = 1024;
const BUCKET_NAME_MAX_LEN: usize = 63;
const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

/// Where the backend keeps its catalog and payloads.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Root directory for object payloads.
    pub storage_dir: PathBuf,

    /// SQLite URL of the metadata catalog, e.g. `sqlite://./data/meta/object_store.db`.
    pub database_url: String,
}

/// StorageService provides the object operations the snapshot store needs:
/// - Create / open a bucket
/// - Put an object (streams bytes to disk, upserts metadata and headers)
/// - Get an object (metadata plus an open file for streaming out)
/// - Delete an object (soft-delete in SQLite and remove the payload)
#[derive(Clone)]
pub struct StorageService {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,

    /// Base directory on disk where object payloads are stored.
    pub base_path: PathBuf,
}

impl StorageService {
    /// Create a new StorageService backed by the provided SQLite pool and
    /// using `base_path` as the root directory for object payloads.
    ///
    /// The pool must already carry the catalog schema; see [`Self::connect`].
    pub fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            db,
            base_path: base_path.into(),
        }
    }

    /// Prepare directories, open the catalog and apply the schema.
    pub async fn connect(cfg: &StorageConfig) -> StorageResult<Self> {
        if !cfg.storage_dir.exists() {
            fs::create_dir_all(&cfg.storage_dir).await?;
            info!("Created storage directory at {}", cfg.storage_dir.display());
        }

        let db_path = Path::new(sqlite_path_from_url(&cfg.database_url));
        debug!("Interpreted SQLite path => {}", db_path.display());
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).await?;
                info!("Created missing directory {}", parent.display());
            }
        }

        let options = SqliteConnectOptions::from_str(&cfg.database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        run_migrations(&pool).await?;

        Ok(Self::new(Arc::new(pool), cfg.storage_dir.clone()))
    }

    /// Basic key validation to avoid trivial path traversal vectors.
    ///
    /// Rejects keys that begin with `/`, have a `..` path segment, or contain
    /// control characters or backslashes.
    fn ensure_key_safe(&self, key: &str) -> StorageResult<()> {
        if key.is_empty() {
            return Err(StorageError::InvalidObjectKey);
        }
        if key.len() > MAX_OBJECT_KEY_LEN {
            return Err(StorageError::InvalidObjectKey);
        }
        if key.starts_with('/') || key.split('/').any(|segment| segment == "..") {
            return Err(StorageError::InvalidObjectKey);
        }
        if key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(StorageError::InvalidObjectKey);
        }
        Ok(())
    }

    /// Validate bucket name format.
    ///
    /// 1–63 characters of ASCII letters, digits, `-` and `_`. Bucket names
    /// double as directory names, so nothing else gets through.
    fn ensure_bucket_name_safe(&self, name: &str) -> StorageResult<()> {
        if name.is_empty() || name.len() > BUCKET_NAME_MAX_LEN {
            return Err(StorageError::InvalidBucketName {
                name: name.to_string(),
                reason: "must be between 1 and 63 characters".into(),
            });
        }

        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
        {
            return Err(StorageError::InvalidBucketName {
                name: name.to_string(),
                reason: "allowed characters are letters, digits, hyphens and underscores".into(),
            });
        }

        Ok(())
    }

    /// Compute the physical base folder path for a bucket.
    fn bucket_root(&self, bucket_name: &str) -> PathBuf {
        let mut path = self.base_path.clone();
        path.push(bucket_name);
        path
    }

    /// Generate two-level shard identifiers for an object key.
    ///
    /// Uses MD5(bucket/key) and returns the first two bytes as lowercase
    /// hexadecimal strings (00–ff).
    fn object_shards(bucket_name: &str, key: &str) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", bucket_name, key));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    /// Construct a fully-qualified object payload path.
    ///
    /// Combines base_path/bucket/{shard}/{shard}/{key}.
    /// Parent directories may not exist yet.
    fn object_path(&self, bucket_name: &str, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(bucket_name, key);
        let mut path = self.bucket_root(bucket_name);
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    /// Fetch bucket metadata from SQLite.
    async fn fetch_bucket(&self, bucket: &str) -> StorageResult<Bucket> {
        self.ensure_bucket_name_safe(bucket)?;
        sqlx::query_as::<_, Bucket>(
            "SELECT id, name, description, created_at FROM buckets WHERE name = ?",
        )
        .bind(bucket)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StorageError::BucketNotFound(bucket.to_string()),
            other => StorageError::Sqlx(other),
        })
    }

    /// Fetch a non-deleted object metadata record.
    async fn fetch_object(&self, bucket: &Bucket, key: &str) -> StorageResult<Object> {
        sqlx::query_as::<_, Object>(
            "SELECT id, bucket_id, key, description, content_type, size_bytes, digest,
                    last_modified, is_deleted
             FROM objects
             WHERE key = ? AND bucket_id = ? AND is_deleted = 0",
        )
        .bind(key)
        .bind(bucket.id)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StorageError::ObjectNotFound {
                bucket: bucket.name.clone(),
                key: key.to_string(),
            },
            other => StorageError::Sqlx(other),
        })
    }

    async fn fetch_headers(&self, object_id: Uuid) -> StorageResult<BTreeMap<String, String>> {
        let rows = sqlx::query_as::<_, ObjectHeader>(
            "SELECT id, object_id, name, value FROM object_headers WHERE object_id = ?",
        )
        .bind(object_id)
        .fetch_all(&*self.db)
        .await?;

        Ok(rows.into_iter().map(|h| (h.name, h.value)).collect())
    }

    async fn fetch_info(&self, bucket: &Bucket, key: &str) -> StorageResult<ObjectInfo> {
        let object = self.fetch_object(bucket, key).await?;
        let headers = self.fetch_headers(object.id).await?;
        Ok(ObjectInfo::from_parts(&bucket.name, object, headers))
    }

    /// Stream-upload an object to disk and update metadata.
    ///
    /// - Writes bytes incrementally to a temporary file.
    /// - Computes the MD5 digest and size while streaming.
    /// - Renames into final location once the stream is fully written.
    /// - Upserts the metadata row and replaces its headers in one transaction.
    ///
    /// A failure at any step leaves the previous payload and its catalog row
    /// as they were.
    pub async fn upload_object_stream(
        &self,
        bucket: &str,
        key: &str,
        meta: ObjectMeta,
        mut stream: ByteStream,
    ) -> StorageResult<ObjectInfo> {
        self.ensure_key_safe(key)?;
        let bucket_rec = self.fetch_bucket(bucket).await?;

        let file_path = self.object_path(&bucket_rec.name, key);
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StorageError::Io(io::Error::new(
                ErrorKind::Other,
                "object path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let mut size_bytes: i64 = 0;
        let mut digest = Context::new();
        while let Some(chunk_res) = stream.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(StorageError::Io(err));
                }
            };
            size_bytes += chunk.len() as i64;
            digest.consume(&chunk);
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StorageError::Io(err));
            }
        }
        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }
        drop(file);

        // Keep a link to the current payload until the catalog commits, so a
        // failed commit can put it back.
        let backup_path = parent.join(format!(".bak-{}", Uuid::new_v4()));
        let backup = match fs::hard_link(&file_path, &backup_path).await {
            Ok(()) => Some(backup_path),
            Err(err) if err.kind() == ErrorKind::NotFound => None,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StorageError::Io(err));
            }
        };

        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            if let Some(backup) = &backup {
                let _ = fs::remove_file(backup).await;
            }
            return Err(StorageError::Io(err));
        }

        let content_type = meta.headers.get(CONTENT_TYPE_HEADER).cloned();
        let digest = format_digest(digest.compute());

        match self
            .record_object(&bucket_rec, key, &meta, content_type, size_bytes, digest)
            .await
        {
            Ok(info) => {
                if let Some(backup) = &backup {
                    if let Err(err) = fs::remove_file(backup).await {
                        warn!("failed to remove payload backup {}: {}", backup.display(), err);
                    }
                }
                debug!(
                    "stored {}/{} ({} bytes) at {}",
                    bucket_rec.name,
                    key,
                    size_bytes,
                    file_path.display()
                );
                Ok(info)
            }
            Err(err) => {
                self.restore_payload(&file_path, backup.as_deref()).await;
                Err(err)
            }
        }
    }

    /// Undo a payload swap whose catalog update did not commit: put the
    /// previous payload back, or drop the new one if there was none.
    async fn restore_payload(&self, file_path: &Path, backup: Option<&Path>) {
        let restored = match backup {
            Some(backup) => fs::rename(backup, file_path).await,
            None => fs::remove_file(file_path).await,
        };
        if let Err(err) = restored {
            warn!("failed to restore payload {}: {}", file_path.display(), err);
        }
    }

    /// Upsert the object row (overwrite semantics) and replace its headers.
    async fn record_object(
        &self,
        bucket: &Bucket,
        key: &str,
        meta: &ObjectMeta,
        content_type: Option<String>,
        size_bytes: i64,
        digest: String,
    ) -> StorageResult<ObjectInfo> {
        let mut tx = self.db.begin().await?;

        let object = sqlx::query_as::<_, Object>(
            r#"
            INSERT INTO objects (
                id, bucket_id, key, description, content_type, size_bytes,
                digest, last_modified, is_deleted
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0)
            ON CONFLICT(bucket_id, key) DO UPDATE SET
                description = excluded.description,
                content_type = excluded.content_type,
                size_bytes = excluded.size_bytes,
                digest = excluded.digest,
                last_modified = excluded.last_modified,
                is_deleted = 0
            RETURNING id, bucket_id, key, description, content_type, size_bytes,
                      digest, last_modified, is_deleted
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(bucket.id)
        .bind(key)
        .bind(meta.description.clone())
        .bind(content_type)
        .bind(size_bytes)
        .bind(&digest)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM object_headers WHERE object_id = ?")
            .bind(object.id)
            .execute(&mut *tx)
            .await?;

        for (name, value) in &meta.headers {
            sqlx::query(
                "INSERT INTO object_headers (id, object_id, name, value) VALUES (?, ?, ?, ?)",
            )
            .bind(Uuid::new_v4())
            .bind(object.id)
            .bind(name)
            .bind(value)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok(ObjectInfo::from_parts(
            &bucket.name,
            object,
            meta.headers.clone(),
        ))
    }

    /// Fetch an object for reading.
    ///
    /// Returns metadata and an opened File handle ready for streaming out.
    /// Returns ObjectNotFound if metadata exists but physical file is missing.
    pub async fn get_object_reader(
        &self,
        bucket: &str,
        key: &str,
    ) -> StorageResult<(ObjectInfo, File)> {
        self.ensure_key_safe(key)?;
        let bucket_rec = self.fetch_bucket(bucket).await?;
        let info = self.fetch_info(&bucket_rec, key).await?;

        let file_path = self.object_path(&bucket_rec.name, key);
        let file = File::open(&file_path).await.map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                StorageError::ObjectNotFound {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                }
            } else {
                StorageError::Io(err)
            }
        })?;

        Ok((info, file))
    }

    /// Fetch only object metadata and headers.
    pub async fn get_object_metadata(&self, bucket: &str, key: &str) -> StorageResult<ObjectInfo> {
        self.ensure_key_safe(key)?;
        let bucket_rec = self.fetch_bucket(bucket).await?;
        self.fetch_info(&bucket_rec, key).await
    }

    /// Soft-delete an object and attempt to remove its payload.
    ///
    /// - Sets `is_deleted = 1`
    /// - Deletes the physical file (a failure here is logged, not returned)
    /// - Prunes empty shard directories
    ///
    /// Repeated calls return ObjectNotFound.
    pub async fn delete_object(&self, bucket: &str, key: &str) -> StorageResult<()> {
        self.ensure_key_safe(key)?;
        let bucket_rec = self.fetch_bucket(bucket).await?;

        let result = sqlx::query(
            "UPDATE objects SET is_deleted = 1 WHERE key = ? AND bucket_id = ? AND is_deleted = 0",
        )
        .bind(key)
        .bind(bucket_rec.id)
        .execute(&*self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::ObjectNotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }

        // The row is already hidden, so a payload left behind is unreachable.
        let file_path = self.object_path(&bucket_rec.name, key);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed physical file {}", file_path.display()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!("file {} already missing", file_path.display());
            }
            Err(err) => warn!("failed to remove payload {}: {}", file_path.display(), err),
        }

        if let Some(parent) = file_path.parent() {
            let bucket_root = self.bucket_root(&bucket_rec.name);
            self.prune_empty_dirs(parent, &bucket_root).await;
        }

        Ok(())
    }

    /// Create a bucket and initialize its directory.
    ///
    /// Returns BucketAlreadyExists if the name is already in the catalog.
    pub async fn create_bucket(&self, name: &str, description: &str) -> StorageResult<Bucket> {
        self.ensure_bucket_name_safe(name)?;
        let bucket_root = self.bucket_root(name);
        fs::create_dir_all(&bucket_root).await?;

        let bucket = Bucket {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: Some(description.to_string()),
            created_at: Utc::now(),
        };

        match sqlx::query(
            "INSERT INTO buckets (id, name, description, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(bucket.id)
        .bind(&bucket.name)
        .bind(&bucket.description)
        .bind(bucket.created_at)
        .execute(&*self.db)
        .await
        {
            Ok(_) => {
                info!("created bucket {}", name);
                Ok(bucket)
            }
            Err(err) if is_unique_violation(&err) => {
                Err(StorageError::BucketAlreadyExists(name.to_string()))
            }
            Err(err) => Err(StorageError::Sqlx(err)),
        }
    }

    /// Open an existing bucket, recreating its payload directory if needed.
    pub async fn open_bucket(&self, name: &str) -> StorageResult<Bucket> {
        let bucket = self.fetch_bucket(name).await?;
        fs::create_dir_all(self.bucket_root(&bucket.name)).await?;
        Ok(bucket)
    }

    /// Remove empty directories walking up towards the bucket root.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

impl ObjectStore for StorageService {
    fn check_key(&self, key: &str) -> StorageResult<()> {
        self.ensure_key_safe(key)
    }

    async fn create_bucket(&self, name: &str, description: &str) -> StorageResult<Bucket> {
        StorageService::create_bucket(self, name, description).await
    }

    async fn open_bucket(&self, name: &str) -> StorageResult<Bucket> {
        StorageService::open_bucket(self, name).await
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        meta: ObjectMeta,
        body: ByteStream,
    ) -> StorageResult<ObjectInfo> {
        self.upload_object_stream(bucket, key, meta, body).await
    }

    async fn get_object(&self, bucket: &str, key: &str) -> StorageResult<(ObjectInfo, ObjectReader)> {
        let (info, file) = self.get_object_reader(bucket, key).await?;
        let reader: ObjectReader = Box::new(file);
        Ok((info, reader))
    }

    async fn object_info(&self, bucket: &str, key: &str) -> StorageResult<ObjectInfo> {
        self.get_object_metadata(bucket, key).await
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> StorageResult<()> {
        StorageService::delete_object(self, bucket, key).await
    }
}

/// Apply the embedded catalog schema, one statement at a time.
async fn run_migrations(db: &SqlitePool) -> StorageResult<()> {
    let statements = SCHEMA
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();

    debug!("Running {} migration statements...", statements.len());

    for stmt in statements {
        sqlx::query(stmt).execute(db).await?;
    }

    Ok(())
}

/// Extract the local file path SQLx will use for a `sqlite:` URL.
fn sqlite_path_from_url(url: &str) -> &str {
    let path = url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    path.split('?').next().unwrap_or(path)
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}
