use bytes::Bytes;
use futures::{StreamExt, stream};
use snapshot_store::{
    BucketStatus, ObjectInfo, ObjectStore, Operation, SnapshotError, SnapshotStore,
    StorageConfig, StorageError, StorageService, Verifier, create_sample_database,
    ensure_bucket,
    models::bucket::Bucket,
    services::{
        object_store::{ByteStream, ObjectMeta, ObjectReader, StorageResult},
        snapshot_store::{SNAPSHOT_CONTENT_TYPE, SNAPSHOT_DESCRIPTION},
    },
    verify_digest,
};
use std::{
    io,
    path::{Path, PathBuf},
};
use tempfile::TempDir;
use tokio_util::io::StreamReader;

const BUCKET: &str = "DUCKDB";
const NAME: &str = "mydb.db";

async fn connect(dir: &TempDir) -> StorageService {
    let cfg = StorageConfig {
        storage_dir: dir.path().join("objects"),
        database_url: format!("sqlite://{}", dir.path().join("meta/catalog.db").display()),
    };
    StorageService::connect(&cfg).await.unwrap()
}

async fn open(dir: &TempDir) -> SnapshotStore<StorageService> {
    SnapshotStore::new(connect(dir).await, BUCKET, NAME)
        .await
        .unwrap()
}

fn write(dir: &TempDir, file: &str, bytes: &[u8]) -> PathBuf {
    let path = dir.path().join(file);
    std::fs::write(&path, bytes).unwrap();
    path
}

fn staged_leftovers(dir: &Path) -> Vec<String> {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.contains(".tmp-"))
        .collect()
}

#[tokio::test]
async fn retrieved_bytes_match_stored_bytes() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir).await;

    // Larger than one transfer chunk, with every byte value present.
    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let source = write(&dir, "source.db", &payload);

    store.store(&source).await.unwrap();
    let out = dir.path().join("out/retrieved.db");
    store.retrieve(&out).await.unwrap();

    assert_eq!(std::fs::read(&out).unwrap(), payload);
    assert!(staged_leftovers(&dir.path().join("out")).is_empty());
}

#[tokio::test]
async fn empty_file_round_trips() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir).await;
    let source = write(&dir, "empty.db", b"");

    let info = store.store(&source).await.unwrap();
    assert_eq!(info.size, 0);

    let out = dir.path().join("empty_copy.db");
    store.retrieve(&out).await.unwrap();
    assert_eq!(std::fs::read(&out).unwrap(), b"");
}

#[tokio::test]
async fn last_store_wins() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir).await;

    store.store(write(&dir, "b1", b"first payload, longer")).await.unwrap();
    store.store(write(&dir, "b2", b"second")).await.unwrap();

    let out = dir.path().join("out.db");
    store.retrieve(&out).await.unwrap();
    assert_eq!(std::fs::read(&out).unwrap(), b"second");
    assert_eq!(store.info().await.unwrap().size, 6);
}

#[tokio::test]
async fn deleted_snapshot_is_not_found_until_stored_again() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir).await;
    store.store(write(&dir, "src", b"bytes")).await.unwrap();

    store.delete().await.unwrap();

    let err = store.info().await.unwrap_err();
    assert!(matches!(err, SnapshotError::NotFound { op: Operation::Info, .. }));
    let out = dir.path().join("after_delete.db");
    let err = store.retrieve(&out).await.unwrap_err();
    assert!(matches!(err, SnapshotError::NotFound { op: Operation::Retrieve, .. }));
    assert!(!out.exists());
    let err = store.delete().await.unwrap_err();
    assert!(matches!(err, SnapshotError::NotFound { op: Operation::Delete, .. }));

    store.store(write(&dir, "src2", b"revived")).await.unwrap();
    assert_eq!(store.info().await.unwrap().size, 7);
}

#[tokio::test]
async fn second_handle_reuses_bucket_and_sees_same_object() {
    let dir = TempDir::new().unwrap();
    let service = connect(&dir).await;

    let status = ensure_bucket(&service, BUCKET).await.unwrap();
    assert!(matches!(status, BucketStatus::Created(_)));
    let status = ensure_bucket(&service, BUCKET).await.unwrap();
    assert!(matches!(status, BucketStatus::Existing(_)));

    let first = SnapshotStore::new(service.clone(), BUCKET, NAME).await.unwrap();
    let second = SnapshotStore::new(service.clone(), BUCKET, NAME).await.unwrap();

    first.store(write(&dir, "src", b"shared")).await.unwrap();
    let out = dir.path().join("seen_by_second.db");
    second.retrieve(&out).await.unwrap();
    assert_eq!(std::fs::read(&out).unwrap(), b"shared");

    second.delete().await.unwrap();
    assert!(first.info().await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn separate_connections_share_the_bucket() {
    let dir = TempDir::new().unwrap();
    let first = open(&dir).await;
    first.store(write(&dir, "src", b"persisted")).await.unwrap();
    drop(first);

    let reopened = open(&dir).await;
    let info = reopened.info().await.unwrap();
    assert_eq!(info.size, 9);
}

#[tokio::test]
async fn info_reports_size_and_metadata() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir).await;
    let source = write(&dir, "src", b"0123456789abcdef");

    let before = chrono::Utc::now() - chrono::Duration::seconds(1);
    store.store(&source).await.unwrap();
    let info = store.info().await.unwrap();

    assert_eq!(info.bucket, BUCKET);
    assert_eq!(info.name, NAME);
    assert_eq!(info.size, std::fs::metadata(&source).unwrap().len());
    assert_eq!(info.description.as_deref(), Some(SNAPSHOT_DESCRIPTION));
    assert_eq!(info.content_type.as_deref(), Some(SNAPSHOT_CONTENT_TYPE));
    assert_eq!(
        info.headers.get("Content-Type").map(String::as_str),
        Some(SNAPSHOT_CONTENT_TYPE)
    );

    let stamped = info.headers.get("Timestamp").unwrap();
    assert!(stamped.ends_with('Z'), "{stamped}");
    assert!(info.stored_at().unwrap() >= before);
    assert!(info.modified >= before);

    verify_digest(&source, &info).await.unwrap();
}

#[tokio::test]
async fn sample_database_scenario() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir).await;
    let db_path = dir.path().join("tmp/mydb.db");
    create_sample_database(&db_path).await.unwrap();

    store.store(&db_path).await.unwrap();
    let info = store.info().await.unwrap();
    assert!(info.size > 0);

    let retrieved = dir.path().join("tmp/mydb_retrieved.db");
    store.retrieve(&retrieved).await.unwrap();
    verify_digest(&retrieved, &info).await.unwrap();
    let report = Verifier::default().expecting(3).verify(&retrieved).await.unwrap();
    assert_eq!(report.value, 3);

    store.delete().await.unwrap();
    assert!(store.info().await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn never_stored_name_leaves_no_file() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir).await;
    let out = dir.path().join("missing/never.db");

    let err = store.retrieve(&out).await.unwrap_err();
    assert!(matches!(err, SnapshotError::NotFound { .. }));
    assert!(!out.exists());
    assert!(!dir.path().join("missing").exists());
}

#[tokio::test]
async fn unreadable_source_is_a_source_file_error() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir).await;

    let err = store.store(dir.path().join("absent.db")).await.unwrap_err();
    assert!(matches!(err, SnapshotError::SourceFile { op: Operation::Store, .. }));

    let err = store.store(dir.path()).await.unwrap_err();
    assert!(matches!(err, SnapshotError::SourceFile { .. }));

    assert!(store.info().await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn unwritable_destination_is_a_destination_error() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir).await;
    store.store(write(&dir, "src", b"bytes")).await.unwrap();

    // A regular file where the parent directory should be.
    let blocker = write(&dir, "blocker", b"");
    let err = store.retrieve(blocker.join("out.db")).await.unwrap_err();
    assert!(matches!(err, SnapshotError::Destination { op: Operation::Retrieve, .. }));
}

#[tokio::test]
async fn blank_names_are_rejected() {
    let dir = TempDir::new().unwrap();
    let service = connect(&dir).await;

    for name in ["", "  ", " padded "] {
        let err = SnapshotStore::new(service.clone(), BUCKET, name)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SnapshotError::InvalidName(_)), "{name:?}");
    }

    // Names the backend cannot hold as keys fail before first use.
    for name in ["../escape", "/abs.db", "a/../b.db"] {
        let err = SnapshotStore::new(service.clone(), BUCKET, name)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SnapshotError::InvalidName(_)), "{name:?}");
    }

    let store = SnapshotStore::new(service, BUCKET, "my..db").await.unwrap();
    store.store(write(&dir, "src", b"x")).await.unwrap();
    assert_eq!(store.info().await.unwrap().size, 1);
}

#[tokio::test]
async fn destination_directory_is_a_destination_error() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir).await;
    store.store(write(&dir, "src", b"bytes")).await.unwrap();

    // The staged file is complete but cannot be renamed over a non-empty directory.
    let out = dir.path().join("occupied");
    std::fs::create_dir(&out).unwrap();
    std::fs::write(out.join("keep"), b"x").unwrap();

    let err = store.retrieve(&out).await.unwrap_err();
    assert!(matches!(err, SnapshotError::Destination { op: Operation::Retrieve, .. }));
    assert!(out.join("keep").exists());
    assert!(staged_leftovers(dir.path()).is_empty());
}

#[tokio::test]
async fn invalid_bucket_is_a_bucket_error() {
    let dir = TempDir::new().unwrap();
    let err = SnapshotStore::new(connect(&dir).await, "not a bucket", NAME)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, SnapshotError::Bucket { op: Operation::Open, .. }));
}

#[tokio::test]
async fn closed_catalog_is_a_connection_error() {
    let dir = TempDir::new().unwrap();
    let service = connect(&dir).await;
    service.db.close().await;

    let err = SnapshotStore::new(service, BUCKET, NAME).await.err().unwrap();
    assert!(matches!(err, SnapshotError::Connection { .. }), "{err}");
}

#[derive(Clone, Copy)]
enum Fault {
    /// The download errors out after a few bytes.
    Reset,
    /// The download ends cleanly, short of the recorded size.
    Truncated,
}

/// Delegates to a real store but breaks transfers partway through.
#[derive(Clone)]
struct FlakyStore {
    inner: StorageService,
    fault: Fault,
}

impl ObjectStore for FlakyStore {
    fn check_key(&self, key: &str) -> StorageResult<()> {
        self.inner.check_key(key)
    }

    async fn create_bucket(&self, name: &str, description: &str) -> StorageResult<Bucket> {
        self.inner.create_bucket(name, description).await
    }

    async fn open_bucket(&self, name: &str) -> StorageResult<Bucket> {
        self.inner.open_bucket(name).await
    }

    async fn put_object(
        &self,
        _bucket: &str,
        _key: &str,
        _meta: ObjectMeta,
        mut body: ByteStream,
    ) -> StorageResult<ObjectInfo> {
        let _ = body.next().await;
        Err(StorageError::Io(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "connection reset while uploading",
        )))
    }

    async fn get_object(&self, bucket: &str, key: &str) -> StorageResult<(ObjectInfo, ObjectReader)> {
        let info = self.inner.get_object_metadata(bucket, key).await?;
        let chunks: Vec<io::Result<Bytes>> = match self.fault {
            Fault::Reset => vec![
                Ok(Bytes::from_static(b"partial")),
                Err(io::Error::new(io::ErrorKind::ConnectionReset, "stream reset")),
            ],
            Fault::Truncated => vec![Ok(Bytes::from_static(b"partial"))],
        };
        let reader: ObjectReader = Box::new(StreamReader::new(stream::iter(chunks)));
        Ok((info, reader))
    }

    async fn object_info(&self, bucket: &str, key: &str) -> StorageResult<ObjectInfo> {
        self.inner.get_object_metadata(bucket, key).await
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> StorageResult<()> {
        self.inner.delete_object(bucket, key).await
    }
}

async fn flaky(inner: StorageService, fault: Fault) -> SnapshotStore<FlakyStore> {
    SnapshotStore::new(FlakyStore { inner, fault }, BUCKET, NAME)
        .await
        .unwrap()
}

#[tokio::test]
async fn interrupted_retrieve_keeps_existing_destination() {
    let dir = TempDir::new().unwrap();
    let service = connect(&dir).await;
    let healthy = SnapshotStore::new(service.clone(), BUCKET, NAME).await.unwrap();
    healthy.store(write(&dir, "src", b"complete snapshot bytes")).await.unwrap();

    let flaky = flaky(service, Fault::Reset).await;
    let out = write(&dir, "local.db", b"previous local copy");

    let err = flaky.retrieve(&out).await.unwrap_err();
    assert!(
        matches!(err, SnapshotError::Transport { op: Operation::Retrieve, .. }),
        "{err}"
    );
    assert_eq!(std::fs::read(&out).unwrap(), b"previous local copy");
    assert!(staged_leftovers(dir.path()).is_empty());
}

#[tokio::test]
async fn interrupted_store_is_a_transport_error() {
    let dir = TempDir::new().unwrap();
    let service = connect(&dir).await;
    let healthy = SnapshotStore::new(service.clone(), BUCKET, NAME).await.unwrap();
    healthy.store(write(&dir, "src", b"good")).await.unwrap();

    let flaky = flaky(service, Fault::Reset).await;
    let err = flaky.store(write(&dir, "src2", b"never lands")).await.unwrap_err();
    assert!(matches!(err, SnapshotError::Transport { op: Operation::Store, .. }));

    // Re-checking after a failed store shows what is actually there.
    let out = dir.path().join("check.db");
    healthy.retrieve(&out).await.unwrap();
    assert_eq!(std::fs::read(&out).unwrap(), b"good");
}

#[tokio::test]
async fn short_retrieve_is_a_transport_error() {
    let dir = TempDir::new().unwrap();
    let service = connect(&dir).await;
    let healthy = SnapshotStore::new(service.clone(), BUCKET, NAME).await.unwrap();
    healthy.store(write(&dir, "src", b"complete snapshot bytes")).await.unwrap();

    let flaky = flaky(service, Fault::Truncated).await;
    let out = write(&dir, "local.db", b"previous local copy");

    let err = flaky.retrieve(&out).await.unwrap_err();
    assert!(
        matches!(err, SnapshotError::Transport { op: Operation::Retrieve, .. }),
        "{err}"
    );
    assert_eq!(std::fs::read(&out).unwrap(), b"previous local copy");
    assert!(staged_leftovers(dir.path()).is_empty());
}
