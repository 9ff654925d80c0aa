//! src/services/engine.rs
//!
//! Thin wrapper over an embedded SQLite connection: the database whose file
//! gets shipped in and out of the object store.

use crate::errors::{SnapshotError, SnapshotResult};
use sqlx::{
    ConnectOptions, Connection, SqliteConnection,
    sqlite::{SqliteConnectOptions, SqliteJournalMode},
};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

/// An open database file.
///
/// Writers use rollback-journal mode so every committed page lives in the
/// main file, which is the only file the snapshot store uploads.
pub struct SnapshotDatabase {
    conn: SqliteConnection,
    path: PathBuf,
}

impl SnapshotDatabase {
    /// Open `path` read-write, creating the file and its parent directories.
    pub async fn create(path: impl AsRef<Path>) -> SnapshotResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|err| SnapshotError::EngineOpen {
                    path: path.clone(),
                    source: sqlx::Error::Io(err),
                })?;
        }

        let conn = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Delete)
            .connect()
            .await
            .map_err(|source| SnapshotError::EngineOpen {
                path: path.clone(),
                source,
            })?;

        debug!("opened {} read-write", path.display());
        Ok(Self { conn, path })
    }

    /// Open an existing file read-only and make sure it parses as a database.
    pub async fn open_read_only(path: impl AsRef<Path>) -> SnapshotResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut conn = SqliteConnectOptions::new()
            .filename(&path)
            .read_only(true)
            .create_if_missing(false)
            .journal_mode(SqliteJournalMode::Delete)
            .connect()
            .await
            .map_err(|source| SnapshotError::EngineOpen {
                path: path.clone(),
                source,
            })?;

        // SQLite reads the header lazily; touch the schema so a corrupt file
        // fails here rather than on the first real query.
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM sqlite_master")
            .fetch_one(&mut conn)
            .await
            .map_err(|source| SnapshotError::EngineOpen {
                path: path.clone(),
                source,
            })?;

        debug!("opened {} read-only", path.display());
        Ok(Self { conn, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run a DDL/DML statement and return the number of affected rows.
    pub async fn execute(&mut self, sql: &str) -> SnapshotResult<u64> {
        let result = sqlx::query(sql)
            .execute(&mut self.conn)
            .await
            .map_err(|source| self.query_error(sql, source))?;
        Ok(result.rows_affected())
    }

    /// Run a query returning a single integer.
    pub async fn query_scalar(&mut self, sql: &str) -> SnapshotResult<i64> {
        sqlx::query_scalar::<_, i64>(sql)
            .fetch_one(&mut self.conn)
            .await
            .map_err(|source| self.query_error(sql, source))
    }

    /// Close the connection, flushing anything still pending to disk.
    pub async fn close(self) -> SnapshotResult<()> {
        let path = self.path;
        self.conn
            .close()
            .await
            .map_err(|source| SnapshotError::Query {
                path,
                query: "close".into(),
                source,
            })
    }

    fn query_error(&self, sql: &str, source: sqlx::Error) -> SnapshotError {
        SnapshotError::Query {
            path: self.path.clone(),
            query: sql.trim().to_string(),
            source,
        }
    }
}

/// Create (or refresh) a small `users` database with three rows.
pub async fn create_sample_database(path: impl AsRef<Path>) -> SnapshotResult<()> {
    let mut db = SnapshotDatabase::create(path).await?;

    db.execute(
        "CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY,
            name VARCHAR,
            created_at TIMESTAMP
        )",
    )
    .await?;

    db.execute("DELETE FROM users").await?;
    db.execute(
        "INSERT INTO users (id, name, created_at) VALUES
            (1, 'Alice', CURRENT_TIMESTAMP),
            (2, 'Bob', CURRENT_TIMESTAMP),
            (3, 'Charlie', CURRENT_TIMESTAMP)",
    )
    .await?;

    db.close().await
}
