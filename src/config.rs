use crate::services::storage_service::StorageConfig;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::{env, path::PathBuf};

const DEFAULT_STORAGE_DIR: &str = "./data/objects";
const DEFAULT_DATABASE_URL: &str = "sqlite://./data/meta/object_store.db";
const DEFAULT_BUCKET: &str = "SNAPSHOTS";
const DEFAULT_NAME: &str = "mydb.db";

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub storage_dir: String,
    pub database_url: String,
    pub bucket: String,
    pub name: String,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Store and retrieve database snapshots in an object store")]
pub struct Args {
    /// Directory where object payloads are stored (overrides SNAPSHOT_STORE_STORAGE_DIR)
    #[arg(long, global = true)]
    pub storage_dir: Option<String>,

    /// Catalog database URL (overrides SNAPSHOT_STORE_DATABASE_URL)
    #[arg(long, global = true)]
    pub database_url: Option<String>,

    /// Bucket holding the snapshot (overrides SNAPSHOT_STORE_BUCKET)
    #[arg(long, global = true)]
    pub bucket: Option<String>,

    /// Logical database name, used as the object key (overrides SNAPSHOT_STORE_NAME)
    #[arg(long, global = true)]
    pub name: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Upload a local database file as the snapshot
    Store { path: PathBuf },

    /// Download the snapshot to a local path
    Retrieve { path: PathBuf },

    /// Show stored size, modification time and headers
    Info {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Delete the snapshot
    Delete,

    /// Open a local database file and run a verification query
    Verify {
        path: PathBuf,

        /// Query returning a single integer
        #[arg(long, default_value = crate::services::verifier::DEFAULT_VERIFY_QUERY)]
        query: String,

        /// Fail unless the query returns this value
        #[arg(long)]
        expect: Option<i64>,

        /// Also compare the file digest with the stored snapshot
        #[arg(long)]
        check_digest: bool,
    },

    /// Create a sample database, store it, retrieve it and verify the copy
    Demo {
        /// Directory for the sample and retrieved files
        #[arg(long, default_value = "./tmp")]
        work_dir: PathBuf,

        /// Delete the snapshot at the end and confirm it is gone
        #[arg(long)]
        cleanup: bool,
    },
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and the command to run.
    pub fn from_env_and_args() -> Result<(Self, Command)> {
        let args = Args::parse();
        Self::merge(args, |key| env::var(key))
    }

    /// Merge parsed arguments over values looked up with `lookup`, falling
    /// back to defaults.
    pub fn merge<F>(args: Args, lookup: F) -> Result<(Self, Command)>
    where
        F: Fn(&str) -> Result<String, env::VarError>,
    {
        let var = |key: &str, default: &str| -> Result<String> {
            match lookup(key) {
                Ok(value) => Ok(value),
                Err(env::VarError::NotPresent) => Ok(default.to_string()),
                Err(err) => Err(err).with_context(|| format!("reading {}", key)),
            }
        };

        let cfg = Self {
            storage_dir: match args.storage_dir {
                Some(v) => v,
                None => var("SNAPSHOT_STORE_STORAGE_DIR", DEFAULT_STORAGE_DIR)?,
            },
            database_url: match args.database_url {
                Some(v) => v,
                None => var("SNAPSHOT_STORE_DATABASE_URL", DEFAULT_DATABASE_URL)?,
            },
            bucket: match args.bucket {
                Some(v) => v,
                None => var("SNAPSHOT_STORE_BUCKET", DEFAULT_BUCKET)?,
            },
            name: match args.name {
                Some(v) => v,
                None => var("SNAPSHOT_STORE_NAME", DEFAULT_NAME)?,
            },
        };

        Ok((cfg, args.command))
    }

    pub fn storage(&self) -> StorageConfig {
        StorageConfig {
            storage_dir: PathBuf::from(&self.storage_dir),
            database_url: self.database_url.clone(),
        }
    }
}
