//! Ship a single embedded database file in and out of an object store.
//!
//! [`SnapshotStore`] binds one bucket and one logical name on an
//! [`ObjectStore`]; [`StorageService`] is the local backend (SQLite catalog
//! plus on-disk payloads). [`Verifier`] checks that a retrieved copy still
//! opens as a database and answers a known query.

pub mod config;
pub mod errors;
pub mod models;
pub mod services;

pub use errors::{Operation, SnapshotError, SnapshotResult};
pub use models::object::ObjectInfo;
pub use services::{
    engine::{SnapshotDatabase, create_sample_database},
    object_store::{ObjectStore, StorageError},
    snapshot_store::{BucketStatus, SnapshotStore, ensure_bucket},
    storage_service::{StorageConfig, StorageService},
    verifier::{Verifier, verify_digest},
};
