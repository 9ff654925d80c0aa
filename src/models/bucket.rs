//! Represents a logical bucket, a durable namespace for snapshot objects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A storage bucket in the local object store.
///
/// Buckets are created once and reused; nothing in this crate deletes them.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Bucket {
    /// Unique identifier for this bucket (UUID for internal DB use).
    pub id: Uuid,

    /// Bucket name, unique across the catalog.
    pub name: String,

    /// Free-form description supplied when the bucket was created.
    pub description: Option<String>,

    /// When this bucket was created.
    pub created_at: DateTime<Utc>,
}
