//! Represents an object (blob) stored in a bucket, plus the caller-facing
//! view of it that merges in the object's headers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Header carrying the MIME type of the payload.
pub const CONTENT_TYPE_HEADER: &str = "Content-Type";

/// Header carrying the UTC time at which the caller stored the payload.
pub const TIMESTAMP_HEADER: &str = "Timestamp";

/// Catalog row for a single object within a bucket.
///
/// Stores metadata only; the payload bytes live on disk.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Object {
    /// Internal UUID for DB indexing.
    pub id: Uuid,

    /// Foreign key linking to the parent bucket.
    pub bucket_id: Uuid,

    /// Object key (the logical name the caller chose).
    pub key: String,

    /// Human-readable description attached at put time.
    pub description: Option<String>,

    /// Content type (MIME type).
    pub content_type: Option<String>,

    /// Size in bytes.
    pub size_bytes: i64,

    /// `MD5=<base64>` digest of the payload, computed while streaming.
    pub digest: String,

    /// Timestamp when object was last written.
    pub last_modified: DateTime<Utc>,

    /// Whether the object is marked as deleted (soft delete).
    pub is_deleted: bool,
}

/// Everything a caller can learn about a stored object without reading it.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ObjectInfo {
    pub bucket: String,
    pub name: String,
    pub description: Option<String>,
    pub content_type: Option<String>,
    pub size: u64,
    pub modified: DateTime<Utc>,
    pub digest: String,
    pub headers: BTreeMap<String, String>,
}

impl ObjectInfo {
    pub fn from_parts(bucket: &str, object: Object, headers: BTreeMap<String, String>) -> Self {
        Self {
            bucket: bucket.to_string(),
            name: object.key,
            description: object.description,
            content_type: object.content_type,
            size: u64::try_from(object.size_bytes).unwrap_or(0),
            modified: object.last_modified,
            digest: object.digest,
            headers,
        }
    }

    /// Value of the `Timestamp` header, if present and well-formed.
    pub fn stored_at(&self) -> Option<DateTime<Utc>> {
        self.headers
            .get(TIMESTAMP_HEADER)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|ts| ts.with_timezone(&Utc))
    }
}
