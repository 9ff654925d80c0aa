//! Key/value headers attached to objects.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A single header entry attached to an object.
///
/// The full header set of an object is replaced on every put.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct ObjectHeader {
    /// Internal UUID for DB indexing.
    pub id: Uuid,

    /// Reference to the associated object.
    pub object_id: Uuid,

    /// Header name (e.g., "Content-Type").
    pub name: String,

    /// Header value as plain text.
    pub value: String,
}
