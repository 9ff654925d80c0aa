//! Core data models for the snapshot object store.
//!
//! These entities map to catalog tables via `sqlx::FromRow` and serialize
//! as JSON via `serde`.

pub mod bucket;
pub mod metadata;
pub mod object;
