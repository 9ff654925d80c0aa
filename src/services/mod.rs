//! Service layer: the object store seam and its local backend, the snapshot
//! store built on top of it, and the database engine plus verifier used to
//! check round trips.

pub mod engine;
pub mod object_store;
pub mod snapshot_store;
pub mod storage_service;
pub mod verifier;
