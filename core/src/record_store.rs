//! Single-key upsert access to the durable key-value store.
//!
//! The store is the only shared mutable resource of the pipeline. It is only
//! ever written through [`RecordStore::upsert`], which must be idempotent:
//! applying the same [`Record`] twice leaves the stored state unchanged, and a
//! record with different attributes replaces the previous one (last write wins).

use crate::BoxFuture;
use crate::record::{Record, UpsertOutcome};
use thiserror::Error;

/// Errors returned by a [`RecordStore`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordStoreError {
    /// The store could not be reached or the write failed
    #[error("Record store unavailable: {0}")]
    Unavailable(String),

    /// Stored attributes could not be (de)serialized
    #[error("Record serialization failed: {0}")]
    Serialization(String),
}

/// Durable store keyed by a single partition id.
///
/// No transactions span more than one id.
pub trait RecordStore: Send + Sync {
    /// Create or fully overwrite the record with `record.id`.
    ///
    /// # Errors
    ///
    /// Returns [`RecordStoreError`] if the write could not be applied.
    fn upsert<'a>(&'a self, record: &'a Record)
    -> BoxFuture<'a, Result<UpsertOutcome, RecordStoreError>>;

    /// Read the record stored under `id`.
    ///
    /// # Errors
    ///
    /// Returns [`RecordStoreError`] if the read failed.
    fn get<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Option<Record>, RecordStoreError>>;
}
