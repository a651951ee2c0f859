//! In-memory object and record stores.
//!
//! Fast, deterministic stand-ins for the external storage collaborators:
//! - [`InMemoryObjectStore`]: objects keyed by `(bucket, key)`
//! - [`InMemoryRecordStore`]: idempotent single-key upserts with write counters

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Lock poisoning only follows a panicking test

use rowflow_core::BoxFuture;
use rowflow_core::object_store::{ObjectRef, ObjectStore, ObjectStoreError};
use rowflow_core::record::{Record, UpsertOutcome};
use rowflow_core::record_store::{RecordStore, RecordStoreError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

/// In-memory object store.
///
/// Versions are ignored on read: the latest bytes under `(bucket, key)` are returned.
///
/// # Example
///
/// ```
/// use rowflow_testing::InMemoryObjectStore;
/// use rowflow_core::object_store::{ObjectRef, ObjectStore};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = InMemoryObjectStore::new();
/// store.put("uploads", "upload/data.csv", "id,val\n1,a\n");
///
/// let bytes = store.get_object(&ObjectRef::new("uploads", "upload/data.csv")).await?;
/// assert!(bytes.starts_with(b"id,val"));
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryObjectStore {
    objects: Arc<RwLock<HashMap<(String, String), Vec<u8>>>>,
    reads: Arc<AtomicUsize>,
}

impl InMemoryObjectStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `bytes` under `(bucket, key)`, replacing any previous object
    pub fn put(&self, bucket: &str, key: &str, bytes: impl Into<Vec<u8>>) {
        self.objects
            .write()
            .unwrap()
            .insert((bucket.to_string(), key.to_string()), bytes.into());
    }

    /// Number of `get_object` calls so far
    #[must_use]
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

impl ObjectStore for InMemoryObjectStore {
    fn get_object<'a>(
        &'a self,
        object: &'a ObjectRef,
    ) -> BoxFuture<'a, Result<Vec<u8>, ObjectStoreError>> {
        Box::pin(async move {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.objects
                .read()
                .unwrap()
                .get(&(object.bucket.clone(), object.key.clone()))
                .cloned()
                .ok_or_else(|| ObjectStoreError::NotFound(object.identity()))
        })
    }
}

/// In-memory record store with upsert outcome accounting.
///
/// # Example
///
/// ```
/// use rowflow_testing::InMemoryRecordStore;
/// use rowflow_core::record::{Record, UpsertOutcome};
/// use rowflow_core::record_store::RecordStore;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = InMemoryRecordStore::new();
/// let record = Record::from_item(&serde_json::json!({"id": "1", "val": "a"}))?;
///
/// assert_eq!(store.upsert(&record).await?, UpsertOutcome::Created);
/// assert_eq!(store.upsert(&record).await?, UpsertOutcome::Unchanged);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryRecordStore {
    records: Arc<RwLock<HashMap<String, Record>>>,
    writes: Arc<AtomicUsize>,
    failures_remaining: Arc<AtomicUsize>,
}

impl InMemoryRecordStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` upserts fail with [`RecordStoreError::Unavailable`]
    pub fn fail_next(&self, n: usize) {
        self.failures_remaining.store(n, Ordering::SeqCst);
    }

    /// Number of upserts applied (failed ones excluded)
    #[must_use]
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of stored records
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    /// Whether nothing is stored
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every stored record, ordered by id
    #[must_use]
    pub fn records(&self) -> Vec<Record> {
        let mut records: Vec<Record> = self.records.read().unwrap().values().cloned().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    fn take_failure(&self) -> bool {
        self.failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl RecordStore for InMemoryRecordStore {
    fn upsert<'a>(
        &'a self,
        record: &'a Record,
    ) -> BoxFuture<'a, Result<UpsertOutcome, RecordStoreError>> {
        Box::pin(async move {
            if self.take_failure() {
                return Err(RecordStoreError::Unavailable(
                    "injected store failure".to_string(),
                ));
            }

            let mut records = self.records.write().unwrap();
            let outcome = match records.get(&record.id) {
                None => UpsertOutcome::Created,
                Some(existing) if existing.attributes == record.attributes => {
                    UpsertOutcome::Unchanged
                }
                Some(_) => UpsertOutcome::Replaced,
            };
            if outcome != UpsertOutcome::Unchanged {
                records.insert(record.id.clone(), record.clone());
            }
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(outcome)
        })
    }

    fn get<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Option<Record>, RecordStoreError>> {
        Box::pin(async move { Ok(self.records.read().unwrap().get(id).cloned()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: &str, val: &str) -> Record {
        Record::from_item(&json!({"id": id, "val": val})).unwrap()
    }

    #[tokio::test]
    async fn upsert_reports_outcomes() {
        let store = InMemoryRecordStore::new();

        assert_eq!(
            store.upsert(&record("1", "a")).await.unwrap(),
            UpsertOutcome::Created
        );
        assert_eq!(
            store.upsert(&record("1", "a")).await.unwrap(),
            UpsertOutcome::Unchanged
        );
        assert_eq!(
            store.upsert(&record("1", "b")).await.unwrap(),
            UpsertOutcome::Replaced
        );
        assert_eq!(store.get("1").await.unwrap(), Some(record("1", "b")));
        assert_eq!(store.writes(), 3);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let store = InMemoryRecordStore::new();
        store.fail_next(1);

        assert!(store.upsert(&record("1", "a")).await.is_err());
        assert!(store.upsert(&record("1", "a")).await.is_ok());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let store = InMemoryObjectStore::new();
        let err = store
            .get_object(&ObjectRef::new("b", "upload/none.csv"))
            .await
            .unwrap_err();
        assert!(matches!(err, ObjectStoreError::NotFound(_)));
        assert_eq!(store.reads(), 1);
    }
}
