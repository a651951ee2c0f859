//! Stores used when the pipeline runs on one machine.
//!
//! - [`LocalObjectStore`]: a directory served as one bucket
//! - [`MemoryRecordStore`]: a process-local record map, used when no database
//!   is configured

use rowflow_core::BoxFuture;
use rowflow_core::object_store::{ObjectRef, ObjectStore, ObjectStoreError};
use rowflow_core::record::{Record, UpsertOutcome};
use rowflow_core::record_store::{RecordStore, RecordStoreError};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

/// A directory served as a single bucket.
///
/// Keys are paths relative to the root with `/` separators; keys that would
/// escape the root are reported as missing. Versions are ignored.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    bucket: String,
    root: PathBuf,
}

impl LocalObjectStore {
    /// Serve `root` as `bucket`.
    #[must_use]
    pub fn new(bucket: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            bucket: bucket.into(),
            root: root.into(),
        }
    }

    /// Serve `root` under its own directory name.
    ///
    /// # Errors
    ///
    /// Returns [`ObjectStoreError::NotFound`] if `root` is not a directory.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, ObjectStoreError> {
        let root = root.into();
        if !root.is_dir() {
            return Err(ObjectStoreError::NotFound(root.display().to_string()));
        }
        let bucket = root
            .canonicalize()
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "local".to_string());
        Ok(Self::new(bucket, root))
    }

    /// Bucket name.
    #[must_use]
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Every key in the bucket, sorted.
    ///
    /// # Errors
    ///
    /// Returns [`ObjectStoreError::Unavailable`] if a directory cannot be read.
    pub async fn keys(&self) -> Result<Vec<String>, ObjectStoreError> {
        let mut keys = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await.map_err(unavailable)?;
            while let Some(entry) = entries.next_entry().await.map_err(unavailable)? {
                let path = entry.path();
                let file_type = entry.file_type().await.map_err(unavailable)?;
                if file_type.is_dir() {
                    pending.push(path);
                } else if file_type.is_file() {
                    if let Some(key) = self.key_for(&path) {
                        keys.push(key);
                    }
                }
            }
        }

        keys.sort();
        Ok(keys)
    }

    fn key_for(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<_> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(parts.join("/"))
    }

    fn path_for(&self, key: &str) -> Option<PathBuf> {
        let relative = Path::new(key);
        let contained = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        (contained && !key.is_empty()).then(|| self.root.join(relative))
    }

    async fn read(&self, object: &ObjectRef) -> Result<Vec<u8>, ObjectStoreError> {
        let missing = || ObjectStoreError::NotFound(object.identity());
        if object.bucket != self.bucket {
            return Err(missing());
        }
        let path = self.path_for(&object.key).ok_or_else(missing)?;

        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(missing()),
            Err(e) => Err(unavailable(e)),
        }
    }
}

#[allow(clippy::needless_pass_by_value)]
fn unavailable(e: std::io::Error) -> ObjectStoreError {
    ObjectStoreError::Unavailable(e.to_string())
}

impl ObjectStore for LocalObjectStore {
    fn get_object<'a>(
        &'a self,
        object: &'a ObjectRef,
    ) -> BoxFuture<'a, Result<Vec<u8>, ObjectStoreError>> {
        Box::pin(self.read(object))
    }
}

/// Process-local [`RecordStore`]; contents are lost on exit.
#[derive(Debug, Clone, Default)]
pub struct MemoryRecordStore {
    records: Arc<RwLock<HashMap<String, Record>>>,
}

impl MemoryRecordStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn apply(&self, record: &Record) -> UpsertOutcome {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        match records.get(&record.id) {
            Some(existing) if existing == record => UpsertOutcome::Unchanged,
            Some(_) => {
                records.insert(record.id.clone(), record.clone());
                UpsertOutcome::Replaced
            }
            None => {
                records.insert(record.id.clone(), record.clone());
                UpsertOutcome::Created
            }
        }
    }
}

impl RecordStore for MemoryRecordStore {
    fn upsert<'a>(
        &'a self,
        record: &'a Record,
    ) -> BoxFuture<'a, Result<UpsertOutcome, RecordStoreError>> {
        let outcome = self.apply(record);
        Box::pin(async move { Ok(outcome) })
    }

    fn get<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Option<Record>, RecordStoreError>> {
        let record = self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned();
        Box::pin(async move { Ok(record) })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rowflow_testing::InMemoryRecordStore;
    use rowflow_testing::properties;
    use serde_json::json;

    fn store_with(files: &[(&str, &str)]) -> (tempfile::TempDir, LocalObjectStore) {
        let dir = tempfile::tempdir().unwrap();
        for (key, contents) in files {
            let path = dir.path().join(key);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, contents).unwrap();
        }
        let store = LocalObjectStore::new("uploads", dir.path());
        (dir, store)
    }

    #[tokio::test]
    async fn test_reads_relative_keys() {
        let (_dir, store) = store_with(&[("upload/data.csv", "id\n1\n")]);
        let bytes = store
            .get_object(&ObjectRef::new("uploads", "upload/data.csv"))
            .await
            .unwrap();
        assert_eq!(bytes, b"id\n1\n");
    }

    #[tokio::test]
    async fn test_missing_objects_and_foreign_buckets() {
        let (_dir, store) = store_with(&[("upload/data.csv", "id\n")]);

        for object in [
            ObjectRef::new("uploads", "upload/other.csv"),
            ObjectRef::new("elsewhere", "upload/data.csv"),
            ObjectRef::new("uploads", "../data.csv"),
            ObjectRef::new("uploads", "/etc/passwd"),
        ] {
            assert!(matches!(
                store.get_object(&object).await,
                Err(ObjectStoreError::NotFound(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_keys_are_listed_recursively() {
        let (_dir, store) = store_with(&[
            ("upload/b.csv", ""),
            ("upload/nested/a.csv", ""),
            ("archive/old.csv", ""),
        ]);
        assert_eq!(
            store.keys().await.unwrap(),
            vec!["archive/old.csv", "upload/b.csv", "upload/nested/a.csv"]
        );
    }

    #[test]
    fn test_open_names_bucket_after_directory() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("landing");
        std::fs::create_dir(&root).unwrap();

        assert_eq!(LocalObjectStore::open(&root).unwrap().bucket(), "landing");
        assert!(LocalObjectStore::open(dir.path().join("absent")).is_err());
    }

    #[tokio::test]
    async fn test_memory_store_upsert_outcomes() {
        let store = MemoryRecordStore::new();
        let a = Record::from_item(&json!({"id": "1", "val": "a"})).unwrap();
        let b = Record::from_item(&json!({"id": "1", "val": "b"})).unwrap();

        assert_eq!(store.upsert(&a).await.unwrap(), UpsertOutcome::Created);
        assert_eq!(store.upsert(&a).await.unwrap(), UpsertOutcome::Unchanged);
        assert_eq!(store.upsert(&b).await.unwrap(), UpsertOutcome::Replaced);
        assert_eq!(store.get("1").await.unwrap(), Some(b));
        assert_eq!(store.len(), 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Both record stores agree with a last-write-wins map, and writing
        /// the same record twice is a no-op.
        #[test]
        fn prop_upserts_are_last_write_wins(
            writes in prop::collection::vec(properties::record(), 1..24),
        ) {
            tokio_test::block_on(async {
                let local = MemoryRecordStore::new();
                let shared = InMemoryRecordStore::new();
                let mut expected: HashMap<String, Record> = HashMap::new();

                for record in &writes {
                    let outcome = match expected.insert(record.id.clone(), record.clone()) {
                        None => UpsertOutcome::Created,
                        Some(previous) if previous == *record => UpsertOutcome::Unchanged,
                        Some(_) => UpsertOutcome::Replaced,
                    };
                    prop_assert_eq!(local.upsert(record).await.unwrap(), outcome);
                    prop_assert_eq!(shared.upsert(record).await.unwrap(), outcome);

                    prop_assert_eq!(local.upsert(record).await.unwrap(), UpsertOutcome::Unchanged);
                    prop_assert_eq!(shared.upsert(record).await.unwrap(), UpsertOutcome::Unchanged);
                }

                prop_assert_eq!(local.len(), expected.len());
                prop_assert_eq!(shared.len(), expected.len());
                for (id, record) in &expected {
                    let local_got = local.get(id).await.unwrap();
                    let shared_got = shared.get(id).await.unwrap();
                    prop_assert_eq!(local_got.as_ref(), Some(record));
                    prop_assert_eq!(shared_got.as_ref(), Some(record));
                }
                Ok(())
            })?;
        }
    }
}
