//! Ingestion launcher: object-creation notifications in, bounded ingestion
//! invocations out.
//!
//! Only keys under the configured prefix are accepted. Each accepted
//! notification becomes exactly one [`IngestionWorker`] invocation submitted
//! to a [`BoundedPool`]; excess launches queue instead of spawning unboundedly.
//!
//! Duplicate notifications are handled two ways:
//! - notifications that carry an object version are deduplicated by
//!   `(bucket, key, version)`, remembering the most recent
//!   `dedupe_capacity` versions
//! - without a version the invocation runs again; correlation ids are a
//!   function of object identity and row position, so the republished rows
//!   collapse onto the same records downstream

use crate::ingestion::IngestionWorker;
use rowflow_core::object_store::ObjectRef;
use rowflow_runtime::metrics::WorkerMetrics;
use rowflow_runtime::pool::BoundedPool;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

/// Launcher configuration errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LauncherError {
    /// `max_concurrency` is zero
    #[error("Launcher max_concurrency must be at least 1")]
    ZeroConcurrency,

    /// `dedupe_capacity` is zero while deduplication is enabled
    #[error("Launcher dedupe_capacity must be at least 1")]
    ZeroDedupeCapacity,
}

/// Launcher settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LauncherConfig {
    /// Accepted key prefix
    pub key_prefix: String,
    /// Maximum simultaneous ingestion invocations
    pub max_concurrency: usize,
    /// Drop notifications whose `(bucket, key, version)` was already launched
    pub dedupe_by_version: bool,
    /// Launched versions remembered for deduplication; the oldest is
    /// forgotten first
    pub dedupe_capacity: usize,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            key_prefix: "upload/".to_string(),
            max_concurrency: 10,
            dedupe_by_version: true,
            dedupe_capacity: 10_000,
        }
    }
}

impl LauncherConfig {
    /// Check the settings.
    ///
    /// # Errors
    ///
    /// - [`LauncherError::ZeroConcurrency`] if `max_concurrency` is zero
    /// - [`LauncherError::ZeroDedupeCapacity`] if deduplication is enabled
    ///   with no capacity
    pub const fn validate(&self) -> Result<(), LauncherError> {
        if self.max_concurrency == 0 {
            return Err(LauncherError::ZeroConcurrency);
        }
        if self.dedupe_by_version && self.dedupe_capacity == 0 {
            return Err(LauncherError::ZeroDedupeCapacity);
        }
        Ok(())
    }
}

/// An object-creation notification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectCreated {
    /// Bucket name
    pub bucket: String,
    /// Object key
    pub key: String,
    /// Object version, when the store versions objects
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl ObjectCreated {
    /// A notification without a version.
    #[must_use]
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            version: None,
        }
    }

    /// Attach the object version.
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Reference to the created object.
    #[must_use]
    pub fn object(&self) -> ObjectRef {
        let object = ObjectRef::new(self.bucket.clone(), self.key.clone());
        match &self.version {
            Some(version) => object.with_version(version.clone()),
            None => object,
        }
    }

    /// Parse an S3-style notification document (`{"Records": [{"s3": ...}]}`).
    ///
    /// # Errors
    ///
    /// Returns the JSON error if the document does not have that shape.
    pub fn from_s3_notification(bytes: &[u8]) -> Result<Vec<Self>, serde_json::Error> {
        let notification: S3Notification = serde_json::from_slice(bytes)?;
        Ok(notification
            .records
            .into_iter()
            .map(|r| Self {
                bucket: r.s3.bucket.name,
                key: r.s3.object.key,
                version: r.s3.object.version_id,
            })
            .collect())
    }
}

#[derive(Deserialize)]
struct S3Notification {
    #[serde(rename = "Records", default)]
    records: Vec<S3Record>,
}

#[derive(Deserialize)]
struct S3Record {
    s3: S3Entity,
}

#[derive(Deserialize)]
struct S3Entity {
    bucket: S3Bucket,
    object: S3Object,
}

#[derive(Deserialize)]
struct S3Bucket {
    name: String,
}

#[derive(Deserialize)]
struct S3Object {
    key: String,
    #[serde(rename = "versionId", default)]
    version_id: Option<String>,
}

/// What the launcher did with a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// The key is outside the configured prefix
    Ignored,
    /// The same object version was already launched
    Duplicate,
    /// An ingestion invocation was submitted
    Launched,
}

impl LaunchOutcome {
    /// Metric label
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ignored => "ignored",
            Self::Duplicate => "duplicate",
            Self::Launched => "launched",
        }
    }
}

/// Counters of a launcher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LauncherStats {
    /// Invocations submitted
    pub launched: u64,
    /// Notifications outside the prefix
    pub ignored: u64,
    /// Notifications dropped as duplicates
    pub duplicates: u64,
    /// Invocations that finished successfully
    pub succeeded: u64,
    /// Invocations that failed as a whole
    pub failed: u64,
    /// Rows published by successful invocations
    pub rows_published: u64,
    /// Rows skipped by successful invocations
    pub rows_skipped: u64,
}

#[derive(Debug, Default)]
struct Counters {
    launched: AtomicU64,
    ignored: AtomicU64,
    duplicates: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    rows_published: AtomicU64,
    rows_skipped: AtomicU64,
}

/// FIFO window of launched object versions.
#[derive(Debug, Default)]
struct SeenVersions {
    members: HashSet<ObjectCreated>,
    order: VecDeque<ObjectCreated>,
}

impl SeenVersions {
    /// Remember `notification`; false if it is already remembered.
    fn insert(&mut self, notification: &ObjectCreated, capacity: usize) -> bool {
        if !self.members.insert(notification.clone()) {
            return false;
        }
        self.order.push_back(notification.clone());
        while self.order.len() > capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.members.remove(&evicted);
            }
        }
        true
    }
}

/// Bridges object-creation notifications to ingestion invocations.
#[derive(Debug, Clone)]
pub struct IngestionLauncher {
    config: Arc<LauncherConfig>,
    worker: IngestionWorker,
    pool: BoundedPool,
    launched: Arc<Mutex<SeenVersions>>,
    counters: Arc<Counters>,
}

impl IngestionLauncher {
    /// Create a launcher running `worker` under the configured ceiling.
    ///
    /// # Errors
    ///
    /// Returns [`LauncherError`] if the configuration is invalid.
    pub fn new(config: LauncherConfig, worker: IngestionWorker) -> Result<Self, LauncherError> {
        config.validate()?;
        Ok(Self {
            pool: BoundedPool::new("ingestion", config.max_concurrency),
            config: Arc::new(config),
            worker,
            launched: Arc::new(Mutex::new(SeenVersions::default())),
            counters: Arc::new(Counters::default()),
        })
    }

    /// Handle one notification; never blocks on the invocation itself.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn notify(&self, notification: ObjectCreated) -> LaunchOutcome {
        let outcome = self.admit(&notification);
        WorkerMetrics::record_notification(outcome.as_str());

        match outcome {
            LaunchOutcome::Ignored => {
                self.counters.ignored.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    bucket = %notification.bucket,
                    key = %notification.key,
                    prefix = %self.config.key_prefix,
                    "Ignoring object outside prefix"
                );
            }
            LaunchOutcome::Duplicate => {
                self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
                tracing::info!(object = %notification.object(), "Ignoring duplicate notification");
            }
            LaunchOutcome::Launched => {
                self.counters.launched.fetch_add(1, Ordering::Relaxed);
                self.launch(notification.object());
            }
        }
        outcome
    }

    /// Handle every record of a multi-record notification.
    pub fn notify_batch(
        &self,
        notifications: impl IntoIterator<Item = ObjectCreated>,
    ) -> Vec<LaunchOutcome> {
        notifications.into_iter().map(|n| self.notify(n)).collect()
    }

    /// Wait until every launched invocation has finished.
    pub async fn wait_idle(&self) {
        self.pool.wait_idle().await;
    }

    /// Snapshot of launcher counters.
    #[must_use]
    pub fn stats(&self) -> LauncherStats {
        let c = &self.counters;
        LauncherStats {
            launched: c.launched.load(Ordering::Relaxed),
            ignored: c.ignored.load(Ordering::Relaxed),
            duplicates: c.duplicates.load(Ordering::Relaxed),
            succeeded: c.succeeded.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            rows_published: c.rows_published.load(Ordering::Relaxed),
            rows_skipped: c.rows_skipped.load(Ordering::Relaxed),
        }
    }

    /// Highest number of simultaneous invocations seen.
    #[must_use]
    pub fn peak_concurrency(&self) -> usize {
        self.pool.peak()
    }

    fn admit(&self, notification: &ObjectCreated) -> LaunchOutcome {
        if !notification.key.starts_with(&self.config.key_prefix) {
            return LaunchOutcome::Ignored;
        }
        if self.config.dedupe_by_version && notification.version.is_some() {
            let mut launched = self.launched.lock().unwrap_or_else(PoisonError::into_inner);
            if !launched.insert(notification, self.config.dedupe_capacity) {
                return LaunchOutcome::Duplicate;
            }
        }
        LaunchOutcome::Launched
    }

    fn launch(&self, object: ObjectRef) {
        let worker = self.worker.clone();
        let counters = Arc::clone(&self.counters);
        tracing::info!(object = %object, "Launching ingestion");

        self.pool.submit(async move {
            match worker.run(&object).await {
                Ok(summary) => {
                    counters.succeeded.fetch_add(1, Ordering::Relaxed);
                    counters
                        .rows_published
                        .fetch_add(summary.published, Ordering::Relaxed);
                    counters
                        .rows_skipped
                        .fetch_add(summary.skipped, Ordering::Relaxed);
                }
                Err(e) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    WorkerMetrics::record_invocation_failure();
                    tracing::error!(object = %object, error = %e, "Ingestion invocation failed");
                }
            }
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use rowflow_testing::{InMemoryObjectStore, RecordingPublisher};

    fn launcher(config: LauncherConfig) -> (IngestionLauncher, InMemoryObjectStore, RecordingPublisher) {
        let store = InMemoryObjectStore::new();
        let publisher = RecordingPublisher::new();
        let worker = IngestionWorker::new(Arc::new(store.clone()), Arc::new(publisher.clone()));
        (IngestionLauncher::new(config, worker).unwrap(), store, publisher)
    }

    #[tokio::test]
    async fn ignores_keys_outside_prefix() {
        let (launcher, store, publisher) = launcher(LauncherConfig::default());
        store.put("b", "archive/data.csv", "id\n1\n");

        assert_eq!(
            launcher.notify(ObjectCreated::new("b", "archive/data.csv")),
            LaunchOutcome::Ignored
        );
        launcher.wait_idle().await;

        assert_eq!(store.reads(), 0);
        assert!(publisher.is_empty());
        assert_eq!(launcher.stats().ignored, 1);
    }

    #[tokio::test]
    async fn deduplicates_by_version() {
        let (launcher, store, publisher) = launcher(LauncherConfig::default());
        store.put("b", "upload/data.csv", "id\n1\n2\n");
        let created = ObjectCreated::new("b", "upload/data.csv").with_version("v1");

        let outcomes = launcher.notify_batch([
            created.clone(),
            created,
            ObjectCreated::new("b", "upload/data.csv").with_version("v2"),
        ]);
        launcher.wait_idle().await;

        assert_eq!(
            outcomes,
            vec![
                LaunchOutcome::Launched,
                LaunchOutcome::Duplicate,
                LaunchOutcome::Launched
            ]
        );
        assert_eq!(publisher.len(), 4);
        let stats = launcher.stats();
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.succeeded, 2);
        assert_eq!(stats.rows_published, 4);
    }

    #[tokio::test]
    async fn unversioned_duplicates_rerun_with_same_ids() {
        let (launcher, store, publisher) = launcher(LauncherConfig::default());
        store.put("b", "upload/data.csv", "id\n1\n");

        launcher.notify(ObjectCreated::new("b", "upload/data.csv"));
        launcher.notify(ObjectCreated::new("b", "upload/data.csv"));
        launcher.wait_idle().await;

        let events = publisher.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].correlation_id(), events[1].correlation_id());
    }

    #[tokio::test]
    async fn failed_invocations_are_counted_not_retried() {
        let (launcher, store, _publisher) = launcher(LauncherConfig::default());

        launcher.notify(ObjectCreated::new("b", "upload/missing.csv"));
        launcher.wait_idle().await;

        let stats = launcher.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.succeeded, 0);
        assert_eq!(store.reads(), 1);
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let config = LauncherConfig {
            max_concurrency: 2,
            ..LauncherConfig::default()
        };
        let (launcher, store, publisher) = launcher(config);
        for n in 0..8 {
            store.put("b", &format!("upload/{n}.csv"), "id\n1\n");
        }

        for n in 0..8 {
            launcher.notify(ObjectCreated::new("b", format!("upload/{n}.csv")));
        }
        launcher.wait_idle().await;

        assert_eq!(publisher.len(), 8);
        assert!(launcher.peak_concurrency() <= 2);
    }

    #[tokio::test]
    async fn dedupe_window_forgets_oldest_version() {
        let config = LauncherConfig {
            dedupe_capacity: 2,
            ..LauncherConfig::default()
        };
        let (launcher, store, _publisher) = launcher(config);
        store.put("b", "upload/data.csv", "id\n1\n");
        let version = |v: &str| ObjectCreated::new("b", "upload/data.csv").with_version(v);

        let outcomes = launcher.notify_batch([
            version("v1"),
            version("v2"),
            version("v2"),
            version("v3"),
            version("v1"),
            version("v3"),
        ]);
        launcher.wait_idle().await;

        assert_eq!(
            outcomes,
            vec![
                LaunchOutcome::Launched,
                LaunchOutcome::Launched,
                LaunchOutcome::Duplicate,
                LaunchOutcome::Launched,
                LaunchOutcome::Launched,
                LaunchOutcome::Duplicate,
            ]
        );
        assert_eq!(launcher.launched.lock().unwrap().members.len(), 2);
    }

    #[test]
    fn zero_dedupe_capacity_is_rejected_only_when_deduplicating() {
        let config = LauncherConfig {
            dedupe_capacity: 0,
            ..LauncherConfig::default()
        };
        assert_eq!(config.validate(), Err(LauncherError::ZeroDedupeCapacity));

        let config = LauncherConfig {
            dedupe_by_version: false,
            ..config
        };
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let config = LauncherConfig {
            max_concurrency: 0,
            ..LauncherConfig::default()
        };
        assert_eq!(config.validate(), Err(LauncherError::ZeroConcurrency));
    }

    #[test]
    fn parses_s3_notification() {
        let body = br#"{
            "Records": [
                {"s3": {"bucket": {"name": "uploads"}, "object": {"key": "upload/a.csv", "versionId": "3"}}},
                {"s3": {"bucket": {"name": "uploads"}, "object": {"key": "upload/b.csv"}}}
            ]
        }"#;

        let parsed = ObjectCreated::from_s3_notification(body).unwrap();
        assert_eq!(
            parsed,
            vec![
                ObjectCreated::new("uploads", "upload/a.csv").with_version("3"),
                ObjectCreated::new("uploads", "upload/b.csv"),
            ]
        );
        assert_eq!(parsed[0].object().identity(), "uploads/upload/a.csv@3");
    }
}
