//! Ingestion worker: one stored object in, one extraction event per row out.
//!
//! The object is read fully and parsed as CSV with a header line. Every data
//! row becomes a JSON object keyed by the header and is published with a
//! correlation id derived from the object identity and the row position, so
//! re-running over the same object republishes the same ids.
//!
//! Row-level problems (wrong field count, undecodable bytes) skip the row.
//! Object-level problems (unreadable object, missing or duplicate headers)
//! fail the whole invocation and publish nothing.

use rowflow_core::environment::{Clock, SystemClock};
use rowflow_core::event::{CorrelationId, Event};
use rowflow_core::event_bus::{EventBusError, EventPublisher};
use rowflow_core::object_store::{ObjectRef, ObjectStore, ObjectStoreError};
use rowflow_runtime::metrics::WorkerMetrics;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

/// Whole-invocation failures of the ingestion worker.
#[derive(Error, Debug)]
pub enum IngestionError {
    /// The object could not be read
    #[error("Cannot read {object}: {source}")]
    Read {
        /// Object identity
        object: String,
        /// Store failure
        #[source]
        source: ObjectStoreError,
    },

    /// The object is not a usable table
    #[error("Corrupt object {object}: {reason}")]
    Object {
        /// Object identity
        object: String,
        /// What is wrong with it
        reason: String,
    },

    /// A row event could not be published
    #[error("Publishing row {row} of {object} failed: {source}")]
    Publish {
        /// Object identity
        object: String,
        /// Zero-based data row index
        row: u64,
        /// Bus failure
        #[source]
        source: EventBusError,
    },
}

/// Parser settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestionConfig {
    /// Field delimiter byte
    pub delimiter: u8,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self { delimiter: b',' }
    }
}

/// What one invocation did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestionSummary {
    /// Object identity
    pub object: String,
    /// Rows published as extraction events
    pub published: u64,
    /// Rows skipped as malformed
    pub skipped: u64,
}

/// Turns stored CSV objects into extraction events.
#[derive(Clone)]
pub struct IngestionWorker {
    store: Arc<dyn ObjectStore>,
    publisher: Arc<dyn EventPublisher>,
    clock: Arc<dyn Clock>,
    config: IngestionConfig,
}

impl IngestionWorker {
    /// Create a worker with the default parser settings.
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>, publisher: Arc<dyn EventPublisher>) -> Self {
        Self {
            store,
            publisher,
            clock: Arc::new(SystemClock),
            config: IngestionConfig::default(),
        }
    }

    /// Use other parser settings.
    #[must_use]
    pub fn with_config(mut self, config: IngestionConfig) -> Self {
        self.config = config;
        self
    }

    /// Stamp events with `clock`.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Ingest one object.
    ///
    /// # Errors
    ///
    /// - [`IngestionError::Read`] if the object cannot be fetched
    /// - [`IngestionError::Object`] if the header is missing, empty or duplicated
    /// - [`IngestionError::Publish`] if the bus rejects a row; rows before it
    ///   were already published, and re-running republishes them with the
    ///   same correlation ids
    pub async fn run(&self, object: &ObjectRef) -> Result<IngestionSummary, IngestionError> {
        let identity = object.identity();
        tracing::info!(object = %identity, "Ingesting object");

        let bytes = self
            .store
            .get_object(object)
            .await
            .map_err(|source| IngestionError::Read {
                object: identity.clone(),
                source,
            })?;

        let (headers, rows) = parse_table(&bytes, self.config.delimiter).map_err(|reason| {
            IngestionError::Object {
                object: identity.clone(),
                reason,
            }
        })?;

        let mut summary = IngestionSummary {
            object: identity.clone(),
            ..IngestionSummary::default()
        };

        for (index, row) in rows.into_iter().enumerate() {
            let index = index as u64;
            let payload = match row.and_then(|fields| to_payload(&headers, &fields)) {
                Ok(payload) => payload,
                Err(reason) => {
                    tracing::warn!(object = %identity, row = index, %reason, "Skipping malformed row");
                    summary.skipped += 1;
                    continue;
                }
            };

            let correlation_id = CorrelationId::for_row(object, index);
            let event = Event::extraction(correlation_id, payload, self.clock.as_ref());
            tracing::debug!(
                object = %identity,
                row = index,
                event_id = %event.id(),
                correlation_id = %event.correlation_id(),
                "Publishing row"
            );
            self.publisher
                .publish(event)
                .await
                .map_err(|source| IngestionError::Publish {
                    object: identity.clone(),
                    row: index,
                    source,
                })?;
            summary.published += 1;
        }

        WorkerMetrics::record_rows("published", summary.published);
        WorkerMetrics::record_rows("skipped", summary.skipped);
        tracing::info!(
            object = %identity,
            published = summary.published,
            skipped = summary.skipped,
            "Object ingested"
        );
        Ok(summary)
    }
}

impl std::fmt::Debug for IngestionWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionWorker")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

type Row = Result<Vec<String>, String>;

/// Split the object into validated headers and raw data rows.
fn parse_table(bytes: &[u8], delimiter: u8) -> Result<(Vec<String>, Vec<Row>), String> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .flexible(true)
        .from_reader(bytes);

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| format!("unreadable header: {e}"))?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    if headers.is_empty() || headers.iter().all(String::is_empty) {
        return Err("missing header line".to_string());
    }
    if let Some(blank) = headers.iter().position(String::is_empty) {
        return Err(format!("header column {blank} is empty"));
    }
    let mut seen = HashSet::with_capacity(headers.len());
    if let Some(duplicate) = headers.iter().find(|h| !seen.insert(h.as_str())) {
        return Err(format!("duplicate header '{duplicate}'"));
    }

    let rows = reader
        .records()
        .map(|record| {
            record
                .map(|r| r.iter().map(str::to_string).collect())
                .map_err(|e| e.to_string())
        })
        .collect();

    Ok((headers, rows))
}

fn to_payload(headers: &[String], fields: &[String]) -> Result<Value, String> {
    if fields.len() != headers.len() {
        return Err(format!(
            "expected {} fields, found {}",
            headers.len(),
            fields.len()
        ));
    }
    let row: Map<String, Value> = headers
        .iter()
        .zip(fields)
        .map(|(h, v)| (h.clone(), Value::String(v.clone())))
        .collect();
    Ok(Value::Object(row))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use rowflow_core::event::Status;
    use rowflow_testing::{InMemoryObjectStore, RecordingPublisher};
    use serde_json::json;

    fn setup(csv: &str) -> (IngestionWorker, RecordingPublisher) {
        let store = InMemoryObjectStore::new();
        store.put("uploads", "upload/data.csv", csv);
        let publisher = RecordingPublisher::new();
        let worker = IngestionWorker::new(Arc::new(store), Arc::new(publisher.clone()));
        (worker, publisher)
    }

    fn object() -> ObjectRef {
        ObjectRef::new("uploads", "upload/data.csv")
    }

    #[tokio::test]
    async fn publishes_one_event_per_row() {
        let (worker, publisher) = setup("id,val\n1,a\n2,b\n");

        let summary = worker.run(&object()).await.unwrap();

        assert_eq!(summary.published, 2);
        assert_eq!(summary.skipped, 0);
        let events = publisher.events();
        assert_eq!(events[0].payload(), &json!({"id": "1", "val": "a"}));
        assert_eq!(events[1].payload(), &json!({"id": "2", "val": "b"}));
        assert!(events.iter().all(|e| e.status() == Status::RowSent));
        assert_eq!(
            events[0].correlation_id(),
            &CorrelationId::for_row(&object(), 0)
        );
    }

    #[tokio::test]
    async fn rerun_reuses_correlation_ids() {
        let (worker, publisher) = setup("id,val\n1,a\n");

        worker.run(&object()).await.unwrap();
        worker.run(&object()).await.unwrap();

        let events = publisher.events();
        assert_eq!(events[0].correlation_id(), events[1].correlation_id());
        assert_ne!(events[0].id(), events[1].id());
    }

    #[tokio::test]
    async fn malformed_rows_are_skipped() {
        let (worker, publisher) = setup("id,val\n1,a\n2\n3,c,extra\n4,d\n");

        let summary = worker.run(&object()).await.unwrap();

        assert_eq!(summary.published, 2);
        assert_eq!(summary.skipped, 2);
        // Row positions survive skipping.
        assert_eq!(
            publisher.events()[1].correlation_id(),
            &CorrelationId::for_row(&object(), 3)
        );
    }

    #[tokio::test]
    async fn headers_are_trimmed_and_validated() {
        let (worker, publisher) = setup(" id , val \n1,a\n");
        worker.run(&object()).await.unwrap();
        assert_eq!(publisher.events()[0].payload(), &json!({"id": "1", "val": "a"}));

        let (worker, _) = setup("id,id\n1,2\n");
        let err = worker.run(&object()).await.unwrap_err();
        assert!(matches!(err, IngestionError::Object { .. }));
        assert!(err.to_string().contains("duplicate header 'id'"));

        let (worker, publisher) = setup("");
        assert!(matches!(
            worker.run(&object()).await,
            Err(IngestionError::Object { .. })
        ));
        assert!(publisher.is_empty());
    }

    #[tokio::test]
    async fn missing_object_is_a_read_failure() {
        let (worker, publisher) = setup("id\n1\n");
        let err = worker
            .run(&ObjectRef::new("uploads", "upload/other.csv"))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            IngestionError::Read {
                source: ObjectStoreError::NotFound(_),
                ..
            }
        ));
        assert!(publisher.is_empty());
    }

    #[tokio::test]
    async fn closed_bus_aborts_invocation() {
        let (worker, publisher) = setup("id\n1\n2\n");
        publisher.close();

        let err = worker.run(&object()).await.unwrap_err();
        assert!(matches!(err, IngestionError::Publish { row: 0, .. }));
    }

    #[tokio::test]
    async fn custom_delimiter() {
        let (worker, publisher) = setup("id;val\n1;a\n");
        let worker = worker.with_config(IngestionConfig { delimiter: b';' });

        worker.run(&object()).await.unwrap();
        assert_eq!(publisher.events()[0].payload(), &json!({"id": "1", "val": "a"}));
    }
}
