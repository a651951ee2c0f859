//! Load stage: one idempotent upsert per transformed item.
//!
//! The record is keyed by the item's domain `id`, never by event identity, so
//! redelivered transform events converge on the same stored state.

use rowflow_core::BoxFuture;
use rowflow_core::event::{Event, Status};
use rowflow_core::handler::{EventHandler, HandlerError};
use rowflow_core::record::{Record, UpsertOutcome};
use rowflow_core::record_store::RecordStore;
use rowflow_runtime::metrics::WorkerMetrics;
use std::sync::Arc;

/// Handler of the load subscription.
#[derive(Clone)]
pub struct LoadWorker {
    store: Arc<dyn RecordStore>,
}

impl LoadWorker {
    /// Create a worker writing to `store`.
    #[must_use]
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Upsert the item carried by `event`.
    ///
    /// # Errors
    ///
    /// - permanent failure if the event is not a transform event or its item
    ///   has no usable `id`
    /// - transient failure if the store rejects the write
    pub async fn load(&self, event: &Event) -> Result<UpsertOutcome, HandlerError> {
        if event.status() != Status::ItemTransformed {
            return Err(HandlerError::permanent(format!(
                "load worker cannot handle {}",
                event.routing_key()
            )));
        }

        let record = Record::from_item(event.payload())
            .map_err(|e| HandlerError::permanent(format!("invalid item: {e}")))?;

        match self.store.upsert(&record).await {
            Ok(outcome) => {
                WorkerMetrics::record_upsert(outcome.as_str());
                tracing::debug!(
                    event_id = %event.id(),
                    correlation_id = %event.correlation_id(),
                    record_id = %record.id,
                    %outcome,
                    "Record upserted"
                );
                Ok(outcome)
            }
            Err(e) => {
                WorkerMetrics::record_upsert("failed");
                Err(HandlerError::transient(format!(
                    "upsert of record '{}' failed: {e}",
                    record.id
                )))
            }
        }
    }
}

impl EventHandler for LoadWorker {
    fn name(&self) -> &str {
        "load-worker"
    }

    fn handle<'a>(&'a self, event: &'a Event) -> BoxFuture<'a, Result<(), HandlerError>> {
        Box::pin(async move { self.load(event).await.map(|_| ()) })
    }
}

impl std::fmt::Debug for LoadWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadWorker").finish_non_exhaustive()
    }
}
