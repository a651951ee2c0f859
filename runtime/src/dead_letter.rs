//! In-memory dead-letter queue.
//!
//! Holds envelopes of deliveries that exhausted their attempts so they can be
//! inspected, monitored and replayed manually. Nothing is ever re-queued
//! automatically; entries leave the queue only through [`DeadLetterQueue::drain`].
//!
//! # Example
//!
//! ```ignore
//! use rowflow_runtime::DeadLetterQueue;
//!
//! let dlq = DeadLetterQueue::new("transform-dlq");
//!
//! // Hand it to a subscription as its dead-letter target, then later:
//! for envelope in dlq.drain() {
//!     handle.redeliver("transform", &envelope)?;
//! }
//! ```

use rowflow_core::BoxFuture;
use rowflow_core::dead_letter::{DeadLetterEnvelope, DeadLetterError, DeadLetterTarget};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

/// Unbounded, thread-safe dead-letter queue.
///
/// Clones share the same storage.
#[derive(Debug, Clone)]
pub struct DeadLetterQueue {
    name: Arc<str>,
    queue: Arc<Mutex<VecDeque<DeadLetterEnvelope>>>,
}

impl DeadLetterQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            queue: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Push an envelope.
    pub fn push(&self, envelope: DeadLetterEnvelope) {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        queue.push_back(envelope);
        self.record_size(queue.len());
    }

    /// Get the current queue size
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Check if the queue is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of every entry, oldest first.
    #[must_use]
    pub fn entries(&self) -> Vec<DeadLetterEnvelope> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Peek at the oldest entry without removing it
    #[must_use]
    pub fn peek(&self) -> Option<DeadLetterEnvelope> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .front()
            .cloned()
    }

    /// Drain all entries from the queue
    pub fn drain(&self) -> Vec<DeadLetterEnvelope> {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        let entries: Vec<_> = queue.drain(..).collect();
        self.record_size(0);

        tracing::info!(target_name = %self.name, count = entries.len(), "Drained dead letter queue");

        entries
    }

    #[allow(clippy::cast_precision_loss)]
    fn record_size(&self, len: usize) {
        metrics::gauge!("dlq_size", "target" => self.name.to_string()).set(len as f64);
    }
}

impl DeadLetterTarget for DeadLetterQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn send<'a>(
        &'a self,
        envelope: &'a DeadLetterEnvelope,
    ) -> BoxFuture<'a, Result<(), DeadLetterError>> {
        Box::pin(async move {
            self.push(envelope.clone());
            Ok(())
        })
    }
}
