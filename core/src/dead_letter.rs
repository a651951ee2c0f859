//! Dead-letter envelopes and targets.
//!
//! When a delivery exhausts its attempts the router wraps the original event
//! in a [`DeadLetterEnvelope`] and writes it to the subscription's own
//! [`DeadLetterTarget`]. The wire bytes captured at publish time are kept
//! verbatim so the event can be inspected and replayed exactly.

use crate::BoxFuture;
use crate::event::{CorrelationId, Event, EventError};
use crate::handler::FailureKind;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

/// Errors returned by a [`DeadLetterTarget`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeadLetterError {
    /// The target could not be reached or the write failed
    #[error("Dead-letter target unavailable: {0}")]
    Unavailable(String),

    /// The target refused the envelope
    #[error("Dead-letter write rejected: {0}")]
    Rejected(String),
}

/// A quarantined delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterEnvelope {
    /// Subscription whose attempts were exhausted
    pub subscription: String,
    /// Id of the original event
    pub event_id: Uuid,
    /// Correlation id of the original event
    pub correlation_id: CorrelationId,
    /// Wire bytes of the original event, byte-for-byte
    pub original_event: Vec<u8>,
    /// Number of failed attempts
    pub attempt_count: u32,
    /// Kind of the final failure
    pub failure_kind: FailureKind,
    /// Message of the final failure
    pub last_error: String,
    /// When the delivery was dead-lettered
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetterEnvelope {
    /// Decode the original event for replay.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Malformed`] if the stored bytes are not a valid event.
    pub fn event(&self) -> Result<Event, EventError> {
        Event::from_wire(&self.original_event)
    }
}

/// Durable quarantine destination owned by exactly one subscription.
pub trait DeadLetterTarget: Send + Sync {
    /// Name used in logs and metrics.
    fn name(&self) -> &str;

    /// Store one envelope.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError`] if the envelope could not be stored.
    fn send<'a>(
        &'a self,
        envelope: &'a DeadLetterEnvelope,
    ) -> BoxFuture<'a, Result<(), DeadLetterError>>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::environment::SystemClock;
    use serde_json::json;

    #[test]
    fn envelope_replays_original_event() {
        let event = Event::extraction(CorrelationId::new("c-1"), json!({"id": "1"}), &SystemClock);
        let envelope = DeadLetterEnvelope {
            subscription: "transform".to_string(),
            event_id: event.id(),
            correlation_id: event.correlation_id().clone(),
            original_event: event.to_wire().unwrap(),
            attempt_count: 3,
            failure_kind: FailureKind::Permanent,
            last_error: "bad row".to_string(),
            dead_lettered_at: Utc::now(),
        };

        assert_eq!(envelope.event().unwrap(), event);
    }
}
