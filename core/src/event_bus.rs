//! Publishing side of the event bus.
//!
//! Workers only ever see an [`EventPublisher`]; the router that evaluates
//! subscriptions lives in `rowflow-runtime`. Publishing is fire-and-forget:
//! a successful return means the event was accepted for routing, not that any
//! subscriber has processed it.
//!
//! # Key Principles
//!
//! - **At-least-once delivery**: Events may be delivered multiple times
//! - **Idempotency**: Subscribers must handle duplicate events
//! - **No ordering**: Events sharing a correlation id may arrive in any order

use crate::BoxFuture;
use crate::event::Event;
use thiserror::Error;

/// Errors that can occur during event bus operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventBusError {
    /// The bus has been shut down and accepts no more events
    #[error("Event bus is closed")]
    Closed,

    /// Failed to publish an event
    #[error("Publish failed: {0}")]
    PublishFailed(String),
}

/// Trait for publishing events onto the bus.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync` so that many concurrent worker
/// invocations can share one publisher.
///
/// # Dyn Compatibility
///
/// This trait uses explicit `Pin<Box<dyn Future>>` returns instead of `async fn`
/// so workers can hold an `Arc<dyn EventPublisher>`.
pub trait EventPublisher: Send + Sync {
    /// Publish one event.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::Closed`] if the bus no longer accepts events,
    /// or [`EventBusError::PublishFailed`] if the substrate rejected it.
    fn publish(&self, event: Event) -> BoxFuture<'_, Result<(), EventBusError>>;
}
