//! # Rowflow Core
//!
//! Core types and collaborator traits for the rowflow event-driven ETL pipeline.
//!
//! Uploaded files are ingested row by row, each row is published as a domain
//! event, a transform stage normalizes it and a load stage upserts the result
//! into a keyed store. Stages never call each other; they only publish to and
//! subscribe from an event router.
//!
//! ## Core Concepts
//!
//! - **Event**: Immutable envelope routed by `(source, detailType, status)`
//! - **Pattern**: Declarative routing rule, compiled once into a predicate
//! - **Record**: Persisted entity keyed by a single `id`
//! - **Dead letter**: Quarantined delivery that exhausted its attempts
//! - **Collaborators**: Object store, record store, publisher, handler and
//!   dead-letter target, each behind a dyn-compatible trait
//!
//! ## Delivery Guarantees
//!
//! - At-least-once per subscription
//! - No ordering, not even per correlation id
//! - Duplicates are absorbed by idempotent upserts keyed by domain id
//!
//! ## Example
//!
//! ```
//! use rowflow_core::environment::SystemClock;
//! use rowflow_core::event::{CorrelationId, DetailType, Event, Source, Status};
//! use rowflow_core::pattern::EventPattern;
//!
//! let rule = EventPattern::exact(Source::Ingestion, DetailType::ExtractionProcess, Status::RowSent)
//!     .compile()
//!     .unwrap();
//!
//! let event = Event::extraction(CorrelationId::new("row-1"), serde_json::json!({}), &SystemClock);
//! assert!(rule.matches(&event));
//! ```

use std::future::Future;
use std::pin::Pin;

pub mod dead_letter;
pub mod event;
pub mod event_bus;
pub mod handler;
pub mod object_store;
pub mod pattern;
pub mod record;
pub mod record_store;

pub use dead_letter::{DeadLetterEnvelope, DeadLetterError, DeadLetterTarget};
pub use event::{CorrelationId, DetailType, Event, EventError, RoutingKey, Source, Status};
pub use event_bus::{EventBusError, EventPublisher};
pub use handler::{EventHandler, FailureKind, HandlerError};
pub use object_store::{ObjectRef, ObjectStore, ObjectStoreError};
pub use pattern::{CompiledPattern, EventPattern, PatternError};
pub use record::{Record, RecordError, UpsertOutcome};
pub use record_store::{RecordStore, RecordStoreError};

/// Boxed future returned by the dyn-compatible collaborator traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Environment traits for dependency injection.
///
/// All external dependencies are abstracted behind traits so that workers can
/// be exercised with deterministic test doubles.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use rowflow_core::environment::{Clock, SystemClock};
    ///
    /// let now = SystemClock.now();
    /// assert!(now.timestamp() > 0);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
