//! # Rowflow Runtime
//!
//! Runtime for the rowflow ETL pipeline: the event router and everything it
//! needs to deliver events at least once without letting one stage's failures
//! or load spill into another.
//!
//! ## Core Components
//!
//! - **Event Router**: Subscription table, fan-out and per-(event, subscription) delivery
//! - **Delivery FSM**: `Pending → Retrying(n) → {Delivered | DeadLettered}`
//! - **Bounded Pool**: Per-stage concurrency ceiling with FIFO queueing
//! - **Retry**: Exponential backoff between attempts and around dead-letter writes
//! - **Dead Letter Queue**: In-memory quarantine for exhausted deliveries
//! - **Metrics / Health**: Prometheus exporter and health reports
//!
//! ## Example
//!
//! ```ignore
//! use rowflow_runtime::{DeadLetterQueue, EventRouter, RouterConfig, Subscription};
//!
//! let mut router = EventRouter::new(RouterConfig::default());
//! router.subscribe(Subscription::builder("load", pattern, handler, Arc::new(dlq)).build())?;
//!
//! let handle = router.start();
//! handle.publisher().publish(event).await?;
//! handle.wait_idle().await;
//! println!("{:?}", handle.stats());
//! ```

/// Per-(event, subscription) delivery state machine
pub mod delivery;

/// In-memory dead-letter queue
pub mod dead_letter;

/// Router and subscription health
pub mod health;

/// Prometheus metrics for observability
pub mod metrics;

/// Bounded worker pools
pub mod pool;

/// Exponential backoff
pub mod retry;

/// Content-filtered publish/subscribe router
pub mod router;

pub use dead_letter::DeadLetterQueue;
pub use delivery::{DeliveryError, DeliveryLedger, DeliveryState};
pub use health::{HealthCheck, HealthReport, HealthStatus};
pub use pool::{BoundedPool, PoolError, PoolPermit};
pub use retry::RetryPolicy;
pub use router::{
    EventRouter, RouterConfig, RouterError, RouterHandle, RouterPublisher, RouterStats,
    Subscription, SubscriptionBuilder,
};
