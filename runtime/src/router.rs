//! Content-filtered publish/subscribe router.
//!
//! The router owns a subscription table (compiled pattern → handler) and the
//! delivery state of every matched (event, subscription) pair. Publishers and
//! subscribers never reference each other.
//!
//! # Architecture
//!
//! ```text
//!  publish() ──► ingress queue ──► dispatcher ──┬─► [transform pool] ──► TransformWorker
//!                                               │        │ failure
//!                                               │        ▼
//!                                               │   retry / transform-dlq
//!                                               │
//!                                               └─► [load pool] ──► LoadWorker
//!                                                        │ failure
//!                                                        ▼
//!                                                   retry / load-dlq
//! ```
//!
//! - The dispatcher serializes each event once and evaluates every compiled
//!   pattern; each match becomes an independent delivery task.
//! - A delivery holds a pool permit only while the handler runs. Backoff
//!   between attempts happens outside the pool.
//! - One subscription's failures never touch another subscription's
//!   deliveries or dead-letter target.
//!
//! # Example
//!
//! ```ignore
//! let mut router = EventRouter::new(RouterConfig::default());
//! let publisher = router.publisher();
//!
//! router.subscribe(
//!     Subscription::builder("transform", pattern, handler, dlq)
//!         .max_attempts(3)
//!         .max_concurrency(10)
//!         .build(),
//! )?;
//!
//! let handle = router.start();
//! publisher.publish(event).await?;
//! handle.wait_idle().await;
//! ```

use crate::delivery::{DeliveryLedger, DeliveryState};
use crate::metrics::RouterMetrics;
use crate::pool::BoundedPool;
use crate::retry::{RetryPolicy, retry_with_backoff};
use crate::{HealthCheck, HealthReport};
use rowflow_core::BoxFuture;
use rowflow_core::dead_letter::{DeadLetterEnvelope, DeadLetterTarget};
use rowflow_core::environment::{Clock, SystemClock};
use rowflow_core::event::{Event, EventError};
use rowflow_core::event_bus::{EventBusError, EventPublisher};
use rowflow_core::handler::{EventHandler, HandlerError};
use rowflow_core::pattern::{CompiledPattern, EventPattern, PatternError};
use std::sync::{Arc, Mutex, PoisonError};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Errors returned by the router.
#[derive(Error, Debug)]
pub enum RouterError {
    /// A subscription with this name is already registered
    #[error("Subscription '{0}' is already registered")]
    DuplicateSubscription(String),

    /// The subscription's pattern does not compile
    #[error("Invalid pattern for subscription '{subscription}': {error}")]
    InvalidPattern {
        /// Subscription name
        subscription: String,
        /// Compilation failure
        #[source]
        error: PatternError,
    },

    /// The subscription's settings are out of range
    #[error("Invalid subscription '{subscription}': {reason}")]
    InvalidSubscription {
        /// Subscription name
        subscription: String,
        /// What is wrong
        reason: String,
    },

    /// No subscription with this name exists
    #[error("Unknown subscription: {0}")]
    UnknownSubscription(String),

    /// A dead-lettered event could not be decoded for replay
    #[error("Cannot replay event: {0}")]
    Replay(#[from] EventError),

    /// Deliveries were still running when shutdown gave up
    #[error("Shutdown timed out with {0} deliveries still running")]
    ShutdownTimeout(usize),
}

/// Router-wide settings.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Dead letters per subscription above which health reports `Degraded`
    pub dead_letter_alert_threshold: u64,
    /// Retries applied to a failing dead-letter write
    pub dead_letter_write_policy: RetryPolicy,
    /// Retired deliveries kept queryable through [`RouterHandle::delivery_state`]
    pub ledger_capacity: usize,
}

impl RouterConfig {
    /// Set the dead-letter alert threshold
    #[must_use]
    pub const fn with_dead_letter_alert_threshold(mut self, threshold: u64) -> Self {
        self.dead_letter_alert_threshold = threshold;
        self
    }

    /// Set the retry policy for dead-letter writes
    #[must_use]
    pub const fn with_dead_letter_write_policy(mut self, policy: RetryPolicy) -> Self {
        self.dead_letter_write_policy = policy;
        self
    }

    /// Set the delivery ledger capacity
    #[must_use]
    pub const fn with_ledger_capacity(mut self, capacity: usize) -> Self {
        self.ledger_capacity = capacity;
        self
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            dead_letter_alert_threshold: 0,
            dead_letter_write_policy: RetryPolicy::default(),
            ledger_capacity: 10_000,
        }
    }
}

/// A routing rule: pattern, handler and failure policy.
pub struct Subscription {
    name: String,
    pattern: EventPattern,
    handler: Arc<dyn EventHandler>,
    dead_letter: Arc<dyn DeadLetterTarget>,
    max_attempts: u32,
    max_concurrency: usize,
    invocation_timeout: Duration,
    retry_policy: RetryPolicy,
}

impl Subscription {
    /// Default number of attempts (first attempt plus two retries).
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
    /// Default per-stage concurrency ceiling.
    pub const DEFAULT_MAX_CONCURRENCY: usize = 10;
    /// Default execution budget of one attempt.
    pub const DEFAULT_INVOCATION_TIMEOUT: Duration = Duration::from_secs(30);

    /// Start building a subscription.
    #[must_use]
    pub fn builder(
        name: impl Into<String>,
        pattern: EventPattern,
        handler: Arc<dyn EventHandler>,
        dead_letter: Arc<dyn DeadLetterTarget>,
    ) -> SubscriptionBuilder {
        SubscriptionBuilder {
            subscription: Self {
                name: name.into(),
                pattern,
                handler,
                dead_letter,
                max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
                max_concurrency: Self::DEFAULT_MAX_CONCURRENCY,
                invocation_timeout: Self::DEFAULT_INVOCATION_TIMEOUT,
                retry_policy: RetryPolicy::default(),
            },
        }
    }

    /// Subscription name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("name", &self.name)
            .field("pattern", &self.pattern)
            .field("handler", &self.handler.name())
            .field("dead_letter", &self.dead_letter.name())
            .field("max_attempts", &self.max_attempts)
            .field("max_concurrency", &self.max_concurrency)
            .field("invocation_timeout", &self.invocation_timeout)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Subscription`].
#[derive(Debug)]
pub struct SubscriptionBuilder {
    subscription: Subscription,
}

impl SubscriptionBuilder {
    /// Total attempts before dead-lettering, first attempt included.
    #[must_use]
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.subscription.max_attempts = max_attempts;
        self
    }

    /// Maximum simultaneous handler invocations.
    #[must_use]
    pub fn max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.subscription.max_concurrency = max_concurrency;
        self
    }

    /// Execution budget of one attempt; exceeding it is a timed-out failure.
    #[must_use]
    pub fn invocation_timeout(mut self, timeout: Duration) -> Self {
        self.subscription.invocation_timeout = timeout;
        self
    }

    /// Backoff between attempts.
    #[must_use]
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.subscription.retry_policy = policy;
        self
    }

    /// Finish the subscription.
    #[must_use]
    pub fn build(self) -> Subscription {
        self.subscription
    }
}

/// A registered, compiled subscription.
struct Route {
    name: Arc<str>,
    pattern: CompiledPattern,
    handler: Arc<dyn EventHandler>,
    dead_letter: Arc<dyn DeadLetterTarget>,
    max_attempts: u32,
    invocation_timeout: Duration,
    retry_policy: RetryPolicy,
    pool: BoundedPool,
    dead_lettered: AtomicU64,
}

#[derive(Debug, Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    dead_letters_lost: AtomicU64,
    unrouted: AtomicU64,
    abandoned: AtomicU64,
}

/// State shared by publishers, the dispatcher and delivery tasks.
struct Shared {
    counters: Counters,
    ledger: DeliveryLedger,
    outstanding: AtomicUsize,
    idle: Notify,
    accepting: AtomicBool,
    clock: Arc<dyn Clock>,
    config: RouterConfig,
}

impl Shared {
    fn begin(&self) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
    }

    fn finish(&self) {
        if self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Snapshot of router counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    /// Events accepted by `publish`
    pub published: u64,
    /// Deliveries that reached `Delivered`
    pub delivered: u64,
    /// Failed attempts that were retried
    pub retried: u64,
    /// Deliveries that reached `DeadLettered`
    pub dead_lettered: u64,
    /// Dead-letter writes that failed after retries
    pub dead_letters_lost: u64,
    /// Events that matched no subscription
    pub unrouted: u64,
    /// Deliveries left unfinished because shutdown closed their pool
    pub abandoned: u64,
}

/// Cloneable publishing endpoint of a router.
///
/// Available before the router starts, so handlers that publish can be built
/// before they are subscribed.
#[derive(Clone)]
pub struct RouterPublisher {
    tx: mpsc::UnboundedSender<Event>,
    shared: Arc<Shared>,
}

impl RouterPublisher {
    /// Enqueue an event for routing and return immediately.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::Closed`] once the router has shut down.
    pub fn try_publish(&self, event: Event) -> Result<(), EventBusError> {
        if !self.shared.accepting.load(Ordering::SeqCst) {
            return Err(EventBusError::Closed);
        }
        self.shared.begin();
        let event_id = event.id();
        if self.tx.send(event).is_err() {
            self.shared.finish();
            return Err(EventBusError::Closed);
        }
        self.shared.counters.published.fetch_add(1, Ordering::Relaxed);
        RouterMetrics::record_publish();
        tracing::trace!(%event_id, "Event published");
        Ok(())
    }
}

impl EventPublisher for RouterPublisher {
    fn publish(&self, event: Event) -> BoxFuture<'_, Result<(), EventBusError>> {
        let result = self.try_publish(event);
        Box::pin(async move { result })
    }
}

impl std::fmt::Debug for RouterPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterPublisher").finish_non_exhaustive()
    }
}

/// A router that is still accepting subscriptions.
pub struct EventRouter {
    routes: Vec<Arc<Route>>,
    shared: Arc<Shared>,
    tx: mpsc::UnboundedSender<Event>,
    rx: mpsc::UnboundedReceiver<Event>,
}

impl EventRouter {
    /// Create a router using the system clock.
    #[must_use]
    pub fn new(config: RouterConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a router stamping dead letters with `clock`.
    #[must_use]
    pub fn with_clock(config: RouterConfig, clock: Arc<dyn Clock>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            routes: Vec::new(),
            shared: Arc::new(Shared {
                counters: Counters::default(),
                ledger: DeliveryLedger::new(config.ledger_capacity),
                outstanding: AtomicUsize::new(0),
                idle: Notify::new(),
                accepting: AtomicBool::new(true),
                clock,
                config,
            }),
            tx,
            rx,
        }
    }

    /// Publishing endpoint; events queue until [`start`](Self::start).
    #[must_use]
    pub fn publisher(&self) -> RouterPublisher {
        RouterPublisher {
            tx: self.tx.clone(),
            shared: Arc::clone(&self.shared),
        }
    }

    /// Register a subscription, compiling its pattern.
    ///
    /// # Errors
    ///
    /// - [`RouterError::DuplicateSubscription`] if the name is taken
    /// - [`RouterError::InvalidPattern`] if the pattern does not compile
    /// - [`RouterError::InvalidSubscription`] if `max_attempts` or `max_concurrency` is zero
    pub fn subscribe(&mut self, subscription: Subscription) -> Result<(), RouterError> {
        let Subscription {
            name,
            pattern,
            handler,
            dead_letter,
            max_attempts,
            max_concurrency,
            invocation_timeout,
            retry_policy,
        } = subscription;

        if self.routes.iter().any(|r| *r.name == *name) {
            return Err(RouterError::DuplicateSubscription(name));
        }
        if max_attempts == 0 || max_concurrency == 0 {
            return Err(RouterError::InvalidSubscription {
                subscription: name,
                reason: "max_attempts and max_concurrency must be at least 1".to_string(),
            });
        }
        let compiled = pattern
            .compile()
            .map_err(|error| RouterError::InvalidPattern {
                subscription: name.clone(),
                error,
            })?;

        tracing::info!(
            subscription = %name,
            pattern = %compiled,
            handler = handler.name(),
            dead_letter = dead_letter.name(),
            max_attempts,
            max_concurrency,
            "Subscription registered"
        );

        self.routes.push(Arc::new(Route {
            pool: BoundedPool::new(name.clone(), max_concurrency),
            name: Arc::from(name),
            pattern: compiled,
            handler,
            dead_letter,
            max_attempts,
            invocation_timeout,
            retry_policy,
            dead_lettered: AtomicU64::new(0),
        }));
        Ok(())
    }

    /// Freeze the subscription table and start dispatching.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn start(self) -> RouterHandle {
        let Self {
            routes,
            shared,
            tx,
            mut rx,
        } = self;
        let routes: Arc<[Arc<Route>]> = routes.into();
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let dispatcher = {
            let routes = Arc::clone(&routes);
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        maybe_event = rx.recv() => {
                            let Some(event) = maybe_event else { break };
                            dispatch(&routes, &shared, event);
                        }
                        _ = shutdown_rx.changed() => break,
                    }
                }
                tracing::debug!("Router dispatcher stopped");
            })
        };

        tracing::info!(subscriptions = routes.len(), "Event router started");

        RouterHandle {
            publisher: RouterPublisher {
                tx,
                shared: Arc::clone(&shared),
            },
            routes,
            shared,
            shutdown_tx,
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }
}

fn dispatch(routes: &[Arc<Route>], shared: &Arc<Shared>, event: Event) {
    let wire: Arc<[u8]> = match event.to_wire() {
        Ok(bytes) => bytes.into(),
        Err(e) => {
            tracing::error!(event_id = %event.id(), error = %e, "Dropping event that cannot be serialized");
            shared.finish();
            return;
        }
    };

    let mut matched = 0usize;
    for route in routes.iter().filter(|r| r.pattern.matches(&event)) {
        matched += 1;
        spawn_delivery(Arc::clone(route), Arc::clone(shared), event.clone(), Arc::clone(&wire));
    }

    if matched == 0 {
        shared.counters.unrouted.fetch_add(1, Ordering::Relaxed);
        RouterMetrics::record_unrouted();
        tracing::debug!(
            event_id = %event.id(),
            route = %event.routing_key(),
            "Event matched no subscription"
        );
    }

    shared.finish();
}

fn spawn_delivery(route: Arc<Route>, shared: Arc<Shared>, event: Event, wire: Arc<[u8]>) {
    shared.begin();
    shared
        .ledger
        .record(event.id(), &route.name, DeliveryState::Pending);
    tokio::spawn(async move {
        deliver(&route, &shared, &event, &wire).await;
        shared.finish();
    });
}

/// Drive one (event, subscription) pair to a terminal state.
async fn deliver(route: &Route, shared: &Shared, event: &Event, wire: &[u8]) {
    let mut state = DeliveryState::Pending;

    while let Some(attempt) = state.next_attempt() {
        let permit = match route.pool.acquire().await {
            Ok(permit) => permit,
            Err(e) => {
                shared.counters.abandoned.fetch_add(1, Ordering::Relaxed);
                RouterMetrics::record_abandoned(&route.name);
                tracing::warn!(
                    subscription = %route.name,
                    event_id = %event.id(),
                    state = ?state,
                    error = %e,
                    "Delivery abandoned"
                );
                return;
            }
        };
        let started = Instant::now();
        let result = match tokio::time::timeout(route.invocation_timeout, route.handler.handle(event)).await {
            Ok(result) => result,
            Err(_) => Err(HandlerError::timed_out(route.invocation_timeout)),
        };
        drop(permit);

        let outcome = if result.is_ok() { "delivered" } else { "failed" };
        RouterMetrics::record_attempt(&route.name, outcome, started.elapsed());

        let next = match &result {
            Ok(()) => state.on_success(),
            Err(_) => state.on_failure(route.max_attempts),
        };
        state = match next {
            Ok(next) => next,
            Err(e) => {
                tracing::error!(subscription = %route.name, event_id = %event.id(), error = %e, "Invalid delivery transition");
                return;
            }
        };
        shared.ledger.record(event.id(), &route.name, state);

        match (state, result) {
            (DeliveryState::Delivered, _) => {
                shared.counters.delivered.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    subscription = %route.name,
                    event_id = %event.id(),
                    correlation_id = %event.correlation_id(),
                    attempt,
                    "Event delivered"
                );
            }
            (DeliveryState::Retrying(failed), Err(err)) => {
                shared.counters.retried.fetch_add(1, Ordering::Relaxed);
                RouterMetrics::record_retry(&route.name);
                let delay = route.retry_policy.delay_for_attempt(failed.saturating_sub(1));
                tracing::warn!(
                    subscription = %route.name,
                    event_id = %event.id(),
                    correlation_id = %event.correlation_id(),
                    attempt,
                    max_attempts = route.max_attempts,
                    failure = %err.kind(),
                    error = %err.message(),
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Delivery failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            (DeliveryState::DeadLettered, Err(err)) => {
                dead_letter(route, shared, event, wire, attempt, &err).await;
            }
            (state, _) => {
                tracing::error!(subscription = %route.name, event_id = %event.id(), %state, "Unexpected delivery state");
                return;
            }
        }
    }
}

async fn dead_letter(
    route: &Route,
    shared: &Shared,
    event: &Event,
    wire: &[u8],
    attempt_count: u32,
    err: &HandlerError,
) {
    let envelope = DeadLetterEnvelope {
        subscription: route.name.to_string(),
        event_id: event.id(),
        correlation_id: event.correlation_id().clone(),
        original_event: wire.to_vec(),
        attempt_count,
        failure_kind: err.kind(),
        last_error: err.to_string(),
        dead_lettered_at: shared.clock.now(),
    };

    shared.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
    route.dead_lettered.fetch_add(1, Ordering::Relaxed);
    RouterMetrics::record_dead_letter(&route.name);

    let target = &route.dead_letter;
    let policy = shared.config.dead_letter_write_policy.clone();
    match retry_with_backoff(policy, "dead-letter write", || target.send(&envelope)).await {
        Ok(()) => {
            tracing::warn!(
                subscription = %route.name,
                dead_letter = target.name(),
                event_id = %event.id(),
                correlation_id = %event.correlation_id(),
                attempt_count,
                failure = %err.kind(),
                error = %err.message(),
                "Event dead-lettered"
            );
        }
        Err(write_err) => {
            shared
                .counters
                .dead_letters_lost
                .fetch_add(1, Ordering::Relaxed);
            RouterMetrics::record_dead_letter_lost(&route.name);
            tracing::error!(
                subscription = %route.name,
                dead_letter = target.name(),
                event_id = %event.id(),
                correlation_id = %event.correlation_id(),
                error = %write_err,
                "Dead-letter write failed; event lost"
            );
        }
    }
}

/// A running router.
pub struct RouterHandle {
    publisher: RouterPublisher,
    routes: Arc<[Arc<Route>]>,
    shared: Arc<Shared>,
    shutdown_tx: watch::Sender<bool>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl RouterHandle {
    /// Publishing endpoint.
    #[must_use]
    pub fn publisher(&self) -> RouterPublisher {
        self.publisher.clone()
    }

    /// Names of the registered subscriptions, in registration order.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<&str> {
        self.routes.iter().map(|r| &*r.name).collect()
    }

    /// Highest number of simultaneous invocations seen by a subscription.
    #[must_use]
    pub fn peak_concurrency(&self, subscription: &str) -> Option<usize> {
        self.route(subscription).map(|r| r.pool.peak())
    }

    /// Wait until every accepted event is retired in every subscription.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            if self.shared.outstanding.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Snapshot of router counters.
    #[must_use]
    pub fn stats(&self) -> RouterStats {
        let c = &self.shared.counters;
        RouterStats {
            published: c.published.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            retried: c.retried.load(Ordering::Relaxed),
            dead_lettered: c.dead_lettered.load(Ordering::Relaxed),
            dead_letters_lost: c.dead_letters_lost.load(Ordering::Relaxed),
            unrouted: c.unrouted.load(Ordering::Relaxed),
            abandoned: c.abandoned.load(Ordering::Relaxed),
        }
    }

    /// Last known delivery state of `event_id` for `subscription`.
    #[must_use]
    pub fn delivery_state(&self, event_id: Uuid, subscription: &str) -> Option<DeliveryState> {
        self.shared.ledger.get(event_id, subscription)
    }

    /// Manually replay a dead-lettered event into one subscription.
    ///
    /// The replay starts a fresh delivery with the full attempt budget.
    ///
    /// # Errors
    ///
    /// - [`RouterError::UnknownSubscription`] if no such subscription exists
    /// - [`RouterError::Replay`] if the stored bytes are not a valid event
    pub fn redeliver(
        &self,
        subscription: &str,
        envelope: &DeadLetterEnvelope,
    ) -> Result<(), RouterError> {
        let route = self
            .route(subscription)
            .ok_or_else(|| RouterError::UnknownSubscription(subscription.to_string()))?;
        let event = envelope.event()?;

        tracing::info!(
            subscription,
            event_id = %event.id(),
            correlation_id = %event.correlation_id(),
            "Redelivering dead-lettered event"
        );
        spawn_delivery(
            Arc::clone(route),
            Arc::clone(&self.shared),
            event,
            envelope.original_event.clone().into(),
        );
        Ok(())
    }

    /// Health of the router and of each subscription.
    #[must_use]
    pub fn health(&self) -> HealthReport {
        let mut checks = Vec::with_capacity(self.routes.len() + 1);

        checks.push(if self.shared.accepting.load(Ordering::SeqCst) {
            HealthCheck::healthy("router")
        } else {
            HealthCheck::unhealthy("router", "router is shut down")
        });

        let threshold = self.shared.config.dead_letter_alert_threshold;
        for route in self.routes.iter() {
            let dead = route.dead_lettered.load(Ordering::Relaxed);
            let component = format!("subscription:{}", route.name);
            let check = if dead > threshold {
                HealthCheck::degraded(
                    component,
                    format!("{dead} dead letters exceed threshold {threshold}"),
                )
            } else {
                HealthCheck::healthy(component)
            };
            checks.push(
                check
                    .with_metadata("dead_lettered", dead.to_string())
                    .with_metadata("active", route.pool.active().to_string())
                    .with_metadata("queued", route.pool.queued().to_string()),
            );
        }

        HealthReport::new(checks)
    }

    /// Drain in-flight deliveries, then stop accepting events.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::ShutdownTimeout`] if deliveries were still
    /// running after `timeout`; the router is stopped regardless. Deliveries
    /// still waiting for a permit are then dropped and counted in
    /// [`RouterStats::abandoned`].
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), RouterError> {
        tracing::info!(timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX), "Shutting down event router");
        let drained = tokio::time::timeout(timeout, self.wait_idle()).await.is_ok();

        self.shared.accepting.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);
        for route in self.routes.iter() {
            route.pool.close();
        }
        let dispatcher = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(dispatcher) = dispatcher {
            if let Err(e) = dispatcher.await {
                tracing::error!(error = %e, "Router dispatcher task failed");
            }
        }

        if drained {
            tracing::info!("Event router stopped");
            Ok(())
        } else {
            let remaining = self.shared.outstanding.load(Ordering::SeqCst);
            tracing::warn!(remaining, "Event router stopped with deliveries in flight");
            Err(RouterError::ShutdownTimeout(remaining))
        }
    }

    fn route(&self, name: &str) -> Option<&Arc<Route>> {
        self.routes.iter().find(|r| &*r.name == name)
    }
}
