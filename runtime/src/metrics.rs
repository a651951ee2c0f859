//! Metrics recorded by the router, the pools and the workers.
//!
//! Recording goes through the `metrics` facade and is a no-op until a
//! recorder is installed. [`MetricsServer`] installs a Prometheus recorder
//! and serves the scrape endpoint.
//!
//! Names are grouped by emitter:
//! - `router_*`: publishes, delivery attempts, retries, dead letters
//! - `pool_*`: permits held and waiting, per stage
//! - `launcher_*`, `ingestion_*`, `transform_*`, `load_*`: stage outcomes
//!
//! # Example
//!
//! ```rust,no_run
//! use rowflow_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! // scrape http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Histogram buckets for `*_duration_seconds`, from 1ms to 10s.
const DURATION_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Exporter setup failures.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// The Prometheus exporter rejected its configuration
    #[error("Cannot build Prometheus exporter: {0}")]
    Build(String),
    /// The global recorder could not be installed
    #[error("Cannot install metrics recorder: {0}")]
    Install(String),
}

/// Prometheus scrape endpoint.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// An exporter that will listen on `addr` once started.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Describe every metric, install the global recorder and spawn the HTTP
    /// listener. Must run inside a Tokio runtime.
    ///
    /// A recorder installed earlier in the process (tests do this) is kept;
    /// the call then succeeds without a render handle.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if the exporter cannot be built or another
    /// kind of installation failure occurs.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let (recorder, exporter) = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                DURATION_BUCKETS,
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let handle = recorder.handle();
        if let Err(e) = metrics::set_global_recorder(recorder) {
            let reason = e.to_string();
            if reason.contains("already initialized") {
                tracing::warn!("Metrics recorder already installed; keeping it");
                return Ok(());
            }
            return Err(MetricsError::Install(reason));
        }

        tokio::spawn(async move {
            if exporter.await.is_err() {
                tracing::error!("Metrics exporter stopped");
            }
        });
        self.handle = Some(handle);
        tracing::info!(addr = %self.addr, "Serving metrics at http://{}/metrics", self.addr);
        Ok(())
    }

    /// Render handle, once started.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Current metrics in Prometheus text format, once started.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
pub fn register_metrics() {
    // Router
    describe_counter!(
        "router_events_published_total",
        "Total number of events accepted by the router"
    );
    describe_counter!(
        "router_events_unrouted_total",
        "Total number of events that matched no subscription"
    );
    describe_counter!(
        "router_deliveries_total",
        "Delivery attempts by subscription and outcome"
    );
    describe_counter!(
        "router_retries_total",
        "Failed attempts that were scheduled for retry"
    );
    describe_counter!(
        "router_dead_letters_total",
        "Deliveries moved to a dead-letter target"
    );
    describe_counter!(
        "router_dead_letters_lost_total",
        "Dead-letter writes that failed after retries"
    );
    describe_counter!(
        "router_deliveries_abandoned_total",
        "Deliveries dropped by shutdown before reaching a terminal state"
    );
    describe_histogram!(
        "router_delivery_duration_seconds",
        "Time taken by one handler invocation"
    );

    // Pools
    describe_gauge!("pool_active", "Invocations currently holding a pool permit");
    describe_gauge!("pool_queued", "Invocations waiting for a pool permit");

    // Dead-letter queues
    describe_gauge!("dlq_size", "Entries held by an in-memory dead-letter queue");

    // Workers
    describe_counter!(
        "launcher_notifications_total",
        "Object-created notifications by outcome"
    );
    describe_counter!(
        "launcher_invocation_failures_total",
        "Ingestion invocations that failed at object level"
    );
    describe_counter!(
        "ingestion_rows_total",
        "Rows read by the ingestion worker by outcome"
    );
    describe_counter!(
        "transform_items_total",
        "Items handled by the transform worker by outcome"
    );
    describe_counter!(
        "load_upserts_total",
        "Record upserts by outcome"
    );
}

/// Event router metrics recorder.
pub struct RouterMetrics;

impl RouterMetrics {
    /// Record an accepted publish.
    pub fn record_publish() {
        counter!("router_events_published_total").increment(1);
    }

    /// Record an event that matched no subscription.
    pub fn record_unrouted() {
        counter!("router_events_unrouted_total").increment(1);
    }

    /// Record one handler invocation.
    pub fn record_attempt(subscription: &str, outcome: &'static str, duration: Duration) {
        counter!(
            "router_deliveries_total",
            "subscription" => subscription.to_string(),
            "outcome" => outcome
        )
        .increment(1);
        histogram!(
            "router_delivery_duration_seconds",
            "subscription" => subscription.to_string()
        )
        .record(duration.as_secs_f64());
    }

    /// Record a scheduled retry.
    pub fn record_retry(subscription: &str) {
        counter!("router_retries_total", "subscription" => subscription.to_string()).increment(1);
    }

    /// Record a dead-lettered delivery.
    pub fn record_dead_letter(subscription: &str) {
        counter!("router_dead_letters_total", "subscription" => subscription.to_string())
            .increment(1);
    }

    /// Record a dead-letter write that could not be stored.
    pub fn record_dead_letter_lost(subscription: &str) {
        counter!("router_dead_letters_lost_total", "subscription" => subscription.to_string())
            .increment(1);
    }

    /// Record a delivery dropped by shutdown before reaching a terminal state.
    pub fn record_abandoned(subscription: &str) {
        counter!("router_deliveries_abandoned_total", "subscription" => subscription.to_string())
            .increment(1);
    }
}

/// Bounded pool metrics recorder.
pub struct PoolMetrics;

impl PoolMetrics {
    /// Record current active invocations.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_active(pool: &str, active: usize) {
        gauge!("pool_active", "pool" => pool.to_string()).set(active as f64);
    }

    /// Record current waiting invocations.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_queued(pool: &str, queued: usize) {
        gauge!("pool_queued", "pool" => pool.to_string()).set(queued as f64);
    }
}

/// Worker stage metrics recorder.
pub struct WorkerMetrics;

impl WorkerMetrics {
    /// Record a launcher decision (`ignored`, `duplicate`, `launched`).
    pub fn record_notification(outcome: &'static str) {
        counter!("launcher_notifications_total", "outcome" => outcome).increment(1);
    }

    /// Record a failed ingestion invocation.
    pub fn record_invocation_failure() {
        counter!("launcher_invocation_failures_total").increment(1);
    }

    /// Record ingested rows (`published`, `skipped`).
    pub fn record_rows(outcome: &'static str, count: u64) {
        counter!("ingestion_rows_total", "outcome" => outcome).increment(count);
    }

    /// Record a transform outcome (`transformed`, `rejected`).
    pub fn record_transform(outcome: &'static str) {
        counter!("transform_items_total", "outcome" => outcome).increment(1);
    }

    /// Record an upsert outcome (`created`, `unchanged`, `replaced`, `failed`).
    pub fn record_upsert(outcome: &'static str) {
        counter!("load_upserts_total", "outcome" => outcome).increment(1);
    }
}
