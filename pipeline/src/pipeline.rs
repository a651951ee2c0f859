//! Wiring of the launcher, the router and the three stages.
//!
//! ```text
//! ObjectCreated ─▶ IngestionLauncher ─▶ IngestionWorker ──publish──┐
//!                                                                  ▼
//!                                                            EventRouter
//!              ┌── "transform": ingestion/extraction-process/row_sent
//!              │      └▶ TransformWorker ──publish──▶ EventRouter
//!              └── "load": transform/transform-process/item_transformed
//!                     └▶ LoadWorker ──upsert──▶ RecordStore
//! ```
//!
//! Each subscription has its own attempt bound, concurrency ceiling and
//! dead-letter target, so a stage that keeps failing only fills its own queue.

use crate::config::{ConfigError, PipelineConfig, StageConfig};
use rowflow_core::dead_letter::{DeadLetterEnvelope, DeadLetterTarget};
use rowflow_core::event::{DetailType, Source, Status};
use rowflow_core::event_bus::EventPublisher;
use rowflow_core::handler::EventHandler;
use rowflow_core::object_store::ObjectStore;
use rowflow_core::pattern::EventPattern;
use rowflow_core::record_store::RecordStore;
use rowflow_runtime::{
    EventRouter, HealthReport, RouterError, RouterHandle, RouterStats, Subscription,
};
use rowflow_workers::{
    IngestionLauncher, IngestionWorker, LaunchOutcome, LauncherError, LauncherStats, LoadWorker,
    ObjectCreated, TransformWorker,
};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Name of the subscription feeding the transform stage.
pub const TRANSFORM_SUBSCRIPTION: &str = "transform";
/// Name of the subscription feeding the load stage.
pub const LOAD_SUBSCRIPTION: &str = "load";

/// Errors raised while assembling or stopping the pipeline.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The launcher rejected its settings
    #[error(transparent)]
    Launcher(#[from] LauncherError),

    /// A subscription could not be registered, or shutdown timed out
    #[error(transparent)]
    Router(#[from] RouterError),
}

/// External systems the pipeline reads from and writes to.
pub struct Collaborators {
    /// Where uploaded objects are read
    pub object_store: Arc<dyn ObjectStore>,
    /// Where loaded records are upserted
    pub record_store: Arc<dyn RecordStore>,
    /// Quarantine of the transform subscription
    pub transform_dead_letter: Arc<dyn DeadLetterTarget>,
    /// Quarantine of the load subscription
    pub load_dead_letter: Arc<dyn DeadLetterTarget>,
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators")
            .field("transform_dead_letter", &self.transform_dead_letter.name())
            .field("load_dead_letter", &self.load_dead_letter.name())
            .finish_non_exhaustive()
    }
}

/// Counters of one pipeline run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineSummary {
    /// Launcher and ingestion counters
    pub launcher: LauncherStats,
    /// Router counters
    pub router: RouterStats,
}

impl fmt::Display for PipelineSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let l = &self.launcher;
        let r = &self.router;
        writeln!(
            f,
            "objects: {} launched, {} ignored, {} duplicate, {} succeeded, {} failed",
            l.launched, l.ignored, l.duplicates, l.succeeded, l.failed
        )?;
        writeln!(
            f,
            "rows:    {} published, {} skipped",
            l.rows_published, l.rows_skipped
        )?;
        write!(
            f,
            "events:  {} published, {} delivered, {} retried, {} dead-lettered, {} lost, {} unrouted, {} abandoned",
            r.published,
            r.delivered,
            r.retried,
            r.dead_lettered,
            r.dead_letters_lost,
            r.unrouted,
            r.abandoned
        )
    }
}

/// A running pipeline.
///
/// # Example
///
/// ```no_run
/// use rowflow_pipeline::{Collaborators, MemoryRecordStore, Pipeline, PipelineConfig};
/// use rowflow_pipeline::stores::LocalObjectStore;
/// use rowflow_runtime::DeadLetterQueue;
/// use rowflow_workers::ObjectCreated;
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let pipeline = Pipeline::start(
///     PipelineConfig::default(),
///     Collaborators {
///         object_store: Arc::new(LocalObjectStore::open("./landing")?),
///         record_store: Arc::new(MemoryRecordStore::new()),
///         transform_dead_letter: Arc::new(DeadLetterQueue::new("transform-dlq")),
///         load_dead_letter: Arc::new(DeadLetterQueue::new("load-dlq")),
///     },
/// )?;
///
/// pipeline.notify(ObjectCreated::new("landing", "upload/data.csv"));
/// pipeline.wait_idle().await;
/// println!("{}", pipeline.summary());
/// pipeline.shutdown().await?;
/// # Ok(())
/// # }
/// ```
pub struct Pipeline {
    launcher: IngestionLauncher,
    router: RouterHandle,
    shutdown_timeout: Duration,
}

impl Pipeline {
    /// Register both subscriptions, start the router and build the launcher.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError`] if the configuration is invalid or a
    /// subscription cannot be registered.
    pub fn start(
        config: PipelineConfig,
        collaborators: Collaborators,
    ) -> Result<Self, PipelineError> {
        config.validate()?;

        let mut router = EventRouter::new(config.router.router_config());
        let publisher: Arc<dyn EventPublisher> = Arc::new(router.publisher());

        let transform = TransformWorker::new(config.transform.schema(), Arc::clone(&publisher));
        router.subscribe(subscription(
            TRANSFORM_SUBSCRIPTION,
            &config.stages.transform,
            Status::RowSent,
            EventPattern::exact(Source::Ingestion, DetailType::ExtractionProcess, Status::RowSent),
            Arc::new(transform),
            collaborators.transform_dead_letter,
        )?)?;

        let load = LoadWorker::new(collaborators.record_store);
        router.subscribe(subscription(
            LOAD_SUBSCRIPTION,
            &config.stages.load,
            Status::ItemTransformed,
            EventPattern::exact(
                Source::Transform,
                DetailType::TransformProcess,
                Status::ItemTransformed,
            ),
            Arc::new(load),
            collaborators.load_dead_letter,
        )?)?;

        let router = router.start();

        let worker = IngestionWorker::new(collaborators.object_store, publisher)
            .with_config(config.ingestion);
        let launcher = IngestionLauncher::new(config.launcher, worker)?;

        tracing::info!(
            subscriptions = ?router.subscriptions(),
            "Pipeline started"
        );

        Ok(Self {
            launcher,
            router,
            shutdown_timeout: config.router.shutdown_timeout(),
        })
    }

    /// Hand an object-creation notification to the launcher.
    pub fn notify(&self, notification: ObjectCreated) -> LaunchOutcome {
        self.launcher.notify(notification)
    }

    /// Wait until every launched object is ingested and every resulting
    /// event is retired by both subscriptions.
    pub async fn wait_idle(&self) {
        self.launcher.wait_idle().await;
        self.router.wait_idle().await;
    }

    /// Snapshot of launcher and router counters.
    #[must_use]
    pub fn summary(&self) -> PipelineSummary {
        PipelineSummary {
            launcher: self.launcher.stats(),
            router: self.router.stats(),
        }
    }

    /// Router and subscription health.
    #[must_use]
    pub fn health(&self) -> HealthReport {
        self.router.health()
    }

    /// Replay a dead-lettered event into `subscription` with a fresh attempt
    /// budget.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError`] if the subscription is unknown or the stored
    /// event cannot be decoded.
    pub fn redeliver(
        &self,
        subscription: &str,
        envelope: &DeadLetterEnvelope,
    ) -> Result<(), RouterError> {
        self.router.redeliver(subscription, envelope)
    }

    /// The launcher.
    #[must_use]
    pub const fn launcher(&self) -> &IngestionLauncher {
        &self.launcher
    }

    /// The running router.
    #[must_use]
    pub const fn router(&self) -> &RouterHandle {
        &self.router
    }

    /// Let running ingestions finish, then drain and stop the router.
    ///
    /// [`Pipeline::summary`] stays available afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Router`] if deliveries were still running when
    /// the configured shutdown timeout elapsed.
    pub async fn shutdown(&self) -> Result<(), PipelineError> {
        self.launcher.wait_idle().await;
        self.router.shutdown(self.shutdown_timeout).await?;
        tracing::info!("Pipeline stopped");
        Ok(())
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("launcher", &self.launcher)
            .field("subscriptions", &self.router.subscriptions())
            .finish_non_exhaustive()
    }
}

/// Build the subscription of stage `name`, whose worker only handles
/// `handled`.
///
/// A configured pattern that compiles but can route any other status is
/// rejected; one that does not compile is left for the router to reject.
fn subscription(
    name: &str,
    stage: &StageConfig,
    handled: Status,
    default_pattern: EventPattern,
    handler: Arc<dyn EventHandler>,
    dead_letter: Arc<dyn DeadLetterTarget>,
) -> Result<Subscription, ConfigError> {
    let pattern = match &stage.pattern {
        Some(pattern) => {
            if let Ok(compiled) = pattern.compile() {
                if !compiled.admits_only(handled) {
                    return Err(ConfigError::Validation(format!(
                        "stages.{name}.pattern ({compiled}) can route statuses other than {handled}"
                    )));
                }
            }
            pattern.clone()
        }
        None => default_pattern,
    };
    Ok(Subscription::builder(name, pattern, handler, dead_letter)
        .max_attempts(stage.max_attempts)
        .max_concurrency(stage.max_concurrency)
        .invocation_timeout(stage.invocation_timeout())
        .retry_policy(stage.retry_policy())
        .build())
}
