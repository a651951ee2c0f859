//! `rowflow`: run the pipeline over a local directory.
//!
//! ```text
//! rowflow ingest ./landing               # every file under ./landing/upload/
//! rowflow dead-letters --subscription load
//! ```
//!
//! Records and dead letters go to Postgres when `DATABASE_URL` is set and stay
//! in memory otherwise. `RUST_LOG` controls logging (default `rowflow=info`).

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use rowflow_core::dead_letter::DeadLetterTarget;
use rowflow_core::record_store::RecordStore;
use rowflow_pipeline::config::DatabaseConfig;
use rowflow_pipeline::{
    Collaborators, LOAD_SUBSCRIPTION, LocalObjectStore, MemoryRecordStore, Pipeline,
    PipelineConfig, TRANSFORM_SUBSCRIPTION,
};
use rowflow_postgres::{PostgresDeadLetterQueue, PostgresRecordStore};
use rowflow_runtime::metrics::MetricsServer;
use rowflow_runtime::{DeadLetterQueue, HealthStatus};
use rowflow_workers::ObjectCreated;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "rowflow", version, about, long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(long, env = "ROWFLOW_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Notify the launcher of every file under DIR and wait for the pipeline to drain
    Ingest {
        /// Directory served as the bucket
        dir: PathBuf,
    },
    /// List pending dead letters stored in Postgres
    DeadLetters {
        /// Only this subscription's queue
        #[arg(long)]
        subscription: Option<String>,
        /// Maximum entries to print
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    let config = PipelineConfig::load(cli.config.as_deref()).context("loading configuration")?;

    let mut metrics = config.metrics.listen_addr.map(MetricsServer::new);
    if let Some(server) = metrics.as_mut() {
        server.start().context("starting metrics exporter")?;
    }

    match cli.command {
        Commands::Ingest { dir } => ingest(config, dir).await,
        Commands::DeadLetters {
            subscription,
            limit,
        } => dead_letters(&config, subscription.as_deref(), limit).await,
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rowflow=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn connect(database: &DatabaseConfig) -> anyhow::Result<Option<PgPool>> {
    let Some(url) = database.url.as_deref() else {
        return Ok(None);
    };
    let pool = PgPoolOptions::new()
        .max_connections(database.max_connections)
        .acquire_timeout(database.connect_timeout())
        .connect(url)
        .await
        .context("connecting to Postgres")?;
    rowflow_postgres::migrate(&pool)
        .await
        .context("migrating Postgres schema")?;
    tracing::info!("Postgres connected");
    Ok(Some(pool))
}

async fn ingest(config: PipelineConfig, dir: PathBuf) -> anyhow::Result<()> {
    let objects = LocalObjectStore::open(&dir)
        .with_context(|| format!("opening {}", dir.display()))?;
    let bucket = objects.bucket().to_string();
    let keys = objects.keys().await.context("listing objects")?;

    let [transform_queue, load_queue] = [
        DeadLetterQueue::new("transform-dlq"),
        DeadLetterQueue::new("load-dlq"),
    ];
    let (record_store, transform_dead_letter, load_dead_letter): (
        Arc<dyn RecordStore>,
        Arc<dyn DeadLetterTarget>,
        Arc<dyn DeadLetterTarget>,
    ) = match connect(&config.database).await? {
        Some(pool) => {
            let dlq = PostgresDeadLetterQueue::new(pool.clone());
            (
                Arc::new(PostgresRecordStore::new(pool)),
                Arc::new(dlq.target(TRANSFORM_SUBSCRIPTION)),
                Arc::new(dlq.target(LOAD_SUBSCRIPTION)),
            )
        }
        None => {
            tracing::warn!("DATABASE_URL is not set; records and dead letters are kept in memory");
            (
                Arc::new(MemoryRecordStore::new()),
                Arc::new(transform_queue.clone()),
                Arc::new(load_queue.clone()),
            )
        }
    };

    let pipeline = Pipeline::start(
        config,
        Collaborators {
            object_store: Arc::new(objects),
            record_store,
            transform_dead_letter,
            load_dead_letter,
        },
    )?;

    for key in keys {
        let outcome = pipeline.notify(ObjectCreated::new(bucket.as_str(), key.as_str()));
        tracing::debug!(key = %key, outcome = outcome.as_str(), "Notified launcher");
    }
    pipeline.wait_idle().await;
    let stopped = pipeline.shutdown().await;

    println!("{}", pipeline.summary());
    for check in &pipeline.health().checks {
        if check.status != HealthStatus::Healthy {
            println!(
                "{}: {} ({})",
                check.component,
                check.status,
                check.message.as_deref().unwrap_or("no details")
            );
        }
    }
    for envelope in [&transform_queue, &load_queue]
        .into_iter()
        .flat_map(DeadLetterQueue::entries)
    {
        println!(
            "dead letter [{}] {} after {} attempts: {}",
            envelope.subscription,
            envelope.correlation_id,
            envelope.attempt_count,
            envelope.last_error
        );
    }

    stopped?;
    Ok(())
}

async fn dead_letters(
    config: &PipelineConfig,
    subscription: Option<&str>,
    limit: usize,
) -> anyhow::Result<()> {
    let Some(pool) = connect(&config.database).await? else {
        bail!("DATABASE_URL is not set; dead letters only outlive a run when stored in Postgres");
    };
    let dlq = PostgresDeadLetterQueue::new(pool);

    let pending = dlq.list_pending(subscription, limit).await?;
    let total = dlq.count_pending(subscription).await?;
    for entry in &pending {
        println!(
            "#{} [{}] {} event={} attempts={} kind={} at={}: {}",
            entry.id,
            entry.subscription,
            entry.correlation_id,
            entry.event_id,
            entry.attempt_count,
            entry.failure_kind,
            entry.dead_lettered_at.to_rfc3339(),
            entry.last_error
        );
    }
    println!("{} of {total} pending dead letters shown", pending.len());
    Ok(())
}
