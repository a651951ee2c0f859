//! End-to-end runs of the assembled pipeline over in-memory collaborators.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use proptest::prelude::*;
use rowflow_core::handler::FailureKind;
use rowflow_core::pattern::EventPattern;
use rowflow_core::record_store::RecordStore;
use rowflow_pipeline::config::{ConfigError, SchemaChoice, StageConfig};
use rowflow_pipeline::{
    Collaborators, LOAD_SUBSCRIPTION, LocalObjectStore, Pipeline, PipelineConfig, PipelineError,
    TRANSFORM_SUBSCRIPTION,
};
use rowflow_runtime::{DeadLetterQueue, HealthStatus};
use rowflow_testing::{InMemoryObjectStore, InMemoryRecordStore};
use rowflow_workers::{LaunchOutcome, ObjectCreated};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const BUCKET: &str = "uploads";

struct Harness {
    pipeline: Pipeline,
    objects: InMemoryObjectStore,
    records: InMemoryRecordStore,
    transform_dlq: DeadLetterQueue,
    load_dlq: DeadLetterQueue,
}

impl Harness {
    fn start(config: PipelineConfig) -> Self {
        let objects = InMemoryObjectStore::new();
        let records = InMemoryRecordStore::new();
        let transform_dlq = DeadLetterQueue::new("transform-dlq");
        let load_dlq = DeadLetterQueue::new("load-dlq");

        let pipeline = Pipeline::start(
            config,
            Collaborators {
                object_store: Arc::new(objects.clone()),
                record_store: Arc::new(records.clone()),
                transform_dead_letter: Arc::new(transform_dlq.clone()),
                load_dead_letter: Arc::new(load_dlq.clone()),
            },
        )
        .expect("pipeline starts");

        Self {
            pipeline,
            objects,
            records,
            transform_dlq,
            load_dlq,
        }
    }

    fn upload(&self, key: &str, csv: &str) -> LaunchOutcome {
        self.objects.put(BUCKET, key, csv);
        self.pipeline.notify(ObjectCreated::new(BUCKET, key))
    }

    async fn settle(&self) {
        tokio::time::timeout(Duration::from_secs(5), self.pipeline.wait_idle())
            .await
            .expect("pipeline drains");
    }
}

fn fast_stage(max_attempts: u32) -> StageConfig {
    StageConfig {
        max_attempts,
        retry_initial_delay_ms: 1,
        retry_max_delay_ms: 5,
        ..StageConfig::default()
    }
}

fn fast_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.stages.transform = fast_stage(3);
    config.stages.load = fast_stage(3);
    config
}

#[tokio::test]
async fn test_accepted_upload_lands_every_row() {
    let harness = Harness::start(fast_config());

    let outcome = harness.upload("upload/data.csv", "id,val\n1,a\n2,b\n");
    harness.settle().await;

    assert_eq!(outcome, LaunchOutcome::Launched);
    assert_eq!(
        harness.records.get("1").await.unwrap().unwrap().to_item(),
        json!({"id": "1", "val": "a"})
    );
    assert_eq!(
        harness.records.get("2").await.unwrap().unwrap().to_item(),
        json!({"id": "2", "val": "b"})
    );
    assert_eq!(harness.records.len(), 2);

    let summary = harness.pipeline.summary();
    assert_eq!(summary.launcher.rows_published, 2);
    assert_eq!(summary.launcher.succeeded, 1);
    // two extraction events plus two transform events
    assert_eq!(summary.router.published, 4);
    assert_eq!(summary.router.delivered, 4);
    assert_eq!(summary.router.dead_lettered, 0);
    assert!(harness.pipeline.health().is_healthy());
}

#[tokio::test]
async fn test_malformed_row_is_dead_lettered_once() {
    let mut config = fast_config();
    config.stages.transform = fast_stage(2);
    let harness = Harness::start(config);

    harness.upload("upload/data.csv", "id,val\n1,a\n,b\n3,c\n");
    harness.settle().await;

    let ids: Vec<_> = harness.records.records().into_iter().map(|r| r.id).collect();
    assert_eq!(ids, vec!["1", "3"]);

    assert_eq!(harness.transform_dlq.len(), 1);
    assert!(harness.load_dlq.is_empty());
    let envelope = harness.transform_dlq.peek().unwrap();
    assert_eq!(envelope.subscription, TRANSFORM_SUBSCRIPTION);
    assert_eq!(envelope.attempt_count, 2);
    assert_eq!(envelope.failure_kind, FailureKind::Permanent);
    assert_eq!(envelope.event().unwrap().detail().payload()["val"], json!("b"));

    let summary = harness.pipeline.summary();
    assert_eq!(summary.router.dead_lettered, 1);
    assert_eq!(summary.router.retried, 1);

    let health = harness.pipeline.health();
    assert_eq!(health.status, HealthStatus::Degraded);
    assert_eq!(
        health.check("subscription:transform").unwrap().status,
        HealthStatus::Degraded
    );
    assert_eq!(
        health.check("subscription:load").unwrap().status,
        HealthStatus::Healthy
    );
}

#[tokio::test]
async fn test_key_outside_prefix_does_nothing() {
    let harness = Harness::start(fast_config());

    let outcome = harness.upload("archive/data.csv", "id,val\n1,a\n");
    harness.settle().await;

    assert_eq!(outcome, LaunchOutcome::Ignored);
    assert_eq!(harness.objects.reads(), 0);
    assert_eq!(harness.pipeline.summary().router.published, 0);
    assert!(harness.records.is_empty());
}

#[tokio::test]
async fn test_repeated_notification_converges() {
    let harness = Harness::start(fast_config());

    harness.upload("upload/data.csv", "id,val\n1,a\n2,b\n");
    harness.settle().await;
    let first = harness.records.records();

    assert_eq!(
        harness.pipeline.notify(ObjectCreated::new(BUCKET, "upload/data.csv")),
        LaunchOutcome::Launched
    );
    harness.settle().await;

    assert_eq!(harness.records.records(), first);
    assert_eq!(harness.pipeline.summary().launcher.launched, 2);
}

#[tokio::test]
async fn test_versioned_duplicate_is_dropped() {
    let harness = Harness::start(fast_config());
    harness.objects.put(BUCKET, "upload/data.csv", "id,val\n1,a\n");
    let notification = ObjectCreated::new(BUCKET, "upload/data.csv").with_version("v1");

    assert_eq!(
        harness.pipeline.notify(notification.clone()),
        LaunchOutcome::Launched
    );
    assert_eq!(harness.pipeline.notify(notification), LaunchOutcome::Duplicate);
    harness.settle().await;

    assert_eq!(harness.objects.reads(), 1);
    assert_eq!(harness.records.len(), 1);
}

#[tokio::test]
async fn test_load_dead_letter_can_be_replayed() {
    let mut config = fast_config();
    config.stages.load = fast_stage(2);
    let harness = Harness::start(config);
    harness.records.fail_next(2);

    harness.upload("upload/data.csv", "id,val\n1,a\n");
    harness.settle().await;

    assert!(harness.records.is_empty());
    assert!(harness.transform_dlq.is_empty());
    let envelopes = harness.load_dlq.drain();
    assert_eq!(envelopes.len(), 1);
    assert_eq!(envelopes[0].failure_kind, FailureKind::Transient);

    harness
        .pipeline
        .redeliver(LOAD_SUBSCRIPTION, &envelopes[0])
        .unwrap();
    harness.settle().await;

    assert_eq!(
        harness.records.get("1").await.unwrap().unwrap().to_item(),
        json!({"id": "1", "val": "a"})
    );
}

#[tokio::test]
async fn test_real_estate_schema_end_to_end() {
    let mut config = fast_config();
    config.transform.schema = SchemaChoice::RealEstate;
    let harness = Harness::start(config);

    harness.upload(
        "upload/sales.csv",
        "street,city,zip,state,beds,baths,sq__ft,type,sale_date,price,latitude,longitude\n\
         3526 HIGH ST,SACRAMENTO,95838,CA,2,1,836,Residential,Wed May 21 00:00:00 EDT 2008,59222,38.631913,-121.434879\n",
    );
    harness.settle().await;

    let records = harness.records.records();
    assert_eq!(records.len(), 1);
    let item = records[0].to_item();
    assert_eq!(item["price_per_sq_ft"], json!(71));
    assert_eq!(item["sale_date"], json!("2008-05-21"));
    assert_eq!(item["city"], json!("SACRAMENTO"));
}

#[tokio::test]
async fn test_stage_pattern_from_config() {
    let mut config = fast_config();
    config.stages.load.pattern = Some(
        EventPattern::default()
            .with_source("ingestion")
            .with_source("transform")
            .with_status("item_transformed"),
    );
    let harness = Harness::start(config);

    harness.upload("upload/data.csv", "id,val\n1,a\n");
    harness.settle().await;

    assert_eq!(harness.records.len(), 1);
    let stats = harness.pipeline.summary().router;
    assert_eq!(stats.dead_lettered, 0);
    assert_eq!(stats.unrouted, 0);
}

#[tokio::test]
async fn test_stage_pattern_routing_foreign_status_is_rejected() {
    for (stage, pattern) in [
        ("load", EventPattern::default().with_source("ingestion")),
        ("transform", EventPattern::default().with_detail_type("transform-process")),
        ("transform", EventPattern::default().with_source("ingestion")),
    ] {
        let mut config = fast_config();
        match stage {
            "load" => config.stages.load.pattern = Some(pattern),
            _ => config.stages.transform.pattern = Some(pattern),
        }

        let result = Pipeline::start(
            config,
            Collaborators {
                object_store: Arc::new(InMemoryObjectStore::new()),
                record_store: Arc::new(InMemoryRecordStore::new()),
                transform_dead_letter: Arc::new(DeadLetterQueue::new("transform-dlq")),
                load_dead_letter: Arc::new(DeadLetterQueue::new("load-dlq")),
            },
        );
        match result {
            Err(PipelineError::Config(ConfigError::Validation(message))) => {
                assert!(message.contains(&format!("stages.{stage}.pattern")), "{message}");
            }
            other => panic!("expected a validation error for {stage}, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_unknown_pattern_value_fails_startup() {
    let mut config = fast_config();
    config.stages.load.pattern = Some(EventPattern::default().with_status("never_emitted"));

    let result = Pipeline::start(
        config,
        Collaborators {
            object_store: Arc::new(InMemoryObjectStore::new()),
            record_store: Arc::new(InMemoryRecordStore::new()),
            transform_dead_letter: Arc::new(DeadLetterQueue::new("transform-dlq")),
            load_dead_letter: Arc::new(DeadLetterQueue::new("load-dlq")),
        },
    );
    assert!(matches!(result, Err(PipelineError::Router(_))));
}

#[tokio::test]
async fn test_local_directory_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("upload")).unwrap();
    std::fs::create_dir_all(dir.path().join("archive")).unwrap();
    std::fs::write(dir.path().join("upload/data.csv"), "id,val\n1,a\n2,b\n").unwrap();
    std::fs::write(dir.path().join("archive/old.csv"), "id,val\n9,z\n").unwrap();

    let objects = LocalObjectStore::new("landing", dir.path());
    let records = InMemoryRecordStore::new();
    let keys = objects.keys().await.unwrap();
    let pipeline = Pipeline::start(
        fast_config(),
        Collaborators {
            object_store: Arc::new(objects),
            record_store: Arc::new(records.clone()),
            transform_dead_letter: Arc::new(DeadLetterQueue::new("transform-dlq")),
            load_dead_letter: Arc::new(DeadLetterQueue::new("load-dlq")),
        },
    )
    .unwrap();

    let outcomes: Vec<_> = keys
        .iter()
        .map(|key| pipeline.notify(ObjectCreated::new("landing", key.as_str())))
        .collect();
    pipeline.wait_idle().await;

    assert_eq!(outcomes, vec![LaunchOutcome::Ignored, LaunchOutcome::Launched]);
    let ids: Vec<_> = records.records().into_iter().map(|r| r.id).collect();
    assert_eq!(ids, vec!["1", "2"]);
    pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let mut config = PipelineConfig::default();
    config.stages.transform.max_concurrency = 0;

    let result = Pipeline::start(
        config,
        Collaborators {
            object_store: Arc::new(InMemoryObjectStore::new()),
            record_store: Arc::new(InMemoryRecordStore::new()),
            transform_dead_letter: Arc::new(DeadLetterQueue::new("transform-dlq")),
            load_dead_letter: Arc::new(DeadLetterQueue::new("load-dlq")),
        },
    );
    assert!(result.is_err());
}

fn csv_for(rows: &[(u8, String)]) -> String {
    let mut csv = String::from("id,val\n");
    for (id, val) in rows {
        csv.push_str(&format!("{id},{val}\n"));
    }
    csv
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Any number of deliveries of an upload leaves exactly one record per
    /// distinct id, holding the value of one of that id's rows.
    #[test]
    fn prop_reingestion_is_idempotent(
        rows in prop::collection::vec((0u8..8, "[a-z]{1,6}"), 1..12),
        deliveries in 1usize..4,
    ) {
        tokio_test::block_on(async {
            let harness = Harness::start(fast_config());
            harness.objects.put(BUCKET, "upload/data.csv", csv_for(&rows));

            for _ in 0..deliveries {
                harness.pipeline.notify(ObjectCreated::new(BUCKET, "upload/data.csv"));
                harness.settle().await;
            }

            let mut distinct: Vec<u8> = rows.iter().map(|(id, _)| *id).collect();
            distinct.sort_unstable();
            distinct.dedup();
            prop_assert_eq!(harness.records.len(), distinct.len());

            for id in distinct {
                let stored = harness.records.get(&id.to_string()).await.unwrap().unwrap();
                // rows sharing an id race; any of their values is a valid end state
                let candidates: Vec<_> = rows
                    .iter()
                    .filter(|(row_id, _)| *row_id == id)
                    .map(|(_, val)| json!(val))
                    .collect();
                prop_assert!(candidates.contains(&stored.attributes["val"]));
            }
            Ok(())
        })?;
    }
}
