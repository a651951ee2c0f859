//! Durable single-key record store.

use rowflow_core::BoxFuture;
use rowflow_core::record::{Record, UpsertOutcome};
use rowflow_core::record_store::{RecordStore, RecordStoreError};
use serde_json::Value;
use sqlx::PgPool;

/// `PostgreSQL`-backed [`RecordStore`].
///
/// Every upsert is one statement: identical attributes leave the row (and its
/// `updated_at`) untouched, different attributes replace it entirely.
///
/// # Example
///
/// ```no_run
/// use rowflow_core::record::{Record, UpsertOutcome};
/// use rowflow_core::record_store::RecordStore;
/// use rowflow_postgres::PostgresRecordStore;
///
/// # async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
/// let store = PostgresRecordStore::new(pool);
/// let record = Record::from_item(&serde_json::json!({"id": "1", "val": "a"}))?;
///
/// assert_eq!(store.upsert(&record).await?, UpsertOutcome::Created);
/// assert_eq!(store.upsert(&record).await?, UpsertOutcome::Unchanged);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct PostgresRecordStore {
    pool: PgPool,
}

impl PostgresRecordStore {
    /// Create a store over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn upsert_record(&self, record: &Record) -> Result<UpsertOutcome, RecordStoreError> {
        // xmax is 0 only for a freshly inserted tuple.
        let inserted: Option<(bool,)> = sqlx::query_as(
            r"
            INSERT INTO records (id, attributes, updated_at)
            VALUES ($1, $2, now())
            ON CONFLICT (id) DO UPDATE
                SET attributes = EXCLUDED.attributes,
                    updated_at = now()
                WHERE records.attributes IS DISTINCT FROM EXCLUDED.attributes
            RETURNING (xmax = 0)
            ",
        )
        .bind(&record.id)
        .bind(Value::Object(record.attributes.clone()))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| RecordStoreError::Unavailable(e.to_string()))?;

        Ok(match inserted {
            Some((true,)) => UpsertOutcome::Created,
            Some((false,)) => UpsertOutcome::Replaced,
            None => UpsertOutcome::Unchanged,
        })
    }

    async fn get_record(&self, id: &str) -> Result<Option<Record>, RecordStoreError> {
        let row: Option<(Value,)> = sqlx::query_as("SELECT attributes FROM records WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| RecordStoreError::Unavailable(e.to_string()))?;

        row.map(|(attributes,)| match attributes {
            Value::Object(attributes) => Ok(Record::new(id, attributes)),
            other => Err(RecordStoreError::Serialization(format!(
                "record '{id}' holds non-object attributes: {other}"
            ))),
        })
        .transpose()
    }
}

impl RecordStore for PostgresRecordStore {
    fn upsert<'a>(
        &'a self,
        record: &'a Record,
    ) -> BoxFuture<'a, Result<UpsertOutcome, RecordStoreError>> {
        Box::pin(self.upsert_record(record))
    }

    fn get<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Option<Record>, RecordStoreError>> {
        Box::pin(self.get_record(id))
    }
}
