//! Durable dead-letter queue.
//!
//! Stores envelopes of deliveries that exhausted their attempts, one logical
//! queue per subscription, with an inspection and resolution workflow for
//! operators. Entries are never re-queued automatically; replay goes through
//! [`DeadLetter::envelope`] and the router's manual redelivery.

use crate::PostgresError;
use chrono::{DateTime, Utc};
use rowflow_core::BoxFuture;
use rowflow_core::dead_letter::{DeadLetterEnvelope, DeadLetterError, DeadLetterTarget};
use rowflow_core::event::CorrelationId;
use rowflow_core::handler::FailureKind;
use sqlx::{PgPool, Row};
use uuid::Uuid;

const COLUMNS: &str = r"
    id, subscription, event_id, correlation_id, original_event, attempt_count,
    failure_kind, last_error, dead_lettered_at, status, updated_at,
    resolved_at, resolved_by, resolution_notes
";

/// Status of an entry in the dead-letter queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DLQStatus {
    /// Awaiting investigation or replay
    Pending,
    /// Being replayed or investigated
    Processing,
    /// Replayed successfully or otherwise fixed
    Resolved,
    /// Given up on
    Discarded,
}

impl DLQStatus {
    /// Database representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Resolved => "resolved",
            Self::Discarded => "discarded",
        }
    }

    /// Parse the database representation.
    ///
    /// # Errors
    ///
    /// Returns [`PostgresError::InvalidValue`] for an unknown status.
    pub fn parse(s: &str) -> Result<Self, PostgresError> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "resolved" => Ok(Self::Resolved),
            "discarded" => Ok(Self::Discarded),
            _ => Err(PostgresError::InvalidValue(format!("DLQ status '{s}'"))),
        }
    }
}

/// A stored dead letter plus its resolution state.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    /// Queue entry id
    pub id: i64,
    /// Subscription whose attempts were exhausted
    pub subscription: String,
    /// Id of the original event
    pub event_id: Uuid,
    /// Correlation id of the original event
    pub correlation_id: String,
    /// Original event wire bytes
    pub original_event: Vec<u8>,
    /// Failed attempts before quarantine
    pub attempt_count: u32,
    /// Kind of the final failure
    pub failure_kind: FailureKind,
    /// Message of the final failure
    pub last_error: String,
    /// When the delivery was dead-lettered
    pub dead_lettered_at: DateTime<Utc>,
    /// Current status
    pub status: DLQStatus,
    /// Last status change
    pub updated_at: DateTime<Utc>,
    /// When the entry was resolved or discarded
    pub resolved_at: Option<DateTime<Utc>>,
    /// Who resolved it
    pub resolved_by: Option<String>,
    /// Resolution or discard notes
    pub resolution_notes: Option<String>,
}

impl DeadLetter {
    /// Rebuild the envelope, e.g. for manual redelivery.
    #[must_use]
    pub fn envelope(&self) -> DeadLetterEnvelope {
        DeadLetterEnvelope {
            subscription: self.subscription.clone(),
            event_id: self.event_id,
            correlation_id: CorrelationId::new(self.correlation_id.clone()),
            original_event: self.original_event.clone(),
            attempt_count: self.attempt_count,
            failure_kind: self.failure_kind,
            last_error: self.last_error.clone(),
            dead_lettered_at: self.dead_lettered_at,
        }
    }

    fn from_row(row: &sqlx::postgres::PgRow) -> Result<Self, PostgresError> {
        let status: String = row.try_get("status")?;
        let failure_kind: String = row.try_get("failure_kind")?;
        let attempt_count: i32 = row.try_get("attempt_count")?;

        Ok(Self {
            id: row.try_get("id")?,
            subscription: row.try_get("subscription")?,
            event_id: row.try_get("event_id")?,
            correlation_id: row.try_get("correlation_id")?,
            original_event: row.try_get("original_event")?,
            attempt_count: u32::try_from(attempt_count).map_err(|_| {
                PostgresError::InvalidValue(format!("attempt count {attempt_count}"))
            })?,
            failure_kind: FailureKind::parse(&failure_kind).ok_or_else(|| {
                PostgresError::InvalidValue(format!("failure kind '{failure_kind}'"))
            })?,
            last_error: row.try_get("last_error")?,
            dead_lettered_at: row.try_get("dead_lettered_at")?,
            status: DLQStatus::parse(&status)?,
            updated_at: row.try_get("updated_at")?,
            resolved_at: row.try_get("resolved_at")?,
            resolved_by: row.try_get("resolved_by")?,
            resolution_notes: row.try_get("resolution_notes")?,
        })
    }
}

/// `PostgreSQL`-based dead-letter queue shared by all subscriptions.
///
/// # Example
///
/// ```no_run
/// use rowflow_postgres::{DLQStatus, PostgresDeadLetterQueue};
///
/// # async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
/// let dlq = PostgresDeadLetterQueue::new(pool);
///
/// let pending = dlq.list_pending(Some("transform"), 100).await?;
/// println!("Pending transform failures: {}", pending.len());
///
/// dlq.update_status(pending[0].id, DLQStatus::Processing).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct PostgresDeadLetterQueue {
    pool: PgPool,
}

impl PostgresDeadLetterQueue {
    /// Create a queue over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Dead-letter target writing only `subscription`'s envelopes.
    #[must_use]
    pub fn target(&self, subscription: impl Into<String>) -> PostgresDeadLetterTarget {
        let subscription = subscription.into();
        PostgresDeadLetterTarget {
            name: format!("postgres:{subscription}-dlq"),
            subscription,
            queue: self.clone(),
        }
    }

    /// Store an envelope and return its entry id.
    ///
    /// # Errors
    ///
    /// Returns [`PostgresError::Database`] if the insert fails.
    pub async fn add(&self, envelope: &DeadLetterEnvelope) -> Result<i64, PostgresError> {
        let (id,): (i64,) = sqlx::query_as(
            r"
            INSERT INTO dead_letters (
                subscription, event_id, correlation_id, original_event,
                attempt_count, failure_kind, last_error, dead_lettered_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id
            ",
        )
        .bind(&envelope.subscription)
        .bind(envelope.event_id)
        .bind(envelope.correlation_id.as_str())
        .bind(&envelope.original_event)
        .bind(i32::try_from(envelope.attempt_count).unwrap_or(i32::MAX))
        .bind(envelope.failure_kind.as_str())
        .bind(&envelope.last_error)
        .bind(envelope.dead_lettered_at)
        .fetch_one(&self.pool)
        .await?;

        tracing::warn!(
            dlq_id = id,
            subscription = %envelope.subscription,
            event_id = %envelope.event_id,
            correlation_id = %envelope.correlation_id,
            attempt_count = envelope.attempt_count,
            error = %envelope.last_error,
            "Event added to dead-letter queue"
        );
        metrics::counter!("postgres_dead_letters_added_total", "subscription" => envelope.subscription.clone())
            .increment(1);

        Ok(id)
    }

    /// Pending entries, oldest first, optionally for one subscription.
    ///
    /// # Errors
    ///
    /// Returns [`PostgresError`] if the query fails or a row is invalid.
    pub async fn list_pending(
        &self,
        subscription: Option<&str>,
        limit: usize,
    ) -> Result<Vec<DeadLetter>, PostgresError> {
        self.list_by_status(DLQStatus::Pending, subscription, limit)
            .await
    }

    /// Entries with `status`, oldest first, optionally for one subscription.
    ///
    /// # Errors
    ///
    /// Returns [`PostgresError`] if the query fails or a row is invalid.
    pub async fn list_by_status(
        &self,
        status: DLQStatus,
        subscription: Option<&str>,
        limit: usize,
    ) -> Result<Vec<DeadLetter>, PostgresError> {
        let rows = sqlx::query(&format!(
            r"
            SELECT {COLUMNS}
            FROM dead_letters
            WHERE status = $1 AND ($2::TEXT IS NULL OR subscription = $2)
            ORDER BY dead_lettered_at ASC, id ASC
            LIMIT $3
            "
        ))
        .bind(status.as_str())
        .bind(subscription)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(DeadLetter::from_row).collect()
    }

    /// One entry by id.
    ///
    /// # Errors
    ///
    /// Returns [`PostgresError::NotFound`] if no such entry exists.
    pub async fn get_by_id(&self, id: i64) -> Result<DeadLetter, PostgresError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM dead_letters WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(PostgresError::NotFound(id))?;

        DeadLetter::from_row(&row)
    }

    /// Change an entry's status.
    ///
    /// # Errors
    ///
    /// Returns [`PostgresError::NotFound`] if no such entry exists.
    pub async fn update_status(&self, id: i64, status: DLQStatus) -> Result<(), PostgresError> {
        let result = sqlx::query(
            r"
            UPDATE dead_letters
            SET status = $1, updated_at = now()
            WHERE id = $2
            ",
        )
        .bind(status.as_str())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Self::ensure_updated(id, result.rows_affected())?;

        tracing::info!(dlq_id = id, status = status.as_str(), "Dead letter status updated");
        Ok(())
    }

    /// Mark an entry resolved.
    ///
    /// # Errors
    ///
    /// Returns [`PostgresError::NotFound`] if no such entry exists.
    pub async fn mark_resolved(
        &self,
        id: i64,
        resolved_by: &str,
        notes: Option<&str>,
    ) -> Result<(), PostgresError> {
        let result = sqlx::query(
            r"
            UPDATE dead_letters
            SET status = 'resolved',
                updated_at = now(),
                resolved_at = now(),
                resolved_by = $1,
                resolution_notes = $2
            WHERE id = $3
            ",
        )
        .bind(resolved_by)
        .bind(notes)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Self::ensure_updated(id, result.rows_affected())?;

        tracing::info!(dlq_id = id, resolved_by, "Dead letter resolved");
        metrics::counter!("postgres_dead_letters_resolved_total").increment(1);
        Ok(())
    }

    /// Mark an entry discarded.
    ///
    /// # Errors
    ///
    /// Returns [`PostgresError::NotFound`] if no such entry exists.
    pub async fn mark_discarded(&self, id: i64, reason: &str) -> Result<(), PostgresError> {
        let result = sqlx::query(
            r"
            UPDATE dead_letters
            SET status = 'discarded',
                updated_at = now(),
                resolved_at = now(),
                resolution_notes = $1
            WHERE id = $2
            ",
        )
        .bind(reason)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Self::ensure_updated(id, result.rows_affected())?;

        tracing::warn!(dlq_id = id, reason, "Dead letter discarded");
        metrics::counter!("postgres_dead_letters_discarded_total").increment(1);
        Ok(())
    }

    /// Number of pending entries, optionally for one subscription.
    ///
    /// # Errors
    ///
    /// Returns [`PostgresError::Database`] if the query fails.
    pub async fn count_pending(&self, subscription: Option<&str>) -> Result<i64, PostgresError> {
        let (count,): (i64,) = sqlx::query_as(
            r"
            SELECT COUNT(*)
            FROM dead_letters
            WHERE status = 'pending' AND ($1::TEXT IS NULL OR subscription = $1)
            ",
        )
        .bind(subscription)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    const fn ensure_updated(id: i64, rows: u64) -> Result<(), PostgresError> {
        if rows == 0 {
            return Err(PostgresError::NotFound(id));
        }
        Ok(())
    }
}

/// One subscription's view of a [`PostgresDeadLetterQueue`].
#[derive(Debug, Clone)]
pub struct PostgresDeadLetterTarget {
    name: String,
    subscription: String,
    queue: PostgresDeadLetterQueue,
}

impl PostgresDeadLetterTarget {
    /// Subscription this target quarantines for.
    #[must_use]
    pub fn subscription(&self) -> &str {
        &self.subscription
    }
}

impl DeadLetterTarget for PostgresDeadLetterTarget {
    fn name(&self) -> &str {
        &self.name
    }

    fn send<'a>(
        &'a self,
        envelope: &'a DeadLetterEnvelope,
    ) -> BoxFuture<'a, Result<(), DeadLetterError>> {
        Box::pin(async move {
            if envelope.subscription != self.subscription {
                return Err(DeadLetterError::Rejected(format!(
                    "target for '{}' received an envelope of '{}'",
                    self.subscription, envelope.subscription
                )));
            }
            self.queue
                .add(envelope)
                .await
                .map(|_| ())
                .map_err(|e| DeadLetterError::Unavailable(e.to_string()))
        })
    }
}
