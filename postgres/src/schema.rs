//! Schema creation.

use crate::PostgresError;
use sqlx::PgPool;

const STATEMENTS: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS records (
        id TEXT PRIMARY KEY,
        attributes JSONB NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS dead_letters (
        id BIGSERIAL PRIMARY KEY,
        subscription TEXT NOT NULL,
        event_id UUID NOT NULL,
        correlation_id TEXT NOT NULL,
        original_event BYTEA NOT NULL,
        attempt_count INTEGER NOT NULL,
        failure_kind TEXT NOT NULL,
        last_error TEXT NOT NULL,
        dead_lettered_at TIMESTAMPTZ NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        resolved_at TIMESTAMPTZ,
        resolved_by TEXT,
        resolution_notes TEXT
    )
    ",
    "CREATE INDEX IF NOT EXISTS idx_dead_letters_pending ON dead_letters(subscription, status, dead_lettered_at)",
];

/// Create the `records` and `dead_letters` tables if they do not exist.
///
/// Safe to run on every startup.
///
/// # Errors
///
/// Returns [`PostgresError::Database`] if a statement fails.
pub async fn migrate(pool: &PgPool) -> Result<(), PostgresError> {
    let mut conn = pool.acquire().await?;
    for statement in STATEMENTS {
        sqlx::query(statement).execute(&mut *conn).await?;
    }
    tracing::info!("Database schema is up to date");
    Ok(())
}
