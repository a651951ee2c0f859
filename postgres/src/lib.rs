//! `PostgreSQL` adapters for the rowflow ETL pipeline.
//!
//! - [`PostgresRecordStore`]: the durable key-value store behind the load
//!   stage; one single-statement upsert per record
//! - [`PostgresDeadLetterQueue`]: durable quarantine with inspection and
//!   resolution workflow, one logical target per subscription
//! - [`migrate`]: idempotent schema creation for both tables
//!
//! # Example
//!
//! ```ignore
//! use rowflow_postgres::{PostgresDeadLetterQueue, PostgresRecordStore, migrate};
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let pool = sqlx::PgPool::connect("postgres://localhost/rowflow").await?;
//!     migrate(&pool).await?;
//!
//!     let records = PostgresRecordStore::new(pool.clone());
//!     let dlq = PostgresDeadLetterQueue::new(pool);
//!     let transform_dlq = dlq.target("transform");
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod dead_letter_queue;
pub mod record_store;
mod schema;

pub use dead_letter_queue::{DLQStatus, DeadLetter, PostgresDeadLetterQueue, PostgresDeadLetterTarget};
pub use record_store::PostgresRecordStore;
pub use schema::migrate;

use thiserror::Error;

/// Errors returned by the `PostgreSQL` adapters.
#[derive(Error, Debug)]
pub enum PostgresError {
    /// The database rejected the query or could not be reached
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// No dead letter with this id exists
    #[error("Dead letter {0} not found")]
    NotFound(i64),

    /// A stored column holds a value the adapter does not recognize
    #[error("Invalid stored value: {0}")]
    InvalidValue(String),
}
