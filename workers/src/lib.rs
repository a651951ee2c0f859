//! # Rowflow Workers
//!
//! The three pipeline stages and the launcher that feeds the first one.
//!
//! - [`IngestionLauncher`]: accepts object-creation notifications under a key
//!   prefix and runs one ingestion invocation per object under a ceiling
//! - [`IngestionWorker`]: reads one CSV object and publishes one extraction
//!   event per row
//! - [`TransformWorker`]: normalizes each row and publishes one transform event
//! - [`LoadWorker`]: upserts each transformed item by its domain id
//!
//! Stages never call each other. The transform and load workers are
//! [`EventHandler`](rowflow_core::handler::EventHandler)s registered with the
//! router; the ingestion worker only publishes.

pub mod ingestion;
pub mod launcher;
pub mod load;
pub mod transform;

pub use ingestion::{IngestionConfig, IngestionError, IngestionSummary, IngestionWorker};
pub use launcher::{
    IngestionLauncher, LaunchOutcome, LauncherConfig, LauncherError, LauncherStats, ObjectCreated,
};
pub use load::LoadWorker;
pub use transform::{
    Derived, FieldKind, FieldSpec, IdSource, NormalizationSchema, TransformError, TransformWorker,
};
