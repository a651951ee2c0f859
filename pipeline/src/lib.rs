//! # Rowflow Pipeline
//!
//! Assembles the rowflow stages into a running pipeline.
//!
//! - [`config`]: layered [`PipelineConfig`] (defaults, TOML file, environment)
//! - [`pipeline`]: [`Pipeline::start`] wires the launcher, the router and the
//!   `transform` and `load` subscriptions over a set of [`Collaborators`]
//! - [`stores`]: a directory-backed object store and an in-memory record
//!   store for running without external services
//!
//! The `rowflow` binary in this crate drives a pipeline over a local
//! directory.

pub mod config;
pub mod pipeline;
pub mod stores;

pub use config::{ConfigError, PipelineConfig};
pub use pipeline::{
    Collaborators, LOAD_SUBSCRIPTION, Pipeline, PipelineError, PipelineSummary,
    TRANSFORM_SUBSCRIPTION,
};
pub use stores::{LocalObjectStore, MemoryRecordStore};
