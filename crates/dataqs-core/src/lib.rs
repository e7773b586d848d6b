//! dataqs pipeline core
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Building blocks shared by every feed job:
//!
//! - [`fetch`]: time-bucketed downloads with a fallback search
//! - [`staging`]: per-run scratch directory
//! - [`normalize`]: typed records validated against a schema
//! - [`upsert`]: idempotent conditional inserts
//! - [`publish`]: full-refresh replacement through slot moves
//! - [`retention`]: age/count eviction for records and rasters
//! - [`notify`]: served-layer registration and cache invalidation
//! - [`store`]: Postgres and on-disk document backends
//! - [`pipeline`]: run orchestration
//!
//! A run is `fetch -> normalize -> upsert|publish -> evict -> notify`, with
//! staging cleanup on every exit path.

pub mod config;
pub mod error;
pub mod fetch;
pub mod normalize;
pub mod notify;
pub mod pipeline;
pub mod publish;
pub mod raster;
pub mod retention;
pub mod staging;
pub mod store;
pub mod upsert;

pub use config::{AppConfig, JobConfig};
pub use error::{PipelineError, Result};
pub use pipeline::{Job, Pipeline, RunContext, RunStats};
