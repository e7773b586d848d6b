//! dataqs Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, logging and error handling for the dataqs workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`DataqsError`] and the crate-wide [`Result`] alias
//! - **Logging**: tracing subscriber setup driven by `DATAQS_LOG_*` variables
//! - **Types**: validated dataset names and run identifiers
//!
//! # Example
//!
//! ```no_run
//! use dataqs_common::{DatasetName, Result};
//!
//! fn staging_slot(dataset: &str) -> Result<DatasetName> {
//!     let name = DatasetName::new(dataset)?;
//!     Ok(name.with_suffix("tmp"))
//! }
//! ```

pub mod error;
pub mod logging;
pub mod types;

pub use error::{DataqsError, Result};
pub use types::{DatasetName, RunId};
