//! Persistent store interfaces
//!
//! A dataset lives in a *slot*: a name (`quakes`, `quakes_tmp`,
//! `quakes_prev`) that points at one physical table or collection. Slots
//! are moved and dropped as single indivisible steps, which is what the
//! snapshot publisher builds on.

pub mod document;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dataqs_common::{DataqsError, DatasetName};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

pub use document::DocumentStore;
pub use postgres::PostgresStore;

use crate::normalize::{Record, RecordSchema};

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Store locked: {0}")]
    Locked(String),

    #[error("Slot {0} already exists")]
    SlotExists(String),

    #[error("Slot {0} does not exist")]
    SlotMissing(String),

    #[error("Schema mismatch for {dataset}: {detail}")]
    Schema { dataset: String, detail: String },

    #[error("Database error: {0}")]
    Database(sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Identifier(#[from] DataqsError),
}

impl StoreError {
    /// Outages that make every further call pointless.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            StoreError::Unavailable(_) | StoreError::Timeout(_) | StoreError::Locked(_)
        )
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Unavailable(err.to_string()),
            other => StoreError::Database(other),
        }
    }
}

/// Result of one conditional insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A record with the same natural key already exists. Not an error.
    ConflictSkipped,
}

/// A single record the store refused; the rest of the batch continues.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("row {index} rejected: {reason}")]
pub struct RowError {
    pub index: usize,
    pub reason: String,
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Create the dataset with its uniqueness constraint if it does not exist.
    ///
    /// Returns `true` when the dataset was created by this call.
    async fn ensure_dataset(&self, dataset: &DatasetName, schema: &RecordSchema) -> Result<bool>;

    /// Insert each record unless its natural key is already present.
    ///
    /// The outer error is store-wide; per-record failures are reported in
    /// the returned vector, one entry per input record in order.
    async fn insert_if_absent(
        &self,
        dataset: &DatasetName,
        schema: &RecordSchema,
        records: &[Record],
    ) -> Result<Vec<std::result::Result<InsertOutcome, RowError>>>;

    /// Delete records with timestamp before `cutoff`, keeping every record
    /// that holds the dataset's newest timestamp.
    async fn delete_older_than(
        &self,
        dataset: &DatasetName,
        schema: &RecordSchema,
        cutoff: DateTime<Utc>,
    ) -> Result<u64>;

    /// Keep only the newest `max_count` records.
    async fn retain_newest(&self, dataset: &DatasetName, schema: &RecordSchema, max_count: u64) -> Result<u64>;

    async fn count(&self, dataset: &DatasetName) -> Result<u64>;

    /// All records in insertion order.
    async fn records(&self, dataset: &DatasetName, schema: &RecordSchema) -> Result<Vec<Record>>;
}

#[async_trait]
pub trait SlotStore: Send + Sync {
    async fn slot_exists(&self, slot: &DatasetName) -> Result<bool>;

    /// Point `to` at what `from` points at and remove `from`, atomically.
    ///
    /// Fails with [`StoreError::SlotExists`] if `to` is taken and
    /// [`StoreError::SlotMissing`] if `from` does not exist.
    async fn move_slot(&self, from: &DatasetName, to: &DatasetName) -> Result<()>;

    /// Move `live` to `previous` and `from` to `live` in one step.
    ///
    /// Readers of `live` see either the old or the new collection, never
    /// neither. Fails with [`StoreError::SlotExists`] if `previous` is taken.
    async fn replace_slot(&self, from: &DatasetName, live: &DatasetName, previous: &DatasetName) -> Result<()>;

    /// Remove a slot and its data. Dropping a missing slot is a no-op.
    async fn drop_slot(&self, slot: &DatasetName) -> Result<()>;
}

/// Full store surface used by the pipeline.
pub trait Store: RecordStore + SlotStore {}

impl<T: RecordStore + SlotStore> Store for T {}

/// Run a store call under the run-level timeout.
pub async fn bounded<T, F>(timeout: Duration, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(timeout, call)
        .await
        .map_err(|_| StoreError::Timeout(timeout))?
}

/// Quote a validated identifier for SQL.
pub(crate) fn quote_ident(name: &DatasetName) -> String {
    format!("\"{}\"", name.as_str())
}
