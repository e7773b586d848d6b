//! Shared fixtures for dataqs-core integration tests

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use dataqs_common::DatasetName;
use dataqs_core::normalize::{FieldType, Geometry, Record, RecordSchema};
use dataqs_core::store::{DocumentStore, InsertOutcome, RecordStore, RowError, SlotStore, StoreError};
use std::sync::atomic::{AtomicBool, Ordering};
use tempfile::TempDir;

/// Initialize tracing for tests
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,dataqs_core=debug")),
        )
        .with_test_writer()
        .try_init();
}

pub fn name(s: &str) -> DatasetName {
    DatasetName::new(s).unwrap()
}

pub fn reference_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2016, 3, 1, 12, 0, 0).unwrap()
}

pub fn days_ago(days: i64) -> DateTime<Utc> {
    reference_time() - ChronoDuration::days(days)
}

pub fn quake_schema() -> RecordSchema {
    RecordSchema::builder()
        .field("id", FieldType::Text)
        .field("mag", FieldType::Real)
        .field("the_geom", FieldType::Geometry)
        .field("time", FieldType::Timestamp)
        .key(&["id"])
        .timestamp("time")
        .build()
        .unwrap()
}

pub fn quake(id: &str, time: DateTime<Utc>) -> Record {
    Record::new()
        .with("id", id)
        .with("mag", 4.2)
        .with("the_geom", Geometry::point(-117.5, 35.7))
        .with("time", time)
}

pub fn document_store() -> (TempDir, DocumentStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = DocumentStore::open(dir.path().join("store")).unwrap();
    (dir, store)
}

/// Document store that can be told to fail specific slot moves.
pub struct FaultyStore {
    pub inner: DocumentStore,
    /// Fail the next promotion of a `_tmp` slot. A replace fails halfway,
    /// after the live slot has already been moved aside.
    pub fail_promote: AtomicBool,
    /// Fail the next move whose source ends in `_prev`.
    pub fail_restore: AtomicBool,
    /// Fail every drop of a `_prev` slot.
    pub fail_drop_previous: AtomicBool,
}

impl FaultyStore {
    pub fn new(inner: DocumentStore) -> Self {
        Self {
            inner,
            fail_promote: AtomicBool::new(false),
            fail_restore: AtomicBool::new(false),
            fail_drop_previous: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl RecordStore for FaultyStore {
    async fn ensure_dataset(&self, dataset: &DatasetName, schema: &RecordSchema) -> Result<bool, StoreError> {
        self.inner.ensure_dataset(dataset, schema).await
    }

    async fn insert_if_absent(
        &self,
        dataset: &DatasetName,
        schema: &RecordSchema,
        records: &[Record],
    ) -> Result<Vec<Result<InsertOutcome, RowError>>, StoreError> {
        self.inner.insert_if_absent(dataset, schema, records).await
    }

    async fn delete_older_than(
        &self,
        dataset: &DatasetName,
        schema: &RecordSchema,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        self.inner.delete_older_than(dataset, schema, cutoff).await
    }

    async fn retain_newest(&self, dataset: &DatasetName, schema: &RecordSchema, max_count: u64) -> Result<u64, StoreError> {
        self.inner.retain_newest(dataset, schema, max_count).await
    }

    async fn count(&self, dataset: &DatasetName) -> Result<u64, StoreError> {
        self.inner.count(dataset).await
    }

    async fn records(&self, dataset: &DatasetName, schema: &RecordSchema) -> Result<Vec<Record>, StoreError> {
        self.inner.records(dataset, schema).await
    }
}

#[async_trait]
impl SlotStore for FaultyStore {
    async fn slot_exists(&self, slot: &DatasetName) -> Result<bool, StoreError> {
        self.inner.slot_exists(slot).await
    }

    async fn move_slot(&self, from: &DatasetName, to: &DatasetName) -> Result<(), StoreError> {
        let from_name = from.as_str();
        if from_name.ends_with("_tmp") && self.fail_promote.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected promote failure".to_string()));
        }
        if from_name.ends_with("_prev") && self.fail_restore.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected restore failure".to_string()));
        }
        self.inner.move_slot(from, to).await
    }

    async fn replace_slot(&self, from: &DatasetName, live: &DatasetName, previous: &DatasetName) -> Result<(), StoreError> {
        if self.fail_promote.swap(false, Ordering::SeqCst) {
            self.inner.move_slot(live, previous).await?;
            return Err(StoreError::Unavailable("injected promote failure".to_string()));
        }
        self.inner.replace_slot(from, live, previous).await
    }

    async fn drop_slot(&self, slot: &DatasetName) -> Result<(), StoreError> {
        if slot.as_str().ends_with("_prev") && self.fail_drop_previous.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected drop failure".to_string()));
        }
        self.inner.drop_slot(slot).await
    }
}
