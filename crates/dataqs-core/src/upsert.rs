//! Idempotent incremental loads
//!
//! Records are inserted in batches with insert-if-absent semantics keyed
//! on the dataset's natural key. Re-running a load with the same input
//! leaves the dataset unchanged.

use dataqs_common::DatasetName;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::normalize::{Record, RecordSchema};
use crate::store::{bounded, InsertOutcome, Store};

/// Tally of one upsert call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertResult {
    /// Records written by this call.
    pub inserted: u64,
    /// `conflicts + failed`.
    pub skipped: u64,
    /// Records whose natural key was already stored or repeated earlier in
    /// the same input.
    pub conflicts: u64,
    /// Records the store rejected individually.
    pub failed: u64,
    /// Whether the dataset was created by this call.
    pub created: bool,
}

impl UpsertResult {
    pub fn total(&self) -> u64 {
        self.inserted + self.skipped
    }

    pub fn merge(&mut self, other: &UpsertResult) {
        self.inserted += other.inserted;
        self.skipped += other.skipped;
        self.conflicts += other.conflicts;
        self.failed += other.failed;
        self.created |= other.created;
    }
}

pub struct UpsertEngine<'a> {
    store: &'a dyn Store,
    batch_size: usize,
    timeout: Duration,
}

impl<'a> UpsertEngine<'a> {
    pub fn new(store: &'a dyn Store, batch_size: usize, timeout: Duration) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
            timeout,
        }
    }

    /// Ensure `dataset` exists and insert every record not already present.
    ///
    /// Individual row failures are counted and logged; only store-wide
    /// failures abort the call.
    pub async fn upsert(&self, dataset: &DatasetName, schema: &RecordSchema, records: &[Record]) -> Result<UpsertResult> {
        let mut result = UpsertResult {
            created: bounded(self.timeout, self.store.ensure_dataset(dataset, schema)).await?,
            ..UpsertResult::default()
        };
        if result.created {
            info!(dataset = %dataset, "Created dataset");
        }

        let (unique, repeated) = dedup_by_key(records, schema);
        result.conflicts = repeated;

        for (batch_no, batch) in unique.chunks(self.batch_size).enumerate() {
            let outcomes = bounded(self.timeout, self.store.insert_if_absent(dataset, schema, batch)).await?;

            for outcome in outcomes {
                match outcome {
                    Ok(InsertOutcome::Inserted) => result.inserted += 1,
                    Ok(InsertOutcome::ConflictSkipped) => result.conflicts += 1,
                    Err(e) => {
                        result.failed += 1;
                        warn!(
                            dataset = %dataset,
                            row = batch_no * self.batch_size + e.index,
                            reason = %e.reason,
                            "Record rejected by store"
                        );
                    }
                }
            }
            debug!(dataset = %dataset, batch = batch_no, size = batch.len(), "Batch written");
        }
        result.skipped = result.conflicts + result.failed;

        info!(
            dataset = %dataset,
            inserted = result.inserted,
            conflicts = result.conflicts,
            failed = result.failed,
            "Upsert complete"
        );
        Ok(result)
    }
}

/// Drop later records that repeat an earlier natural key.
fn dedup_by_key(records: &[Record], schema: &RecordSchema) -> (Vec<Record>, u64) {
    let mut seen = std::collections::HashSet::new();
    let mut unique = Vec::with_capacity(records.len());
    let mut skipped = 0;

    for record in records {
        if seen.insert(record.natural_key(schema)) {
            unique.push(record.clone());
        } else {
            skipped += 1;
        }
    }
    (unique, skipped)
}
