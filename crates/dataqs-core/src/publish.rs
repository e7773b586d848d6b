//! Full-refresh publication through slot moves
//!
//! A new version of a dataset is built in the `{dataset}_tmp` slot and
//! promoted in one store step:
//!
//! ```text
//! live -> {dataset}_prev, {dataset}_tmp -> live   (replace_slot)
//! drop {dataset}_prev
//! ```
//!
//! On first publish the staging slot is simply moved to the live name.
//! Readers of the live name see either the old version or the new one. A leftover `_prev` slot
//! means an earlier swap did not finish; publishing refuses to run until
//! it is resolved.

use dataqs_common::DatasetName;
use std::future::Future;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::error::{PipelineError, Result};
use crate::normalize::{Record, RecordSchema};
use crate::store::{bounded, Store};
use crate::upsert::{UpsertEngine, UpsertResult};

pub const STAGING_SUFFIX: &str = "tmp";
pub const PREVIOUS_SUFFIX: &str = "prev";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReport {
    pub dataset: DatasetName,
    /// Records in the live dataset after the swap.
    pub records: u64,
    /// Whether a previous live version was replaced.
    pub replaced: bool,
    /// Whether the previous version could not be dropped and was left behind.
    pub previous_left: bool,
}

pub struct SnapshotPublisher<'a> {
    store: &'a dyn Store,
    timeout: Duration,
}

impl<'a> SnapshotPublisher<'a> {
    pub fn new(store: &'a dyn Store, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Build a fresh version of `dataset` with `build` and swap it in.
    ///
    /// `build` receives the staging slot name and fills it through the
    /// store. If it fails, the staging slot is dropped and the live
    /// dataset is left exactly as it was.
    pub async fn publish<F, Fut>(&self, dataset: &DatasetName, schema: &RecordSchema, build: F) -> Result<PublishReport>
    where
        F: FnOnce(DatasetName) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let staging = dataset.with_suffix(STAGING_SUFFIX);
        let previous = dataset.with_suffix(PREVIOUS_SUFFIX);

        if bounded(self.timeout, self.store.slot_exists(&previous)).await? {
            return Err(PipelineError::InterruptedSwap {
                dataset: dataset.to_string(),
                detail: format!("slot {} is left over from an earlier swap", previous),
            });
        }

        if bounded(self.timeout, self.store.slot_exists(&staging)).await? {
            warn!(dataset = %dataset, slot = %staging, "Discarding stale staging slot");
            bounded(self.timeout, self.store.drop_slot(&staging)).await?;
        }
        bounded(self.timeout, self.store.ensure_dataset(&staging, schema)).await?;

        if let Err(e) = build(staging.clone()).await {
            warn!(dataset = %dataset, error = %e, "Snapshot build failed, live dataset untouched");
            self.discard(&staging).await;
            return Err(e);
        }

        let replaced = match bounded(self.timeout, self.store.slot_exists(dataset)).await {
            Ok(exists) => exists,
            Err(e) => {
                self.discard(&staging).await;
                return Err(e.into());
            }
        };

        let swapped = if replaced {
            bounded(self.timeout, self.store.replace_slot(&staging, dataset, &previous)).await
        } else {
            bounded(self.timeout, self.store.move_slot(&staging, dataset)).await
        };

        if let Err(source) = swapped {
            error!(dataset = %dataset, error = %source, "Swap failed, restoring previous version");
            if let Err(detail) = self.restore(dataset, &previous).await {
                return Err(PipelineError::InterruptedSwap {
                    dataset: dataset.to_string(),
                    detail: format!("swap failed ({}) and {}", source, detail),
                });
            }
            self.discard(&staging).await;
            return Err(PipelineError::PublishSwapFailure {
                dataset: dataset.to_string(),
                source,
            });
        }

        let mut previous_left = false;
        if replaced {
            if let Err(e) = bounded(self.timeout, self.store.drop_slot(&previous)).await {
                error!(
                    dataset = %dataset,
                    slot = %previous,
                    error = %e,
                    "Failed to drop previous version; next publish will refuse to start"
                );
                previous_left = true;
            }
        }

        let records = bounded(self.timeout, self.store.count(dataset)).await?;
        info!(dataset = %dataset, records, replaced, "Published snapshot");

        Ok(PublishReport {
            dataset: dataset.clone(),
            records,
            replaced,
            previous_left,
        })
    }

    /// Publish `records` as the complete new content of `dataset`.
    pub async fn publish_records(
        &self,
        dataset: &DatasetName,
        schema: &RecordSchema,
        records: &[Record],
        batch_size: usize,
    ) -> Result<(PublishReport, UpsertResult)> {
        let engine = UpsertEngine::new(self.store, batch_size, self.timeout);
        let mut loaded = UpsertResult::default();

        let report = self
            .publish(dataset, schema, |staging| {
                let engine = &engine;
                let loaded = &mut loaded;
                async move {
                    *loaded = engine.upsert(&staging, schema, records).await?;
                    Ok(())
                }
            })
            .await?;

        Ok((report, loaded))
    }

    /// Put the previous version back if a failed swap left the live slot empty.
    async fn restore(&self, dataset: &DatasetName, previous: &DatasetName) -> std::result::Result<(), String> {
        let live = bounded(self.timeout, self.store.slot_exists(dataset))
            .await
            .map_err(|e| format!("live slot check failed ({})", e))?;
        if live {
            return Ok(());
        }

        let has_previous = bounded(self.timeout, self.store.slot_exists(previous))
            .await
            .map_err(|e| format!("previous slot check failed ({})", e))?;
        if !has_previous {
            return Ok(());
        }

        bounded(self.timeout, self.store.move_slot(previous, dataset))
            .await
            .map_err(|e| format!("restore failed ({})", e))?;
        info!(dataset = %dataset, "Restored previous version");
        Ok(())
    }

    async fn discard(&self, staging: &DatasetName) {
        if let Err(e) = bounded(self.timeout, self.store.drop_slot(staging)).await {
            warn!(slot = %staging, error = %e, "Failed to drop staging slot");
        }
    }
}
