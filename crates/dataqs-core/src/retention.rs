//! Retention eviction
//!
//! Age and count limits for tabular datasets and raster artifacts. An
//! eviction pass never removes the newest record of a dataset or the
//! newest artifact of a layer, so a feed that stalls keeps serving its
//! last good data.

use chrono::{DateTime, Utc};
use dataqs_common::DatasetName;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};
use crate::normalize::RecordSchema;
use crate::raster::{RasterArtifact, RasterCatalog};
use crate::store::{bounded, Store};

/// Limits for one dataset or retention class. Both limits are optional.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_age: Option<Duration>,
    pub max_count: Option<u64>,
}

impl RetentionPolicy {
    pub fn hours(hours: u64) -> Self {
        Self {
            max_age: Some(Duration::from_secs(hours * 3600)),
            max_count: None,
        }
    }

    pub fn days(days: u64) -> Self {
        Self {
            max_age: Some(Duration::from_secs(days * 86_400)),
            max_count: None,
        }
    }

    /// Keep at most `max_count` records. The newest record always stays, so
    /// the count is at least one.
    pub fn with_max_count(mut self, max_count: u64) -> Self {
        self.max_count = Some(max_count.max(1));
        self
    }

    pub fn is_unbounded(&self) -> bool {
        self.max_age.is_none() && self.max_count.is_none()
    }

    /// `reference_time - max_age`, if an age limit is set.
    pub fn cutoff(&self, reference_time: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let age = chrono::Duration::from_std(self.max_age?).ok()?;
        reference_time.checked_sub_signed(age)
    }
}

/// Retention class of a raster artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetentionClass {
    Hourly,
    Daily,
}

impl RetentionClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetentionClass::Hourly => "hourly",
            RetentionClass::Daily => "daily",
        }
    }
}

impl fmt::Display for RetentionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delete records of `dataset` that fall outside `policy`.
///
/// Returns the number of records removed. Running it twice with the same
/// reference time removes nothing the second time.
pub async fn evict_records(
    store: &dyn Store,
    dataset: &DatasetName,
    schema: &RecordSchema,
    policy: &RetentionPolicy,
    reference_time: DateTime<Utc>,
    timeout: Duration,
) -> Result<u64> {
    if policy.is_unbounded() {
        return Ok(0);
    }
    if !bounded(timeout, store.slot_exists(dataset)).await? {
        debug!(dataset = %dataset, "Nothing to evict, dataset does not exist");
        return Ok(0);
    }

    let mut removed = 0;
    if let Some(cutoff) = policy.cutoff(reference_time) {
        removed += bounded(timeout, store.delete_older_than(dataset, schema, cutoff)).await?;
    }
    if let Some(max_count) = policy.max_count {
        removed += bounded(timeout, store.retain_newest(dataset, schema, max_count.max(1))).await?;
    }

    if removed > 0 {
        info!(dataset = %dataset, removed, "Evicted expired records");
    }
    Ok(removed)
}

/// Per-class limits for one raster layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RasterRetention {
    pub daily_hour: u32,
    pub policies: BTreeMap<RetentionClass, RetentionPolicy>,
}

impl RasterRetention {
    /// 24 hours of hourly artifacts and 30 days of daily ones.
    pub fn standard(daily_hour: u32) -> Self {
        Self::new(daily_hour)
            .with(RetentionClass::Hourly, RetentionPolicy::hours(24))
            .with(RetentionClass::Daily, RetentionPolicy::days(30))
    }

    pub fn new(daily_hour: u32) -> Self {
        Self {
            daily_hour,
            policies: BTreeMap::new(),
        }
    }

    pub fn with(mut self, class: RetentionClass, policy: RetentionPolicy) -> Self {
        self.policies.insert(class, policy);
        self
    }

    fn expired(&self, artifacts: &[RasterArtifact], reference_time: DateTime<Utc>) -> Vec<RasterArtifact> {
        let newest = artifacts.iter().map(|a| a.time).max();
        let mut expired = Vec::new();

        for (class, policy) in &self.policies {
            let cutoff = policy.cutoff(reference_time);

            let mut members: Vec<&RasterArtifact> =
                artifacts.iter().filter(|a| a.class(self.daily_hour) == *class).collect();
            members.sort_by(|a, b| b.time.cmp(&a.time));

            for (rank, artifact) in members.into_iter().enumerate() {
                if Some(artifact.time) == newest {
                    continue;
                }
                let too_old = cutoff.is_some_and(|c| artifact.time < c);
                let too_many = policy.max_count.is_some_and(|max| rank as u64 >= max);
                if too_old || too_many {
                    expired.push(artifact.clone());
                }
            }
        }

        expired.sort_by(|a, b| a.time.cmp(&b.time));
        expired
    }
}

/// Delete raster artifacts of `layer` that fall outside their class limits.
///
/// Returns the artifacts actually removed so the caller can drop them from
/// the map server's index.
pub async fn evict_rasters(
    catalog: &RasterCatalog,
    layer: &DatasetName,
    retention: &RasterRetention,
    reference_time: DateTime<Utc>,
) -> Result<Vec<RasterArtifact>> {
    let catalog = catalog.clone();
    let layer = layer.clone();
    let retention = retention.clone();

    tokio::task::spawn_blocking(move || -> Result<Vec<RasterArtifact>> {
        let artifacts = catalog.list(&layer)?;
        let mut removed = Vec::new();

        for artifact in retention.expired(&artifacts, reference_time) {
            match catalog.remove(&artifact) {
                Ok(()) => removed.push(artifact),
                Err(e) => {
                    warn!(path = %artifact.path.display(), error = %e, "Failed to remove raster artifact");
                }
            }
        }

        if !removed.is_empty() {
            info!(layer = %layer, removed = removed.len(), "Evicted expired raster artifacts");
        }
        Ok(removed)
    })
    .await
    .map_err(|e| PipelineError::Staging(std::io::Error::other(e)))?
}
