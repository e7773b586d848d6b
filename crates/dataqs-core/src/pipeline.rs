//! Run orchestration
//!
//! A [`Job`] describes one feed. [`Pipeline::run`] gives it a
//! [`RunContext`] with its own staging area, store handle and notifier,
//! runs it inside an `ingest_run` span and removes the staging area
//! afterwards, whether the job succeeded or not.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dataqs_common::logging::run_span;
use dataqs_common::{DatasetName, RunId};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn, Instrument};

use crate::config::{AppConfig, JobConfig, StoreBackend};
use crate::error::{PipelineError, Result};
use crate::fetch::{FallbackPolicy, FetchRequest, Fetched, Fetcher, ResourceSource};
use crate::normalize::{normalize, NormalizationPolicy, Record, RecordSchema, RowMapper};
use crate::notify::{GeoServerNotifier, LayerMetadata, LayerNotifier, LogNotifier};
use crate::publish::{PublishReport, SnapshotPublisher};
use crate::raster::{RasterArtifact, RasterCatalog};
use crate::retention::{self, RasterRetention, RetentionPolicy};
use crate::staging::StagingArea;
use crate::store::{DocumentStore, PostgresStore, Store};
use crate::upsert::{UpsertEngine, UpsertResult};

/// One feed: fetch, normalize and deliver a dataset.
#[async_trait]
pub trait Job: Send + Sync {
    /// Job name as used on the command line and in `[jobs.<name>]`.
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    async fn run(&self, ctx: &mut RunContext<'_>) -> Result<()>;
}

/// Statistics collected during a run
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct RunStats {
    /// Records written by upserts and snapshot builds
    pub records_inserted: u64,
    /// Records skipped as duplicates of a stored or earlier record
    pub records_conflicting: u64,
    /// Records the store rejected
    pub records_failed: u64,
    /// Rows dropped by lenient normalization
    pub records_rejected: u64,
    pub records_evicted: u64,
    pub artifacts_installed: u64,
    pub artifacts_evicted: u64,
    /// Bytes staged by fetches
    pub bytes_fetched: u64,
    /// Datasets and layers changed by the run
    pub datasets: Vec<String>,
    pub duration_secs: f64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RunStats {
    pub fn new() -> Self {
        Self {
            started_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    /// Mark stats as completed
    pub fn complete(&mut self) {
        self.completed_at = Some(Utc::now());
        if let (Some(start), Some(end)) = (self.started_at, self.completed_at) {
            self.duration_secs = (end - start).num_milliseconds() as f64 / 1000.0;
        }
    }

    pub fn add_upsert(&mut self, result: &UpsertResult) {
        self.records_inserted += result.inserted;
        self.records_conflicting += result.conflicts;
        self.records_failed += result.failed;
    }

    fn touch(&mut self, dataset: &DatasetName) {
        if !self.datasets.iter().any(|d| d == dataset.as_str()) {
            self.datasets.push(dataset.to_string());
        }
    }

    /// Records seen by upserts and snapshot builds
    pub fn records_total(&self) -> u64 {
        self.records_inserted + self.records_conflicting + self.records_failed
    }

    /// Get success rate as percentage
    pub fn success_rate(&self) -> f64 {
        let total = self.records_total();
        if total > 0 {
            (total - self.records_failed) as f64 / total as f64 * 100.0
        } else {
            0.0
        }
    }
}

/// Everything a job may touch during one run.
pub struct RunContext<'a> {
    config: &'a JobConfig,
    run_id: RunId,
    reference_time: DateTime<Utc>,
    store: Arc<dyn Store>,
    notifier: Arc<dyn LayerNotifier>,
    staging: StagingArea,
    catalog: RasterCatalog,
    stats: RunStats,
}

impl<'a> RunContext<'a> {
    pub fn config(&self) -> &JobConfig {
        self.config
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// The "now" of this run; bucket selection and eviction are relative to it.
    pub fn reference_time(&self) -> DateTime<Utc> {
        self.reference_time
    }

    pub fn staging(&self) -> &StagingArea {
        &self.staging
    }

    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    pub fn stats(&self) -> &RunStats {
        &self.stats
    }

    pub fn timeout(&self) -> Duration {
        self.config.remote_timeout
    }

    /// Fetch into this run's staging area.
    pub async fn fetch(
        &mut self,
        source: Arc<dyn ResourceSource>,
        request: &FetchRequest,
        policy: &FallbackPolicy,
    ) -> Result<Fetched> {
        let fetched = Fetcher::new(source, &self.staging, self.config.remote_timeout)
            .fetch(request, policy)
            .await?;
        self.stats.bytes_fetched += fetched.bytes;
        Ok(fetched)
    }

    /// Normalize `rows` under the job's strictness, falling back to `default`.
    pub fn normalize<R: Debug, M: RowMapper<R>>(
        &mut self,
        rows: &[R],
        mapper: &M,
        schema: &RecordSchema,
        default: NormalizationPolicy,
    ) -> Result<Vec<Record>> {
        let policy = self.config.normalization_or(default);
        let batch = policy.collect(normalize(rows, mapper, schema))?;
        self.stats.records_rejected += batch.rejected as u64;
        Ok(batch.records)
    }

    /// Insert new records into `dataset`, keeping what is already there.
    pub async fn upsert(&mut self, dataset: &DatasetName, schema: &RecordSchema, records: &[Record]) -> Result<UpsertResult> {
        let engine = UpsertEngine::new(self.store.as_ref(), self.config.batch_size, self.config.remote_timeout);
        let result = engine.upsert(dataset, schema, records).await?;

        self.stats.add_upsert(&result);
        self.stats.touch(dataset);
        Ok(result)
    }

    /// Replace the content of `dataset` with `records` in one swap.
    pub async fn publish(&mut self, dataset: &DatasetName, schema: &RecordSchema, records: &[Record]) -> Result<PublishReport> {
        let publisher = SnapshotPublisher::new(self.store.as_ref(), self.config.remote_timeout);
        let (report, loaded) = publisher
            .publish_records(dataset, schema, records, self.config.batch_size)
            .await?;

        self.stats.add_upsert(&loaded);
        self.stats.touch(dataset);
        Ok(report)
    }

    /// Apply `policy` to `dataset` relative to the run's reference time.
    pub async fn evict(&mut self, dataset: &DatasetName, schema: &RecordSchema, policy: &RetentionPolicy) -> Result<u64> {
        let removed = retention::evict_records(
            self.store.as_ref(),
            dataset,
            schema,
            policy,
            self.reference_time,
            self.config.remote_timeout,
        )
        .await?;
        self.stats.records_evicted += removed;
        Ok(removed)
    }

    /// Register `dataset` as a served layer and flush its cache.
    ///
    /// The style is offered on every run; notifiers skip styles they already
    /// have, so an upload that failed once is retried next time. Failures are
    /// logged and never fail the run.
    pub async fn announce(&self, dataset: &DatasetName, metadata: &LayerMetadata, style: Option<&str>) {
        let name = dataset.as_str();

        if let Err(e) = self.notifier.register_layer(name, metadata).await {
            warn!(layer = name, error = %e, "Layer registration failed");
        }
        if let Some(sld) = style {
            if let Err(e) = self.notifier.register_style(name, sld).await {
                warn!(layer = name, error = %e, "Style registration failed");
            }
        }
        if let Err(e) = self.notifier.invalidate_cache(name).await {
            warn!(layer = name, error = %e, "Cache invalidation failed");
        }
    }

    /// Install a staged raster as the `layer` artifact for `time`.
    pub async fn deliver_artifact(
        &mut self,
        layer: &DatasetName,
        time: DateTime<Utc>,
        staged: &Path,
        extension: &str,
    ) -> Result<RasterArtifact> {
        let artifact = self.catalog.install(layer, time, staged, extension)?;

        if let Err(e) = self.notifier.add_granule(layer.as_str(), &artifact.path).await {
            warn!(layer = %layer, error = %e, "Granule registration failed");
        }

        self.stats.artifacts_installed += 1;
        self.stats.touch(layer);
        Ok(artifact)
    }

    /// Evict expired artifacts of `layer` and drop them from the served index.
    pub async fn evict_artifacts(&mut self, layer: &DatasetName, retention: &RasterRetention) -> Result<usize> {
        let removed = retention::evict_rasters(&self.catalog, layer, retention, self.reference_time).await?;
        if !removed.is_empty() {
            let files: Vec<_> = removed.iter().map(|a| a.path.clone()).collect();
            if let Err(e) = self.notifier.remove_granules(layer.as_str(), &files).await {
                warn!(layer = %layer, error = %e, "Granule removal failed");
            }
        }
        self.stats.artifacts_evicted += removed.len() as u64;
        Ok(removed.len())
    }

    /// Standard raster retention for this job, with per-class overrides from config.
    pub fn raster_retention(&self) -> RasterRetention {
        let standard = RasterRetention::standard(self.config.raster.daily_hour);
        let mut retention = RasterRetention::new(standard.daily_hour);
        for (class, default) in standard.policies {
            retention = retention.with(class, self.config.retention_or(class.as_str(), default));
        }
        retention
    }
}

/// Runs jobs against one store and notifier.
pub struct Pipeline {
    store: Arc<dyn Store>,
    notifier: Arc<dyn LayerNotifier>,
}

impl Pipeline {
    pub fn new(store: Arc<dyn Store>, notifier: Arc<dyn LayerNotifier>) -> Self {
        Self { store, notifier }
    }

    /// Connect the configured store and notifier.
    pub async fn from_config(config: &AppConfig) -> Result<Self> {
        let store: Arc<dyn Store> = match config.store {
            StoreBackend::Postgres => Arc::new(PostgresStore::connect(&config.database).await?),
            StoreBackend::Document => Arc::new(DocumentStore::open(&config.document_store.root)?),
        };

        let notifier: Arc<dyn LayerNotifier> = match config.geoserver.url.as_deref() {
            Some(url) => {
                let timeout = Duration::from_secs(config.defaults.remote_timeout_secs);
                let notifier = GeoServerNotifier::new(url, &config.geoserver, timeout)
                    .map_err(|e| PipelineError::feed(format!("GeoServer client: {}", e)))?;
                Arc::new(notifier)
            },
            None => Arc::new(LogNotifier),
        };

        Ok(Self::new(store, notifier))
    }

    /// Run `job` once and clean up its staging area on every exit path.
    pub async fn run(&self, job: &dyn Job, config: &JobConfig, reference_time: DateTime<Utc>) -> Result<RunStats> {
        let run_id = RunId::new();
        let span = run_span(job.name(), run_id);

        async move {
            info!(reference_time = %reference_time, "Starting run");

            let prefix = format!("dataqs-{}-{}-", job.name(), run_id.short());
            let staging = StagingArea::create(&config.staging_root, &prefix)?;

            let mut ctx = RunContext {
                config,
                run_id,
                reference_time,
                store: Arc::clone(&self.store),
                notifier: Arc::clone(&self.notifier),
                staging,
                catalog: RasterCatalog::new(&config.raster),
                stats: RunStats::new(),
            };

            let outcome = job.run(&mut ctx).await;

            let RunContext { staging, mut stats, .. } = ctx;
            if let Err(e) = staging.cleanup() {
                warn!(error = %e, "Failed to remove staging area");
            }
            stats.complete();

            match outcome {
                Ok(()) => {
                    info!(
                        inserted = stats.records_inserted,
                        conflicting = stats.records_conflicting,
                        failed = stats.records_failed,
                        rejected = stats.records_rejected,
                        evicted = stats.records_evicted,
                        artifacts = stats.artifacts_installed,
                        duration_secs = stats.duration_secs,
                        "Run complete"
                    );
                    Ok(stats)
                },
                Err(e) => {
                    error!(error = %e, duration_secs = stats.duration_secs, "Run failed");
                    Err(e)
                },
            }
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_run_stats_new() {
        let stats = RunStats::new();
        assert_eq!(stats.records_total(), 0);
        assert!(stats.started_at.is_some());
        assert!(stats.completed_at.is_none());
        assert_eq!(stats.success_rate(), 0.0);
    }

    #[test]
    fn test_run_stats_counts() {
        let mut stats = RunStats::new();
        stats.add_upsert(&UpsertResult {
            inserted: 3,
            skipped: 1,
            conflicts: 0,
            failed: 1,
            created: true,
        });
        stats.complete();

        assert_eq!(stats.records_total(), 4);
        assert_eq!(stats.success_rate(), 75.0);
        assert!(stats.completed_at.is_some());
    }

    #[test]
    fn test_touch_deduplicates() {
        let mut stats = RunStats::default();
        let name = DatasetName::new("quakes_weekly").unwrap();
        stats.touch(&name);
        stats.touch(&name);
        assert_eq!(stats.datasets, vec!["quakes_weekly".to_string()]);
    }
}
