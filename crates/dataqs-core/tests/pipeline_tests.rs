//! End-to-end runs through `Pipeline::run`
//!
//! Coverage includes:
//! - Fetch, normalize, upsert, evict and announce in one run
//! - Style registration retried on every run
//! - Staging cleanup after success and after failure
//! - Nothing published when the resource is unavailable
//! - Raster artifacts installed, evicted and reported to the notifier

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use common::*;
use dataqs_core::fetch::{BucketKind, ExpectedFormat, FallbackPolicy, FetchError, FetchRequest, ResourceSource, TimeBucket};
use dataqs_core::normalize::{Mapped, NormalizationPolicy, Record};
use dataqs_core::notify::{LayerMetadata, LayerNotifier, NotifyError};
use dataqs_core::retention::RetentionPolicy;
use dataqs_core::store::{RecordStore, SlotStore, Store};
use dataqs_core::{Job, JobConfig, Pipeline, PipelineError, RunContext};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

// ============================================================================
// Test Doubles
// ============================================================================

struct MapSource {
    payloads: HashMap<String, Vec<u8>>,
}

impl MapSource {
    fn new(entries: &[(&str, &str)]) -> Arc<Self> {
        Arc::new(Self {
            payloads: entries.iter().map(|(k, v)| (k.to_string(), v.as_bytes().to_vec())).collect(),
        })
    }
}

#[async_trait]
impl ResourceSource for MapSource {
    fn scheme(&self) -> &str {
        "map"
    }

    async fn retrieve(&self, location: &str) -> Result<Vec<u8>, FetchError> {
        self.payloads
            .get(location)
            .cloned()
            .ok_or_else(|| FetchError::NotFound(location.to_string()))
    }
}

#[derive(Default)]
struct RecordingNotifier {
    calls: Mutex<Vec<String>>,
    style_failures: Mutex<u32>,
}

impl RecordingNotifier {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn fail_styles(&self, times: u32) {
        *self.style_failures.lock().unwrap() = times;
    }
}

#[async_trait]
impl LayerNotifier for RecordingNotifier {
    async fn register_layer(&self, name: &str, _metadata: &LayerMetadata) -> Result<(), NotifyError> {
        self.record(format!("layer:{name}"));
        Ok(())
    }

    async fn invalidate_cache(&self, name: &str) -> Result<(), NotifyError> {
        self.record(format!("cache:{name}"));
        Ok(())
    }

    async fn register_style(&self, name: &str, _sld: &str) -> Result<(), NotifyError> {
        self.record(format!("style:{name}"));
        let mut failures = self.style_failures.lock().unwrap();
        if *failures > 0 {
            *failures -= 1;
            return Err(NotifyError::Status {
                method: "POST",
                url: format!("styles/{name}"),
                status: 503,
                body: String::new(),
            });
        }
        Ok(())
    }

    async fn add_granule(&self, layer: &str, _file: &Path) -> Result<(), NotifyError> {
        self.record(format!("granule:{layer}"));
        Ok(())
    }

    async fn remove_granules(&self, layer: &str, files: &[PathBuf]) -> Result<(), NotifyError> {
        self.record(format!("remove:{layer}:{}", files.len()));
        Ok(())
    }
}

/// Reads `id,days_ago` lines for the hour bucket of the reference time.
struct QuakeJob {
    source: Arc<MapSource>,
}

fn parse_line(line: &&str) -> Result<Mapped, String> {
    if *line == "TOTAL" {
        return Ok(Mapped::Sentinel);
    }
    let (id, age) = line.split_once(',').ok_or("missing comma")?;
    let age: i64 = age.trim().parse().map_err(|e| format!("bad age: {e}"))?;
    Ok(Mapped::Record(quake(id, days_ago(age))))
}

#[async_trait]
impl Job for QuakeJob {
    fn name(&self) -> &str {
        "quaketest"
    }

    fn description(&self) -> &str {
        "Test feed"
    }

    async fn run(&self, ctx: &mut RunContext<'_>) -> dataqs_core::Result<()> {
        let start = TimeBucket::containing(BucketKind::Hour, ctx.reference_time());
        let request = FetchRequest::new("quakes", start, "feed/{year}{month}{day}{hour}")
            .extension("csv")
            .format(ExpectedFormat::Text);
        let fetched = ctx.fetch(self.source.clone(), &request, &FallbackPolicy::EXACT).await?;

        let text = std::fs::read_to_string(&fetched.path)?;
        let lines: Vec<&str> = text.lines().collect();
        let schema = quake_schema();
        let records: Vec<Record> = ctx.normalize(&lines, &parse_line, &schema, NormalizationPolicy::Lenient)?;

        let dataset = name("quakes_weekly");
        ctx.upsert(&dataset, &schema, &records).await?;
        ctx.evict(&dataset, &schema, &RetentionPolicy::days(7)).await?;
        ctx.announce(&dataset, &LayerMetadata::vector("Earthquakes"), Some("<sld/>")).await;
        Ok(())
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    staging_root: PathBuf,
    store: Arc<dyn Store>,
    notifier: Arc<RecordingNotifier>,
    pipeline: Pipeline,
    config: JobConfig,
}

fn harness() -> Harness {
    let (dir, store) = document_store();
    let staging_root = dir.path().join("staging");
    std::fs::create_dir_all(&staging_root).unwrap();

    let store: Arc<dyn Store> = Arc::new(store);
    let notifier = Arc::new(RecordingNotifier::default());
    let pipeline = Pipeline::new(Arc::clone(&store), notifier.clone());

    let mut config = JobConfig::new("quaketest");
    config.staging_root = staging_root.clone();
    config.raster.root = dir.path().join("geodata");

    Harness {
        _dir: dir,
        staging_root,
        store,
        notifier,
        pipeline,
        config,
    }
}

fn staging_entries(root: &Path) -> usize {
    std::fs::read_dir(root)
        .unwrap()
        .filter(|e| e.as_ref().unwrap().file_name().to_string_lossy().starts_with("dataqs-"))
        .count()
}

// ============================================================================
// Tabular Runs
// ============================================================================

#[tokio::test]
async fn test_run_upserts_evicts_and_announces() -> anyhow::Result<()> {
    init_tracing();
    let h = harness();
    let source = MapSource::new(&[("feed/2016030112", "a,1\nb,2\nold,30\nbad line\nTOTAL\n")]);
    let job = QuakeJob { source };

    let stats = h.pipeline.run(&job, &h.config, reference_time()).await?;

    assert_eq!(stats.records_inserted, 3);
    assert_eq!(stats.records_rejected, 1);
    assert_eq!(stats.records_evicted, 1);
    assert_eq!(stats.datasets, vec!["quakes_weekly".to_string()]);
    assert!(stats.completed_at.is_some());
    assert_eq!(h.store.count(&name("quakes_weekly")).await?, 2);
    assert_eq!(
        h.notifier.calls(),
        vec!["layer:quakes_weekly", "style:quakes_weekly", "cache:quakes_weekly"]
    );
    assert_eq!(staging_entries(&h.staging_root), 0);

    // Second run: only the evicted record comes back, and goes again.
    let stats = h.pipeline.run(&job, &h.config, reference_time()).await?;
    assert_eq!(stats.records_inserted, 1);
    assert_eq!(stats.records_conflicting, 2);
    assert_eq!(stats.records_evicted, 1);
    assert_eq!(h.notifier.calls().iter().filter(|c| c.starts_with("style:")).count(), 2);
    Ok(())
}

#[tokio::test]
async fn test_failed_style_upload_is_retried_next_run() -> anyhow::Result<()> {
    init_tracing();
    let h = harness();
    h.notifier.fail_styles(1);
    let job = QuakeJob {
        source: MapSource::new(&[("feed/2016030112", "a,1\nb,2\n")]),
    };

    // The failed upload does not fail the run, and the cache is still flushed
    h.pipeline.run(&job, &h.config, reference_time()).await?;
    assert_eq!(
        h.notifier.calls(),
        vec!["layer:quakes_weekly", "style:quakes_weekly", "cache:quakes_weekly"]
    );

    let stats = h.pipeline.run(&job, &h.config, reference_time()).await?;
    assert_eq!(stats.records_inserted, 0);
    assert_eq!(h.notifier.calls().iter().filter(|c| c.starts_with("style:")).count(), 2);
    assert_eq!(*h.notifier.style_failures.lock().unwrap(), 0);
    Ok(())
}

#[tokio::test]
async fn test_unavailable_resource_publishes_nothing() -> anyhow::Result<()> {
    init_tracing();
    let h = harness();
    let job = QuakeJob {
        source: MapSource::new(&[]),
    };

    let err = h.pipeline.run(&job, &h.config, reference_time()).await.unwrap_err();

    assert!(matches!(err, PipelineError::ResourceUnavailable { .. }));
    assert!(!h.store.slot_exists(&name("quakes_weekly")).await?);
    assert!(h.notifier.calls().is_empty());
    assert_eq!(staging_entries(&h.staging_root), 0);
    Ok(())
}

#[tokio::test]
async fn test_strict_config_aborts_on_bad_row() -> anyhow::Result<()> {
    init_tracing();
    let mut h = harness();
    h.config.normalization = Some(NormalizationPolicy::Strict);
    let job = QuakeJob {
        source: MapSource::new(&[("feed/2016030112", "a,1\nbad line\n")]),
    };

    let err = h.pipeline.run(&job, &h.config, reference_time()).await.unwrap_err();

    assert!(matches!(err, PipelineError::Normalization(_)));
    assert!(!h.store.slot_exists(&name("quakes_weekly")).await?);
    assert_eq!(staging_entries(&h.staging_root), 0);
    Ok(())
}

// ============================================================================
// Raster Runs
// ============================================================================

struct GridJob {
    times: Vec<DateTime<Utc>>,
}

#[async_trait]
impl Job for GridJob {
    fn name(&self) -> &str {
        "gridtest"
    }

    fn description(&self) -> &str {
        "Test raster feed"
    }

    async fn run(&self, ctx: &mut RunContext<'_>) -> dataqs_core::Result<()> {
        let layer = name("forecast_io_airtemp");
        let staged = ctx.staging().write_new("grid.tif", b"II*\0grid")?;
        for time in &self.times {
            ctx.deliver_artifact(&layer, *time, &staged.path, "tif").await?;
        }
        let retention = ctx.raster_retention();
        ctx.evict_artifacts(&layer, &retention).await?;
        Ok(())
    }
}

#[tokio::test]
async fn test_raster_run_installs_and_evicts() -> anyhow::Result<()> {
    init_tracing();
    let h = harness();
    let job = GridJob {
        times: vec![
            Utc.with_ymd_and_hms(2016, 2, 27, 5, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2016, 3, 1, 11, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2016, 3, 1, 12, 0, 0).unwrap(),
        ],
    };

    let stats = h.pipeline.run(&job, &h.config, reference_time()).await?;

    assert_eq!(stats.artifacts_installed, 3);
    assert_eq!(stats.artifacts_evicted, 1);
    let calls = h.notifier.calls();
    assert_eq!(calls.iter().filter(|c| c.starts_with("granule:")).count(), 3);
    assert!(calls.contains(&"remove:forecast_io_airtemp:1".to_string()));

    let layer_dir = h.config.raster.root.join("geonode").join("forecast_io_airtemp");
    assert_eq!(std::fs::read_dir(layer_dir)?.count(), 2);
    assert_eq!(staging_entries(&h.staging_root), 0);
    Ok(())
}
