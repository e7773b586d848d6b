//! forecast.io global near-surface air temperature
//!
//! One GeoTIFF per hour. If the current hour is not published yet the
//! previous one is used; the artifact is stamped with the hour actually
//! fetched.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dataqs_common::DatasetName;
use dataqs_core::fetch::{BucketKind, ExpectedFormat, FallbackPolicy, FetchRequest, HttpAuth, TimeBucket};
use dataqs_core::notify::LayerMetadata;
use dataqs_core::{Job, Result, RunContext};
use tracing::info;

use super::{http_source, style_for};

pub const NAME: &str = "forecastio";
pub const LAYER: &str = "forecast_io_airtemp";
pub const DEFAULT_LOCATION: &str = "https://maps.forecast.io/temperature/{year}/{month}/{day}/{hour}.tif";

const STYLE: &str = include_str!("../../resources/forecastio.sld");

pub fn layer_title(time: DateTime<Utc>) -> String {
    format!(
        "Global (near-surface) Air Temperature - {} UTC",
        time.format("%Y-%m-%d %H:00")
    )
}

pub struct ForecastIoJob;

#[async_trait]
impl Job for ForecastIoJob {
    fn name(&self) -> &str {
        NAME
    }

    fn description(&self) -> &str {
        "forecast.io hourly global air temperature grid"
    }

    async fn run(&self, ctx: &mut RunContext<'_>) -> Result<()> {
        let config = ctx.config().clone();
        let source = http_source(&config, HttpAuth::None)?;
        let layer = DatasetName::new(LAYER)?;

        let request = FetchRequest::new(
            NAME,
            TimeBucket::containing(BucketKind::Hour, ctx.reference_time()),
            config.base_url_or(DEFAULT_LOCATION),
        )
        .file_prefix(LAYER)
        .extension("tif")
        .format(ExpectedFormat::GeoTiff);
        let fetched = ctx
            .fetch(source, &request, &FallbackPolicy::back(config.back_steps_or(1)))
            .await?;

        let time = fetched.bucket.start();
        let artifact = ctx.deliver_artifact(&layer, time, &fetched.path, "tif").await?;
        info!(layer = LAYER, time = %time, path = %artifact.path.display(), "Installed air temperature grid");

        let retention = ctx.raster_retention();
        ctx.evict_artifacts(&layer, &retention).await?;

        let metadata = LayerMetadata::raster(layer_title(time))
            .with_description("Near-surface air temperature, WGS84, bounds -180 -90 180 90");
        let style = style_for(STYLE, LAYER);
        ctx.announce(&layer, &metadata, Some(&style)).await;
        Ok(())
    }
}
