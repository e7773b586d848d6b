//! AirNow hourly air quality index grids
//!
//! AirNow publishes three GRIB2 grids per hour over FTP (ozone, PM2.5 and
//! the combined index), named `GRIB2/US-{yymmddHH}{suffix}.grib2`. Each
//! product is fetched on its own, with one hour of fallback, and installed
//! into its own layer. A product that cannot be fetched does not stop the
//! others; the run still fails once every product has been tried.
//!
//! The `days` option backfills one grid per day for the last `days` days,
//! taken at the raster daily hour so they fall in the daily retention
//! class. Days missing upstream are skipped.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Timelike, Utc};
use dataqs_common::DatasetName;
use dataqs_core::fetch::{BucketKind, ExpectedFormat, FallbackPolicy, FetchRequest, FtpConfig, FtpSource, TimeBucket};
use dataqs_core::notify::LayerMetadata;
use dataqs_core::{Job, PipelineError, Result, RunContext};
use std::sync::Arc;
use tracing::{info, warn};

use super::style_for;

pub const NAME: &str = "airnow";
pub const DEFAULT_HOST: &str = "ftp.airnowapi.org";

const STYLE: &str = include_str!("../../resources/airnow.sld");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Product {
    Ozone,
    Pm25,
    Combined,
}

impl Product {
    pub const ALL: [Product; 3] = [Product::Ozone, Product::Pm25, Product::Combined];

    pub fn key(&self) -> &'static str {
        match self {
            Product::Ozone => "ozone",
            Product::Pm25 => "pm25",
            Product::Combined => "combined",
        }
    }

    /// File name suffix after the timestamp.
    pub fn suffix(&self) -> &'static str {
        match self {
            Product::Ozone => "",
            Product::Pm25 => "_pm25",
            Product::Combined => "_combined",
        }
    }

    pub fn layer(&self) -> &'static str {
        match self {
            Product::Ozone => "airnow_aqi_ozone",
            Product::Pm25 => "airnow_aqi_pm25",
            Product::Combined => "airnow_aqi_combined",
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Product::Ozone => "Ozone",
            Product::Pm25 => "PM25",
            Product::Combined => "Combined Ozone & PM25",
        }
    }

    pub fn location(&self) -> String {
        format!("GRIB2/US-{{yy}}{{month}}{{day}}{{hour}}{}.grib2", self.suffix())
    }

    pub fn title(&self, time: DateTime<Utc>) -> String {
        format!(
            "AirNow Hourly Air Quality Index ({}) - {} UTC",
            self.label(),
            time.format("%Y-%m-%d %H:00")
        )
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.key() == key)
    }
}

/// Which hours a run installs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    /// The reference hour, falling back `back_steps` hours.
    Latest { back_steps: u32 },
    /// These hours exactly, oldest first.
    Backfill(Vec<DateTime<Utc>>),
}

impl Plan {
    /// Plan from the `days` option. `days` of 1 or less means the latest hour.
    pub fn from_days(days: Option<&str>, back_steps: u32, daily_hour: u32, reference_time: DateTime<Utc>) -> Result<Self> {
        let days: u32 = match days {
            None => 1,
            Some(value) => value
                .trim()
                .parse()
                .map_err(|_| PipelineError::feed(format!("invalid AirNow days '{}'", value)))?,
        };
        if days <= 1 {
            return Ok(Plan::Latest { back_steps });
        }

        let hour = TimeBucket::containing(BucketKind::Hour, reference_time).start();
        let mut latest = hour
            .with_hour(daily_hour)
            .ok_or_else(|| PipelineError::feed(format!("invalid daily hour {}", daily_hour)))?;
        if latest > hour {
            latest -= Duration::days(1);
        }
        Ok(Plan::Backfill(
            (0..days as i64).rev().map(|back| latest - Duration::days(back)).collect(),
        ))
    }
}

/// Products named by the comma separated `products` option, else all three.
pub fn selected_products(option: Option<&str>) -> Result<Vec<Product>> {
    let Some(list) = option else {
        return Ok(Product::ALL.to_vec());
    };
    list.split(',')
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(|key| {
            Product::from_key(key).ok_or_else(|| PipelineError::feed(format!("unknown AirNow product '{}'", key)))
        })
        .collect()
}

pub struct AirNowJob;

impl AirNowJob {
    /// Fetch and install the grid of `product` for the hour of `start`.
    async fn install(
        &self,
        ctx: &mut RunContext<'_>,
        source: &Arc<FtpSource>,
        product: Product,
        start: DateTime<Utc>,
        policy: &FallbackPolicy,
    ) -> Result<DateTime<Utc>> {
        let layer = DatasetName::new(product.layer())?;
        let request = FetchRequest::new(
            format!("{}_{}", NAME, product.key()),
            TimeBucket::containing(BucketKind::Hour, start),
            product.location(),
        )
        .file_prefix(product.layer())
        .extension("grib2")
        .format(ExpectedFormat::Grib);
        let fetched = ctx.fetch(source.clone(), &request, policy).await?;

        let time = fetched.bucket.start();
        ctx.deliver_artifact(&layer, time, &fetched.path, "grib2").await?;
        info!(layer = %layer, time = %time, "Installed AQI grid");
        Ok(time)
    }

    async fn deliver(&self, ctx: &mut RunContext<'_>, source: Arc<FtpSource>, product: Product, plan: &Plan) -> Result<()> {
        let layer = DatasetName::new(product.layer())?;

        let time = match plan {
            Plan::Latest { back_steps } => {
                let policy = FallbackPolicy::back(*back_steps);
                let now = ctx.reference_time();
                self.install(ctx, &source, product, now, &policy).await?
            },
            Plan::Backfill(hours) => {
                let mut newest = None;
                let mut last_error = None;
                for hour in hours {
                    match self.install(ctx, &source, product, *hour, &FallbackPolicy::EXACT).await {
                        Ok(time) => newest = Some(time),
                        Err(e @ PipelineError::ResourceUnavailable { .. }) => {
                            warn!(product = product.key(), hour = %hour, "AirNow grid missing, skipping");
                            last_error = Some(e);
                        },
                        Err(e) => return Err(e),
                    }
                }
                match (newest, last_error) {
                    (Some(time), _) => time,
                    (None, Some(e)) => return Err(e),
                    (None, None) => return Ok(()),
                }
            },
        };

        let retention = ctx.raster_retention();
        ctx.evict_artifacts(&layer, &retention).await?;

        let style = style_for(STYLE, product.layer());
        ctx.announce(&layer, &LayerMetadata::raster(product.title(time)), Some(&style))
            .await;
        Ok(())
    }
}

#[async_trait]
impl Job for AirNowJob {
    fn name(&self) -> &str {
        NAME
    }

    fn description(&self) -> &str {
        "AirNow hourly AQI grids for ozone, PM2.5 and both combined"
    }

    async fn run(&self, ctx: &mut RunContext<'_>) -> Result<()> {
        let config = ctx.config().clone();
        let products = selected_products(config.option("products"))?;
        let plan = Plan::from_days(
            config.option("days"),
            config.back_steps_or(1),
            config.raster.daily_hour,
            ctx.reference_time(),
        )?;

        let mut ftp = FtpConfig {
            host: config.base_url_or(DEFAULT_HOST).to_string(),
            ..FtpConfig::default()
        };
        ftp.io_timeout = ftp.io_timeout.min(config.remote_timeout);
        if let Some(credentials) = config.credentials.clone() {
            ftp.credentials = credentials;
        }
        if let Some(port) = config.option("port") {
            ftp.port = port
                .parse()
                .map_err(|_| PipelineError::feed(format!("invalid FTP port '{}'", port)))?;
        }
        let source = Arc::new(FtpSource::new(ftp));

        let mut first_error = None;
        for product in products {
            if let Err(e) = self.deliver(ctx, Arc::clone(&source), product, &plan).await {
                warn!(product = product.key(), error = %e, "AirNow product failed");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_product_locations() {
        let bucket = TimeBucket::containing(BucketKind::Hour, Utc.with_ymd_and_hms(2016, 1, 2, 13, 5, 0).unwrap());
        assert_eq!(bucket.render(&Product::Ozone.location()), "GRIB2/US-16010213.grib2");
        assert_eq!(bucket.render(&Product::Pm25.location()), "GRIB2/US-16010213_pm25.grib2");
        assert_eq!(bucket.render(&Product::Combined.location()), "GRIB2/US-16010213_combined.grib2");
    }

    #[test]
    fn test_product_title() {
        let time = Utc.with_ymd_and_hms(2016, 1, 2, 13, 0, 0).unwrap();
        assert_eq!(
            Product::Combined.title(time),
            "AirNow Hourly Air Quality Index (Combined Ozone & PM25) - 2016-01-02 13:00 UTC"
        );
    }

    #[test]
    fn test_plan_from_days() {
        let now = Utc.with_ymd_and_hms(2016, 3, 1, 7, 40, 0).unwrap();
        assert_eq!(Plan::from_days(None, 1, 0, now).unwrap(), Plan::Latest { back_steps: 1 });
        assert_eq!(Plan::from_days(Some("1"), 2, 0, now).unwrap(), Plan::Latest { back_steps: 2 });
        assert!(Plan::from_days(Some("week"), 1, 0, now).is_err());

        assert_eq!(
            Plan::from_days(Some("3"), 1, 0, now).unwrap(),
            Plan::Backfill(vec![
                Utc.with_ymd_and_hms(2016, 2, 28, 0, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2016, 2, 29, 0, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2016, 3, 1, 0, 0, 0).unwrap(),
            ])
        );

        // Today's daily hour has not come yet
        assert_eq!(
            Plan::from_days(Some("2"), 1, 12, now).unwrap(),
            Plan::Backfill(vec![
                Utc.with_ymd_and_hms(2016, 2, 28, 12, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2016, 2, 29, 12, 0, 0).unwrap(),
            ])
        );
    }

    #[test]
    fn test_selected_products() {
        assert_eq!(selected_products(None).unwrap(), Product::ALL.to_vec());
        assert_eq!(
            selected_products(Some("pm25, ozone")).unwrap(),
            vec![Product::Pm25, Product::Ozone]
        );
        assert!(selected_products(Some("smoke")).is_err());
    }
}
