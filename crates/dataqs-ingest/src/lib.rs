//! dataqs feed jobs
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Concrete feeds built on `dataqs-core`. Each feed is a [`Job`] that the
//! pipeline runs once per schedule tick.
//!
//! # Supported Feeds
//!
//! - **mmwr**: CDC weekly mortality reports for the 122 Cities system
//! - **healthmap**: HealthMap disease outbreak alerts
//! - **usgs_quakes**: USGS earthquakes of the past day
//! - **forecastio**: forecast.io hourly near-surface air temperature grid
//! - **airnow**: AirNow hourly air quality index grids
//!
//! # Example
//!
//! ```no_run
//! use dataqs_core::{AppConfig, Pipeline};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AppConfig::load(None)?;
//!     let pipeline = Pipeline::from_config(&config).await?;
//!     let job = dataqs_ingest::find_job("usgs_quakes").expect("known job");
//!     pipeline.run(job.as_ref(), &config.job_config(job.name()), chrono::Utc::now()).await?;
//!     Ok(())
//! }
//! ```

pub mod feeds;

use dataqs_core::Job;

pub use feeds::airnow::AirNowJob;
pub use feeds::forecastio::ForecastIoJob;
pub use feeds::healthmap::HealthMapJob;
pub use feeds::mmwr::MmwrJob;
pub use feeds::usgs_quakes::UsgsQuakesJob;

/// Every bundled feed, in listing order.
pub fn all_jobs() -> Vec<Box<dyn Job>> {
    vec![
        Box::new(MmwrJob),
        Box::new(HealthMapJob),
        Box::new(UsgsQuakesJob),
        Box::new(ForecastIoJob),
        Box::new(AirNowJob),
    ]
}

pub fn find_job(name: &str) -> Option<Box<dyn Job>> {
    all_jobs().into_iter().find(|job| job.name() == name)
}
