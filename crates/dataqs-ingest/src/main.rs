//! dataqs-ingest - run scheduled feed jobs

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use clap::Parser;
use dataqs_common::logging::{init_logging, LogConfig, LogLevel};
use dataqs_core::{AppConfig, Pipeline};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "dataqs-ingest")]
#[command(author, version, about = "Scheduled geospatial feed ingestion")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Parser, Debug)]
enum Command {
    /// Run one feed job once
    Run {
        /// Job name, see `list`
        job: String,

        /// Configuration file
        #[arg(short, long, default_value = "dataqs.toml")]
        config: PathBuf,

        /// Run as if it were this time (RFC 3339, `YYYY-MM-DDTHH` or `YYYY-MM-DD`)
        #[arg(short, long, value_parser = parse_reference_time)]
        reference_time: Option<DateTime<Utc>>,
    },

    /// List available jobs
    List,
}

fn parse_reference_time(value: &str) -> std::result::Result<DateTime<Utc>, String> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(&format!("{}:00:00", value), "%Y-%m-%dT%H:%M:%S") {
        return Ok(Utc.from_utc_datetime(&dt));
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| Utc.from_utc_datetime(&dt))
        .ok_or_else(|| format!("'{}' is not a recognized time", value))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = if LogConfig::env_present() {
        LogConfig::from_env()?
    } else {
        LogConfig::builder()
            .level(log_level)
            .log_file_prefix("dataqs-ingest".to_string())
            .build()
    };

    init_logging(&log_config)?;

    match cli.command {
        Command::List => {
            for job in dataqs_ingest::all_jobs() {
                println!("{:<14} {}", job.name(), job.description());
            }
        },
        Command::Run {
            job,
            config,
            reference_time,
        } => {
            let job = dataqs_ingest::find_job(&job)
                .ok_or_else(|| anyhow::anyhow!("unknown job '{}', try `dataqs-ingest list`", job))?;

            let app_config = AppConfig::load(Some(config.as_path()))
                .with_context(|| format!("loading configuration from {}", config.display()))?;
            let pipeline = Pipeline::from_config(&app_config)
                .await
                .context("connecting store and notifier")?;

            let reference_time = reference_time.unwrap_or_else(Utc::now);
            let stats = pipeline
                .run(job.as_ref(), &app_config.job_config(job.name()), reference_time)
                .await
                .with_context(|| format!("job {} failed", job.name()))?;

            info!(
                job = job.name(),
                datasets = ?stats.datasets,
                inserted = stats.records_inserted,
                duration_secs = stats.duration_secs,
                "Ingestion complete"
            );
        },
    }

    Ok(())
}
