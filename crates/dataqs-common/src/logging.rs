//! Logging Configuration and Initialization
//!
//! Every dataqs binary sets up tracing through this module. It supports:
//!
//! - Console, file or both as output targets
//! - Text or JSON formatting
//! - Daily rotated log files
//! - Configuration from `DATAQS_LOG_*` environment variables
//!
//! Library code never prints. Use the tracing macros with structured fields:
//!
//! ```rust,ignore
//! use tracing::{info, warn};
//!
//! info!(dataset = %dataset, inserted = result.inserted, "Upsert complete");
//! warn!(error = %err, slot = %slot, "Failed to drop previous slot");
//! ```
//!
//! Each job run executes inside the span returned by [`run_span`], so every
//! event emitted during the run carries the job name and run id.
//!
//! # Example
//!
//! ```no_run
//! use dataqs_common::logging::{init_logging, LogConfig};
//! use tracing::info;
//!
//! fn main() -> dataqs_common::Result<()> {
//!     let config = LogConfig::from_env()?;
//!     init_logging(&config)?;
//!
//!     info!("dataqs-ingest started");
//!     Ok(())
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{Level, Span};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, MakeWriter},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::error::{DataqsError, Result};
use crate::types::RunId;

/// Prefix shared by all logging environment variables
pub const ENV_PREFIX: &str = "DATAQS_LOG_";

/// Log level for filtering messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = DataqsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(DataqsError::Config(format!("Invalid log level: {}", s))),
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

/// Output target for logs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Console,
    File,
    Both,
}

impl std::str::FromStr for LogOutput {
    type Err = DataqsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "console" | "stdout" => Ok(LogOutput::Console),
            "file" => Ok(LogOutput::File),
            "both" | "all" => Ok(LogOutput::Both),
            _ => Err(DataqsError::Config(format!("Invalid log output: {}", s))),
        }
    }
}

impl std::fmt::Display for LogOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogOutput::Console => write!(f, "console"),
            LogOutput::File => write!(f, "file"),
            LogOutput::Both => write!(f, "both"),
        }
    }
}

/// Log line format
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = DataqsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => Err(DataqsError::Config(format!("Invalid log format: {}", s))),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Text => write!(f, "text"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub level: LogLevel,

    pub output: LogOutput,

    pub format: LogFormat,

    /// Directory for log files (only used when output includes file)
    pub log_dir: PathBuf,

    /// Log file name prefix ("dataqs-ingest" -> "dataqs-ingest.2024-01-18")
    pub log_file_prefix: String,

    /// Extra filter directives, e.g. "sqlx=warn,suppaftp=info"
    pub filter_directives: Option<String>,

    pub include_location: bool,

    pub include_thread_ids: bool,

    pub include_targets: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            output: LogOutput::Console,
            format: LogFormat::Text,
            log_dir: PathBuf::from("./logs"),
            log_file_prefix: "dataqs".to_string(),
            // sqlx logs every statement at info
            filter_directives: Some("sqlx=warn".to_string()),
            include_location: false,
            include_thread_ids: false,
            include_targets: true,
        }
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from environment variables
    ///
    /// - `DATAQS_LOG_LEVEL`: trace, debug, info, warn, error
    /// - `DATAQS_LOG_OUTPUT`: console, file, both
    /// - `DATAQS_LOG_FORMAT`: text, json
    /// - `DATAQS_LOG_DIR`: directory for log files
    /// - `DATAQS_LOG_FILE_PREFIX`: prefix for log files
    /// - `DATAQS_LOG_FILTER`: additional filter directives
    /// - `DATAQS_LOG_INCLUDE_LOCATION`, `DATAQS_LOG_INCLUDE_THREAD_IDS`,
    ///   `DATAQS_LOG_INCLUDE_TARGETS`: true/false
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(format!("{}{}", ENV_PREFIX, key)).ok())
    }

    /// Same as [`LogConfig::from_env`] but reads keys (without prefix) from `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(level) = lookup("LEVEL") {
            config.level = level.parse()?;
        }
        if let Some(output) = lookup("OUTPUT") {
            config.output = output.parse()?;
        }
        if let Some(format) = lookup("FORMAT") {
            config.format = format.parse()?;
        }
        if let Some(dir) = lookup("DIR") {
            config.log_dir = PathBuf::from(dir);
        }
        if let Some(prefix) = lookup("FILE_PREFIX") {
            config.log_file_prefix = prefix;
        }
        if let Some(filter) = lookup("FILTER") {
            config.filter_directives = Some(filter);
        }
        if let Some(val) = lookup("INCLUDE_LOCATION") {
            config.include_location = val.parse().unwrap_or(false);
        }
        if let Some(val) = lookup("INCLUDE_THREAD_IDS") {
            config.include_thread_ids = val.parse().unwrap_or(false);
        }
        if let Some(val) = lookup("INCLUDE_TARGETS") {
            config.include_targets = val.parse().unwrap_or(true);
        }

        Ok(config)
    }

    /// True if any `DATAQS_LOG_*` variable is set.
    pub fn env_present() -> bool {
        std::env::vars().any(|(key, _)| key.starts_with(ENV_PREFIX))
    }

    pub fn builder() -> LogConfigBuilder {
        LogConfigBuilder::default()
    }

    fn build_filter(&self) -> Result<EnvFilter> {
        let mut filter =
            EnvFilter::from_default_env().add_directive(self.level.to_tracing_level().into());

        if let Some(ref directives) = self.filter_directives {
            for directive in directives.split(',').filter(|d| !d.trim().is_empty()) {
                let parsed = directive.trim().parse().map_err(|e| {
                    DataqsError::Logging(format!("bad filter directive '{}': {}", directive, e))
                })?;
                filter = filter.add_directive(parsed);
            }
        }

        Ok(filter)
    }
}

/// Builder for LogConfig
#[derive(Default)]
pub struct LogConfigBuilder {
    config: LogConfig,
}

impl LogConfigBuilder {
    pub fn level(mut self, level: LogLevel) -> Self {
        self.config.level = level;
        self
    }

    pub fn output(mut self, output: LogOutput) -> Self {
        self.config.output = output;
        self
    }

    pub fn format(mut self, format: LogFormat) -> Self {
        self.config.format = format;
        self
    }

    pub fn log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.log_dir = dir.into();
        self
    }

    pub fn log_file_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.log_file_prefix = prefix.into();
        self
    }

    pub fn filter_directives(mut self, filter: impl Into<String>) -> Self {
        self.config.filter_directives = Some(filter.into());
        self
    }

    pub fn include_location(mut self, include: bool) -> Self {
        self.config.include_location = include;
        self
    }

    pub fn include_thread_ids(mut self, include: bool) -> Self {
        self.config.include_thread_ids = include;
        self
    }

    pub fn include_targets(mut self, include: bool) -> Self {
        self.config.include_targets = include;
        self
    }

    pub fn build(self) -> LogConfig {
        self.config
    }
}

/// Install the global tracing subscriber.
///
/// Call once at process start. A second call fails because a global
/// subscriber is already set.
pub fn init_logging(config: &LogConfig) -> Result<()> {
    let filter = config.build_filter()?;

    let console = matches!(config.output, LogOutput::Console | LogOutput::Both)
        .then(|| fmt_layer(config, std::io::stdout, true));

    let file = match config.output {
        LogOutput::File | LogOutput::Both => {
            std::fs::create_dir_all(&config.log_dir)?;
            let appender =
                tracing_appender::rolling::daily(&config.log_dir, &config.log_file_prefix);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            // Flushes on drop; the writer has to outlive every span.
            std::mem::forget(guard);
            Some(fmt_layer(config, non_blocking, false))
        },
        LogOutput::Console => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init()
        .map_err(|e| DataqsError::Logging(e.to_string()))
}

fn fmt_layer<S, W>(config: &LogConfig, writer: W, ansi: bool) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(config.include_targets)
        .with_thread_ids(config.include_thread_ids)
        .with_file(config.include_location)
        .with_line_number(config.include_location)
        .with_span_events(FmtSpan::CLOSE);

    match config.format {
        LogFormat::Text => layer.boxed(),
        LogFormat::Json => layer.json().boxed(),
    }
}

/// Span wrapping a single job run.
pub fn run_span(job: &str, run_id: RunId) -> Span {
    tracing::info_span!("ingest_run", job = %job, run_id = %run_id)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::collections::HashMap;

    #[test]
    fn test_log_level_from_str() {
        assert_eq!("trace".parse::<LogLevel>().unwrap(), LogLevel::Trace);
        assert_eq!("DEBUG".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert_eq!("warning".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_log_output_and_format_from_str() {
        assert_eq!("both".parse::<LogOutput>().unwrap(), LogOutput::Both);
        assert_eq!("stdout".parse::<LogOutput>().unwrap(), LogOutput::Console);
        assert!("syslog".parse::<LogOutput>().is_err());
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("LEVEL", "debug"),
            ("OUTPUT", "file"),
            ("FORMAT", "json"),
            ("DIR", "/var/log/dataqs"),
            ("INCLUDE_TARGETS", "false"),
        ]
        .into_iter()
        .collect();

        let config = LogConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(config.level, LogLevel::Debug);
        assert_eq!(config.output, LogOutput::File);
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.log_dir, PathBuf::from("/var/log/dataqs"));
        assert!(!config.include_targets);
        assert_eq!(config.log_file_prefix, "dataqs");
    }

    #[test]
    fn test_from_lookup_rejects_bad_level() {
        let result = LogConfig::from_lookup(|k| (k == "LEVEL").then(|| "shout".to_string()));
        assert!(result.is_err());
    }

    #[test]
    #[serial]
    fn test_from_env() {
        std::env::set_var("DATAQS_LOG_LEVEL", "warn");
        std::env::set_var("DATAQS_LOG_FILE_PREFIX", "nightly");
        let present = LogConfig::env_present();
        let config = LogConfig::from_env();
        std::env::remove_var("DATAQS_LOG_LEVEL");
        std::env::remove_var("DATAQS_LOG_FILE_PREFIX");

        assert!(present);
        let config = config.unwrap();
        assert_eq!(config.level, LogLevel::Warn);
        assert_eq!(config.log_file_prefix, "nightly");
        assert_eq!(config.output, LogOutput::Console);
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_bad_output() {
        std::env::set_var("DATAQS_LOG_OUTPUT", "syslog");
        let config = LogConfig::from_env();
        std::env::remove_var("DATAQS_LOG_OUTPUT");

        assert!(config.is_err());
    }

    #[test]
    fn test_config_builder() {
        let config = LogConfig::builder()
            .level(LogLevel::Warn)
            .output(LogOutput::Both)
            .log_file_prefix("dataqs-ingest")
            .filter_directives("reqwest=info")
            .build();

        assert_eq!(config.level, LogLevel::Warn);
        assert_eq!(config.output, LogOutput::Both);
        assert_eq!(config.log_file_prefix, "dataqs-ingest");
        assert_eq!(config.filter_directives.as_deref(), Some("reqwest=info"));
    }

    #[test]
    fn test_bad_filter_directive() {
        let config = LogConfig::builder().filter_directives("sqlx=[[[").build();
        assert!(config.build_filter().is_err());
    }
}
