//! Configuration management
//!
//! [`AppConfig`] is read once per process from `dataqs.toml` (or the path
//! given on the command line) merged with `DATAQS_*` environment variables,
//! nested with `__` (`DATAQS_DATABASE__URL`, `DATAQS_JOBS__HEALTHMAP__TOKEN`).
//! Each run then receives an immutable [`JobConfig`].

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::normalize::NormalizationPolicy;
use crate::retention::RetentionPolicy;

// ============================================================================
// Configuration Constants
// ============================================================================

/// Default configuration file name, resolved against the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "dataqs.toml";

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "DATAQS_";

/// Records sent to the store per statement.
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Upper bound for any single remote call (HTTP, FTP, store statement).
pub const DEFAULT_REMOTE_TIMEOUT_SECS: u64 = 120;

pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 5;

pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Hour (UTC) whose raster artifacts are kept as the daily series.
pub const DEFAULT_DAILY_HOUR: u32 = 0;

pub const DEFAULT_USER_AGENT: &str = concat!("dataqs/", env!("CARGO_PKG_VERSION"));

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Unknown job: {0}")]
    UnknownJob(String),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        ConfigError::Load(Box::new(err))
    }
}

/// Which backend holds datasets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Postgres,
    Document,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub store: StoreBackend,
    pub database: DatabaseConfig,
    pub document_store: DocumentStoreConfig,
    pub staging: StagingConfig,
    pub raster: RasterConfig,
    pub geoserver: GeoServerConfig,
    pub defaults: JobDefaults,
    pub jobs: BTreeMap<String, JobSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
            connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentStoreConfig {
    pub root: PathBuf,
}

impl Default for DocumentStoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./data/documents"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StagingConfig {
    /// Parent directory for per-run staging directories.
    pub root: PathBuf,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            root: std::env::temp_dir(),
        }
    }
}

/// Where raster artifacts live and how they are classified.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RasterConfig {
    /// Artifacts go to `{root}/{workspace}/{layer}/`.
    pub root: PathBuf,
    pub workspace: String,
    pub daily_hour: u32,
}

impl Default for RasterConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./data/geodata"),
            workspace: "geonode".to_string(),
            daily_hour: DEFAULT_DAILY_HOUR,
        }
    }
}

/// GeoServer REST endpoint. Without a URL, layer changes are only logged.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeoServerConfig {
    pub url: Option<String>,
    pub username: String,
    pub password: String,
    pub workspace: String,
    pub datastore: String,
}

impl Default for GeoServerConfig {
    fn default() -> Self {
        Self {
            url: None,
            username: "admin".to_string(),
            password: "geoserver".to_string(),
            workspace: "geonode".to_string(),
            datastore: "datastore".to_string(),
        }
    }
}

impl std::fmt::Debug for GeoServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeoServerConfig")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &"***")
            .field("workspace", &self.workspace)
            .field("datastore", &self.datastore)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobDefaults {
    pub batch_size: usize,
    pub remote_timeout_secs: u64,
    pub user_agent: String,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            remote_timeout_secs: DEFAULT_REMOTE_TIMEOUT_SECS,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

/// Per-job overrides as they appear under `[jobs.<name>]`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct JobSettings {
    pub base_url: Option<String>,
    /// `user:password`
    pub account: Option<String>,
    pub token: Option<String>,
    pub batch_size: Option<usize>,
    pub remote_timeout_secs: Option<u64>,
    pub back_steps: Option<u32>,
    pub strict: Option<bool>,
    /// Keyed by dataset name or raster retention class.
    pub retention: BTreeMap<String, RetentionSettings>,
    pub options: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct RetentionSettings {
    pub max_age_hours: Option<u64>,
    pub max_age_days: Option<u64>,
    pub max_count: Option<u64>,
}

impl RetentionSettings {
    fn to_policy(self) -> RetentionPolicy {
        let max_age = self
            .max_age_hours
            .map(|h| Duration::from_secs(h * 3600))
            .or_else(|| self.max_age_days.map(|d| Duration::from_secs(d * 86_400)));
        RetentionPolicy {
            max_age,
            max_count: self.max_count,
        }
    }
}

/// Username and password for a remote source.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    /// Parse a `user:password` account string.
    pub fn parse_account(account: &str) -> Option<Self> {
        let (username, password) = account.split_once(':')?;
        if username.is_empty() {
            return None;
        }
        Some(Self {
            username: username.to_string(),
            password: password.to_string(),
        })
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Everything a single run needs, resolved from [`AppConfig`].
#[derive(Debug, Clone)]
pub struct JobConfig {
    pub name: String,
    pub base_url: Option<String>,
    pub credentials: Option<Credentials>,
    pub token: Option<String>,
    pub batch_size: usize,
    pub remote_timeout: Duration,
    pub user_agent: String,
    pub back_steps: Option<u32>,
    pub normalization: Option<NormalizationPolicy>,
    pub retention: BTreeMap<String, RetentionPolicy>,
    pub options: BTreeMap<String, String>,
    pub staging_root: PathBuf,
    pub raster: RasterConfig,
}

impl JobConfig {
    /// Defaults only; handy for tests and for jobs without a config section.
    pub fn new(name: impl Into<String>) -> Self {
        let defaults = JobDefaults::default();
        Self {
            name: name.into(),
            base_url: None,
            credentials: None,
            token: None,
            batch_size: defaults.batch_size,
            remote_timeout: Duration::from_secs(defaults.remote_timeout_secs),
            user_agent: defaults.user_agent,
            back_steps: None,
            normalization: None,
            retention: BTreeMap::new(),
            options: BTreeMap::new(),
            staging_root: StagingConfig::default().root,
            raster: RasterConfig::default(),
        }
    }

    pub fn base_url_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.base_url.as_deref().unwrap_or(default)
    }

    pub fn back_steps_or(&self, default: u32) -> u32 {
        self.back_steps.unwrap_or(default)
    }

    pub fn normalization_or(&self, default: NormalizationPolicy) -> NormalizationPolicy {
        self.normalization.unwrap_or(default)
    }

    /// Configured policy for a dataset or retention class, else `default`.
    pub fn retention_or(&self, key: &str, default: RetentionPolicy) -> RetentionPolicy {
        self.retention.get(key).copied().unwrap_or(default)
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }
}

impl AppConfig {
    /// Load from `path` (or `dataqs.toml`) and the environment.
    ///
    /// A missing file is not an error; everything has a default.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        Self::from_figment(figment)
    }

    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: AppConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.store == StoreBackend::Postgres
            && self.database.url.as_deref().map_or(true, str::is_empty)
        {
            return Err(ConfigError::Invalid(
                "database.url is required for the postgres store".to_string(),
            ));
        }

        if self.database.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "database.max_connections must be greater than 0".to_string(),
            ));
        }

        if self.defaults.batch_size == 0 {
            return Err(ConfigError::Invalid("defaults.batch_size must be greater than 0".to_string()));
        }

        if self.defaults.remote_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "defaults.remote_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.raster.daily_hour > 23 {
            return Err(ConfigError::Invalid("raster.daily_hour must be 0-23".to_string()));
        }

        for (name, job) in &self.jobs {
            if job.batch_size == Some(0) {
                return Err(ConfigError::Invalid(format!("jobs.{}.batch_size must be greater than 0", name)));
            }
            if let Some(account) = &job.account {
                if Credentials::parse_account(account).is_none() {
                    return Err(ConfigError::Invalid(format!(
                        "jobs.{}.account must look like user:password",
                        name
                    )));
                }
            }
            for (key, retention) in &job.retention {
                if retention.max_age_hours.is_some() && retention.max_age_days.is_some() {
                    return Err(ConfigError::Invalid(format!(
                        "jobs.{}.retention.{}: set max_age_hours or max_age_days, not both",
                        name, key
                    )));
                }
                if retention.max_count == Some(0) {
                    return Err(ConfigError::Invalid(format!(
                        "jobs.{}.retention.{}.max_count must be greater than 0",
                        name, key
                    )));
                }
            }
        }

        Ok(())
    }

    /// Resolve the immutable configuration for one run of `name`.
    ///
    /// Jobs without a `[jobs.<name>]` section run on defaults.
    pub fn job_config(&self, name: &str) -> JobConfig {
        let settings = self.jobs.get(name).cloned().unwrap_or_default();

        JobConfig {
            name: name.to_string(),
            base_url: settings.base_url,
            credentials: settings.account.as_deref().and_then(Credentials::parse_account),
            token: settings.token,
            batch_size: settings.batch_size.unwrap_or(self.defaults.batch_size),
            remote_timeout: Duration::from_secs(
                settings
                    .remote_timeout_secs
                    .unwrap_or(self.defaults.remote_timeout_secs),
            ),
            user_agent: self.defaults.user_agent.clone(),
            back_steps: settings.back_steps,
            normalization: settings.strict.map(|strict| {
                if strict {
                    NormalizationPolicy::Strict
                } else {
                    NormalizationPolicy::Lenient
                }
            }),
            retention: settings
                .retention
                .into_iter()
                .map(|(key, r)| (key, r.to_policy()))
                .collect(),
            options: settings.options,
            staging_root: self.staging.root.clone(),
            raster: self.raster.clone(),
        }
    }
}
