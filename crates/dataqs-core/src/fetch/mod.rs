//! Resource fetching
//!
//! A [`Fetcher`] renders a location template per [`TimeBucket`], pulls the
//! payload through a [`ResourceSource`], validates it and stages exactly one
//! file for the bucket that succeeded. Failed attempts leave nothing behind.

pub mod bucket;
pub mod ftp;
pub mod http;
pub mod validate;

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

pub use bucket::{BucketKind, FallbackPolicy, FallbackSearch, FallbackState, TimeBucket};
pub use ftp::{FtpConfig, FtpSource};
pub use http::{HttpAuth, HttpSource};
pub use validate::ExpectedFormat;

use crate::error::{PipelineError, Result};
use crate::staging::StagingArea;

/// Failure of a single attempt. Recoverable by the fallback search.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{location} returned status {status}")]
    Status { location: String, status: u16 },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("FTP error: {0}")]
    Ftp(String),

    #[error("Payload rejected: {0}")]
    Invalid(String),

    #[error("Payload larger than {limit} bytes")]
    TooLarge { limit: u64 },

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Transport for one kind of remote location.
#[async_trait]
pub trait ResourceSource: Send + Sync {
    /// Short name for logs ("http", "ftp").
    fn scheme(&self) -> &str;

    /// Retrieve the full payload at `location`.
    async fn retrieve(&self, location: &str) -> std::result::Result<Vec<u8>, FetchError>;
}

/// What to fetch and how to stage it.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// Name used in errors and logs.
    pub resource: String,
    pub start: TimeBucket,
    /// Location template, see [`TimeBucket::render`].
    pub location: String,
    /// Staged files are named `{file_prefix}_{bucket label}.{extension}`.
    pub file_prefix: String,
    pub extension: String,
    pub format: ExpectedFormat,
    pub decompress_gzip: bool,
}

impl FetchRequest {
    pub fn new(resource: impl Into<String>, start: TimeBucket, location: impl Into<String>) -> Self {
        let resource = resource.into();
        Self {
            file_prefix: resource.clone(),
            resource,
            start,
            location: location.into(),
            extension: "dat".to_string(),
            format: ExpectedFormat::Any,
            decompress_gzip: false,
        }
    }

    pub fn file_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.file_prefix = prefix.into();
        self
    }

    pub fn extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    pub fn format(mut self, format: ExpectedFormat) -> Self {
        self.format = format;
        self
    }

    pub fn decompress_gzip(mut self, decompress: bool) -> Self {
        self.decompress_gzip = decompress;
        self
    }

    fn staged_name(&self, bucket: &TimeBucket) -> String {
        format!("{}_{}.{}", self.file_prefix, bucket.label(), self.extension)
    }
}

/// A staged payload and the bucket it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetched {
    pub path: PathBuf,
    pub bucket: TimeBucket,
    pub digest: String,
    pub bytes: u64,
}

pub struct Fetcher<'a> {
    source: Arc<dyn ResourceSource>,
    staging: &'a StagingArea,
    timeout: Duration,
}

impl<'a> Fetcher<'a> {
    pub fn new(source: Arc<dyn ResourceSource>, staging: &'a StagingArea, timeout: Duration) -> Self {
        Self {
            source,
            staging,
            timeout,
        }
    }

    /// Walk the fallback search until one bucket yields a valid payload.
    pub async fn fetch(&self, request: &FetchRequest, policy: &FallbackPolicy) -> Result<Fetched> {
        let mut search = FallbackSearch::new(request.start, *policy);
        let mut attempts = 0usize;

        while let Some(bucket) = search.current() {
            attempts += 1;
            let name = request.staged_name(&bucket);

            if self.staging.contains(&name) {
                debug!(resource = %request.resource, file = %name, "Reusing staged file");
                let staged = self.staging.existing(&name)?;
                search.succeed();
                return Ok(Fetched {
                    path: staged.path,
                    bucket,
                    digest: staged.digest,
                    bytes: staged.bytes,
                });
            }

            let location = bucket.render(&request.location);
            match self.attempt(request, &location).await {
                Ok(payload) => {
                    let staged = self.staging.write_new(&name, &payload).map_err(PipelineError::Staging)?;
                    search.succeed();
                    info!(
                        resource = %request.resource,
                        source = self.source.scheme(),
                        bucket = %bucket,
                        bytes = staged.bytes,
                        sha256 = %staged.digest,
                        attempts,
                        "Fetched resource"
                    );
                    return Ok(Fetched {
                        path: staged.path,
                        bucket,
                        digest: staged.digest,
                        bytes: staged.bytes,
                    });
                },
                Err(e) => {
                    let next = search.fail();
                    warn!(
                        resource = %request.resource,
                        location = %location,
                        error = %e,
                        next = ?next,
                        "Fetch attempt failed"
                    );
                },
            }
        }

        Err(PipelineError::ResourceUnavailable {
            resource: request.resource.clone(),
            attempts,
        })
    }

    async fn attempt(&self, request: &FetchRequest, location: &str) -> std::result::Result<Vec<u8>, FetchError> {
        let payload = tokio::time::timeout(self.timeout, self.source.retrieve(location))
            .await
            .map_err(|_| FetchError::Timeout(self.timeout))??;

        let payload = if request.decompress_gzip {
            validate::maybe_gunzip(payload)?
        } else {
            payload
        };

        request.format.check(&payload)?;
        Ok(payload)
    }
}
