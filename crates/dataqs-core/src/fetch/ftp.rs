//! FTP resource source
//!
//! suppaftp's blocking client runs on the blocking pool, one session per
//! retrieval. Transient failures (connect, login, data channel) are retried
//! with a linear backoff; a missing file is reported at once so the fallback
//! search can move to the next bucket.
//!
//! ```rust,ignore
//! use dataqs_core::fetch::{FtpConfig, FtpSource};
//!
//! let source = FtpSource::new(FtpConfig {
//!     host: "ftp.airnowapi.org".to_string(),
//!     ..FtpConfig::default()
//! });
//! let grib = source.retrieve("GRIB2/US-16010213.grib2").await?;
//! ```

use async_trait::async_trait;
use std::io::Read;
use std::net::ToSocketAddrs;
use std::time::Duration;
use suppaftp::types::{FileType, Response};
use suppaftp::{FtpError, FtpStream, Mode, Status};
use tracing::{debug, info, warn};

use super::http::DEFAULT_MAX_BYTES;
use super::{FetchError, ResourceSource};
use crate::config::Credentials;

pub const MAX_RETRIES: u32 = 3;

/// Bound on connecting and on each control or data channel read.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Base delay between attempts; attempt `n` waits `n` times this.
pub const RETRY_DELAY_SECS: u64 = 5;

#[derive(Debug, Clone)]
pub struct FtpConfig {
    pub host: String,
    pub port: u16,
    pub credentials: Credentials,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub io_timeout: Duration,
    pub max_bytes: u64,
}

impl Default for FtpConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 21,
            credentials: Credentials {
                username: "anonymous".to_string(),
                password: "anonymous@".to_string(),
            },
            max_retries: MAX_RETRIES,
            retry_delay: Duration::from_secs(RETRY_DELAY_SECS),
            io_timeout: DEFAULT_IO_TIMEOUT,
            max_bytes: DEFAULT_MAX_BYTES,
        }
    }
}

pub struct FtpSource {
    config: FtpConfig,
}

impl FtpSource {
    pub fn new(config: FtpConfig) -> Self {
        Self { config }
    }

    fn retrieve_sync(config: &FtpConfig, path: &str) -> Result<Vec<u8>, FetchError> {
        debug!(host = %config.host, port = config.port, "Connecting to FTP server");

        let addr = (config.host.as_str(), config.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| FetchError::Ftp(format!("cannot resolve {}", config.host)))?;
        let mut ftp_stream = FtpStream::connect_timeout(addr, config.io_timeout).map_err(ftp_error)?;
        ftp_stream.get_ref().set_read_timeout(Some(config.io_timeout))?;
        ftp_stream.get_ref().set_write_timeout(Some(config.io_timeout))?;

        ftp_stream.set_mode(Mode::ExtendedPassive);

        ftp_stream
            .login(&config.credentials.username, &config.credentials.password)
            .map_err(ftp_error)?;
        ftp_stream.transfer_type(FileType::Binary).map_err(ftp_error)?;

        debug!(path = %path, "RETR");
        let max_bytes = config.max_bytes;
        let data = match ftp_stream.retr(path, |reader| {
            read_capped(reader, max_bytes).map_err(FtpError::ConnectionError)
        }) {
            Ok(data) => data,
            Err(e) => {
                let _ = ftp_stream.quit();
                return Err(match e {
                    FtpError::UnexpectedResponse(Response {
                        status: Status::FileUnavailable,
                        ..
                    }) => FetchError::NotFound(path.to_string()),
                    other => ftp_error(other),
                });
            },
        };

        if let Err(e) = ftp_stream.quit() {
            warn!(error = %e, "Failed to quit FTP session gracefully");
        }

        if data.len() as u64 > max_bytes {
            return Err(FetchError::TooLarge { limit: max_bytes });
        }
        Ok(data)
    }
}

/// Read at most one byte past `max_bytes`, enough to tell an oversized
/// payload apart without buffering all of it.
fn read_capped(reader: &mut dyn Read, max_bytes: u64) -> std::io::Result<Vec<u8>> {
    let mut data = Vec::new();
    reader.take(max_bytes.saturating_add(1)).read_to_end(&mut data)?;
    Ok(data)
}

fn ftp_error(err: FtpError) -> FetchError {
    FetchError::Ftp(err.to_string())
}

#[async_trait]
impl ResourceSource for FtpSource {
    fn scheme(&self) -> &str {
        "ftp"
    }

    async fn retrieve(&self, location: &str) -> Result<Vec<u8>, FetchError> {
        let attempts = self.config.max_retries.max(1);

        for attempt in 1..=attempts {
            let result = tokio::task::spawn_blocking({
                let config = self.config.clone();
                let path = location.to_string();
                move || Self::retrieve_sync(&config, &path)
            })
            .await
            .map_err(|e| FetchError::Ftp(format!("FTP task panicked: {}", e)))?;

            match result {
                Ok(data) => {
                    info!(path = %location, bytes = data.len(), "Downloaded via FTP");
                    return Ok(data);
                },
                Err(e @ (FetchError::NotFound(_) | FetchError::TooLarge { .. })) => return Err(e),
                Err(e) if attempt < attempts => {
                    let delay = self.config.retry_delay * attempt;
                    warn!(
                        attempt,
                        max = attempts,
                        error = %e,
                        "FTP download failed, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                },
                Err(e) => return Err(e),
            }
        }

        Err(FetchError::Ftp(format!("no attempts made for {}", location)))
    }
}
