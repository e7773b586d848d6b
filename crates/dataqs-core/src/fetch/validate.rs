//! Payload checks applied before anything is staged

use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use std::io::Read;

use super::FetchError;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const TIFF_LE: [u8; 4] = *b"II*\0";
const TIFF_BE: [u8; 4] = *b"MM\0*";
const GRIB_MAGIC: &[u8] = b"GRIB";

/// Bytes inspected when sniffing for an HTML error page.
const SNIFF_LEN: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpectedFormat {
    /// Delimited or free text.
    Text,
    Json,
    GeoTiff,
    Grib,
    /// Only the HTML and empty checks apply.
    Any,
}

impl ExpectedFormat {
    pub fn check(&self, payload: &[u8]) -> Result<(), FetchError> {
        if payload.iter().all(u8::is_ascii_whitespace) {
            return Err(FetchError::Invalid("empty payload".to_string()));
        }
        if looks_like_html(payload) {
            return Err(FetchError::Invalid("received an HTML page".to_string()));
        }

        match self {
            ExpectedFormat::Text | ExpectedFormat::Any => Ok(()),
            ExpectedFormat::Json => serde_json::from_slice::<serde_json::Value>(payload)
                .map(|_| ())
                .map_err(|e| FetchError::Invalid(format!("malformed JSON: {}", e))),
            ExpectedFormat::GeoTiff => {
                if payload.starts_with(&TIFF_LE) || payload.starts_with(&TIFF_BE) {
                    Ok(())
                } else {
                    Err(FetchError::Invalid("missing TIFF header".to_string()))
                }
            },
            ExpectedFormat::Grib => {
                if payload.starts_with(GRIB_MAGIC) {
                    Ok(())
                } else {
                    Err(FetchError::Invalid("missing GRIB header".to_string()))
                }
            },
        }
    }
}

pub fn is_gzip(payload: &[u8]) -> bool {
    payload.starts_with(&GZIP_MAGIC)
}

/// Decompress gzip payloads; anything else is returned unchanged.
pub fn maybe_gunzip(payload: Vec<u8>) -> Result<Vec<u8>, FetchError> {
    if !is_gzip(&payload) {
        return Ok(payload);
    }

    let mut decoded = Vec::with_capacity(payload.len() * 4);
    GzDecoder::new(payload.as_slice())
        .read_to_end(&mut decoded)
        .map_err(|e| FetchError::Invalid(format!("corrupt gzip stream: {}", e)))?;
    Ok(decoded)
}

/// Upstream servers answer missing files with a 200 and an HTML page.
pub fn looks_like_html(payload: &[u8]) -> bool {
    let head = &payload[..payload.len().min(SNIFF_LEN)];
    let text = String::from_utf8_lossy(head);
    let trimmed = text.trim_start().to_ascii_lowercase();
    trimmed.starts_with("<html") || trimmed.starts_with("<!doctype html")
}
