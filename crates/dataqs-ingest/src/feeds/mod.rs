//! Feed implementations and the helpers they share

pub mod airnow;
pub mod forecastio;
pub mod healthmap;
pub mod mmwr;
pub mod usgs_quakes;

use chrono::{DateTime, NaiveDate, Utc};
use dataqs_core::config::JobConfig;
use dataqs_core::fetch::{HttpAuth, HttpSource, ResourceSource};
use dataqs_core::{PipelineError, Result};
use std::path::Path;
use std::sync::Arc;

/// HTTP source with the job's user agent, timeout and optional auth.
pub(crate) fn http_source(config: &JobConfig, auth: HttpAuth) -> Result<Arc<dyn ResourceSource>> {
    let source = HttpSource::new(&config.user_agent, config.remote_timeout)
        .map_err(|e| PipelineError::feed(format!("HTTP client: {}", e)))?
        .with_auth(auth);
    Ok(Arc::new(source))
}

/// Fill the `{layername}` placeholder of a bundled SLD.
pub(crate) fn style_for(template: &str, layer: &str) -> String {
    template.replace("{layername}", layer)
}

pub(crate) async fn read_staged(path: &Path) -> Result<Vec<u8>> {
    Ok(tokio::fs::read(path).await?)
}

/// A `YYYY-MM-DD` job option as midnight UTC.
pub(crate) fn date_option(config: &JobConfig, key: &str) -> Result<Option<DateTime<Utc>>> {
    let Some(value) = config.option(key) else {
        return Ok(None);
    };
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| Some(dt.and_utc()))
        .ok_or_else(|| PipelineError::feed(format!("option {} must be YYYY-MM-DD, got '{}'", key, value)))
}

/// Parse a number that upstream may send as a JSON number or a string.
pub(crate) fn json_f64(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub(crate) fn json_text(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) if s.is_empty() => None,
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}
