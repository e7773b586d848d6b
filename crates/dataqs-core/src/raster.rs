//! Raster artifact catalog
//!
//! Artifacts are time-stamped grid files kept on disk under
//! `{root}/{workspace}/{layer}/` and named
//! `{layer}_{YYYYMMDD}T{HH}0000000Z.{ext}`, the naming the map server's
//! mosaic time dimension expects. The file name is the only metadata.

use chrono::{DateTime, NaiveDate, TimeZone, Timelike, Utc};
use dataqs_common::DatasetName;
use regex::Regex;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::config::RasterConfig;
use crate::retention::RetentionClass;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RasterArtifact {
    pub layer: DatasetName,
    pub time: DateTime<Utc>,
    pub path: PathBuf,
}

impl RasterArtifact {
    /// `daily` when captured at `daily_hour`, otherwise `hourly`.
    pub fn class(&self, daily_hour: u32) -> RetentionClass {
        if self.time.hour() == daily_hour {
            RetentionClass::Daily
        } else {
            RetentionClass::Hourly
        }
    }
}

pub fn artifact_file_name(layer: &DatasetName, time: DateTime<Utc>, extension: &str) -> String {
    format!("{}_{}0000000Z.{}", layer, time.format("%Y%m%dT%H"), extension)
}

/// Capture time encoded in an artifact file name, if it belongs to `layer`.
pub fn parse_artifact_time(layer: &DatasetName, file_name: &str) -> Option<DateTime<Utc>> {
    let pattern = format!(r"^{}_(\d{{4}})(\d{{2}})(\d{{2}})T(\d{{2}})0000000Z\.[A-Za-z0-9]+$", regex::escape(layer.as_str()));
    let re = Regex::new(&pattern).ok()?;
    let caps = re.captures(file_name)?;

    let year = caps[1].parse().ok()?;
    let month = caps[2].parse().ok()?;
    let day = caps[3].parse().ok()?;
    let hour = caps[4].parse().ok()?;

    let naive = NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(hour, 0, 0)?;
    Some(Utc.from_utc_datetime(&naive))
}

#[derive(Debug, Clone)]
pub struct RasterCatalog {
    root: PathBuf,
    workspace: String,
}

impl RasterCatalog {
    pub fn new(config: &RasterConfig) -> Self {
        Self {
            root: config.root.clone(),
            workspace: config.workspace.clone(),
        }
    }

    pub fn layer_dir(&self, layer: &DatasetName) -> PathBuf {
        self.root.join(&self.workspace).join(layer.as_str())
    }

    /// Copy a staged file into the layer directory under its artifact name.
    ///
    /// The copy goes to a hidden temporary name first and is renamed into
    /// place, so the map server never indexes a half-written granule.
    pub fn install(
        &self,
        layer: &DatasetName,
        time: DateTime<Utc>,
        staged: &Path,
        extension: &str,
    ) -> io::Result<RasterArtifact> {
        let dir = self.layer_dir(layer);
        fs::create_dir_all(&dir)?;

        let name = artifact_file_name(layer, time, extension);
        let dest = dir.join(&name);
        let partial = dir.join(format!(".{}.partial", name));

        fs::copy(staged, &partial)?;
        if let Err(e) = fs::rename(&partial, &dest) {
            let _ = fs::remove_file(&partial);
            return Err(e);
        }

        debug!(layer = %layer, path = %dest.display(), "Installed raster artifact");
        Ok(RasterArtifact {
            layer: layer.clone(),
            time,
            path: dest,
        })
    }

    /// Artifacts of `layer`, oldest first. Unrelated files are ignored.
    pub fn list(&self, layer: &DatasetName) -> io::Result<Vec<RasterArtifact>> {
        let dir = self.layer_dir(layer);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut artifacts = Vec::new();
        for entry in entries {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(time) = parse_artifact_time(layer, &file_name.to_string_lossy()) else {
                continue;
            };
            artifacts.push(RasterArtifact {
                layer: layer.clone(),
                time,
                path: entry.path(),
            });
        }

        artifacts.sort_by(|a, b| a.time.cmp(&b.time).then_with(|| a.path.cmp(&b.path)));
        Ok(artifacts)
    }

    pub fn remove(&self, artifact: &RasterArtifact) -> io::Result<()> {
        match fs::remove_file(&artifact.path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}
