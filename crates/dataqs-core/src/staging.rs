//! Per-run scratch directory
//!
//! Each run owns one directory named after its prefix. Downloads land there
//! before they are normalized or moved into the raster catalog. The
//! directory is removed by [`StagingArea::cleanup`] at the end of the run,
//! and by `Drop` if the run unwinds before reaching cleanup.

use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, warn};

#[derive(Debug)]
pub struct StagingArea {
    dir: Option<TempDir>,
    path: PathBuf,
    prefix: String,
}

/// A file written into the staging area.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    pub path: PathBuf,
    /// Lowercase hex SHA-256 of the file contents.
    pub digest: String,
    pub bytes: u64,
}

impl StagingArea {
    /// Create a fresh staging directory under `root` whose name starts with `prefix`.
    pub fn create(root: &Path, prefix: &str) -> io::Result<Self> {
        fs::create_dir_all(root)?;
        let dir = tempfile::Builder::new().prefix(prefix).tempdir_in(root)?;
        let path = dir.path().to_path_buf();
        debug!(path = %path.display(), "Created staging area");

        Ok(Self {
            dir: Some(dir),
            path,
            prefix: prefix.to_string(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn file_path(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.file_path(name).is_file()
    }

    /// Write `data` as a new file. Fails if `name` is already staged.
    ///
    /// A partially written file is removed before the error is returned.
    pub fn write_new(&self, name: &str, data: &[u8]) -> io::Result<StagedFile> {
        if name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid staging file name: {}", name),
            ));
        }

        let path = self.file_path(name);
        let mut file = OpenOptions::new().write(true).create_new(true).open(&path)?;
        if let Err(e) = file.write_all(data).and_then(|_| file.sync_all()) {
            drop(file);
            let _ = fs::remove_file(&path);
            return Err(e);
        }

        Ok(StagedFile {
            path,
            digest: hex::encode(Sha256::digest(data)),
            bytes: data.len() as u64,
        })
    }

    /// Describe an already staged file without rewriting it.
    pub fn existing(&self, name: &str) -> io::Result<StagedFile> {
        let path = self.file_path(name);
        let mut hasher = Sha256::new();
        let bytes = io::copy(&mut File::open(&path)?, &mut hasher)?;

        Ok(StagedFile {
            path,
            digest: hex::encode(hasher.finalize()),
            bytes,
        })
    }

    /// Remove the directory and everything in it.
    pub fn cleanup(mut self) -> io::Result<()> {
        match self.dir.take() {
            Some(dir) => {
                debug!(path = %self.path.display(), "Removing staging area");
                dir.close()
            },
            None => Ok(()),
        }
    }
}

impl Drop for StagingArea {
    fn drop(&mut self) {
        if self.dir.is_some() {
            warn!(path = %self.path.display(), "Staging area dropped without cleanup");
        }
    }
}
