//! On-disk JSON document store
//!
//! Layout under the store root:
//!
//! ```text
//! slots.json                      slot name -> collection id
//! collections/c-<uuid>/schema.json
//! collections/c-<uuid>/records.jsonl
//! .lock                           held for the duration of every call
//! ```
//!
//! The slot catalog is rewritten with write-temp-then-rename, so a slot
//! move is one atomic rename. The lock file is created with `create_new`,
//! which serializes writers across processes and keeps natural keys unique.
//! It holds `<pid> <token>`. A lock left by a process that no longer runs,
//! or older than the stale age, is broken with a warning.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dataqs_common::DatasetName;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{InsertOutcome, RecordStore, Result, RowError, SlotStore, StoreError};
use crate::normalize::{Record, RecordSchema};

const CATALOG_FILE: &str = "slots.json";
const LOCK_FILE: &str = ".lock";
const COLLECTIONS_DIR: &str = "collections";
const SCHEMA_FILE: &str = "schema.json";
const RECORDS_FILE: &str = "records.jsonl";

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_STALE_LOCK_AGE: Duration = Duration::from_secs(600);

#[derive(Debug, Default, Serialize, Deserialize)]
struct Catalog {
    slots: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRecord {
    seq: u64,
    record: Record,
}

#[derive(Debug, Clone)]
pub struct DocumentStore {
    root: PathBuf,
    lock_timeout: Duration,
    stale_lock_age: Duration,
}

struct LockGuard {
    path: PathBuf,
    owner: String,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // Only remove the lock if it is still ours
        match fs::read_to_string(&self.path) {
            Ok(owner) if owner.trim() == self.owner => {
                if let Err(e) = fs::remove_file(&self.path) {
                    warn!(path = %self.path.display(), error = %e, "Failed to release store lock");
                }
            },
            Ok(_) => warn!(path = %self.path.display(), "Store lock was taken over, leaving it"),
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to release store lock"),
        }
    }
}

/// True if the process that wrote `owner` is known to be gone.
#[cfg(target_os = "linux")]
fn owner_is_dead(owner: &str) -> bool {
    owner
        .split_whitespace()
        .next()
        .and_then(|pid| pid.parse::<u32>().ok())
        .is_some_and(|pid| !Path::new("/proc").join(pid.to_string()).exists())
}

#[cfg(not(target_os = "linux"))]
fn owner_is_dead(_owner: &str) -> bool {
    false
}

impl DocumentStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(COLLECTIONS_DIR))?;
        Ok(Self {
            root,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            stale_lock_age: DEFAULT_STALE_LOCK_AGE,
        })
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Age after which a lock is considered abandoned even if its owner
    /// cannot be checked.
    pub fn with_stale_lock_age(mut self, age: Duration) -> Self {
        self.stale_lock_age = age;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Run `op` on the blocking pool while holding the store lock.
    async fn locked<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&DocumentStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || {
            let _guard = store.lock()?;
            op(&store)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("document store task failed: {}", e)))?
    }

    fn lock(&self) -> Result<LockGuard> {
        let path = self.root.join(LOCK_FILE);
        let owner = format!("{} {}", std::process::id(), Uuid::new_v4().simple());
        let started = Instant::now();

        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    if let Err(e) = writeln!(file, "{}", owner) {
                        let _ = fs::remove_file(&path);
                        return Err(e.into());
                    }
                    return Ok(LockGuard { path, owner });
                },
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if self.break_stale_lock(&path) {
                        continue;
                    }
                    if started.elapsed() >= self.lock_timeout {
                        return Err(StoreError::Locked(path.display().to_string()));
                    }
                    std::thread::sleep(Duration::from_millis(20));
                },
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Remove the lock at `path` if its owner is gone or it is too old.
    fn break_stale_lock(&self, path: &Path) -> bool {
        let Ok(owner) = fs::read_to_string(path) else {
            return false;
        };
        let age = fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| modified.elapsed().ok());

        let dead = owner_is_dead(&owner);
        let expired = age.is_some_and(|age| age > self.stale_lock_age);
        if !dead && !expired {
            return false;
        }

        // Re-read so a lock taken in the meantime is left alone
        if fs::read_to_string(path).ok().as_deref() != Some(owner.as_str()) {
            return false;
        }
        match fs::remove_file(path) {
            Ok(()) => {
                warn!(
                    path = %path.display(),
                    owner = owner.trim(),
                    owner_dead = dead,
                    age_secs = age.map(|a| a.as_secs()),
                    "Broke stale store lock"
                );
                true
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => true,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to break stale store lock");
                false
            },
        }
    }

    fn load_catalog(&self) -> Result<Catalog> {
        match fs::read(self.root.join(CATALOG_FILE)) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Catalog::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn save_catalog(&self, catalog: &Catalog) -> Result<()> {
        write_atomic(&self.root.join(CATALOG_FILE), &serde_json::to_vec_pretty(catalog)?)
    }

    fn collection_dir(&self, id: &str) -> PathBuf {
        self.root.join(COLLECTIONS_DIR).join(id)
    }

    fn resolve(&self, slot: &DatasetName) -> Result<PathBuf> {
        let catalog = self.load_catalog()?;
        catalog
            .slots
            .get(slot.as_str())
            .map(|id| self.collection_dir(id))
            .ok_or_else(|| StoreError::SlotMissing(slot.to_string()))
    }

    fn read_records(dir: &Path) -> Result<Vec<StoredRecord>> {
        let file = match File::open(dir.join(RECORDS_FILE)) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line)?);
        }
        Ok(records)
    }

    fn write_records(dir: &Path, records: &[StoredRecord]) -> Result<()> {
        let mut buf = Vec::new();
        for record in records {
            serde_json::to_writer(&mut buf, record)?;
            buf.push(b'\n');
        }
        write_atomic(&dir.join(RECORDS_FILE), &buf)
    }

    fn ensure_sync(&self, dataset: &DatasetName, schema: &RecordSchema) -> Result<bool> {
        let mut catalog = self.load_catalog()?;

        if let Some(id) = catalog.slots.get(dataset.as_str()) {
            let stored: RecordSchema = serde_json::from_slice(&fs::read(self.collection_dir(id).join(SCHEMA_FILE))?)?;
            if &stored != schema {
                return Err(StoreError::Schema {
                    dataset: dataset.to_string(),
                    detail: "stored schema differs from the declared one".to_string(),
                });
            }
            return Ok(false);
        }

        let id = format!("c-{}", Uuid::new_v4().simple());
        let dir = self.collection_dir(&id);
        fs::create_dir_all(&dir)?;
        write_atomic(&dir.join(SCHEMA_FILE), &serde_json::to_vec_pretty(schema)?)?;
        Self::write_records(&dir, &[])?;

        catalog.slots.insert(dataset.to_string(), id.clone());
        self.save_catalog(&catalog)?;
        debug!(dataset = %dataset, collection = %id, "Created collection");
        Ok(true)
    }

    fn insert_sync(
        &self,
        dataset: &DatasetName,
        schema: &RecordSchema,
        records: &[Record],
    ) -> Result<Vec<std::result::Result<InsertOutcome, RowError>>> {
        let dir = self.resolve(dataset)?;
        let existing = Self::read_records(&dir)?;
        let mut keys: HashSet<String> = existing.iter().map(|r| r.record.natural_key(schema)).collect();
        let mut next_seq = existing.iter().map(|r| r.seq).max().map_or(1, |s| s + 1);

        let mut outcomes = Vec::with_capacity(records.len());
        let mut buf = Vec::new();
        for (index, record) in records.iter().enumerate() {
            if let Err(reason) = schema.validate(record) {
                outcomes.push(Err(RowError { index, reason }));
                continue;
            }
            if !keys.insert(record.natural_key(schema)) {
                outcomes.push(Ok(InsertOutcome::ConflictSkipped));
                continue;
            }

            let stored = StoredRecord {
                seq: next_seq,
                record: record.clone(),
            };
            serde_json::to_writer(&mut buf, &stored)?;
            buf.push(b'\n');
            next_seq += 1;
            outcomes.push(Ok(InsertOutcome::Inserted));
        }

        if !buf.is_empty() {
            let mut file = OpenOptions::new().create(true).append(true).open(dir.join(RECORDS_FILE))?;
            file.write_all(&buf)?;
            file.sync_all()?;
        }

        Ok(outcomes)
    }

    fn delete_older_sync(&self, dataset: &DatasetName, schema: &RecordSchema, cutoff: DateTime<Utc>) -> Result<u64> {
        let dir = self.resolve(dataset)?;
        let records = Self::read_records(&dir)?;
        let Some(newest) = records.iter().filter_map(|r| r.record.timestamp(schema)).max() else {
            return Ok(0);
        };

        let before = records.len();
        let kept: Vec<StoredRecord> = records
            .into_iter()
            .filter(|r| match r.record.timestamp(schema) {
                Some(ts) => ts >= cutoff || ts == newest,
                None => true,
            })
            .collect();

        let removed = (before - kept.len()) as u64;
        if removed > 0 {
            Self::write_records(&dir, &kept)?;
        }
        Ok(removed)
    }

    fn retain_newest_sync(&self, dataset: &DatasetName, schema: &RecordSchema, max_count: u64) -> Result<u64> {
        let dir = self.resolve(dataset)?;
        let mut records = Self::read_records(&dir)?;
        let max_count = usize::try_from(max_count).unwrap_or(usize::MAX);
        if records.len() <= max_count {
            return Ok(0);
        }

        records.sort_by(|a, b| {
            b.record
                .timestamp(schema)
                .cmp(&a.record.timestamp(schema))
                .then(b.seq.cmp(&a.seq))
        });
        let removed = (records.len() - max_count) as u64;
        records.truncate(max_count);
        records.sort_by_key(|r| r.seq);

        Self::write_records(&dir, &records)?;
        Ok(removed)
    }

    fn move_sync(&self, from: &DatasetName, to: &DatasetName) -> Result<()> {
        let mut catalog = self.load_catalog()?;
        if catalog.slots.contains_key(to.as_str()) {
            return Err(StoreError::SlotExists(to.to_string()));
        }
        let id = catalog
            .slots
            .remove(from.as_str())
            .ok_or_else(|| StoreError::SlotMissing(from.to_string()))?;
        catalog.slots.insert(to.to_string(), id);
        self.save_catalog(&catalog)
    }

    fn replace_sync(&self, from: &DatasetName, live: &DatasetName, previous: &DatasetName) -> Result<()> {
        let mut catalog = self.load_catalog()?;
        if catalog.slots.contains_key(previous.as_str()) {
            return Err(StoreError::SlotExists(previous.to_string()));
        }
        let Some(old_id) = catalog.slots.remove(live.as_str()) else {
            return Err(StoreError::SlotMissing(live.to_string()));
        };
        let Some(new_id) = catalog.slots.remove(from.as_str()) else {
            return Err(StoreError::SlotMissing(from.to_string()));
        };
        catalog.slots.insert(previous.to_string(), old_id);
        catalog.slots.insert(live.to_string(), new_id);
        self.save_catalog(&catalog)
    }

    fn drop_sync(&self, slot: &DatasetName) -> Result<()> {
        let mut catalog = self.load_catalog()?;
        let Some(id) = catalog.slots.remove(slot.as_str()) else {
            return Ok(());
        };
        self.save_catalog(&catalog)?;

        if let Err(e) = fs::remove_dir_all(self.collection_dir(&id)) {
            warn!(slot = %slot, collection = %id, error = %e, "Failed to remove collection data");
        }
        Ok(())
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

#[async_trait]
impl RecordStore for DocumentStore {
    async fn ensure_dataset(&self, dataset: &DatasetName, schema: &RecordSchema) -> Result<bool> {
        let (dataset, schema) = (dataset.clone(), schema.clone());
        self.locked(move |s| s.ensure_sync(&dataset, &schema)).await
    }

    async fn insert_if_absent(
        &self,
        dataset: &DatasetName,
        schema: &RecordSchema,
        records: &[Record],
    ) -> Result<Vec<std::result::Result<InsertOutcome, RowError>>> {
        let (dataset, schema, records) = (dataset.clone(), schema.clone(), records.to_vec());
        self.locked(move |s| s.insert_sync(&dataset, &schema, &records)).await
    }

    async fn delete_older_than(
        &self,
        dataset: &DatasetName,
        schema: &RecordSchema,
        cutoff: DateTime<Utc>,
    ) -> Result<u64> {
        let (dataset, schema) = (dataset.clone(), schema.clone());
        self.locked(move |s| s.delete_older_sync(&dataset, &schema, cutoff)).await
    }

    async fn retain_newest(&self, dataset: &DatasetName, schema: &RecordSchema, max_count: u64) -> Result<u64> {
        let (dataset, schema) = (dataset.clone(), schema.clone());
        self.locked(move |s| s.retain_newest_sync(&dataset, &schema, max_count)).await
    }

    async fn count(&self, dataset: &DatasetName) -> Result<u64> {
        let dataset = dataset.clone();
        self.locked(move |s| Ok(Self::read_records(&s.resolve(&dataset)?)?.len() as u64))
            .await
    }

    async fn records(&self, dataset: &DatasetName, _schema: &RecordSchema) -> Result<Vec<Record>> {
        let dataset = dataset.clone();
        self.locked(move |s| {
            let mut stored = Self::read_records(&s.resolve(&dataset)?)?;
            stored.sort_by_key(|r| r.seq);
            Ok(stored.into_iter().map(|r| r.record).collect())
        })
        .await
    }
}

#[async_trait]
impl SlotStore for DocumentStore {
    async fn slot_exists(&self, slot: &DatasetName) -> Result<bool> {
        let slot = slot.clone();
        self.locked(move |s| Ok(s.load_catalog()?.slots.contains_key(slot.as_str())))
            .await
    }

    async fn move_slot(&self, from: &DatasetName, to: &DatasetName) -> Result<()> {
        let (from, to) = (from.clone(), to.clone());
        self.locked(move |s| s.move_sync(&from, &to)).await
    }

    async fn replace_slot(&self, from: &DatasetName, live: &DatasetName, previous: &DatasetName) -> Result<()> {
        let (from, live, previous) = (from.clone(), live.clone(), previous.clone());
        self.locked(move |s| s.replace_sync(&from, &live, &previous)).await
    }

    async fn drop_slot(&self, slot: &DatasetName) -> Result<()> {
        let slot = slot.clone();
        self.locked(move |s| s.drop_sync(&slot)).await
    }
}
