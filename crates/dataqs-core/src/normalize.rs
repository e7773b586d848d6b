//! Record normalization
//!
//! Feed-specific [`RowMapper`]s turn raw upstream rows into typed
//! [`Record`]s. The normalizer validates every record against the dataset's
//! [`RecordSchema`] and reports unmappable rows as structured
//! [`NormalizationError`]s. It performs no I/O.

use chrono::{DateTime, SecondsFormat, Utc};
use dataqs_common::types::validate_identifier;
use dataqs_common::DataqsError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt::Debug;
use thiserror::Error;
use tracing::warn;

/// Separator between key components in a canonical natural key.
const KEY_SEPARATOR: char = '\u{1f}';

static NULL: FieldValue = FieldValue::Null;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Integer,
    Real,
    Text,
    Timestamp,
    Geometry,
}

/// WGS84 (EPSG:4326) geometry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Geometry {
    Point { lon: f64, lat: f64 },
    MultiPoint { points: Vec<(f64, f64)> },
}

impl Geometry {
    pub fn point(lon: f64, lat: f64) -> Self {
        Geometry::Point { lon, lat }
    }

    pub fn to_wkt(&self) -> String {
        match self {
            Geometry::Point { lon, lat } => format!("POINT({} {})", lon, lat),
            Geometry::MultiPoint { points } => {
                let coords: Vec<String> = points.iter().map(|(lon, lat)| format!("({} {})", lon, lat)).collect();
                format!("MULTIPOINT({})", coords.join(","))
            },
        }
    }

    fn coordinates(&self) -> Vec<(f64, f64)> {
        match self {
            Geometry::Point { lon, lat } => vec![(*lon, *lat)],
            Geometry::MultiPoint { points } => points.clone(),
        }
    }

    pub fn within_wgs84(&self) -> bool {
        let coords = self.coordinates();
        !coords.is_empty()
            && coords.iter().all(|(lon, lat)| {
                lon.is_finite() && lat.is_finite() && (-180.0..=180.0).contains(lon) && (-90.0..=90.0).contains(lat)
            })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum FieldValue {
    Integer(i64),
    Real(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
    Geometry(Geometry),
    Null,
}

impl FieldValue {
    pub fn field_type(&self) -> Option<FieldType> {
        match self {
            FieldValue::Integer(_) => Some(FieldType::Integer),
            FieldValue::Real(_) => Some(FieldType::Real),
            FieldValue::Text(_) => Some(FieldType::Text),
            FieldValue::Timestamp(_) => Some(FieldType::Timestamp),
            FieldValue::Geometry(_) => Some(FieldType::Geometry),
            FieldValue::Null => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            FieldValue::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }

    /// Stable text form used to compare natural keys.
    pub fn canonical(&self) -> String {
        match self {
            FieldValue::Integer(v) => v.to_string(),
            FieldValue::Real(v) => format!("{:?}", v),
            FieldValue::Text(v) => v.clone(),
            FieldValue::Timestamp(v) => v.to_rfc3339_opts(SecondsFormat::Micros, true),
            FieldValue::Geometry(g) => g.to_wkt(),
            FieldValue::Null => String::new(),
        }
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Integer(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Real(v)
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Text(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Text(v.to_string())
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(v: DateTime<Utc>) -> Self {
        FieldValue::Timestamp(v)
    }
}

impl From<Geometry> for FieldValue {
    fn from(v: Geometry) -> Self {
        FieldValue::Geometry(v)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(FieldValue::Null, Into::into)
    }
}

/// Field name to typed value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    values: BTreeMap<String, FieldValue>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: &str, value: impl Into<FieldValue>) -> Self {
        self.set(field, value);
        self
    }

    pub fn set(&mut self, field: &str, value: impl Into<FieldValue>) {
        self.values.insert(field.to_string(), value.into());
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.values.get(field)
    }

    /// Value of `field`, treating absent as null.
    pub fn value(&self, field: &str) -> &FieldValue {
        self.values.get(field).unwrap_or(&NULL)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Canonical natural key under `schema`.
    pub fn natural_key(&self, schema: &RecordSchema) -> String {
        let parts: Vec<String> = schema.key().iter().map(|k| self.value(k).canonical()).collect();
        parts.join(&KEY_SEPARATOR.to_string())
    }

    pub fn timestamp(&self, schema: &RecordSchema) -> Option<DateTime<Utc>> {
        self.value(schema.timestamp_field()).as_timestamp()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub field_type: FieldType,
}

/// Declared shape of a dataset: fields, natural key and retention timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordSchema {
    fields: Vec<FieldDef>,
    key: Vec<String>,
    timestamp: String,
}

impl RecordSchema {
    pub fn builder() -> RecordSchemaBuilder {
        RecordSchemaBuilder::default()
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    pub fn key(&self) -> &[String] {
        &self.key
    }

    pub fn timestamp_field(&self) -> &str {
        &self.timestamp
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_type(&self, name: &str) -> Option<FieldType> {
        self.field(name).map(|f| f.field_type)
    }

    fn is_required(&self, name: &str) -> bool {
        name == self.timestamp || self.key.iter().any(|k| k == name)
    }

    /// Check one record against the declaration.
    pub fn validate(&self, record: &Record) -> std::result::Result<(), String> {
        for (name, value) in record.fields() {
            let Some(def) = self.field(name) else {
                return Err(format!("undeclared field '{}'", name));
            };
            match value.field_type() {
                None => {},
                Some(actual) if actual == def.field_type => {},
                Some(actual) => {
                    return Err(format!(
                        "field '{}' is {:?}, declared {:?}",
                        name, actual, def.field_type
                    ))
                },
            }
            if let FieldValue::Geometry(geometry) = value {
                if !geometry.within_wgs84() {
                    return Err(format!("field '{}' has coordinates outside WGS84 bounds", name));
                }
            }
            if let FieldValue::Real(v) = value {
                if !v.is_finite() {
                    return Err(format!("field '{}' is not a finite number", name));
                }
            }
        }

        for def in &self.fields {
            if self.is_required(&def.name) && record.value(&def.name).is_null() {
                return Err(format!("required field '{}' is missing", def.name));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct RecordSchemaBuilder {
    fields: Vec<FieldDef>,
    key: Vec<String>,
    timestamp: Option<String>,
}

impl RecordSchemaBuilder {
    pub fn field(mut self, name: &str, field_type: FieldType) -> Self {
        self.fields.push(FieldDef {
            name: name.to_string(),
            field_type,
        });
        self
    }

    pub fn key(mut self, fields: &[&str]) -> Self {
        self.key = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn timestamp(mut self, field: &str) -> Self {
        self.timestamp = Some(field.to_string());
        self
    }

    pub fn build(self) -> dataqs_common::Result<RecordSchema> {
        let mut seen = HashSet::new();
        for field in &self.fields {
            validate_identifier(&field.name)?;
            if !seen.insert(field.name.as_str()) {
                return Err(DataqsError::invalid_identifier(&field.name, "declared twice"));
            }
        }

        if self.key.is_empty() {
            return Err(DataqsError::Config("schema needs at least one key field".to_string()));
        }
        for key in &self.key {
            if !seen.contains(key.as_str()) {
                return Err(DataqsError::Config(format!("key field '{}' is not declared", key)));
            }
        }

        let timestamp = self
            .timestamp
            .ok_or_else(|| DataqsError::Config("schema needs a timestamp field".to_string()))?;
        let is_timestamp = self
            .fields
            .iter()
            .any(|f| f.name == timestamp && f.field_type == FieldType::Timestamp);
        if !is_timestamp {
            return Err(DataqsError::Config(format!(
                "timestamp field '{}' must be declared as a timestamp",
                timestamp
            )));
        }

        Ok(RecordSchema {
            fields: self.fields,
            key: self.key,
            timestamp,
        })
    }
}

/// Outcome of mapping one raw row.
#[derive(Debug, Clone, PartialEq)]
pub enum Mapped {
    Record(Record),
    /// Known row that carries no record, such as a `TOTAL` line.
    Sentinel,
}

/// Maps one raw upstream row to a record.
pub trait RowMapper<R: ?Sized> {
    fn map(&self, row: &R) -> std::result::Result<Mapped, String>;
}

impl<R: ?Sized, F> RowMapper<R> for F
where
    F: Fn(&R) -> std::result::Result<Mapped, String>,
{
    fn map(&self, row: &R) -> std::result::Result<Mapped, String> {
        self(row)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("row {row}: {reason} (raw: {raw})")]
pub struct NormalizationError {
    pub row: usize,
    pub raw: String,
    pub reason: String,
}

/// Lazy iterator over normalized records.
///
/// Cloning restarts from the clone point without re-reading the source.
pub struct Normalized<'a, R, M> {
    rows: &'a [R],
    mapper: &'a M,
    schema: &'a RecordSchema,
    index: usize,
}

impl<R, M> Clone for Normalized<'_, R, M> {
    fn clone(&self) -> Self {
        Self {
            rows: self.rows,
            mapper: self.mapper,
            schema: self.schema,
            index: self.index,
        }
    }
}

impl<'a, R: Debug, M: RowMapper<R>> Iterator for Normalized<'a, R, M> {
    type Item = std::result::Result<Record, NormalizationError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let index = self.index;
            let row = self.rows.get(index)?;
            self.index += 1;

            let reject = |reason: String| NormalizationError {
                row: index,
                raw: format!("{:?}", row),
                reason,
            };

            match self.mapper.map(row) {
                Ok(Mapped::Sentinel) => continue,
                Ok(Mapped::Record(record)) => {
                    return Some(self.schema.validate(&record).map(|_| record).map_err(reject));
                },
                Err(reason) => return Some(Err(reject(reason))),
            }
        }
    }
}

pub fn normalize<'a, R: Debug, M: RowMapper<R>>(
    raw_batch: &'a [R],
    mapper: &'a M,
    schema: &'a RecordSchema,
) -> Normalized<'a, R, M> {
    Normalized {
        rows: raw_batch,
        mapper,
        schema,
        index: 0,
    }
}

/// Whether a bad row aborts the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NormalizationPolicy {
    #[default]
    Strict,
    Lenient,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedBatch {
    pub records: Vec<Record>,
    pub rejected: usize,
}

impl NormalizationPolicy {
    /// Drain `normalized`; strict stops at the first error, lenient logs and counts.
    pub fn collect<I>(self, normalized: I) -> std::result::Result<NormalizedBatch, NormalizationError>
    where
        I: Iterator<Item = std::result::Result<Record, NormalizationError>>,
    {
        let mut batch = NormalizedBatch::default();
        for item in normalized {
            match item {
                Ok(record) => batch.records.push(record),
                Err(e) if self == NormalizationPolicy::Strict => return Err(e),
                Err(e) => {
                    warn!(row = e.row, reason = %e.reason, raw = %e.raw, "Skipping unmappable row");
                    batch.rejected += 1;
                },
            }
        }
        Ok(batch)
    }
}
