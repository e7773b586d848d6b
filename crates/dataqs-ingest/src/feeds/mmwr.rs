//! CDC MMWR 122 Cities mortality feed
//!
//! CDC WONDER publishes one tab-separated export per ISO week with deaths
//! by age group for each reporting city. The current week is often not out
//! yet, so the fetch falls back one week, and at week 53 it also tries
//! week 1 of the next year.
//!
//! The export is normalized strictly: every data row must name a city of
//! the gazetteer (region subtotals included), except the `TOTAL` line. The
//! week replaces `mmwr_weekly` and is appended to `mmwr_archive`.
//!
//! With `start` (and optionally `end`) options spanning several weeks the
//! job backfills every week in the range into the archive, without stepping
//! back, and leaves the last one in `mmwr_weekly`.

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use dataqs_common::DatasetName;
use dataqs_core::config::JobConfig;
use dataqs_core::fetch::{BucketKind, ExpectedFormat, FallbackPolicy, FetchRequest, HttpAuth, ResourceSource, TimeBucket};
use dataqs_core::normalize::{FieldType, Geometry, Mapped, NormalizationPolicy, Record, RecordSchema, RowMapper};
use dataqs_core::notify::LayerMetadata;
use dataqs_core::{Job, PipelineError, Result, RunContext};
use regex::Regex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use super::{date_option, http_source, read_staged, style_for};

pub const NAME: &str = "mmwr";

pub const DEFAULT_LOCATION: &str = "https://wonder.cdc.gov/mmwr/mmwr_{year}.asp?request=Export&mmwr_location=Click+here+for+all+Locations&mmwr_table=4A&mmwr_year={year}&mmwr_week={week}";

pub const WEEKLY_DATASET: &str = "mmwr_weekly";
pub const ARCHIVE_DATASET: &str = "mmwr_archive";

const BASE_TITLE: &str = "Mortality and Morbidity Reports";

/// Summary line at the bottom of every export.
const TOTAL_ROW: &str = "TOTAL";
const HEADER_ROW: &str = "Reporting Area";

/// Death counts by age group, in export column order after the place.
pub const COUNT_COLUMNS: [&str; 7] = ["all", "a65", "a45_64", "a25_44", "a01_24", "a01", "flu"];

const BUNDLED_PLACES: &str = include_str!("../../resources/mmwr_places.json");
const STYLE: &str = include_str!("../../resources/mmwr.sld");

/// Place name to (lat, lng).
pub type Gazetteer = HashMap<String, (f64, f64)>;

pub fn schema() -> Result<RecordSchema> {
    let mut builder = RecordSchema::builder()
        .field("place", FieldType::Text)
        .field("the_geom", FieldType::Geometry);
    for column in COUNT_COLUMNS {
        builder = builder.field(column, FieldType::Integer);
    }
    Ok(builder
        .field("report_date", FieldType::Timestamp)
        .key(&["place", "report_date"])
        .timestamp("report_date")
        .build()?)
}

/// Parse a gazetteer of `{"place": [lat, lng]}` entries.
pub fn parse_gazetteer(json: &str) -> Result<Gazetteer> {
    let raw: HashMap<String, [f64; 2]> =
        serde_json::from_str(json).map_err(|e| PipelineError::feed(format!("invalid MMWR gazetteer: {}", e)))?;
    Ok(raw.into_iter().map(|(place, [lat, lng])| (place, (lat, lng))).collect())
}

/// The gazetteer named by the `places` option, else the bundled one.
pub fn load_gazetteer(path: Option<&Path>) -> Result<Gazetteer> {
    match path {
        Some(path) => parse_gazetteer(&std::fs::read_to_string(path)?),
        None => parse_gazetteer(BUNDLED_PLACES),
    }
}

/// One weekly export split into its report date and data rows.
#[derive(Debug, Clone, PartialEq)]
pub struct WeeklyReport {
    pub report_date: DateTime<Utc>,
    pub rows: Vec<Vec<String>>,
}

pub fn parse_report(content: &[u8]) -> Result<WeeklyReport> {
    let week_ending = Regex::new(r"(?i)week ending (.+)").map_err(|e| PipelineError::feed(e.to_string()))?;

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .flexible(true)
        .from_reader(content);

    let mut report_date = None;
    let mut rows = Vec::new();

    for result in reader.records() {
        let record = result.map_err(|e| PipelineError::feed(format!("malformed MMWR export: {}", e)))?;
        let cells: Vec<String> = record.iter().map(|c| c.trim().to_string()).collect();

        if cells.len() == 1 && report_date.is_none() {
            if let Some(caps) = week_ending.captures(&cells[0]) {
                report_date = Some(parse_report_date(&caps[1])?);
            }
        }
        if cells.len() > 2 {
            rows.push(cells);
        }
    }

    let report_date = report_date.ok_or_else(|| PipelineError::feed("MMWR export has no 'week ending' line"))?;
    debug!(report_date = %report_date, rows = rows.len(), "Parsed MMWR export");
    Ok(WeeklyReport { report_date, rows })
}

fn parse_report_date(text: &str) -> Result<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(text.trim(), "%B %d, %Y")
        .map_err(|e| PipelineError::feed(format!("unparseable report date '{}': {}", text, e)))?;
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| PipelineError::feed(format!("unparseable report date '{}'", text)))?;
    Ok(Utc.from_utc_datetime(&midnight))
}

/// Empty, `-` and `U` (unavailable) mean no value.
fn parse_count(column: &str, cell: Option<&String>) -> std::result::Result<Option<i64>, String> {
    let cell = cell.map(|c| c.trim()).unwrap_or("");
    if cell.is_empty() || cell == "-" || cell.eq_ignore_ascii_case("u") {
        return Ok(None);
    }
    cell.replace(',', "")
        .parse::<i64>()
        .map(Some)
        .map_err(|_| format!("column '{}' is not a count: '{}'", column, cell))
}

pub struct WeeklyRowMapper<'a> {
    pub places: &'a Gazetteer,
    pub report_date: DateTime<Utc>,
}

impl RowMapper<Vec<String>> for WeeklyRowMapper<'_> {
    fn map(&self, row: &Vec<String>) -> std::result::Result<Mapped, String> {
        let place = row.first().map(String::as_str).unwrap_or("");
        if place == TOTAL_ROW || place == HEADER_ROW {
            return Ok(Mapped::Sentinel);
        }
        let Some(&(lat, lng)) = self.places.get(place) else {
            return Err(format!("could not find matching city: {}", place));
        };

        let mut record = Record::new()
            .with("place", place)
            .with("the_geom", Geometry::point(lng, lat))
            .with("report_date", self.report_date);
        for (i, column) in COUNT_COLUMNS.iter().enumerate() {
            record.set(column, parse_count(column, row.get(i + 1))?);
        }
        Ok(Mapped::Record(record))
    }
}

/// ISO weeks from the `start` option to the `end` option (or the reference
/// time), oldest first. `None` unless the range spans more than one week.
pub fn backfill_weeks(config: &JobConfig, reference_time: DateTime<Utc>) -> Result<Option<Vec<TimeBucket>>> {
    let start = date_option(config, "start")?;
    let end = date_option(config, "end")?;
    let Some(start) = start else {
        if end.is_some() {
            return Err(PipelineError::feed("option end requires start"));
        }
        return Ok(None);
    };
    let end = end.unwrap_or(reference_time);
    if start > end {
        return Err(PipelineError::feed(format!("start {} is after end {}", start.date_naive(), end.date_naive())));
    }

    let last = TimeBucket::containing(BucketKind::IsoWeek, end);
    let mut week = TimeBucket::containing(BucketKind::IsoWeek, start);
    if week == last {
        return Ok(None);
    }

    let mut weeks = Vec::new();
    while week.start() <= last.start() {
        weeks.push(week);
        week = TimeBucket::containing(BucketKind::IsoWeek, week.start() + Duration::days(7));
    }
    Ok(Some(weeks))
}

pub struct MmwrJob;

struct WeekInputs<'a> {
    source: Arc<dyn ResourceSource>,
    location: &'a str,
    places: &'a Gazetteer,
    schema: &'a RecordSchema,
}

impl MmwrJob {
    async fn load_week(
        &self,
        ctx: &mut RunContext<'_>,
        inputs: &WeekInputs<'_>,
        week: TimeBucket,
        policy: &FallbackPolicy,
    ) -> Result<Vec<Record>> {
        let request = FetchRequest::new(NAME, week, inputs.location)
            .extension("txt")
            .format(ExpectedFormat::Text);
        let fetched = ctx.fetch(Arc::clone(&inputs.source), &request, policy).await?;
        let report = parse_report(&read_staged(&fetched.path).await?)?;

        let mapper = WeeklyRowMapper {
            places: inputs.places,
            report_date: report.report_date,
        };
        let records = ctx.normalize(&report.rows, &mapper, inputs.schema, NormalizationPolicy::Strict)?;
        info!(week = %fetched.bucket, report_date = %report.report_date, records = records.len(), "Normalized MMWR week");
        Ok(records)
    }
}

#[async_trait]
impl Job for MmwrJob {
    fn name(&self) -> &str {
        NAME
    }

    fn description(&self) -> &str {
        "CDC MMWR weekly deaths in 122 U.S. cities"
    }

    async fn run(&self, ctx: &mut RunContext<'_>) -> Result<()> {
        let config = ctx.config().clone();
        let places = load_gazetteer(config.option("places").map(Path::new))?;
        let schema = schema()?;
        let inputs = WeekInputs {
            source: http_source(&config, HttpAuth::None)?,
            location: config.base_url_or(DEFAULT_LOCATION),
            places: &places,
            schema: &schema,
        };

        let weekly = DatasetName::new(WEEKLY_DATASET)?;
        let archive = DatasetName::new(ARCHIVE_DATASET)?;

        let latest = match backfill_weeks(&config, ctx.reference_time())? {
            None => {
                let week = TimeBucket::containing(BucketKind::IsoWeek, ctx.reference_time());
                let policy = FallbackPolicy::back(config.back_steps_or(1)).with_wrap_forward();
                let records = self.load_week(ctx, &inputs, week, &policy).await?;
                ctx.upsert(&archive, &schema, &records).await?;
                records
            },
            Some(weeks) => {
                // A range only wraps past week 53; it never steps back.
                let policy = FallbackPolicy::EXACT.with_wrap_forward();
                info!(first = %weeks[0], weeks = weeks.len(), "Backfilling MMWR weeks");
                let mut latest = Vec::new();
                for week in weeks {
                    latest = self.load_week(ctx, &inputs, week, &policy).await?;
                    ctx.upsert(&archive, &schema, &latest).await?;
                }
                latest
            },
        };
        ctx.publish(&weekly, &schema, &latest).await?;

        for (dataset, title) in [(&weekly, "Weekly"), (&archive, "Archive")] {
            let metadata = LayerMetadata::vector(format!("{} {}", BASE_TITLE, title));
            let style = style_for(STYLE, dataset.as_str());
            ctx.announce(dataset, &metadata, Some(&style)).await;
        }
        Ok(())
    }
}
