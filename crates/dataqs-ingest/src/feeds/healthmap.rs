//! HealthMap disease outbreak alerts
//!
//! The API returns one entry per place with the alerts reported there.
//! Each alert becomes a point record keyed by its link and place, appended
//! to `healthmap90days`. Alerts older than 90 days are evicted.

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use dataqs_common::DatasetName;
use dataqs_core::config::ConfigError;
use dataqs_core::fetch::{BucketKind, ExpectedFormat, FallbackPolicy, FetchRequest, HttpAuth, TimeBucket};
use dataqs_core::normalize::{FieldType, Geometry, Mapped, NormalizationPolicy, Record, RecordSchema, RowMapper};
use dataqs_core::notify::LayerMetadata;
use dataqs_core::retention::RetentionPolicy;
use dataqs_core::{Job, PipelineError, Result, RunContext};
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use super::{http_source, json_f64, json_text, read_staged};

pub const NAME: &str = "healthmap";
pub const DEFAULT_BASE_URL: &str = "https://www.healthmap.org/HMapi.php";
pub const DATASET: &str = "healthmap90days";

/// Days of alerts requested per run.
const LOOKBACK_DAYS: i64 = 7;
const RETENTION_DAYS: u64 = 90;

pub fn schema() -> Result<RecordSchema> {
    Ok(RecordSchema::builder()
        .field("link", FieldType::Text)
        .field("place_name", FieldType::Text)
        .field("country", FieldType::Text)
        .field("country_id", FieldType::Text)
        .field("summary", FieldType::Text)
        .field("disease", FieldType::Text)
        .field("species_name", FieldType::Text)
        .field("date", FieldType::Timestamp)
        .field("the_geom", FieldType::Geometry)
        .key(&["link", "place_name"])
        .timestamp("date")
        .build()?)
}

#[derive(Debug, Clone, Deserialize)]
struct Place {
    #[serde(default)]
    country: Option<String>,
    place_name: String,
    #[serde(default)]
    lat: Value,
    #[serde(default)]
    lng: Value,
    #[serde(default)]
    country_id: Value,
    #[serde(default)]
    alerts: Vec<Value>,
}

/// One alert flattened with the fields of the place it was reported at.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertRow {
    pub country: Option<String>,
    pub place_name: String,
    pub lat: Value,
    pub lng: Value,
    pub country_id: Value,
    pub alert: Value,
}

pub fn parse_alerts(content: &[u8]) -> Result<Vec<AlertRow>> {
    let places: Vec<Place> = serde_json::from_slice(content)
        .map_err(|e| PipelineError::feed(format!("unexpected HealthMap response: {}", e)))?;

    Ok(places
        .into_iter()
        .flat_map(|place| {
            let Place {
                country,
                place_name,
                lat,
                lng,
                country_id,
                alerts,
            } = place;
            alerts.into_iter().map(move |alert| AlertRow {
                country: country.clone(),
                place_name: place_name.clone(),
                lat: lat.clone(),
                lng: lng.clone(),
                country_id: country_id.clone(),
                alert,
            })
        })
        .collect())
}

/// Alert dates come as `YYYY-MM-DD HH:MM:SS`, occasionally RFC 3339 or a bare date.
fn parse_alert_date(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(dt) = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S") {
        return Some(Utc.from_utc_datetime(&dt));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| Utc.from_utc_datetime(&dt))
}

pub struct AlertMapper;

impl RowMapper<AlertRow> for AlertMapper {
    fn map(&self, row: &AlertRow) -> std::result::Result<Mapped, String> {
        let field = |name: &str| row.alert.get(name).and_then(json_text);

        let link = field("link").ok_or("alert has no link")?;
        let date = field("date").ok_or("alert has no date")?;
        let date = parse_alert_date(&date).ok_or_else(|| format!("unparseable alert date '{}'", date))?;

        let lat = json_f64(&row.lat).ok_or_else(|| format!("bad latitude {}", row.lat))?;
        let lng = json_f64(&row.lng).ok_or_else(|| format!("bad longitude {}", row.lng))?;

        Ok(Mapped::Record(
            Record::new()
                .with("link", link)
                .with("place_name", row.place_name.as_str())
                .with("country", row.country.clone())
                .with("country_id", json_text(&row.country_id))
                .with("summary", field("summary"))
                .with("disease", field("disease").or_else(|| field("disease_name")))
                .with("species_name", field("species_name"))
                .with("date", date)
                .with("the_geom", Geometry::point(lng, lat)),
        ))
    }
}

pub struct HealthMapJob;

#[async_trait]
impl Job for HealthMapJob {
    fn name(&self) -> &str {
        NAME
    }

    fn description(&self) -> &str {
        "HealthMap disease outbreak alerts of the past 90 days"
    }

    async fn run(&self, ctx: &mut RunContext<'_>) -> Result<()> {
        let config = ctx.config().clone();
        let token = config
            .token
            .clone()
            .ok_or_else(|| ConfigError::Invalid(format!("jobs.{}.token is required", NAME)))?;
        let source = http_source(
            &config,
            HttpAuth::Query {
                param: "auth".to_string(),
                value: token,
            },
        )?;

        let base = config.base_url_or(DEFAULT_BASE_URL);
        let since = (ctx.reference_time() - Duration::days(LOOKBACK_DAYS)).format("%Y-%m-%d");
        let separator = if base.contains('?') { '&' } else { '?' };
        let location = format!("{}{}sdate={}", base, separator, since);

        let request = FetchRequest::new(NAME, TimeBucket::containing(BucketKind::Day, ctx.reference_time()), location)
            .extension("json")
            .format(ExpectedFormat::Json);
        let fetched = ctx
            .fetch(source, &request, &FallbackPolicy::back(config.back_steps_or(0)))
            .await?;

        let rows = parse_alerts(&read_staged(&fetched.path).await?)?;
        let schema = schema()?;
        let records = ctx.normalize(&rows, &AlertMapper, &schema, NormalizationPolicy::Lenient)?;
        info!(alerts = rows.len(), records = records.len(), "Normalized HealthMap alerts");

        let dataset = DatasetName::new(DATASET)?;
        ctx.upsert(&dataset, &schema, &records).await?;

        let policy = config.retention_or(DATASET, RetentionPolicy::days(RETENTION_DAYS));
        ctx.evict(&dataset, &schema, &policy).await?;

        ctx.announce(&dataset, &LayerMetadata::vector("HealthMap Alerts (90 days)"), None)
            .await;
        Ok(())
    }
}
