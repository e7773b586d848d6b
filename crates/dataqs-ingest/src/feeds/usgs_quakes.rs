//! USGS earthquakes
//!
//! The all-day GeoJSON summary is appended to four tables that differ only
//! in how long they keep events: a week, a month, a year, and forever.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use dataqs_common::DatasetName;
use dataqs_core::fetch::{BucketKind, ExpectedFormat, FallbackPolicy, FetchRequest, HttpAuth, TimeBucket};
use dataqs_core::normalize::{FieldType, Geometry, Mapped, NormalizationPolicy, Record, RecordSchema, RowMapper};
use dataqs_core::notify::LayerMetadata;
use dataqs_core::retention::RetentionPolicy;
use dataqs_core::{Job, PipelineError, Result, RunContext};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::info;

use super::{http_source, json_f64, json_text, read_staged, style_for};

pub const NAME: &str = "usgs_quakes";
pub const DEFAULT_LOCATION: &str = "https://earthquake.usgs.gov/earthquakes/feed/v1.0/summary/all_day.geojson";

const STYLE: &str = include_str!("../../resources/usgs_quakes.sld");

/// Target tables with their title and default age limit in days.
pub const TABLES: [(&str, &str, Option<u64>); 4] = [
    ("quakes_weekly", "Earthquakes - Past Week", Some(7)),
    ("quakes_monthly", "Earthquakes - Past Month", Some(30)),
    ("quakes_yearly", "Earthquakes - Past Year", Some(365)),
    ("quakes_archive", "Earthquakes - Archive", None),
];

pub fn schema() -> Result<RecordSchema> {
    Ok(RecordSchema::builder()
        .field("id", FieldType::Text)
        .field("mag", FieldType::Real)
        .field("mag_type", FieldType::Text)
        .field("place", FieldType::Text)
        .field("time", FieldType::Timestamp)
        .field("updated", FieldType::Timestamp)
        .field("url", FieldType::Text)
        .field("felt", FieldType::Integer)
        .field("alert", FieldType::Text)
        .field("tsunami", FieldType::Integer)
        .field("sig", FieldType::Integer)
        .field("event_type", FieldType::Text)
        .field("title", FieldType::Text)
        .field("depth", FieldType::Real)
        .field("the_geom", FieldType::Geometry)
        .key(&["id"])
        .timestamp("time")
        .build()?)
}

#[derive(Debug, Clone, Deserialize)]
struct FeatureCollection {
    features: Vec<Feature>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Feature {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub properties: Map<String, Value>,
    #[serde(default)]
    pub geometry: Option<PointGeometry>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PointGeometry {
    pub coordinates: Vec<f64>,
}

pub fn parse_features(content: &[u8]) -> Result<Vec<Feature>> {
    let collection: FeatureCollection = serde_json::from_slice(content)
        .map_err(|e| PipelineError::feed(format!("unexpected USGS GeoJSON: {}", e)))?;
    Ok(collection.features)
}

fn epoch_millis(value: Option<&Value>) -> Option<DateTime<Utc>> {
    let millis = value?.as_i64()?;
    Utc.timestamp_millis_opt(millis).single()
}

pub struct QuakeMapper;

impl RowMapper<Feature> for QuakeMapper {
    fn map(&self, feature: &Feature) -> std::result::Result<Mapped, String> {
        let id = feature.id.clone().ok_or("feature has no id")?;
        let props = &feature.properties;
        let text = |name: &str| props.get(name).and_then(json_text);
        let int = |name: &str| props.get(name).and_then(Value::as_i64);

        let time = epoch_millis(props.get("time")).ok_or("feature has no time")?;
        let coordinates = feature
            .geometry
            .as_ref()
            .map(|g| g.coordinates.as_slice())
            .unwrap_or_default();
        let [lon, lat, rest @ ..] = coordinates else {
            return Err(format!("feature {} has no point coordinates", id));
        };

        Ok(Mapped::Record(
            Record::new()
                .with("id", id)
                .with("mag", props.get("mag").and_then(json_f64))
                .with("mag_type", text("magType"))
                .with("place", text("place"))
                .with("time", time)
                .with("updated", epoch_millis(props.get("updated")))
                .with("url", text("url"))
                .with("felt", int("felt"))
                .with("alert", text("alert"))
                .with("tsunami", int("tsunami"))
                .with("sig", int("sig"))
                .with("event_type", text("type"))
                .with("title", text("title"))
                .with("depth", rest.first().copied())
                .with("the_geom", Geometry::point(*lon, *lat)),
        ))
    }
}

pub struct UsgsQuakesJob;

#[async_trait]
impl Job for UsgsQuakesJob {
    fn name(&self) -> &str {
        NAME
    }

    fn description(&self) -> &str {
        "USGS earthquakes of the past day, kept for a week, month, year and forever"
    }

    async fn run(&self, ctx: &mut RunContext<'_>) -> Result<()> {
        let config = ctx.config().clone();
        let source = http_source(&config, HttpAuth::None)?;

        let request = FetchRequest::new(
            NAME,
            TimeBucket::containing(BucketKind::Day, ctx.reference_time()),
            config.base_url_or(DEFAULT_LOCATION),
        )
        .extension("geojson")
        .format(ExpectedFormat::Json);
        let fetched = ctx
            .fetch(source, &request, &FallbackPolicy::back(config.back_steps_or(0)))
            .await?;

        let features = parse_features(&read_staged(&fetched.path).await?)?;
        let schema = schema()?;
        let records = ctx.normalize(&features, &QuakeMapper, &schema, NormalizationPolicy::Lenient)?;
        info!(features = features.len(), records = records.len(), "Normalized USGS events");

        for (table, title, max_age_days) in TABLES {
            let dataset = DatasetName::new(table)?;
            ctx.upsert(&dataset, &schema, &records).await?;

            let default = max_age_days.map(RetentionPolicy::days).unwrap_or_default();
            let policy = config.retention_or(table, default);
            ctx.evict(&dataset, &schema, &policy).await?;

            let style = style_for(STYLE, table);
            ctx.announce(&dataset, &LayerMetadata::vector(title), Some(&style)).await;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use dataqs_core::normalize::{normalize, FieldValue};

    const GEOJSON: &str = r#"{
        "type": "FeatureCollection",
        "metadata": {"generated": 1456833600000, "title": "USGS All Earthquakes, Past Day"},
        "features": [
            {
                "type": "Feature",
                "id": "us10004u1y",
                "properties": {
                    "mag": 4.7, "place": "45km SW of Sola, Vanuatu", "time": 1456826400000,
                    "updated": 1456830000000, "url": "https://earthquake.usgs.gov/earthquakes/eventpage/us10004u1y",
                    "felt": null, "alert": null, "tsunami": 0, "sig": 340, "magType": "mb",
                    "type": "earthquake", "title": "M 4.7 - 45km SW of Sola, Vanuatu"
                },
                "geometry": {"type": "Point", "coordinates": [167.2, -14.2, 35.0]}
            },
            {
                "type": "Feature",
                "id": "ak12862013",
                "properties": {"mag": 1.1, "time": 1456822800000, "type": "earthquake"},
                "geometry": {"type": "Point", "coordinates": [-150.1, 61.5]}
            },
            {
                "type": "Feature",
                "id": "broken1",
                "properties": {"mag": 2.0, "time": 1456822800000},
                "geometry": null
            }
        ]
    }"#;

    #[test]
    fn test_parse_features() {
        let features = parse_features(GEOJSON.as_bytes()).unwrap();
        assert_eq!(features.len(), 3);
        assert_eq!(features[0].id.as_deref(), Some("us10004u1y"));
    }

    #[test]
    fn test_mapper_reads_properties_and_depth() {
        let features = parse_features(GEOJSON.as_bytes()).unwrap();
        let schema = schema().unwrap();
        let results: Vec<_> = normalize(&features, &QuakeMapper, &schema).collect();

        let first = results[0].as_ref().unwrap();
        assert_eq!(first.value("mag"), &FieldValue::Real(4.7));
        assert_eq!(first.value("depth"), &FieldValue::Real(35.0));
        assert_eq!(first.value("sig"), &FieldValue::Integer(340));
        assert!(first.value("felt").is_null());
        assert_eq!(
            first.value("time"),
            &FieldValue::Timestamp(Utc.with_ymd_and_hms(2016, 3, 1, 10, 0, 0).unwrap())
        );
        assert_eq!(first.value("the_geom"), &FieldValue::Geometry(Geometry::point(167.2, -14.2)));

        let second = results[1].as_ref().unwrap();
        assert!(second.value("depth").is_null());

        let err = results[2].as_ref().unwrap_err();
        assert!(err.reason.contains("broken1"));
    }

    #[test]
    fn test_table_retention_defaults() {
        let days: Vec<_> = TABLES.iter().map(|(_, _, d)| *d).collect();
        assert_eq!(days, vec![Some(7), Some(30), Some(365), None]);
    }
}
