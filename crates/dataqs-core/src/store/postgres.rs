//! PostGIS-backed store
//!
//! Each slot is a table. Tables carry a generated `dataqs_id` column for
//! count-based retention, an unnamed `UNIQUE` constraint on the natural key
//! and unnamed indexes on the timestamp and geometry columns. Leaving the
//! constraint and index names to Postgres means a renamed table never
//! collides with the names of a freshly created staging table.
//!
//! All values are bound parameters; identifiers are validated
//! [`DatasetName`]s or schema field names and always quoted.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dataqs_common::DatasetName;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{quote_ident, InsertOutcome, RecordStore, Result, RowError, SlotStore, StoreError};
use crate::config::DatabaseConfig;
use crate::normalize::{FieldType, FieldValue, Geometry, Record, RecordSchema};

/// Surrogate column used to order records and to trim by count.
pub const ID_COLUMN: &str = "dataqs_id";

#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| StoreError::Unavailable("database.url is not set".to_string()))?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect(url)
            .await?;

        info!(max_connections = config.max_connections, "Connected to Postgres");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn table_exists(&self, table: &DatasetName) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM pg_catalog.pg_tables \
             WHERE schemaname = current_schema() AND tablename = $1)",
        )
        .bind(table.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn check_columns(&self, table: &DatasetName, schema: &RecordSchema) -> Result<()> {
        let columns: Vec<String> = sqlx::query_scalar(
            "SELECT column_name::text FROM information_schema.columns \
             WHERE table_schema = current_schema() AND table_name = $1",
        )
        .bind(table.as_str())
        .fetch_all(&self.pool)
        .await?;
        let columns: HashSet<String> = columns.into_iter().collect();

        let missing: Vec<&str> = schema
            .fields()
            .iter()
            .map(|f| f.name.as_str())
            .filter(|name| !columns.contains(*name))
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(StoreError::Schema {
                dataset: table.to_string(),
                detail: format!("missing columns: {}", missing.join(", ")),
            })
        }
    }
}

fn column_type(field_type: FieldType) -> &'static str {
    match field_type {
        FieldType::Integer => "BIGINT",
        FieldType::Real => "DOUBLE PRECISION",
        FieldType::Text => "TEXT",
        FieldType::Timestamp => "TIMESTAMPTZ",
        FieldType::Geometry => "geometry(Geometry, 4326)",
    }
}

fn quote_field(name: &str) -> String {
    format!("\"{}\"", name)
}

fn create_table_sql(table: &DatasetName, schema: &RecordSchema) -> Vec<String> {
    let mut columns = vec![format!("{} BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY", ID_COLUMN)];
    for field in schema.fields() {
        columns.push(format!("{} {}", quote_field(&field.name), column_type(field.field_type)));
    }
    let key: Vec<String> = schema.key().iter().map(|k| quote_field(k)).collect();
    columns.push(format!("UNIQUE ({})", key.join(", ")));

    let quoted = quote_ident(table);
    let mut statements = vec![
        format!("CREATE TABLE IF NOT EXISTS {} ({})", quoted, columns.join(", ")),
        format!("CREATE INDEX ON {} ({})", quoted, quote_field(schema.timestamp_field())),
    ];
    for field in schema.fields().iter().filter(|f| f.field_type == FieldType::Geometry) {
        statements.push(format!("CREATE INDEX ON {} USING GIST ({})", quoted, quote_field(&field.name)));
    }
    statements
}

/// Bind one value according to its declared column type.
fn push_value(qb: &mut QueryBuilder<'_, Postgres>, field_type: FieldType, value: &FieldValue) {
    match (field_type, value) {
        (_, FieldValue::Integer(v)) => {
            qb.push_bind(*v);
        },
        (_, FieldValue::Real(v)) => {
            qb.push_bind(*v);
        },
        (_, FieldValue::Text(v)) => {
            qb.push_bind(v.clone());
        },
        (_, FieldValue::Timestamp(v)) => {
            qb.push_bind(*v);
        },
        (_, FieldValue::Geometry(g)) => {
            qb.push("ST_GeomFromText(").push_bind(g.to_wkt()).push(", 4326)");
        },
        (FieldType::Integer, FieldValue::Null) => {
            qb.push_bind(None::<i64>);
        },
        (FieldType::Real, FieldValue::Null) => {
            qb.push_bind(None::<f64>);
        },
        (FieldType::Text, FieldValue::Null) => {
            qb.push_bind(None::<String>);
        },
        (FieldType::Timestamp, FieldValue::Null) => {
            qb.push_bind(None::<DateTime<Utc>>);
        },
        (FieldType::Geometry, FieldValue::Null) => {
            qb.push("ST_GeomFromText(").push_bind(None::<String>).push(", 4326)");
        },
    }
}

fn insert_query<'a>(table: &DatasetName, schema: &RecordSchema, record: &Record) -> QueryBuilder<'a, Postgres> {
    let columns: Vec<String> = schema.fields().iter().map(|f| quote_field(&f.name)).collect();
    let mut qb = QueryBuilder::new(format!(
        "INSERT INTO {} ({}) VALUES (",
        quote_ident(table),
        columns.join(", ")
    ));

    for (i, field) in schema.fields().iter().enumerate() {
        if i > 0 {
            qb.push(", ");
        }
        push_value(&mut qb, field.field_type, record.value(&field.name));
    }
    qb.push(") ON CONFLICT DO NOTHING");
    qb
}

fn decode_row(row: &PgRow, schema: &RecordSchema) -> Result<Record> {
    let mut record = Record::new();
    for field in schema.fields() {
        let name = field.name.as_str();
        let value: FieldValue = match field.field_type {
            FieldType::Integer => row.try_get::<Option<i64>, _>(name)?.into(),
            FieldType::Real => row.try_get::<Option<f64>, _>(name)?.into(),
            FieldType::Text => row.try_get::<Option<String>, _>(name)?.into(),
            FieldType::Timestamp => row.try_get::<Option<DateTime<Utc>>, _>(name)?.into(),
            FieldType::Geometry => match row.try_get::<Option<String>, _>(name)? {
                Some(wkt) => FieldValue::Geometry(parse_wkt(&wkt).ok_or_else(|| StoreError::Schema {
                    dataset: String::new(),
                    detail: format!("unsupported geometry in column {}: {}", name, wkt),
                })?),
                None => FieldValue::Null,
            },
        };
        if !value.is_null() {
            record.set(name, value);
        }
    }
    Ok(record)
}

/// Parse the POINT and MULTIPOINT forms produced by `ST_AsText`.
fn parse_wkt(wkt: &str) -> Option<Geometry> {
    let wkt = wkt.trim();
    let upper = wkt.to_ascii_uppercase();

    let coords = |body: &str| -> Option<Vec<(f64, f64)>> {
        body.replace(['(', ')'], "")
            .split(',')
            .map(|pair| {
                let mut parts = pair.split_whitespace();
                let lon = parts.next()?.parse::<f64>().ok()?;
                let lat = parts.next()?.parse::<f64>().ok()?;
                Some((lon, lat))
            })
            .collect()
    };

    if let Some(body) = upper.strip_prefix("MULTIPOINT") {
        Some(Geometry::MultiPoint { points: coords(body)? })
    } else if let Some(body) = upper.strip_prefix("POINT") {
        let points = coords(body)?;
        match points.as_slice() {
            [(lon, lat)] => Some(Geometry::point(*lon, *lat)),
            _ => None,
        }
    } else {
        None
    }
}

#[async_trait]
impl RecordStore for PostgresStore {
    async fn ensure_dataset(&self, dataset: &DatasetName, schema: &RecordSchema) -> Result<bool> {
        if self.table_exists(dataset).await? {
            self.check_columns(dataset, schema).await?;
            return Ok(false);
        }

        let mut tx = self.pool.begin().await?;
        for statement in create_table_sql(dataset, schema) {
            sqlx::query(&statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;

        debug!(dataset = %dataset, "Created table");
        Ok(true)
    }

    async fn insert_if_absent(
        &self,
        dataset: &DatasetName,
        schema: &RecordSchema,
        records: &[Record],
    ) -> Result<Vec<std::result::Result<InsertOutcome, RowError>>> {
        let mut outcomes = Vec::with_capacity(records.len());
        let mut tx = self.pool.begin().await?;

        for (index, record) in records.iter().enumerate() {
            sqlx::query("SAVEPOINT dataqs_row").execute(&mut *tx).await?;

            let result = insert_query(dataset, schema, record).build().execute(&mut *tx).await;
            match result {
                Ok(done) => {
                    sqlx::query("RELEASE SAVEPOINT dataqs_row").execute(&mut *tx).await?;
                    outcomes.push(Ok(if done.rows_affected() == 1 {
                        InsertOutcome::Inserted
                    } else {
                        InsertOutcome::ConflictSkipped
                    }));
                },
                Err(sqlx::Error::Database(db_err)) => {
                    sqlx::query("ROLLBACK TO SAVEPOINT dataqs_row").execute(&mut *tx).await?;
                    warn!(dataset = %dataset, row = index, error = %db_err, "Row rejected by store");
                    outcomes.push(Err(RowError {
                        index,
                        reason: db_err.to_string(),
                    }));
                },
                Err(other) => return Err(other.into()),
            }
        }

        tx.commit().await?;
        Ok(outcomes)
    }

    async fn delete_older_than(
        &self,
        dataset: &DatasetName,
        schema: &RecordSchema,
        cutoff: DateTime<Utc>,
    ) -> Result<u64> {
        let table = quote_ident(dataset);
        let ts = quote_field(schema.timestamp_field());
        let sql = format!(
            "DELETE FROM {table} WHERE {ts} < $1 AND {ts} < (SELECT max({ts}) FROM {table})",
            table = table,
            ts = ts
        );

        let done = sqlx::query(&sql).bind(cutoff).execute(&self.pool).await?;
        Ok(done.rows_affected())
    }

    async fn retain_newest(&self, dataset: &DatasetName, schema: &RecordSchema, max_count: u64) -> Result<u64> {
        let table = quote_ident(dataset);
        let sql = format!(
            "DELETE FROM {table} WHERE {id} IN (SELECT {id} FROM {table} ORDER BY {ts} DESC NULLS LAST, {id} DESC OFFSET $1)",
            table = table,
            id = ID_COLUMN,
            ts = quote_field(schema.timestamp_field())
        );

        let offset = i64::try_from(max_count).unwrap_or(i64::MAX);
        let done = sqlx::query(&sql).bind(offset).execute(&self.pool).await?;
        Ok(done.rows_affected())
    }

    async fn count(&self, dataset: &DatasetName) -> Result<u64> {
        let sql = format!("SELECT count(*) FROM {}", quote_ident(dataset));
        let count: i64 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(count.max(0) as u64)
    }

    async fn records(&self, dataset: &DatasetName, schema: &RecordSchema) -> Result<Vec<Record>> {
        let select: Vec<String> = schema
            .fields()
            .iter()
            .map(|f| match f.field_type {
                FieldType::Geometry => format!("ST_AsText({0}) AS {0}", quote_field(&f.name)),
                _ => quote_field(&f.name),
            })
            .collect();
        let sql = format!(
            "SELECT {} FROM {} ORDER BY {}",
            select.join(", "),
            quote_ident(dataset),
            ID_COLUMN
        );

        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(|row| decode_row(row, schema)).collect()
    }
}

#[async_trait]
impl SlotStore for PostgresStore {
    async fn slot_exists(&self, slot: &DatasetName) -> Result<bool> {
        self.table_exists(slot).await
    }

    async fn move_slot(&self, from: &DatasetName, to: &DatasetName) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let exists = |name: &DatasetName| {
            sqlx::query_scalar::<_, bool>(
                "SELECT EXISTS (SELECT 1 FROM pg_catalog.pg_tables \
                 WHERE schemaname = current_schema() AND tablename = $1)",
            )
            .bind(name.as_str().to_string())
        };

        if exists(to).fetch_one(&mut *tx).await? {
            return Err(StoreError::SlotExists(to.to_string()));
        }
        if !exists(from).fetch_one(&mut *tx).await? {
            return Err(StoreError::SlotMissing(from.to_string()));
        }

        let sql = format!("ALTER TABLE {} RENAME TO {}", quote_ident(from), quote_ident(to));
        sqlx::query(&sql).execute(&mut *tx).await?;
        tx.commit().await?;

        debug!(from = %from, to = %to, "Renamed table");
        Ok(())
    }

    async fn replace_slot(&self, from: &DatasetName, live: &DatasetName, previous: &DatasetName) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let exists = |name: &DatasetName| {
            sqlx::query_scalar::<_, bool>(
                "SELECT EXISTS (SELECT 1 FROM pg_catalog.pg_tables \
                 WHERE schemaname = current_schema() AND tablename = $1)",
            )
            .bind(name.as_str().to_string())
        };

        if exists(previous).fetch_one(&mut *tx).await? {
            return Err(StoreError::SlotExists(previous.to_string()));
        }
        for name in [from, live] {
            if !exists(name).fetch_one(&mut *tx).await? {
                return Err(StoreError::SlotMissing(name.to_string()));
            }
        }

        for (old, new) in [(live, previous), (from, live)] {
            let sql = format!("ALTER TABLE {} RENAME TO {}", quote_ident(old), quote_ident(new));
            sqlx::query(&sql).execute(&mut *tx).await?;
        }
        tx.commit().await?;

        debug!(from = %from, live = %live, previous = %previous, "Swapped tables");
        Ok(())
    }

    async fn drop_slot(&self, slot: &DatasetName) -> Result<()> {
        let sql = format!("DROP TABLE IF EXISTS {}", quote_ident(slot));
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn schema() -> RecordSchema {
        RecordSchema::builder()
            .field("place_name", FieldType::Text)
            .field("link", FieldType::Text)
            .field("the_geom", FieldType::Geometry)
            .field("date", FieldType::Timestamp)
            .key(&["link", "place_name"])
            .timestamp("date")
            .build()
            .unwrap()
    }

    #[test]
    fn test_create_table_sql() {
        let table = DatasetName::new("healthmap90days").unwrap();
        let statements = create_table_sql(&table, &schema());

        assert_eq!(statements.len(), 3);
        assert!(statements[0].starts_with("CREATE TABLE IF NOT EXISTS \"healthmap90days\""));
        assert!(statements[0].contains("\"the_geom\" geometry(Geometry, 4326)"));
        assert!(statements[0].contains("UNIQUE (\"link\", \"place_name\")"));
        assert_eq!(statements[1], "CREATE INDEX ON \"healthmap90days\" (\"date\")");
        assert!(statements[2].contains("USING GIST (\"the_geom\")"));
    }

    #[test]
    fn test_insert_query_binds_values() {
        let table = DatasetName::new("healthmap90days").unwrap();
        let record = Record::new()
            .with("place_name", "Lagos")
            .with("link", "http://example.org/a")
            .with("the_geom", Geometry::point(3.4, 6.5));

        let mut qb = insert_query(&table, &schema(), &record);
        let sql = qb.sql().to_string();

        assert_eq!(
            sql,
            "INSERT INTO \"healthmap90days\" (\"place_name\", \"link\", \"the_geom\", \"date\") \
             VALUES ($1, $2, ST_GeomFromText($3, 4326), $4) ON CONFLICT DO NOTHING"
        );
        assert!(!sql.contains("Lagos"));
        let _ = qb.build();
    }

    #[test]
    fn test_parse_wkt() {
        assert_eq!(parse_wkt("POINT(3.4 6.5)"), Some(Geometry::point(3.4, 6.5)));
        assert_eq!(
            parse_wkt("MULTIPOINT((1 2),(3 4))"),
            Some(Geometry::MultiPoint {
                points: vec![(1.0, 2.0), (3.0, 4.0)]
            })
        );
        assert_eq!(
            parse_wkt("MULTIPOINT(1 2,3 4)"),
            Some(Geometry::MultiPoint {
                points: vec![(1.0, 2.0), (3.0, 4.0)]
            })
        );
        assert_eq!(parse_wkt("LINESTRING(0 0,1 1)"), None);
    }
}
