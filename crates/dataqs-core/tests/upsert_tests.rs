//! Uniqueness under repeated, overlapping and concurrent upserts

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::*;
use dataqs_core::store::{DocumentStore, RecordStore};
use dataqs_core::upsert::UpsertEngine;
use std::collections::HashSet;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn test_overlapping_windows_stay_unique() -> anyhow::Result<()> {
    init_tracing();
    let (_dir, store) = document_store();
    let dataset = name("quakes_archive");
    let schema = quake_schema();
    let engine = UpsertEngine::new(&store, 3, TIMEOUT);

    let monday: Vec<_> = (0..10).map(|i| quake(&format!("q{i}"), days_ago(2))).collect();
    let tuesday: Vec<_> = (5..15).map(|i| quake(&format!("q{i}"), days_ago(1))).collect();

    let first = engine.upsert(&dataset, &schema, &monday).await?;
    let second = engine.upsert(&dataset, &schema, &tuesday).await?;
    let retry = engine.upsert(&dataset, &schema, &tuesday).await?;

    assert_eq!(first.inserted, 10);
    assert_eq!((second.inserted, second.conflicts), (5, 5));
    assert_eq!((retry.inserted, retry.conflicts), (0, 10));
    assert_eq!(store.count(&dataset).await?, 15);
    Ok(())
}

#[tokio::test]
async fn test_concurrent_writers_stay_unique() -> anyhow::Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let dataset = name("healthmap90days");
    let schema = quake_schema();
    let records: Vec<_> = (0..40).map(|i| quake(&format!("alert{i}"), days_ago(1))).collect();

    // Two handles on the same directory behave like two processes.
    let a = DocumentStore::open(dir.path())?;
    let b = DocumentStore::open(dir.path())?;
    let engine_a = UpsertEngine::new(&a, 4, TIMEOUT);
    let engine_b = UpsertEngine::new(&b, 4, TIMEOUT);

    let (ra, rb) = tokio::join!(
        engine_a.upsert(&dataset, &schema, &records),
        engine_b.upsert(&dataset, &schema, &records),
    );
    let (ra, rb) = (ra?, rb?);

    assert_eq!(ra.inserted + rb.inserted, 40);
    assert_eq!(ra.conflicts + rb.conflicts, 40);

    let stored = a.records(&dataset, &schema).await?;
    let keys: HashSet<_> = stored.iter().map(|r| r.natural_key(&schema)).collect();
    assert_eq!(stored.len(), 40);
    assert_eq!(keys.len(), 40);
    Ok(())
}

#[tokio::test]
async fn test_invalid_rows_do_not_abort_batch() -> anyhow::Result<()> {
    init_tracing();
    let (_dir, store) = document_store();
    let dataset = name("quakes_weekly");
    let schema = quake_schema();

    let mut broken = quake("broken", days_ago(1));
    broken.set("mag", "not a number");
    let records = vec![quake("a", days_ago(1)), broken, quake("b", days_ago(1))];

    let result = UpsertEngine::new(&store, 500, TIMEOUT)
        .upsert(&dataset, &schema, &records)
        .await?;

    assert_eq!(result.inserted, 2);
    assert_eq!(result.failed, 1);
    assert_eq!(result.skipped, 1);
    Ok(())
}
