//! Snapshot publication tests
//!
//! Coverage includes:
//! - Failed builds leave the live dataset untouched
//! - Readers never observe an empty or partial live dataset
//! - Swap failures roll back to the previous version
//! - Failed rollbacks and leftover previous slots stop later publishes

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::*;
use dataqs_core::publish::SnapshotPublisher;
use dataqs_core::store::{RecordStore, SlotStore};
use dataqs_core::PipelineError;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Atomicity
// ============================================================================

#[tokio::test]
async fn test_failed_build_keeps_live_identical() -> anyhow::Result<()> {
    init_tracing();
    let (dir, store) = document_store();
    let dataset = name("quakes_weekly");
    let schema = quake_schema();
    let publisher = SnapshotPublisher::new(&store, TIMEOUT);

    let original = vec![quake("a", days_ago(1)), quake("b", days_ago(2))];
    publisher.publish_records(&dataset, &schema, &original, 100).await?;
    let before = store.records(&dataset, &schema).await?;
    let catalog_before = std::fs::read(dir.path().join("store").join("slots.json"))?;

    let result = publisher
        .publish(&dataset, &schema, |staging| {
            let store = &store;
            let schema = &schema;
            async move {
                store.insert_if_absent(&staging, schema, &[quake("c", days_ago(1))]).await?;
                Err(PipelineError::feed("upstream truncated"))
            }
        })
        .await;

    assert!(matches!(result, Err(PipelineError::Feed(_))));
    assert_eq!(store.records(&dataset, &schema).await?, before);
    assert_eq!(std::fs::read(dir.path().join("store").join("slots.json"))?, catalog_before);
    assert!(!store.slot_exists(&name("quakes_weekly_tmp")).await?);
    Ok(())
}

#[tokio::test]
async fn test_live_stays_readable_during_publish() -> anyhow::Result<()> {
    init_tracing();
    let (_dir, store) = document_store();
    let store = Arc::new(store);
    let dataset = name("mmwr_weekly");
    let schema = quake_schema();

    let old: Vec<_> = (0..20).map(|i| quake(&format!("old{i}"), days_ago(1))).collect();
    SnapshotPublisher::new(store.as_ref(), TIMEOUT)
        .publish_records(&dataset, &schema, &old, 5)
        .await?;

    let reader = {
        let store = Arc::clone(&store);
        let dataset = dataset.clone();
        tokio::spawn(async move {
            let mut observed = Vec::new();
            for _ in 0..200 {
                observed.push(store.count(&dataset).await.unwrap());
                tokio::task::yield_now().await;
            }
            observed
        })
    };

    let new: Vec<_> = (0..30).map(|i| quake(&format!("new{i}"), days_ago(1))).collect();
    SnapshotPublisher::new(store.as_ref(), TIMEOUT)
        .publish_records(&dataset, &schema, &new, 5)
        .await?;

    let observed = reader.await?;
    assert!(observed.iter().all(|&n| n == 20 || n == 30), "reader saw {:?}", observed);
    assert_eq!(store.count(&dataset).await?, 30);
    Ok(())
}

// ============================================================================
// Swap Failures
// ============================================================================

#[tokio::test]
async fn test_swap_failure_restores_previous() -> anyhow::Result<()> {
    init_tracing();
    let (_dir, inner) = document_store();
    let store = FaultyStore::new(inner);
    let dataset = name("quakes_monthly");
    let schema = quake_schema();
    let publisher = SnapshotPublisher::new(&store, TIMEOUT);

    publisher
        .publish_records(&dataset, &schema, &[quake("a", days_ago(3))], 100)
        .await?;

    store.fail_promote.store(true, Ordering::SeqCst);
    let result = publisher
        .publish_records(&dataset, &schema, &[quake("z", days_ago(1))], 100)
        .await;

    assert!(matches!(result, Err(PipelineError::PublishSwapFailure { .. })));
    assert_eq!(store.records(&dataset, &schema).await?, vec![quake("a", days_ago(3))]);
    assert!(!store.slot_exists(&name("quakes_monthly_tmp")).await?);
    assert!(!store.slot_exists(&name("quakes_monthly_prev")).await?);

    // The next run goes through normally.
    publisher
        .publish_records(&dataset, &schema, &[quake("z", days_ago(1))], 100)
        .await?;
    assert_eq!(store.records(&dataset, &schema).await?, vec![quake("z", days_ago(1))]);
    Ok(())
}

#[tokio::test]
async fn test_failed_restore_is_interrupted_swap() -> anyhow::Result<()> {
    init_tracing();
    let (_dir, inner) = document_store();
    let store = FaultyStore::new(inner);
    let dataset = name("quakes_yearly");
    let schema = quake_schema();
    let publisher = SnapshotPublisher::new(&store, TIMEOUT);

    publisher
        .publish_records(&dataset, &schema, &[quake("a", days_ago(3))], 100)
        .await?;

    store.fail_promote.store(true, Ordering::SeqCst);
    store.fail_restore.store(true, Ordering::SeqCst);
    let result = publisher
        .publish_records(&dataset, &schema, &[quake("z", days_ago(1))], 100)
        .await;
    assert!(matches!(result, Err(PipelineError::InterruptedSwap { .. })));

    // Later runs refuse to start until someone resolves the leftover slot.
    let again = publisher
        .publish_records(&dataset, &schema, &[quake("z", days_ago(1))], 100)
        .await;
    assert!(matches!(again, Err(PipelineError::InterruptedSwap { .. })));
    assert!(store.slot_exists(&name("quakes_yearly_prev")).await?);
    Ok(())
}

#[tokio::test]
async fn test_failed_previous_drop_is_not_fatal() -> anyhow::Result<()> {
    init_tracing();
    let (_dir, inner) = document_store();
    let store = FaultyStore::new(inner);
    let dataset = name("mmwr_weekly");
    let schema = quake_schema();
    let publisher = SnapshotPublisher::new(&store, TIMEOUT);

    publisher
        .publish_records(&dataset, &schema, &[quake("a", days_ago(3))], 100)
        .await?;

    store.fail_drop_previous.store(true, Ordering::SeqCst);
    let (report, _) = publisher
        .publish_records(&dataset, &schema, &[quake("b", days_ago(1))], 100)
        .await?;

    assert!(report.replaced);
    assert!(report.previous_left);
    assert_eq!(store.records(&dataset, &schema).await?, vec![quake("b", days_ago(1))]);
    Ok(())
}
