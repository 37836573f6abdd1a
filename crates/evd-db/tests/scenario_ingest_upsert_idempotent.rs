//! Ingest is upsert-on-conflict keyed by `(source_name, event_id)`:
//! re-ingesting reports an update and leaves a single row behind.

use chrono::{TimeZone, Utc};
use sqlx::SqlitePool;

use evd_schemas::{
    DomainError, EventBatchIngestRequest, EventFilter, EventPolarity, EventRecordCreate,
    EventSourceRegisterRequest, Metadata,
};

async fn temp_pool(dir: &tempfile::TempDir) -> anyhow::Result<SqlitePool> {
    let pool = evd_db::connect(dir.path().join("evd.db")).await?;
    evd_db::migrate(&pool).await?;
    Ok(pool)
}

fn sample_event(event_id: &str) -> EventRecordCreate {
    EventRecordCreate {
        event_id: event_id.to_string(),
        symbol: "600000".to_string(),
        event_type: "share_buyback".to_string(),
        publish_time: Utc.with_ymd_and_hms(2024, 5, 6, 1, 30, 0).unwrap(),
        effective_time: None,
        polarity: EventPolarity::Positive,
        score: 0.8,
        confidence: 0.6,
        title: "回购进展公告".to_string(),
        summary: String::new(),
        raw_ref: None,
        tags: vec!["buyback".to_string()],
        metadata: Metadata::new(),
    }
}

#[tokio::test]
async fn scenario_ingest_upsert_idempotent() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let pool = temp_pool(&dir).await?;

    evd_db::register_source(&pool, &EventSourceRegisterRequest::new("ann_cn")).await?;

    let req = EventBatchIngestRequest {
        source_name: "ann_cn".to_string(),
        events: vec![sample_event("idem-1")],
    };

    let first = evd_db::ingest_events(&pool, &req).await?;
    assert_eq!(first.inserted, 1);
    assert_eq!(first.updated, 0);
    assert!(first.errors.is_empty());

    let second = evd_db::ingest_events(&pool, &req).await?;
    assert_eq!(second.inserted, 0);
    assert_eq!(second.updated, 1);

    let rows = evd_db::list_events(&pool, &EventFilter::default()).await?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].event_id, "idem-1");
    assert_eq!(rows[0].tags, vec!["buyback".to_string()]);
    Ok(())
}

#[tokio::test]
async fn ingest_rejects_unknown_source_without_mutation() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let pool = temp_pool(&dir).await?;

    let req = EventBatchIngestRequest {
        source_name: "ghost".to_string(),
        events: vec![sample_event("x-1")],
    };
    let err = evd_db::ingest_events(&pool, &req).await.unwrap_err();
    assert!(matches!(err.downcast_ref::<DomainError>(), Some(DomainError::NotFound(_))));

    let rows = evd_db::list_events(&pool, &EventFilter::default()).await?;
    assert!(rows.is_empty());
    Ok(())
}

#[tokio::test]
async fn ingest_reports_row_errors_by_index_and_continues() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let pool = temp_pool(&dir).await?;
    evd_db::register_source(&pool, &EventSourceRegisterRequest::new("ann_cn")).await?;

    let mut bad = sample_event("bad-1");
    bad.effective_time = Some(bad.publish_time - chrono::Duration::hours(1));
    let good = sample_event("good-1");

    let result = evd_db::ingest_events(
        &pool,
        &EventBatchIngestRequest {
            source_name: "ann_cn".to_string(),
            events: vec![bad, good],
        },
    )
    .await?;

    assert_eq!(result.inserted, 1);
    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].starts_with("idx=0:"));
    assert!(result.errors[0].contains("effective_time"));
    Ok(())
}

#[tokio::test]
async fn migrate_is_idempotent() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let pool = temp_pool(&dir).await?;
    // A second pass must not fail or mutate anything.
    evd_db::migrate(&pool).await?;
    evd_db::register_source(&pool, &EventSourceRegisterRequest::new("ann_cn")).await?;
    evd_db::migrate(&pool).await?;
    assert!(evd_db::get_source(&pool, "ann_cn").await?.is_some());
    Ok(())
}
