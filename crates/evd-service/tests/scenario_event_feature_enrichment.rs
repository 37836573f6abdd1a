//! Decayed event-feature enrichment: positive and negative polarities
//! aggregate separately with a `2^(-age/half_life)` weight over the
//! trailing lookback window.

use chrono::{NaiveDate, TimeZone, Utc};

use evd_schemas::{
    EventBatchIngestRequest, EventFeaturePreviewRequest, EventPolarity, EventRecordCreate, Metadata,
};
use evd_service::EventService;

async fn service_with_store(dir: &tempfile::TempDir) -> anyhow::Result<EventService> {
    let pool = evd_db::connect(dir.path().join("evd.db")).await?;
    evd_db::migrate(&pool).await?;
    Ok(EventService::new(pool, None))
}

fn event(event_id: &str, day: u32, polarity: EventPolarity, score: f64) -> EventRecordCreate {
    EventRecordCreate {
        event_id: event_id.to_string(),
        symbol: "600000".to_string(),
        event_type: "share_buyback".to_string(),
        publish_time: Utc.with_ymd_and_hms(2024, 5, day, 2, 0, 0).unwrap(),
        effective_time: None,
        polarity,
        score,
        confidence: 0.6,
        title: "t".to_string(),
        summary: String::new(),
        raw_ref: None,
        tags: vec![],
        metadata: Metadata::new(),
    }
}

#[tokio::test]
async fn scenario_event_feature_enrichment() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let service = service_with_store(&dir).await?;
    service
        .register_source(&evd_schemas::EventSourceRegisterRequest::new("ann_cn"))
        .await?;

    service
        .ingest(&EventBatchIngestRequest {
            source_name: "ann_cn".to_string(),
            events: vec![
                event("pos-1", 1, EventPolarity::Positive, 0.8),
                event("neg-1", 3, EventPolarity::Negative, 0.4),
                event("neu-1", 3, EventPolarity::Neutral, 0.5),
            ],
        })
        .await?;

    // Half-life 2 days: on May 5 the May 1 event has age 4 (weight 0.25)
    // and the May 3 events have age 2 (weight 0.5).
    let points = service
        .enrich_bars(
            "600000",
            &[NaiveDate::from_ymd_opt(2024, 5, 5).unwrap()],
            30,
            2.0,
        )
        .await?;
    assert_eq!(points.len(), 1);
    let point = &points[0];
    assert_eq!(point.event_count, 3);
    assert_eq!(point.positive_event_count, 1);
    assert_eq!(point.negative_event_count, 1);
    assert!((point.event_score - 0.25 * 0.8).abs() < 1e-9);
    assert!((point.negative_event_score - 0.5 * 0.4).abs() < 1e-9);

    // Same-day events decay with weight 1.
    let same_day = service
        .enrich_bars(
            "600000",
            &[NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()],
            30,
            2.0,
        )
        .await?;
    assert!((same_day[0].event_score - 0.8).abs() < 1e-9);
    assert_eq!(same_day[0].event_count, 1);

    // Events beyond the lookback window do not contribute.
    let far = service
        .enrich_bars(
            "600000",
            &[NaiveDate::from_ymd_opt(2024, 5, 20).unwrap()],
            3,
            2.0,
        )
        .await?;
    assert_eq!(far[0].event_count, 0);
    assert_eq!(far[0].event_score, 0.0);

    // preview_features expands the date range.
    let preview = service
        .preview_features(&EventFeaturePreviewRequest {
            symbol: "600000".to_string(),
            start_date: NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2024, 5, 5).unwrap(),
            lookback_days: 30,
            decay_half_life_days: 2.0,
        })
        .await?;
    assert_eq!(preview.len(), 5);
    Ok(())
}
