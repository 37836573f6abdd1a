//! Batch standardize-then-ingest through the facade, including the
//! allow_partial gate.

use evd_schemas::{
    AnnouncementRawRecord, EventFilter, EventPolarity, NormalizeIngestRequest,
    NormalizePreviewRequest,
};
use evd_service::EventService;

async fn service_with_store(dir: &tempfile::TempDir) -> anyhow::Result<EventService> {
    let pool = evd_db::connect(dir.path().join("evd.db")).await?;
    evd_db::migrate(&pool).await?;
    Ok(EventService::new(pool, None))
}

fn record(event_id: &str, symbol: Option<&str>, title: &str) -> AnnouncementRawRecord {
    AnnouncementRawRecord {
        source_event_id: Some(event_id.to_string()),
        symbol: symbol.map(str::to_string),
        title: title.to_string(),
        publish_time_text: Some("2024-05-06 09:30:00".to_string()),
        ..AnnouncementRawRecord::default()
    }
}

fn preview_request(records: Vec<AnnouncementRawRecord>) -> NormalizePreviewRequest {
    NormalizePreviewRequest {
        source_name: "ann_cn".to_string(),
        records,
        default_symbol: None,
        default_timezone: "Asia/Shanghai".to_string(),
        source_reliability_score: 0.8,
    }
}

#[tokio::test]
async fn scenario_normalize_ingest_roundtrip() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let service = service_with_store(&dir).await?;
    service
        .register_source(&evd_schemas::EventSourceRegisterRequest::new("ann_cn"))
        .await?;

    let result = service
        .normalize_and_ingest(&NormalizeIngestRequest {
            request: preview_request(vec![
                record("n-1", Some("600000"), "公司发布股份回购进展公告"),
                record("n-2", Some("600000"), "收到证监会立案调查通知"),
            ]),
            allow_partial: true,
        })
        .await?;

    let ingest = result.ingest.expect("ingest ran");
    assert_eq!(ingest.inserted, 2);

    let rows = service
        .list_events(&EventFilter { symbol: Some("600000".to_string()), ..EventFilter::default() })
        .await?;
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().any(|r| r.polarity == EventPolarity::Positive));
    assert!(rows.iter().any(|r| r.polarity == EventPolarity::Negative));

    // A row without a symbol is an error; with allow_partial=false the
    // whole request aborts before persisting anything.
    let err = service
        .normalize_and_ingest(&NormalizeIngestRequest {
            request: preview_request(vec![record("n-3", None, "减持公告")]),
            allow_partial: false,
        })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("normalize failed"));

    let rows = service.list_events(&EventFilter::default()).await?;
    assert_eq!(rows.len(), 2);
    Ok(())
}
