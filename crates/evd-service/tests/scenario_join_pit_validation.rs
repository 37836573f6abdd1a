//! Point-in-time join validation: missing events, symbol mismatches, and
//! use-before-effective all surface as critical issues.

use chrono::{Duration, TimeZone, Utc};

use evd_schemas::{
    EventBatchIngestRequest, EventJoinPitRow, EventJoinPitValidationRequest, EventPolarity,
    EventRecordCreate, Metadata,
};
use evd_service::EventService;

async fn service_with_store(dir: &tempfile::TempDir) -> anyhow::Result<EventService> {
    let pool = evd_db::connect(dir.path().join("evd.db")).await?;
    evd_db::migrate(&pool).await?;
    Ok(EventService::new(pool, None))
}

#[tokio::test]
async fn scenario_join_pit_validation() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let service = service_with_store(&dir).await?;
    service
        .register_source(&evd_schemas::EventSourceRegisterRequest::new("ann_cn"))
        .await?;

    let publish = Utc.with_ymd_and_hms(2024, 5, 6, 1, 0, 0).unwrap();
    let effective = publish + Duration::hours(6);
    service
        .ingest(&EventBatchIngestRequest {
            source_name: "ann_cn".to_string(),
            events: vec![EventRecordCreate {
                event_id: "pit-1".to_string(),
                symbol: "600000".to_string(),
                event_type: "share_buyback".to_string(),
                publish_time: publish,
                effective_time: Some(effective),
                polarity: EventPolarity::Positive,
                score: 0.8,
                confidence: 0.6,
                title: "t".to_string(),
                summary: String::new(),
                raw_ref: None,
                tags: vec![],
                metadata: Metadata::new(),
            }],
        })
        .await?;

    let row = |event_id: &str, symbol: &str, at| EventJoinPitRow {
        event_id: event_id.to_string(),
        symbol: symbol.to_string(),
        used_in_trade_time: at,
        source_name: Some("ann_cn".to_string()),
    };

    // Clean join: used after the effective time.
    let ok = service
        .validate_join(&EventJoinPitValidationRequest {
            rows: vec![row("pit-1", "600000", effective + Duration::hours(1))],
            strict_symbol_match: true,
        })
        .await?;
    assert!(ok.passed);
    assert_eq!(ok.checked_rows, 1);

    // One missing event, one symbol mismatch, one lookahead use.
    let bad = service
        .validate_join(&EventJoinPitValidationRequest {
            rows: vec![
                row("ghost", "600000", effective + Duration::hours(1)),
                row("pit-1", "000001", effective + Duration::hours(1)),
                row("pit-1", "600000", publish + Duration::hours(1)),
            ],
            strict_symbol_match: true,
        })
        .await?;
    assert!(!bad.passed);
    assert_eq!(bad.checked_rows, 3);
    assert!(bad.issues.iter().any(|i| i.issue_type == "event_not_found" && i.row_index == 0));
    assert!(bad.issues.iter().any(|i| i.issue_type == "symbol_mismatch" && i.row_index == 1));
    assert!(bad.issues.iter().any(|i| i.issue_type == "lookahead_violation" && i.row_index == 2));

    // An empty request is a validation error.
    assert!(service
        .validate_join(&EventJoinPitValidationRequest { rows: vec![], strict_symbol_match: true })
        .await
        .is_err());
    Ok(())
}
