//! Three labelers agree on one event (clean consensus) and split on
//! another (conflict recorded); an under-labeled event is skipped.

use evd_governance::NlpGovernance;
use evd_schemas::{
    AdjudicationRequest, EventBatchIngestRequest, EventPolarity, EventRecordCreate,
    LabelEntryUpsertRequest, Metadata,
};
use evd_testkit::{seed_source, ts, TestStore};

fn event(event_id: &str, hour: u32) -> EventRecordCreate {
    EventRecordCreate {
        event_id: event_id.to_string(),
        symbol: "600000".to_string(),
        event_type: "share_buyback".to_string(),
        publish_time: ts(2024, 5, 6, hour, 0),
        effective_time: None,
        polarity: EventPolarity::Positive,
        score: 0.7,
        confidence: 0.6,
        title: "回购公告".to_string(),
        summary: String::new(),
        raw_ref: None,
        tags: vec![],
        metadata: Metadata::new(),
    }
}

fn label(
    event_id: &str,
    labeler: &str,
    event_type: &str,
    polarity: EventPolarity,
    score: Option<f64>,
) -> LabelEntryUpsertRequest {
    LabelEntryUpsertRequest {
        source_name: "ann_cn".to_string(),
        event_id: event_id.to_string(),
        labeler: labeler.to_string(),
        label_event_type: event_type.to_string(),
        label_polarity: polarity,
        label_score: score,
        note: String::new(),
    }
}

#[tokio::test]
async fn scenario_adjudication_builds_consensus() -> anyhow::Result<()> {
    let store = TestStore::new().await?;
    let service = store.service();
    seed_source(&service, "ann_cn").await?;

    service
        .ingest(&EventBatchIngestRequest {
            source_name: "ann_cn".to_string(),
            events: vec![event("adj-1", 1), event("adj-2", 2), event("adj-3", 3)],
        })
        .await?;

    let governance = NlpGovernance::new(store.pool.clone(), Some(store.audit.clone()), None);

    // adj-1: unanimous across three labelers.
    for (labeler, score) in [("ana", Some(0.8)), ("bo", Some(0.7)), ("chen", Some(0.75))] {
        governance
            .upsert_label_entry(&label("adj-1", labeler, "share_buyback", EventPolarity::Positive, score))
            .await?;
    }
    // adj-2: disagreement on both axes.
    governance
        .upsert_label_entry(&label("adj-2", "ana", "share_buyback", EventPolarity::Positive, Some(0.9)))
        .await?;
    governance
        .upsert_label_entry(&label("adj-2", "bo", "share_pledge", EventPolarity::Negative, Some(0.2)))
        .await?;
    // adj-3: a single labeler, below min_labelers.
    governance
        .upsert_label_entry(&label("adj-3", "ana", "share_buyback", EventPolarity::Positive, None))
        .await?;

    let result = governance
        .adjudicate_labels(&AdjudicationRequest {
            source_name: Some("ann_cn".to_string()),
            ..AdjudicationRequest::default()
        })
        .await?;

    assert_eq!(result.total_events, 3);
    assert_eq!(result.adjudicated, 2);
    assert_eq!(result.skipped, 1);
    assert_eq!(result.conflicts, 1);

    let unanimous = result.items.iter().find(|i| i.event_id == "adj-1").unwrap();
    assert!(!unanimous.conflict);
    assert_eq!(unanimous.consensus_event_type.as_deref(), Some("share_buyback"));
    assert_eq!(unanimous.consensus_polarity, Some(EventPolarity::Positive));
    assert_eq!(unanimous.consensus_score, Some(0.75)); // median of .7/.75/.8
    assert_eq!(unanimous.label_count, 3);
    assert_eq!(unanimous.consensus_confidence, 1.0);

    let split = result.items.iter().find(|i| i.event_id == "adj-2").unwrap();
    assert!(split.conflict);
    assert!(split.conflict_reasons.iter().any(|r| r == "event_type_disagreement"));
    assert!(split.conflict_reasons.iter().any(|r| r == "polarity_disagreement"));
    assert!(split.conflict_reasons.iter().any(|r| r == "event_type_tie"));
    assert!(split.conflict_reasons.iter().any(|r| r == "score_dispersion_high"));

    // Consensus rows were persisted for adjudicated events.
    let consensus = governance.list_consensus_labels(Some("ann_cn"), None, None, 10).await?;
    assert_eq!(consensus.len(), 2);
    assert!(consensus.iter().any(|c| c.event_id == "adj-1" && !c.conflict));
    assert!(consensus.iter().any(|c| c.event_id == "adj-2" && c.conflict));

    // Feedback on an unknown event is rejected.
    let err = governance
        .upsert_feedback(&evd_schemas::FeedbackUpsertRequest {
            source_name: "ann_cn".to_string(),
            event_id: "missing-evt".to_string(),
            label_event_type: "share_buyback".to_string(),
            label_polarity: EventPolarity::Positive,
            label_score: Some(0.5),
            labeler: "ana".to_string(),
            note: String::new(),
        })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("event not found"));
    Ok(())
}
