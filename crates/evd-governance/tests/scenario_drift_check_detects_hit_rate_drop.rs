//! A current window full of unmatched generic events against a baseline of
//! rule hits trips the hit-rate drop alert, persists a snapshot, and the
//! trend monitor classifies the latest risk.

use chrono::NaiveDate;
use serde_json::json;

use evd_governance::NlpGovernance;
use evd_schemas::{
    DriftCheckRequest, EventBatchIngestRequest, EventPolarity, EventRecordCreate, Metadata,
    SignalLevel,
};
use evd_testkit::{seed_source, ts, TestStore};

fn event(event_id: &str, day: u32, event_type: &str, matched: &str, score: f64) -> EventRecordCreate {
    let mut metadata = Metadata::new();
    metadata.insert("nlp_ruleset_version".to_string(), json!("cn-ann-v1"));
    metadata.insert("matched_rules".to_string(), json!(matched));
    EventRecordCreate {
        event_id: event_id.to_string(),
        symbol: "600000".to_string(),
        event_type: event_type.to_string(),
        publish_time: ts(2024, 4, day, 2, 0),
        effective_time: None,
        polarity: if matched.is_empty() { EventPolarity::Neutral } else { EventPolarity::Positive },
        score,
        confidence: 0.6,
        title: "t".to_string(),
        summary: String::new(),
        raw_ref: None,
        tags: vec![],
        metadata,
    }
}

#[tokio::test]
async fn scenario_drift_check_detects_hit_rate_drop() -> anyhow::Result<()> {
    let store = TestStore::new().await?;
    let service = store.service();
    seed_source(&service, "ann_cn").await?;

    // Baseline window (Apr 1-7): every event matched a rule.
    let mut events: Vec<EventRecordCreate> = (1..=6)
        .map(|i| event(&format!("base-{i}"), i, "share_buyback", "buyback", 0.8))
        .collect();
    // Current window (Apr 8-14): nothing matched.
    events.extend((8..=13).map(|i| event(&format!("cur-{i}"), i, "generic_announcement", "", 0.3)));
    service
        .ingest(&EventBatchIngestRequest { source_name: "ann_cn".to_string(), events })
        .await?;

    let governance = NlpGovernance::new(store.pool.clone(), Some(store.audit.clone()), None);

    let mut req = DriftCheckRequest::new(
        NaiveDate::from_ymd_opt(2024, 4, 8).unwrap(),
        NaiveDate::from_ymd_opt(2024, 4, 14).unwrap(),
    );
    req.source_name = Some("ann_cn".to_string());
    req.include_contribution = false;
    req.include_feedback_quality = false;

    let result = governance.drift_check(&req).await?;

    assert_eq!(result.current.sample_size, 6);
    assert_eq!(result.baseline.sample_size, 6);
    assert_eq!(result.baseline.hit_rate, 1.0);
    assert_eq!(result.current.hit_rate, 0.0);
    assert_eq!(result.hit_rate_delta, -1.0);
    // The drop is far past the critical band.
    assert!(result
        .alerts
        .iter()
        .any(|a| a.metric == "hit_rate" && a.severity == SignalLevel::Critical));
    // Events carry the ruleset that scored them.
    assert_eq!(result.ruleset_version, "cn-ann-v1");
    let snapshot_id = result.snapshot_id.expect("snapshot persisted");

    let snapshots = governance.list_drift_snapshots(Some("ann_cn"), 10).await?;
    assert_eq!(snapshots[0].id, snapshot_id);
    assert!(!snapshots[0].alerts.is_empty());

    let monitor = governance.drift_monitor(Some("ann_cn"), 30).await?;
    assert_eq!(monitor.window_size, 1);
    assert_eq!(monitor.latest_snapshot_id, Some(snapshot_id));
    assert_eq!(monitor.latest_risk_level, SignalLevel::Critical);

    // An empty scope yields an INFO monitor with no points.
    let empty = governance.drift_monitor(Some("other_source"), 30).await?;
    assert_eq!(empty.window_size, 0);
    assert_eq!(empty.latest_risk_level, SignalLevel::Info);
    Ok(())
}
