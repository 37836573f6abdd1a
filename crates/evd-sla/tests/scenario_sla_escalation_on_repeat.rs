//! Repeated breaches escalate: by the second sync the sustained-breach rule
//! raises the escalation level and an escalation audit event exists.

use serde_json::json;

use evd_db::FailureAppend;
use evd_schemas::SlaPolicy;
use evd_sla::{SlaMonitor, SlaSyncOptions};
use evd_testkit::{file_connector_request, seed_source, TestStore};

#[tokio::test]
async fn scenario_sla_escalation_on_repeat() -> anyhow::Result<()> {
    let store = TestStore::new().await?;
    let service = store.service();
    seed_source(&service, "ann_cn").await?;

    let mut req = file_connector_request("ann_esc", "ann_cn", json!({
        "file_path": "/unused.json",
        "sla": {"pending_warning": 1, "pending_critical": 3, "pending_escalation": 9}
    }));
    req.checkpoint_publish_time = Some(chrono::Utc::now());
    evd_db::register_connector(&store.pool, &req).await?;

    evd_db::append_failures(
        &store.pool,
        &FailureAppend {
            connector_name: "ann_esc".to_string(),
            source_name: "ann_cn".to_string(),
            run_id: "seed-run".to_string(),
            payloads: vec![json!({"phase": "normalize", "error": "boom"})],
            error_message: "connector run failure".to_string(),
            next_retry_at: None,
        },
    )
    .await?;

    let monitor = SlaMonitor::new(store.pool.clone(), Some(store.audit.clone()), SlaPolicy::default());
    let options = SlaSyncOptions {
        cooldown_seconds: 0,
        warning_repeat_escalate: 2,
        critical_repeat_escalate: 2,
    };

    let first = monitor.sync_sla_alerts(&options).await?;
    assert_eq!(first.escalated, 0);

    let second = monitor.sync_sla_alerts(&options).await?;
    assert!(second.escalated >= 1);
    assert!(second.open_escalated >= 1);

    let events = store.audit.read_all()?;
    let escalations: Vec<_> = events
        .iter()
        .filter(|e| e.event_type == evd_audit::EVENT_CONNECTOR_SLA_ESCALATION)
        .collect();
    assert!(!escalations.is_empty());
    assert!(escalations[0]
        .payload
        .get("escalation_reason")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .contains("repeated"));

    let summary = monitor.alert_state_summary(None).await?;
    assert!(summary.open_states >= 1);
    assert!(summary.escalated_open_states >= 1);
    assert!(summary.open_by_escalation_level.keys().any(|level| *level >= 1));
    Ok(())
}
