//! A pending-backlog breach opens an alert and emits once; within the
//! cooldown a repeat is suppressed; once the backlog clears, the state
//! closes and a recovery audit event is recorded.

use serde_json::json;

use evd_db::FailureAppend;
use evd_schemas::{FailureStatus, SlaPolicy};
use evd_sla::{SlaMonitor, SlaSyncOptions};
use evd_testkit::{file_connector_request, seed_source, TestStore};

#[tokio::test]
async fn scenario_sla_dedupe_and_recovery() -> anyhow::Result<()> {
    let store = TestStore::new().await?;
    let service = store.service();
    seed_source(&service, "ann_cn").await?;

    let mut req = file_connector_request("ann_sla", "ann_cn", json!({
        "file_path": "/unused.json",
        "sla": {"pending_warning": 1, "pending_critical": 50, "pending_escalation": 100},
        "runbook_url": "https://wiki/runbooks/ann_sla"
    }));
    req.checkpoint_publish_time = Some(chrono::Utc::now());
    evd_db::register_connector(&store.pool, &req).await?;

    evd_db::append_failures(
        &store.pool,
        &FailureAppend {
            connector_name: "ann_sla".to_string(),
            source_name: "ann_cn".to_string(),
            run_id: "seed-run".to_string(),
            payloads: vec![json!({"phase": "normalize", "error": "boom"})],
            error_message: "connector run failure".to_string(),
            next_retry_at: None,
        },
    )
    .await?;

    let monitor = SlaMonitor::new(store.pool.clone(), Some(store.audit.clone()), SlaPolicy::default());
    let options = SlaSyncOptions { cooldown_seconds: 600, ..SlaSyncOptions::default() };

    let first = monitor.sync_sla_alerts(&options).await?;
    assert!(first.emitted >= 1);
    assert!(first.open_states >= 1);
    assert_eq!(first.recovered, 0);

    let second = monitor.sync_sla_alerts(&options).await?;
    assert!(second.skipped >= 1);

    // Clear the backlog: the pending breach no longer appears and its state
    // closes with a recovery audit event.
    let pending =
        evd_db::list_failures(&store.pool, Some("ann_sla"), Some(FailureStatus::Pending), None, 10)
            .await?;
    for failure in &pending {
        evd_db::mark_failure_replayed(&store.pool, failure.id).await?;
    }

    let third = monitor.sync_sla_alerts(&options).await?;
    assert!(third.recovered >= 1);

    let events = store.audit.read_all()?;
    assert!(events.iter().any(|e| e.event_type == evd_audit::EVENT_CONNECTOR_SLA));
    let recovery: Vec<_> = events
        .iter()
        .filter(|e| e.event_type == evd_audit::EVENT_CONNECTOR_SLA_RECOVERY)
        .collect();
    assert!(!recovery.is_empty());
    assert_eq!(
        recovery[0].payload.get("breach_type").and_then(|v| v.as_str()),
        Some("PENDING_BACKLOG")
    );
    assert_eq!(
        recovery[0].payload.get("runbook_url").and_then(|v| v.as_str()),
        Some("https://wiki/runbooks/ann_sla")
    );

    // History is append-only across the three evaluations.
    let history = evd_db::list_sla_history(&store.pool, Some("ann_sla"), None, None, 100).await?;
    assert!(history.len() >= 2);
    Ok(())
}
