//! A dead primary source fails over to a healthy backup within one run,
//! degrading the primary's health and activating the backup.

use serde_json::json;

use evd_runtime::ConnectorRuntime;
use evd_schemas::{ConnectorRunRequest, EventFilter, RunStatus};
use evd_testkit::{file_connector_request, seed_source, TestStore};

#[tokio::test]
async fn scenario_two_candidate_failover() -> anyhow::Result<()> {
    let store = TestStore::new().await?;
    let service = store.service();
    seed_source(&service, "ann_cn").await?;

    let backup_path = store.write_fixture(
        "backup.json",
        &[json!({
            "event_id": "fo-1",
            "symbol": "600000",
            "title": "回购进展公告",
            "publish_time": "2024-05-06 09:30:00"
        })],
    )?;

    let runtime = ConnectorRuntime::new(service.clone(), Some(store.audit.clone()));
    let req = file_connector_request(
        "ann_failover",
        "ann_cn",
        json!({
            "source_matrix": [
                {
                    "source_key": "primary_dead",
                    "priority": 10,
                    "config": {"file_path": store.dir.path().join("missing.json").to_string_lossy()}
                },
                {
                    "source_key": "backup_ok",
                    "priority": 20,
                    "config": {"file_path": backup_path.to_string_lossy()}
                }
            ]
        }),
    );
    runtime.register_connector(&req).await?;

    let result = runtime.run_connector(&ConnectorRunRequest::new("ann_failover")).await?;

    assert!(matches!(result.run.status, RunStatus::Success | RunStatus::Partial));
    assert_eq!(result.run.inserted_count, 1);
    assert_eq!(
        result.run.details.get("selected_source_key").and_then(|v| v.as_str()),
        Some("backup_ok")
    );
    assert!(result.errors.iter().any(|e| e.contains("source=primary_dead")));

    let attempts = result.run.details.get("source_attempts").and_then(|v| v.as_array()).unwrap();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0]["status"], json!("FAILED"));
    assert_eq!(attempts[1]["status"], json!("SUCCESS"));

    let states = evd_db::list_source_states(&store.pool, Some("ann_failover"), 10).await?;
    assert_eq!(states.len(), 2);
    let primary = states.iter().find(|s| s.source_key == "primary_dead").unwrap();
    let backup = states.iter().find(|s| s.source_key == "backup_ok").unwrap();
    assert!(backup.is_active);
    assert!(!primary.is_active);
    assert!(primary.consecutive_failures >= 1);
    assert!(primary.health_score < backup.health_score);

    let rows = service
        .list_events(&EventFilter { symbol: Some("600000".to_string()), ..EventFilter::default() })
        .await?;
    assert_eq!(rows.len(), 1);
    Ok(())
}
