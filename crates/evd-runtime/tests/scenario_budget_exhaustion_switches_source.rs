//! An exhausted hourly budget skips the primary source (recorded as
//! SKIPPED_BUDGET, not a failure) and the backup takes the run.

use serde_json::json;

use evd_runtime::ConnectorRuntime;
use evd_schemas::{ConnectorRunRequest, RunStatus};
use evd_testkit::{file_connector_request, seed_source, TestStore};

#[tokio::test]
async fn scenario_budget_exhaustion_switches_source() -> anyhow::Result<()> {
    let store = TestStore::new().await?;
    let service = store.service();
    seed_source(&service, "ann_cn").await?;

    let rows = &[json!({
        "event_id": "bud-1",
        "symbol": "600000",
        "title": "分红公告",
        "publish_time": "2024-05-06 09:30:00"
    })];
    let primary_path = store.write_fixture("primary.json", rows)?;
    let backup_path = store.write_fixture("backup.json", rows)?;

    let runtime = ConnectorRuntime::new(service.clone(), Some(store.audit.clone()));
    let req = file_connector_request(
        "ann_budget",
        "ann_cn",
        json!({
            "source_matrix": [
                {
                    "source_key": "primary_budget_1h",
                    "priority": 10,
                    "request_budget_per_hour": 1,
                    "config": {"file_path": primary_path.to_string_lossy()}
                },
                {
                    "source_key": "backup_unlimited",
                    "priority": 20,
                    "config": {"file_path": backup_path.to_string_lossy()}
                }
            ]
        }),
    );
    runtime.register_connector(&req).await?;

    let mut run_req = ConnectorRunRequest::new("ann_budget");
    run_req.force_full_sync = true;

    let first = runtime.run_connector(&run_req).await?;
    assert!(matches!(first.run.status, RunStatus::Success | RunStatus::Partial));
    assert_eq!(
        first.run.details.get("selected_source_key").and_then(|v| v.as_str()),
        Some("primary_budget_1h")
    );

    let second = runtime.run_connector(&run_req).await?;
    assert!(matches!(second.run.status, RunStatus::Success | RunStatus::Partial));
    assert_eq!(
        second.run.details.get("selected_source_key").and_then(|v| v.as_str()),
        Some("backup_unlimited")
    );
    let attempts = second.run.details.get("source_attempts").and_then(|v| v.as_array()).unwrap();
    assert!(attempts
        .iter()
        .any(|a| a["status"] == json!("SKIPPED_BUDGET") && a["source_key"] == json!("primary_budget_1h")));
    Ok(())
}
