//! Normalize-failed rows (missing symbol) become pending failures; a batch
//! repair patching the symbol re-queues them and one replay lands both
//! events in the store.

use serde_json::json;

use evd_runtime::ConnectorRuntime;
use evd_schemas::{
    ConnectorRunRequest, EventFilter, FailureStatus, RepairReplayItemRequest, RepairReplayRequest,
    RunStatus,
};
use evd_testkit::{file_connector_request, seed_source, TestStore};

#[tokio::test]
async fn scenario_repair_then_batch_replay() -> anyhow::Result<()> {
    let store = TestStore::new().await?;
    let service = store.service();
    seed_source(&service, "ann_cn").await?;

    // No symbol on either record: both rows fail normalization.
    let path = store.write_fixture(
        "broken.json",
        &[
            json!({
                "event_id": "rep-1",
                "title": "回购进展公告",
                "publish_time": "2024-05-06 09:00:00"
            }),
            json!({
                "event_id": "rep-2",
                "title": "分红公告",
                "publish_time": "2024-05-06 10:00:00"
            }),
        ],
    )?;

    let runtime = ConnectorRuntime::new(service.clone(), Some(store.audit.clone()));
    let req = file_connector_request(
        "ann_repair",
        "ann_cn",
        json!({"file_path": path.to_string_lossy()}),
    );
    runtime.register_connector(&req).await?;

    let run = runtime.run_connector(&ConnectorRunRequest::new("ann_repair")).await?;
    assert_eq!(run.run.status, RunStatus::Failed);
    assert_eq!(run.run.failed_count, 2);

    let failures =
        evd_db::list_failures(&store.pool, Some("ann_repair"), Some(FailureStatus::Pending), None, 10)
            .await?;
    assert_eq!(failures.len(), 2);

    let items: Vec<RepairReplayItemRequest> = failures
        .iter()
        .map(|f| RepairReplayItemRequest {
            failure_id: f.id,
            patch_raw_record: json!({"symbol": "000001"}),
            patch_event: json!({}),
            reset_retry_count: true,
            note: "backfill missing symbol".to_string(),
        })
        .collect();

    let result = runtime
        .repair_and_replay_failures(&RepairReplayRequest {
            connector_name: "ann_repair".to_string(),
            items,
            triggered_by: "ops".to_string(),
        })
        .await?;

    assert_eq!(result.repaired, 2);
    assert_eq!(result.picked, 2);
    assert_eq!(result.replayed, 2);
    assert_eq!(result.failed, 0);
    assert_eq!(result.dead, 0);

    let rows = service
        .list_events(&EventFilter { symbol: Some("000001".to_string()), ..EventFilter::default() })
        .await?;
    assert_eq!(rows.len(), 2);

    let remaining =
        evd_db::list_failures(&store.pool, Some("ann_repair"), Some(FailureStatus::Pending), None, 10)
            .await?;
    assert!(remaining.is_empty());
    Ok(())
}
