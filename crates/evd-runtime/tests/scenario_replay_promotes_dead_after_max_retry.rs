//! An unrepairable failure exhausts its bounded retries and is promoted to
//! DEAD; an already-replayed row is reported as such without mutation.

use serde_json::json;

use evd_db::FailureAppend;
use evd_runtime::ConnectorRuntime;
use evd_schemas::{FailureStatus, ManualReplayRequest, ReplayRequest};
use evd_testkit::{file_connector_request, seed_source, TestStore};

#[tokio::test]
async fn scenario_replay_promotes_dead_after_max_retry() -> anyhow::Result<()> {
    let store = TestStore::new().await?;
    let service = store.service();
    seed_source(&service, "ann_cn").await?;

    let runtime = ConnectorRuntime::new(service.clone(), Some(store.audit.clone()));
    let mut req = file_connector_request("ann_dead", "ann_cn", json!({"file_path": "/unused.json"}));
    req.max_retry = 1;
    runtime.register_connector(&req).await?;

    // A normalize failure whose raw record still has no symbol: every
    // replay attempt will fail again.
    evd_db::append_failures(
        &store.pool,
        &FailureAppend {
            connector_name: "ann_dead".to_string(),
            source_name: "ann_cn".to_string(),
            run_id: "seed-run".to_string(),
            payloads: vec![json!({
                "phase": "normalize",
                "source_key": "primary",
                "error": "normalize failed: missing symbol",
                "raw_record": {
                    "title": "警示函公告",
                    "publish_time": "2024-05-06T01:00:00Z"
                }
            })],
            error_message: "connector run failure".to_string(),
            next_retry_at: None,
        },
    )
    .await?;

    // max_retry = 1: the single allowed retry fails and the row goes DEAD.
    let replay = runtime.replay_failures(&ReplayRequest::new("ann_dead")).await?;
    assert_eq!(replay.picked, 1);
    assert_eq!(replay.replayed, 0);
    assert_eq!(replay.failed, 1);
    assert_eq!(replay.dead, 1);

    let dead =
        evd_db::list_failures(&store.pool, Some("ann_dead"), Some(FailureStatus::Dead), None, 10)
            .await?;
    assert_eq!(dead.len(), 1);
    assert!(dead[0].last_error.contains("missing symbol"));

    // Dead rows are no longer claimable by the scheduled replay.
    let again = runtime.replay_failures(&ReplayRequest::new("ann_dead")).await?;
    assert_eq!(again.picked, 0);

    // Replaying an already-REPLAYED row is a no-op with an explicit status.
    evd_db::mark_failure_replayed(&store.pool, dead[0].id).await?;
    let manual = runtime
        .replay_selected_failures(&ManualReplayRequest {
            connector_name: "ann_dead".to_string(),
            failure_ids: vec![dead[0].id],
            triggered_by: "ops".to_string(),
        })
        .await?;
    assert_eq!(manual.picked, 1);
    assert_eq!(manual.replayed, 0);
    assert_eq!(manual.failed, 0);
    assert_eq!(manual.items.len(), 1);
    assert_eq!(manual.items[0].message, "already replayed");
    Ok(())
}
