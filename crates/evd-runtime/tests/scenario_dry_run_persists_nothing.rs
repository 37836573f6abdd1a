//! A dry run creates exactly one DRY_RUN row and leaves checkpoint, events,
//! and failures untouched.

use serde_json::json;

use evd_runtime::ConnectorRuntime;
use evd_schemas::{ConnectorRunRequest, EventFilter, RunStatus};
use evd_testkit::{file_connector_request, seed_source, TestStore};

#[tokio::test]
async fn scenario_dry_run_persists_nothing() -> anyhow::Result<()> {
    let store = TestStore::new().await?;
    let service = store.service();
    seed_source(&service, "ann_cn").await?;

    let path = store.write_fixture(
        "dry.json",
        &[json!({
            "event_id": "dry-1",
            "symbol": "600000",
            "title": "重大合同公告",
            "publish_time": "2024-05-06 09:30:00"
        })],
    )?;

    let runtime = ConnectorRuntime::new(service.clone(), Some(store.audit.clone()));
    let req = file_connector_request(
        "ann_dry",
        "ann_cn",
        json!({"file_path": path.to_string_lossy()}),
    );
    runtime.register_connector(&req).await?;

    let mut run_req = ConnectorRunRequest::new("ann_dry");
    run_req.dry_run = true;
    let result = runtime.run_connector(&run_req).await?;

    assert_eq!(result.run.status, RunStatus::DryRun);
    assert_eq!(result.run.pulled_count, 1);
    assert_eq!(result.run.normalized_count, 1);
    assert_eq!(result.run.inserted_count, 0);

    let checkpoint = evd_db::get_checkpoint(&store.pool, "ann_dry").await?.unwrap();
    assert!(checkpoint.checkpoint_cursor.is_none());
    assert!(checkpoint.last_run_at.is_none());

    let events = service.list_events(&EventFilter::default()).await?;
    assert!(events.is_empty());
    assert_eq!(evd_db::count_failures(&store.pool, Some("ann_dry"), None).await?, 0);

    let runs = evd_db::list_runs(&store.pool, Some("ann_dry"), 10).await?;
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::DryRun);
    Ok(())
}
