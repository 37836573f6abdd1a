//! Credential aliases rotate round-robin across consecutive runs of the
//! same source.

use serde_json::json;

use evd_runtime::ConnectorRuntime;
use evd_schemas::ConnectorRunRequest;
use evd_testkit::{file_connector_request, seed_source, TestStore};

fn attempt_alias(run_details: &serde_json::Value) -> Option<String> {
    run_details
        .get("source_attempts")?
        .as_array()?
        .first()?
        .get("credential_alias")?
        .as_str()
        .map(str::to_string)
}

#[tokio::test]
async fn scenario_credential_alias_rotation() -> anyhow::Result<()> {
    let store = TestStore::new().await?;
    let service = store.service();
    seed_source(&service, "ann_cn").await?;

    let path = store.write_fixture(
        "single.json",
        &[json!({
            "event_id": "cred-1",
            "symbol": "600000",
            "title": "增持公告",
            "publish_time": "2024-05-06 09:30:00"
        })],
    )?;

    let runtime = ConnectorRuntime::new(service.clone(), Some(store.audit.clone()));
    let req = file_connector_request(
        "ann_cred",
        "ann_cn",
        json!({
            "source_matrix": [{
                "source_key": "primary",
                "priority": 10,
                "credential_aliases": ["cred_a", "cred_b"],
                "config": {
                    "file_path": path.to_string_lossy(),
                    "credentials": {
                        "cred_a": {"token": "token-a"},
                        "cred_b": {"token": "token-b"}
                    }
                }
            }]
        }),
    );
    runtime.register_connector(&req).await?;

    let mut run_req = ConnectorRunRequest::new("ann_cred");
    run_req.force_full_sync = true;

    let first = runtime.run_connector(&run_req).await?;
    let second = runtime.run_connector(&run_req).await?;

    let a1 = attempt_alias(&first.run.details).expect("first run records an alias");
    let a2 = attempt_alias(&second.run.details).expect("second run records an alias");
    assert!(["cred_a", "cred_b"].contains(&a1.as_str()));
    assert!(["cred_a", "cred_b"].contains(&a2.as_str()));
    assert_ne!(a1, a2);
    Ok(())
}
