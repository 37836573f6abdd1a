//! Dead-letter workbench: scheduled replay, operator-selected replay,
//! manual payload repair, and the repair-then-replay compound.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

use evd_schemas::{
    ConnectorRecord, ConnectorRunRecord, DomainError, EventBatchIngestRequest,
    EventRecordCreate, EventSourceRecord, FailureRecord, FailureRepairRequest,
    FailureRepairResult, FailureStatus, ManualReplayItem, ManualReplayRequest, ManualReplayResult,
    RepairReplayRequest, RepairReplayResult, ReplayRequest, ReplayResult, RunStatus,
};

use crate::ConnectorRuntime;

struct ReplayTally {
    replayed: i64,
    failed: i64,
    dead: i64,
    errors: Vec<String>,
    items: Vec<ManualReplayItem>,
}

/// Claim pending failures on schedule and re-run their ingest.
pub(crate) async fn replay_failures(
    rt: &ConnectorRuntime,
    req: &ReplayRequest,
) -> Result<ReplayResult> {
    req.validate()?;
    let pool = rt.service().pool().clone();
    let connector = require_connector(rt, &req.connector_name).await?;
    let source = rt.service().require_source(&connector.source_name).await?;

    let now = Utc::now();
    let mut run = replay_run_record(&connector, &req.triggered_by, now, json!({"mode": "replay"}));
    evd_db::create_run(&pool, &run).await?;

    let failures = evd_db::claim_pending_failures(
        &pool,
        &connector.connector_name,
        req.limit,
        connector.max_retry,
        now,
    )
    .await?;
    let tally = replay_failure_rows(rt, &connector, &source, &failures, now).await?;

    finalize_replay_run(&pool, &mut run, failures.len() as i64, &tally).await?;

    Ok(ReplayResult {
        connector_name: req.connector_name.clone(),
        picked: failures.len() as i64,
        replayed: tally.replayed,
        failed: tally.failed,
        dead: tally.dead,
        errors: tally.errors,
    })
}

/// Replay explicit failure ids, ignoring retry caps. Operator path.
pub(crate) async fn replay_selected_failures(
    rt: &ConnectorRuntime,
    req: &ManualReplayRequest,
) -> Result<ManualReplayResult> {
    req.validate()?;
    let pool = rt.service().pool().clone();
    let connector = require_connector(rt, &req.connector_name).await?;
    let source = rt.service().require_source(&connector.source_name).await?;

    let now = Utc::now();
    let mut sorted_ids: Vec<i64> = req.failure_ids.clone();
    sorted_ids.sort_unstable();
    sorted_ids.dedup();
    sorted_ids.truncate(500);
    let mut run = replay_run_record(
        &connector,
        &req.triggered_by,
        now,
        json!({"mode": "manual_replay", "failure_ids": sorted_ids}),
    );
    evd_db::create_run(&pool, &run).await?;

    let failures =
        evd_db::claim_failures_by_ids(&pool, &connector.connector_name, &req.failure_ids).await?;
    let tally = replay_failure_rows(rt, &connector, &source, &failures, now).await?;

    finalize_replay_run(&pool, &mut run, failures.len() as i64, &tally).await?;

    Ok(ManualReplayResult {
        connector_name: req.connector_name.clone(),
        picked: failures.len() as i64,
        replayed: tally.replayed,
        failed: tally.failed,
        dead: tally.dead,
        items: tally.items,
        errors: tally.errors,
    })
}

/// Merge operator patches into a failure payload and re-queue it.
pub(crate) async fn repair_failure(
    rt: &ConnectorRuntime,
    req: &FailureRepairRequest,
) -> Result<FailureRepairResult> {
    req.validate()?;
    let pool = rt.service().pool().clone();
    let _connector = require_connector(rt, &req.connector_name).await?;

    let row = evd_db::get_failure(&pool, req.failure_id)
        .await?
        .ok_or_else(|| DomainError::not_found(format!("failure id '{}' not found", req.failure_id)))?;
    if row.connector_name != req.connector_name {
        return Err(DomainError::invalid(format!(
            "failure id '{}' belongs to connector '{}', not '{}'",
            req.failure_id, row.connector_name, req.connector_name
        ))
        .into());
    }

    let mut payload = row.payload.clone();
    if let Value::Object(patch) = &req.patch_raw_record {
        if !patch.is_empty() {
            merge_into(&mut payload, "raw_record", patch);
        }
    }
    if let Value::Object(patch) = &req.patch_event {
        if !patch.is_empty() {
            merge_into(&mut payload, "event", patch);
        }
    }
    if !req.note.trim().is_empty() {
        if let Value::Object(map) = &mut payload {
            map.insert("manual_note".to_string(), Value::String(req.note.clone()));
            map.insert("manual_repair_by".to_string(), Value::String(req.triggered_by.clone()));
        }
    }

    let last_error = if req.note.trim().is_empty() {
        "manual payload repair".to_string()
    } else {
        req.note.clone()
    };
    let updated = evd_db::update_failure_payload(
        &pool,
        req.failure_id,
        &payload,
        &last_error,
        Some(Utc::now()),
        req.reset_retry_count,
    )
    .await?;
    let refreshed = evd_db::get_failure(&pool, req.failure_id).await?;

    Ok(FailureRepairResult {
        connector_name: req.connector_name.clone(),
        failure_id: req.failure_id,
        updated,
        failure: refreshed,
    })
}

/// Per-item repair, then one manual replay over every id that repaired
/// cleanly. The result aggregates both phases.
pub(crate) async fn repair_and_replay_failures(
    rt: &ConnectorRuntime,
    req: &RepairReplayRequest,
) -> Result<RepairReplayResult> {
    req.validate()?;
    let mut repaired_ids: Vec<i64> = Vec::new();
    let mut errors: Vec<String> = Vec::new();

    for item in &req.items {
        let repair_req = FailureRepairRequest {
            connector_name: req.connector_name.clone(),
            failure_id: item.failure_id,
            patch_raw_record: item.patch_raw_record.clone(),
            patch_event: item.patch_event.clone(),
            reset_retry_count: item.reset_retry_count,
            triggered_by: req.triggered_by.clone(),
            note: item.note.clone(),
        };
        match repair_failure(rt, &repair_req).await {
            Ok(result) if result.updated => repaired_ids.push(item.failure_id),
            Ok(_) => {}
            Err(err) => errors.push(format!("repair failure_id={} failed: {err}", item.failure_id)),
        }
    }

    if repaired_ids.is_empty() {
        return Ok(RepairReplayResult {
            connector_name: req.connector_name.clone(),
            repaired: 0,
            picked: 0,
            replayed: 0,
            failed: 0,
            dead: 0,
            repaired_failure_ids: Vec::new(),
            items: Vec::new(),
            errors,
        });
    }

    let replay = replay_selected_failures(
        rt,
        &ManualReplayRequest {
            connector_name: req.connector_name.clone(),
            failure_ids: repaired_ids.clone(),
            triggered_by: req.triggered_by.clone(),
        },
    )
    .await?;

    let mut all_errors = errors;
    all_errors.extend(replay.errors);
    Ok(RepairReplayResult {
        connector_name: req.connector_name.clone(),
        repaired: repaired_ids.len() as i64,
        picked: replay.picked,
        replayed: replay.replayed,
        failed: replay.failed,
        dead: replay.dead,
        repaired_failure_ids: repaired_ids,
        items: replay.items,
        errors: all_errors,
    })
}

// ---------------------------------------------------------------------------
// Shared row processing
// ---------------------------------------------------------------------------

/// Re-run ingest for each claimed failure row.
///
/// A payload with an `event` ingests directly; one with only a `raw_record`
/// goes back through the standardizer first. Success marks the row
/// REPLAYED; an error schedules the next retry with exponential backoff or
/// promotes the row to DEAD once `max_retry` is exhausted.
async fn replay_failure_rows(
    rt: &ConnectorRuntime,
    connector: &ConnectorRecord,
    source: &EventSourceRecord,
    failures: &[FailureRecord],
    now: DateTime<Utc>,
) -> Result<ReplayTally> {
    let pool = rt.service().pool().clone();
    let standardizer = evd_service::active_standardizer(&pool).await?;
    let mut tally = ReplayTally {
        replayed: 0,
        failed: 0,
        dead: 0,
        errors: Vec::new(),
        items: Vec::new(),
    };

    for item in failures {
        if item.status == FailureStatus::Replayed {
            tally.items.push(ManualReplayItem {
                failure_id: item.id,
                status: FailureStatus::Replayed,
                message: "already replayed".to_string(),
            });
            continue;
        }

        let replay_attempt: Result<()> = async {
            let event = reconstruct_event(
                &standardizer,
                item,
                &connector.source_name,
                &source.timezone,
                source.reliability_score,
            )?;
            let ingest = rt
                .service()
                .ingest(&EventBatchIngestRequest {
                    source_name: connector.source_name.clone(),
                    events: vec![event],
                })
                .await?;
            if !ingest.errors.is_empty() {
                let joined = ingest.errors[..ingest.errors.len().min(3)].join("; ");
                return Err(DomainError::invalid(joined).into());
            }
            Ok(())
        }
        .await;

        match replay_attempt {
            Ok(()) => {
                evd_db::mark_failure_replayed(&pool, item.id).await?;
                tally.replayed += 1;
                tally.items.push(ManualReplayItem {
                    failure_id: item.id,
                    status: FailureStatus::Replayed,
                    message: "replayed".to_string(),
                });
            }
            Err(err) => {
                tally.failed += 1;
                tally.errors.push(format!("id={}: {err}", item.id));
                if item.retry_count + 1 >= connector.max_retry {
                    evd_db::mark_failure_dead(&pool, item.id, &err.to_string()).await?;
                    tally.dead += 1;
                    tally.items.push(ManualReplayItem {
                        failure_id: item.id,
                        status: FailureStatus::Dead,
                        message: err.to_string(),
                    });
                } else {
                    let backoff_seconds = connector
                        .replay_backoff_seconds
                        .saturating_mul(1i64 << item.retry_count.clamp(0, 32) as u32);
                    let next_retry = now + Duration::seconds(backoff_seconds);
                    evd_db::mark_failure_retry(&pool, item.id, next_retry, &err.to_string()).await?;
                    tally.items.push(ManualReplayItem {
                        failure_id: item.id,
                        status: FailureStatus::Pending,
                        message: err.to_string(),
                    });
                }
            }
        }
    }

    Ok(tally)
}

/// Rebuild the event from a failure payload.
fn reconstruct_event(
    standardizer: &evd_nlp::Standardizer,
    failure: &FailureRecord,
    source_name: &str,
    source_timezone: &str,
    source_reliability_score: f64,
) -> Result<EventRecordCreate> {
    if let Some(event_value) = failure.payload.get("event") {
        if event_value.is_object() {
            let event: EventRecordCreate = serde_json::from_value(event_value.clone())
                .map_err(|err| DomainError::invalid(format!("failure event payload invalid: {err}")))?;
            return Ok(event);
        }
    }
    if let Some(raw_value) = failure.payload.get("raw_record") {
        if raw_value.is_object() {
            let raw: evd_schemas::AnnouncementRawRecord = serde_json::from_value(raw_value.clone())
                .map_err(|err| DomainError::invalid(format!("failure raw_record payload invalid: {err}")))?;
            let (event, _, _) = standardizer
                .normalize_record(&raw, source_name, None, source_timezone, source_reliability_score)
                .map_err(|err| DomainError::invalid(err.to_string()))?;
            return Ok(event);
        }
    }
    Err(DomainError::invalid("failure payload missing both event and raw_record").into())
}

fn merge_into(payload: &mut Value, key: &str, patch: &serde_json::Map<String, Value>) {
    let Value::Object(map) = payload else { return };
    let entry = map
        .entry(key.to_string())
        .or_insert_with(|| Value::Object(serde_json::Map::new()));
    if !entry.is_object() {
        *entry = Value::Object(serde_json::Map::new());
    }
    if let Value::Object(target) = entry {
        for (k, v) in patch {
            target.insert(k.clone(), v.clone());
        }
    }
}

async fn require_connector(rt: &ConnectorRuntime, connector_name: &str) -> Result<ConnectorRecord> {
    evd_db::get_connector(rt.service().pool(), connector_name)
        .await?
        .ok_or_else(|| DomainError::not_found(format!("connector '{connector_name}' not found")).into())
}

fn replay_run_record(
    connector: &ConnectorRecord,
    triggered_by: &str,
    now: DateTime<Utc>,
    details: Value,
) -> ConnectorRunRecord {
    ConnectorRunRecord {
        run_id: Uuid::new_v4().simple().to_string(),
        connector_name: connector.connector_name.clone(),
        source_name: connector.source_name.clone(),
        started_at: now,
        finished_at: None,
        status: RunStatus::Running,
        triggered_by: triggered_by.to_string(),
        pulled_count: 0,
        normalized_count: 0,
        inserted_count: 0,
        updated_count: 0,
        failed_count: 0,
        replayed_count: 0,
        checkpoint_before: None,
        checkpoint_after: None,
        error_message: None,
        details,
    }
}

async fn finalize_replay_run(
    pool: &sqlx::SqlitePool,
    run: &mut ConnectorRunRecord,
    picked: i64,
    tally: &ReplayTally,
) -> Result<()> {
    run.replayed_count = tally.replayed;
    run.failed_count = tally.failed;
    run.status = if tally.failed == 0 {
        RunStatus::Success
    } else if tally.replayed > 0 {
        RunStatus::Partial
    } else {
        RunStatus::Failed
    };
    run.finished_at = Some(Utc::now());
    if let Value::Object(map) = &mut run.details {
        map.insert("picked".to_string(), Value::from(picked));
        map.insert("dead".to_string(), Value::from(tally.dead));
        map.insert("errors".to_string(), Value::from(tally.errors.len() as i64));
    }
    run.error_message = tally.errors.first().cloned();
    evd_db::update_run(pool, run).await?;
    Ok(())
}
