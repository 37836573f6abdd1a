//! Per-run orchestration: pick a source, fetch, standardize, ingest,
//! advance the checkpoint, and materialize per-row failures.

use std::time::Instant;

use anyhow::Result;
use chrono::{Duration, Utc};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use evd_connectors::build_connector;
use evd_db::{CheckpointUpdate, FailureAppend};
use evd_schemas::{
    AnnouncementRawRecord, ConnectorRunRecord, ConnectorRunRequest, ConnectorRunResult,
    DomainError, EventBatchIngestRequest, EventRecordCreate, RunStatus, SourceMatrixItem,
    SourceStateRecord,
};

use crate::matrix;
use crate::ConnectorRuntime;
use crate::RunError;

pub(crate) fn detail(run: &mut ConnectorRunRecord, key: &str, value: Value) {
    if let Value::Object(map) = &mut run.details {
        map.insert(key.to_string(), value);
    }
}

/// Extract the `idx=N:` prefix a store ingest error carries.
pub(crate) fn extract_error_index(raw: &str) -> Option<usize> {
    let rest = raw.strip_prefix("idx=")?;
    let end = rest.find(':')?;
    rest[..end].trim().parse().ok()
}

pub(crate) async fn run_connector(
    rt: &ConnectorRuntime,
    req: &ConnectorRunRequest,
) -> Result<ConnectorRunResult> {
    req.validate()?;
    let pool = rt.service().pool().clone();

    let connector = evd_db::get_connector(&pool, &req.connector_name)
        .await?
        .ok_or_else(|| DomainError::not_found(format!("connector '{}' not found", req.connector_name)))?;
    let source = rt.service().require_source(&connector.source_name).await?;

    let checkpoint = evd_db::get_checkpoint(&pool, &connector.connector_name).await?;
    let checkpoint_before = checkpoint.as_ref().and_then(|c| c.checkpoint_cursor.clone());

    let source_matrix = matrix::resolve_source_matrix(&connector);
    matrix::sync_source_state_registry(&pool, &connector, &source_matrix).await?;
    let states = evd_db::list_source_states(&pool, Some(&connector.connector_name), 500).await?;
    let matrix_states: Vec<SourceStateRecord> = source_matrix
        .iter()
        .filter_map(|item| states.iter().find(|s| s.source_key == item.source_key).cloned())
        .collect();
    let failover = matrix::failover_config(&connector.config, matrix_states.len());
    let (ordered, failover_enabled, max_candidates) =
        matrix::order_source_states(&matrix_states, &failover);

    let now = Utc::now();
    let mut run = ConnectorRunRecord {
        run_id: Uuid::new_v4().simple().to_string(),
        connector_name: connector.connector_name.clone(),
        source_name: connector.source_name.clone(),
        started_at: now,
        finished_at: None,
        status: RunStatus::Running,
        triggered_by: req.triggered_by.clone(),
        pulled_count: 0,
        normalized_count: 0,
        inserted_count: 0,
        updated_count: 0,
        failed_count: 0,
        replayed_count: 0,
        checkpoint_before: checkpoint_before.clone(),
        checkpoint_after: checkpoint_before.clone(),
        error_message: None,
        details: json!({
            "enabled": connector.enabled,
            "dry_run": req.dry_run,
            "force_full_sync": req.force_full_sync,
            "failover_enabled": failover_enabled,
            "source_matrix_count": source_matrix.len() as i64,
            "source_attempts": [],
        }),
    };
    evd_db::create_run(&pool, &run).await?;

    let mut errors: Vec<String> = Vec::new();
    let mut attempts: Vec<Value> = Vec::new();
    let next_retry_at = now + Duration::seconds(connector.replay_backoff_seconds);

    let outcome: Result<()> = async {
        let fetch_limit = req.fetch_limit_override.unwrap_or(connector.fetch_limit).max(1);
        detail(&mut run, "fetch_limit", Value::from(fetch_limit));

        let mut selected: Option<(SourceStateRecord, SourceMatrixItem, evd_connectors::FetchOutcome)> =
            None;

        let picked = &ordered[..max_candidates.max(1).min(ordered.len())];
        for state in picked {
            let Some(candidate) = source_matrix.iter().find(|c| c.source_key == state.source_key)
            else {
                continue;
            };
            let mut source_cfg: Map<String, Value> = candidate
                .config
                .as_object()
                .cloned()
                .unwrap_or_default();
            let global_cfg = connector.config.as_object();

            let budget_per_hour = read_i64(source_cfg.get("request_budget_per_hour"))
                .or_else(|| read_i64(global_cfg.and_then(|m| m.get("request_budget_per_hour"))));
            let (budget_allowed, budget_used, budget_limit, budget_window) =
                evd_db::try_consume_source_budget(
                    &pool,
                    &connector.connector_name,
                    &state.source_key,
                    budget_per_hour,
                    Utc::now(),
                )
                .await?;
            if !budget_allowed {
                let budget_msg = format!(
                    "source={}: budget exceeded {budget_used}/{budget_limit} (window={budget_window})",
                    state.source_key
                );
                errors.push(budget_msg.clone());
                attempts.push(json!({
                    "source_key": state.source_key,
                    "connector_type": candidate.connector_type.as_str(),
                    "status": "SKIPPED_BUDGET",
                    "budget_used": budget_used,
                    "budget_limit": budget_limit,
                    "budget_window": budget_window,
                    "error": budget_msg,
                }));
                if !failover_enabled {
                    break;
                }
                continue;
            }

            let aliases = read_aliases(source_cfg.get("credential_aliases"))
                .or_else(|| read_aliases(global_cfg.and_then(|m| m.get("credential_aliases"))))
                .unwrap_or_default();
            let credential_alias = evd_db::next_source_credential_alias(
                &pool,
                &connector.connector_name,
                &state.source_key,
                &aliases,
            )
            .await?;
            if let Some(alias) = &credential_alias {
                let credentials = source_cfg
                    .get("credentials")
                    .and_then(Value::as_object)
                    .cloned()
                    .or_else(|| {
                        global_cfg
                            .and_then(|m| m.get("credentials"))
                            .and_then(Value::as_object)
                            .cloned()
                    });
                if let Some(secret) = credentials.as_ref().and_then(|m| m.get(alias)).and_then(Value::as_object) {
                    for (key, value) in secret {
                        source_cfg.insert(key.clone(), value.clone());
                    }
                }
            }
            source_cfg.remove("credential_aliases");
            source_cfg.remove("credentials");
            source_cfg.remove("request_budget_per_hour");

            let cursor = if req.force_full_sync {
                None
            } else {
                state.checkpoint_cursor.clone().or_else(|| checkpoint_before.clone())
            };

            let fetch_started = Instant::now();
            let fetch_result = match build_connector(candidate.connector_type, &Value::Object(source_cfg)) {
                Ok(adapter) => adapter.fetch(cursor.as_deref(), fetch_limit as usize).await,
                Err(err) => Err(err),
            };
            let latency_ms = fetch_started.elapsed().as_millis() as i64;

            match fetch_result {
                Ok(fetched) => {
                    let updated_state = evd_db::mark_source_attempt_success(
                        &pool,
                        &connector.connector_name,
                        &state.source_key,
                        fetched.next_cursor.as_deref().or(cursor.as_deref()),
                        fetched.checkpoint_publish_time,
                        latency_ms,
                    )
                    .await?;
                    run.checkpoint_before = cursor.clone();
                    run.checkpoint_after = fetched.next_cursor.clone().or(cursor.clone());
                    attempts.push(json!({
                        "source_key": state.source_key,
                        "connector_type": candidate.connector_type.as_str(),
                        "status": "SUCCESS",
                        "latency_ms": latency_ms,
                        "checkpoint_before": cursor,
                        "checkpoint_after": run.checkpoint_after,
                        "credential_alias": credential_alias,
                        "budget_used": budget_used,
                        "budget_limit": budget_limit,
                        "budget_window": budget_window,
                    }));
                    selected = Some((
                        updated_state.unwrap_or_else(|| state.clone()),
                        candidate.clone(),
                        fetched,
                    ));
                    break;
                }
                Err(err) => {
                    evd_db::mark_source_attempt_failure(
                        &pool,
                        &connector.connector_name,
                        &state.source_key,
                        &err.to_string(),
                        latency_ms,
                    )
                    .await?;
                    errors.push(format!("source={}: fetch failed: {err}", state.source_key));
                    attempts.push(json!({
                        "source_key": state.source_key,
                        "connector_type": candidate.connector_type.as_str(),
                        "status": "FAILED",
                        "latency_ms": latency_ms,
                        "error": err.to_string(),
                        "credential_alias": credential_alias,
                        "budget_used": budget_used,
                        "budget_limit": budget_limit,
                        "budget_window": budget_window,
                    }));
                    if !failover_enabled {
                        break;
                    }
                }
            }
        }

        let Some((selected_state, selected_candidate, fetched)) = selected else {
            return Err(RunError::AllCandidatesFailed.into());
        };

        run.pulled_count = fetched.records.len() as i64;
        detail(&mut run, "fetched", Value::from(fetched.records.len() as i64));
        detail(&mut run, "selected_source_key", Value::String(selected_state.source_key.clone()));
        detail(
            &mut run,
            "selected_connector_type",
            Value::String(selected_candidate.connector_type.as_str().to_string()),
        );

        // Standardize row by row; failures become normalize-phase dead letters.
        let standardizer = evd_service::active_standardizer(&pool).await?;
        let mut normalized: Vec<(usize, AnnouncementRawRecord, EventRecordCreate)> = Vec::new();
        let mut fail_payloads: Vec<Value> = Vec::new();
        for (idx, raw) in fetched.records.iter().enumerate() {
            match standardizer.normalize_record(
                raw,
                &connector.source_name,
                None,
                &source.timezone,
                source.reliability_score,
            ) {
                Ok((event, _nlp, warning)) => {
                    if let Some(warning) = warning {
                        errors.push(format!("idx={idx}: {warning}"));
                    }
                    normalized.push((idx, raw.clone(), event));
                }
                Err(err) => {
                    run.failed_count += 1;
                    errors.push(format!("idx={idx}: {err}"));
                    fail_payloads.push(json!({
                        "phase": "normalize",
                        "source_key": selected_state.source_key,
                        "error": err.to_string(),
                        "raw_record": serde_json::to_value(raw)?,
                    }));
                }
            }
        }
        run.normalized_count = normalized.len() as i64;

        if req.dry_run {
            run.status = RunStatus::DryRun;
            return Ok(());
        }

        // Persist atomically: batch ingest, checkpoint advancement, and the
        // failure rows land in one transaction.
        let mut tx = pool.begin().await?;
        if !normalized.is_empty() {
            let batch = EventBatchIngestRequest {
                source_name: connector.source_name.clone(),
                events: normalized.iter().map(|(_, _, event)| event.clone()).collect(),
            };
            let ingest = evd_db::ingest_events_in(&mut *tx, &batch).await?;
            run.inserted_count = ingest.inserted;
            run.updated_count = ingest.updated;
            run.failed_count += ingest.errors.len() as i64;
            for ingest_error in &ingest.errors {
                errors.push(ingest_error.clone());
                let mut payload = json!({
                    "phase": "ingest",
                    "source_key": selected_state.source_key,
                    "error": ingest_error,
                });
                if let Some(idx) = extract_error_index(ingest_error) {
                    if let Some((_, raw, event)) = normalized.get(idx) {
                        payload["raw_record"] = serde_json::to_value(raw)?;
                        payload["event"] = serde_json::to_value(event)?;
                    }
                }
                fail_payloads.push(payload);
            }
        }

        run.status = if run.failed_count == 0 {
            RunStatus::Success
        } else if run.inserted_count + run.updated_count == 0 {
            RunStatus::Failed
        } else {
            RunStatus::Partial
        };

        let mark_success = matches!(run.status, RunStatus::Success | RunStatus::Partial);
        evd_db::update_checkpoint_in(
            &mut *tx,
            &connector.connector_name,
            &CheckpointUpdate {
                checkpoint_cursor: run.checkpoint_after.clone(),
                checkpoint_publish_time: fetched.checkpoint_publish_time,
                mark_run_at: Some(now),
                mark_success_at: mark_success.then_some(now),
            },
        )
        .await?;
        if !fail_payloads.is_empty() {
            evd_db::append_failures_in(
                &mut *tx,
                &FailureAppend {
                    connector_name: connector.connector_name.clone(),
                    source_name: connector.source_name.clone(),
                    run_id: run.run_id.clone(),
                    payloads: fail_payloads,
                    error_message: "connector run failure".to_string(),
                    next_retry_at: Some(next_retry_at),
                },
            )
            .await?;
        }
        tx.commit().await?;

        Ok(())
    }
    .await;

    if let Err(err) = outcome {
        run.status = RunStatus::Failed;
        run.error_message = Some(err.to_string());
        errors.push(err.to_string());
        if !req.dry_run {
            // Cursor stays put; the run is still stamped.
            evd_db::update_checkpoint(
                &pool,
                &connector.connector_name,
                &CheckpointUpdate {
                    checkpoint_cursor: checkpoint_before.clone(),
                    checkpoint_publish_time: checkpoint.as_ref().and_then(|c| c.checkpoint_publish_time),
                    mark_run_at: Some(now),
                    mark_success_at: None,
                },
            )
            .await?;
        }
    }

    run.finished_at = Some(Utc::now());
    detail(&mut run, "source_attempts", Value::Array(attempts));
    detail(&mut run, "errors", Value::from(errors.len() as i64));
    if run.status == RunStatus::Running {
        run.status = RunStatus::Failed;
        run.error_message = Some(
            run.error_message
                .clone()
                .unwrap_or_else(|| "connector run did not finish correctly".to_string()),
        );
    }
    evd_db::update_run(&pool, &run).await?;
    tracing::debug!(
        connector = %run.connector_name,
        run_id = %run.run_id,
        status = run.status.as_str(),
        pulled = run.pulled_count,
        failed = run.failed_count,
        "connector run finished"
    );

    rt.audit_event(
        evd_audit::EVENT_CONNECTOR,
        "run",
        if run.status == RunStatus::Failed { "ERROR" } else { "OK" },
        json!({
            "connector_name": run.connector_name,
            "source_name": run.source_name,
            "run_id": run.run_id,
            "status": run.status.as_str(),
            "triggered_by": run.triggered_by,
            "pulled_count": run.pulled_count,
            "normalized_count": run.normalized_count,
            "inserted_count": run.inserted_count,
            "updated_count": run.updated_count,
            "failed_count": run.failed_count,
        }),
    );

    Ok(ConnectorRunResult { run, errors })
}

fn read_i64(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn read_aliases(value: Option<&Value>) -> Option<Vec<String>> {
    let items = value?.as_array()?;
    Some(
        items
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_index_extraction() {
        assert_eq!(extract_error_index("idx=3: effective_time must be >= publish_time"), Some(3));
        assert_eq!(extract_error_index("idx=x: nope"), None);
        assert_eq!(extract_error_index("no prefix"), None);
    }

    #[test]
    fn read_i64_accepts_numbers_and_strings() {
        assert_eq!(read_i64(Some(&json!(5))), Some(5));
        assert_eq!(read_i64(Some(&json!("7"))), Some(7));
        assert_eq!(read_i64(Some(&json!(true))), None);
        assert_eq!(read_i64(None), None);
    }
}
