//! Source-matrix resolution and per-run candidate ordering.
//!
//! Both are pure functions over `(config, SourceStateRecord[])` so the
//! selection policy can be tested without touching the store or the
//! network; the registry sync at the bottom is the only stateful piece.

use anyhow::Result;
use serde_json::{Map, Value};
use sqlx::SqlitePool;

use evd_schemas::{ConnectorRecord, ConnectorType, FailoverConfig, SourceMatrixItem, SourceStateRecord};

pub const DEFAULT_HEALTH_THRESHOLD: f64 = 35.0;

/// Parse `config.source_matrix` into ordered candidates.
///
/// Malformed entries (blank key, unknown connector type) are skipped. A
/// missing or empty matrix synthesizes a single `primary` candidate that
/// reuses the connector's own type and config. Budget and credential
/// aliases fold into each candidate's config map.
pub fn resolve_source_matrix(connector: &ConnectorRecord) -> Vec<SourceMatrixItem> {
    let mut out: Vec<SourceMatrixItem> = Vec::new();

    if let Some(raw) = connector.config.get("source_matrix").and_then(Value::as_array) {
        for (idx, item) in raw.iter().enumerate() {
            let Some(item) = item.as_object() else { continue };

            let source_key = item
                .get("source_key")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| format!("source_{}", idx + 1));

            let raw_type = item
                .get("connector_type")
                .and_then(Value::as_str)
                .unwrap_or(connector.connector_type.as_str());
            let Ok(connector_type) = ConnectorType::parse(raw_type) else { continue };

            let priority = item
                .get("priority")
                .and_then(Value::as_i64)
                .unwrap_or((idx as i64 + 1) * 10)
                .max(0);
            let enabled = item.get("enabled").and_then(Value::as_bool).unwrap_or(true);

            let mut cfg: Map<String, Value> = item
                .get("config")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            if let Some(budget) = item.get("request_budget_per_hour").and_then(Value::as_i64) {
                if budget > 0 {
                    cfg.insert("request_budget_per_hour".to_string(), Value::from(budget));
                }
            }
            if let Some(aliases) = item.get("credential_aliases").and_then(Value::as_array) {
                let cleaned: Vec<Value> = aliases
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(|s| Value::String(s.to_string()))
                    .collect();
                if !cleaned.is_empty() {
                    cfg.insert("credential_aliases".to_string(), Value::Array(cleaned));
                }
            }

            out.push(SourceMatrixItem {
                source_key,
                connector_type,
                priority,
                enabled,
                config: Value::Object(cfg),
            });
        }
    }

    if out.is_empty() {
        out.push(SourceMatrixItem {
            source_key: "primary".to_string(),
            connector_type: connector.connector_type,
            priority: 10,
            enabled: true,
            config: connector.config.clone(),
        });
    }

    out.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.source_key.cmp(&b.source_key)));
    out
}

/// Parse `config.failover` with defaults.
pub fn failover_config(config: &Value, state_count: usize) -> FailoverConfig {
    let raw = config.get("failover").and_then(Value::as_object);
    let enabled = raw
        .and_then(|m| m.get("enabled"))
        .and_then(Value::as_bool)
        .unwrap_or(true);
    let health_threshold = raw
        .and_then(|m| m.get("health_threshold"))
        .and_then(Value::as_f64)
        .unwrap_or(DEFAULT_HEALTH_THRESHOLD);
    let max_candidates_per_run = raw
        .and_then(|m| m.get("max_candidates_per_run"))
        .and_then(Value::as_i64)
        .map(|v| v.max(0) as usize)
        .unwrap_or(state_count);
    FailoverConfig { enabled, health_threshold, max_candidates_per_run }
}

/// Order candidates for one run.
///
/// Returns `(ordered_states, failover_enabled, max_candidates)`.
///
/// With failover off, the single best candidate is returned:
/// `(is_active desc, priority asc, effective_health desc, source_key asc)`.
/// With failover on, healthy-active candidates lead, then effective health,
/// priority, and key break ties; at most `max_candidates` are attempted.
pub fn order_source_states(
    states: &[SourceStateRecord],
    failover: &FailoverConfig,
) -> (Vec<SourceStateRecord>, bool, usize) {
    if states.is_empty() {
        return (Vec::new(), true, 1);
    }

    let mut candidates: Vec<SourceStateRecord> =
        states.iter().filter(|s| s.enabled).cloned().collect();
    if candidates.is_empty() {
        candidates = states.to_vec();
    }

    if !failover.enabled {
        candidates.sort_by(|a, b| {
            (!a.is_active)
                .cmp(&!b.is_active)
                .then_with(|| a.priority.cmp(&b.priority))
                .then_with(|| b.effective_health_score.total_cmp(&a.effective_health_score))
                .then_with(|| a.source_key.cmp(&b.source_key))
        });
        candidates.truncate(1);
        return (candidates, false, 1);
    }

    let threshold = failover.health_threshold;
    candidates.sort_by(|a, b| {
        let a_lead = !(a.is_active && a.effective_health_score >= threshold);
        let b_lead = !(b.is_active && b.effective_health_score >= threshold);
        a_lead
            .cmp(&b_lead)
            .then_with(|| b.effective_health_score.total_cmp(&a.effective_health_score))
            .then_with(|| a.priority.cmp(&b.priority))
            .then_with(|| a.source_key.cmp(&b.source_key))
    });

    let bounded = failover.max_candidates_per_run.clamp(1, candidates.len());
    (candidates, true, bounded)
}

/// Insert missing source-state rows and disable rows no longer in the
/// matrix (without dropping their health history).
pub async fn sync_source_state_registry(
    pool: &SqlitePool,
    connector: &ConnectorRecord,
    source_matrix: &[SourceMatrixItem],
) -> Result<()> {
    for item in source_matrix {
        evd_db::upsert_source_state(
            pool,
            &connector.connector_name,
            &item.source_key,
            item.connector_type,
            item.priority,
            item.enabled,
        )
        .await?;
    }

    let existing = evd_db::list_source_states(pool, Some(&connector.connector_name), 5000).await?;
    for state in existing {
        if source_matrix.iter().any(|item| item.source_key == state.source_key) {
            continue;
        }
        evd_db::upsert_source_state(
            pool,
            &state.connector_name,
            &state.source_key,
            state.connector_type,
            state.priority,
            false,
        )
        .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn connector_with_config(config: Value) -> ConnectorRecord {
        ConnectorRecord {
            id: 1,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            connector_name: "ann_main".to_string(),
            source_name: "ann_cn".to_string(),
            connector_type: ConnectorType::FileAnnouncement,
            enabled: true,
            fetch_limit: 500,
            poll_interval_minutes: 10,
            replay_backoff_seconds: 300,
            max_retry: 5,
            config,
            created_by: "system".to_string(),
            note: String::new(),
        }
    }

    fn state(key: &str, priority: i64, health: f64, active: bool) -> SourceStateRecord {
        SourceStateRecord {
            connector_name: "ann_main".to_string(),
            source_key: key.to_string(),
            connector_type: ConnectorType::FileAnnouncement,
            priority,
            enabled: true,
            health_score: health,
            effective_health_score: health,
            consecutive_failures: 0,
            total_success: 0,
            total_failures: 0,
            last_latency_ms: None,
            last_error: String::new(),
            last_attempt_at: None,
            last_success_at: None,
            last_failure_at: None,
            checkpoint_cursor: None,
            checkpoint_publish_time: None,
            is_active: active,
        }
    }

    #[test]
    fn missing_matrix_synthesizes_primary() {
        let connector = connector_with_config(json!({"file_path": "/tmp/a.json"}));
        let matrix = resolve_source_matrix(&connector);
        assert_eq!(matrix.len(), 1);
        assert_eq!(matrix[0].source_key, "primary");
        assert_eq!(matrix[0].priority, 10);
        assert_eq!(matrix[0].config.get("file_path").and_then(Value::as_str), Some("/tmp/a.json"));
    }

    #[test]
    fn matrix_items_sort_by_priority_then_key() {
        let connector = connector_with_config(json!({
            "source_matrix": [
                {"source_key": "zz", "priority": 10, "config": {}},
                {"source_key": "aa", "priority": 10, "config": {}},
                {"source_key": "first", "priority": 5, "config": {}}
            ]
        }));
        let matrix = resolve_source_matrix(&connector);
        let keys: Vec<&str> = matrix.iter().map(|m| m.source_key.as_str()).collect();
        assert_eq!(keys, vec!["first", "aa", "zz"]);
    }

    #[test]
    fn budget_and_aliases_fold_into_candidate_config() {
        let connector = connector_with_config(json!({
            "source_matrix": [{
                "source_key": "primary",
                "request_budget_per_hour": 3,
                "credential_aliases": ["cred_a", " ", "cred_b"],
                "config": {"file_path": "/tmp/a.json"}
            }]
        }));
        let matrix = resolve_source_matrix(&connector);
        let cfg = &matrix[0].config;
        assert_eq!(cfg.get("request_budget_per_hour").and_then(Value::as_i64), Some(3));
        assert_eq!(
            cfg.get("credential_aliases").and_then(Value::as_array).map(|a| a.len()),
            Some(2)
        );
    }

    #[test]
    fn unknown_connector_type_is_skipped() {
        let connector = connector_with_config(json!({
            "source_matrix": [
                {"source_key": "bad", "connector_type": "CARRIER_PIGEON"},
                {"source_key": "good"}
            ]
        }));
        let matrix = resolve_source_matrix(&connector);
        assert_eq!(matrix.len(), 1);
        assert_eq!(matrix[0].source_key, "good");
    }

    #[test]
    fn healthy_active_candidate_leads_under_failover() {
        let cfg = FailoverConfig {
            enabled: true,
            health_threshold: 35.0,
            max_candidates_per_run: 3,
        };
        let states = vec![
            state("backup", 20, 90.0, false),
            state("primary", 10, 80.0, true),
        ];
        let (ordered, enabled, bounded) = order_source_states(&states, &cfg);
        assert!(enabled);
        assert_eq!(bounded, 2);
        // primary is active and above threshold, so it leads despite the
        // backup's higher health.
        assert_eq!(ordered[0].source_key, "primary");
    }

    #[test]
    fn unhealthy_active_candidate_loses_precedence() {
        let cfg = FailoverConfig {
            enabled: true,
            health_threshold: 35.0,
            max_candidates_per_run: 2,
        };
        let states = vec![
            state("primary", 10, 20.0, true),
            state("backup", 20, 90.0, false),
        ];
        let (ordered, _, _) = order_source_states(&states, &cfg);
        assert_eq!(ordered[0].source_key, "backup");
    }

    #[test]
    fn failover_disabled_takes_single_best() {
        let cfg = FailoverConfig {
            enabled: false,
            health_threshold: 35.0,
            max_candidates_per_run: 5,
        };
        let states = vec![
            state("backup", 20, 90.0, false),
            state("primary", 10, 10.0, false),
        ];
        let (ordered, enabled, bounded) = order_source_states(&states, &cfg);
        assert!(!enabled);
        assert_eq!(bounded, 1);
        assert_eq!(ordered.len(), 1);
        // No active row: priority decides.
        assert_eq!(ordered[0].source_key, "primary");
    }

    #[test]
    fn disabled_states_are_filtered_unless_all_disabled() {
        let cfg = failover_config(&json!({}), 2);
        let mut a = state("a", 10, 50.0, false);
        a.enabled = false;
        let b = state("b", 20, 50.0, false);
        let (ordered, _, _) = order_source_states(&[a.clone(), b], &cfg);
        assert_eq!(ordered.len(), 1);
        assert_eq!(ordered[0].source_key, "b");

        let mut c = state("c", 30, 50.0, false);
        c.enabled = false;
        let (ordered, _, _) = order_source_states(&[a, c], &cfg);
        assert_eq!(ordered.len(), 2);
    }

    #[test]
    fn failover_config_defaults() {
        let cfg = failover_config(&json!({}), 4);
        assert!(cfg.enabled);
        assert_eq!(cfg.health_threshold, DEFAULT_HEALTH_THRESHOLD);
        assert_eq!(cfg.max_candidates_per_run, 4);

        let cfg = failover_config(
            &json!({"failover": {"enabled": false, "health_threshold": 50.0, "max_candidates_per_run": 1}}),
            4,
        );
        assert!(!cfg.enabled);
        assert_eq!(cfg.health_threshold, 50.0);
        assert_eq!(cfg.max_candidates_per_run, 1);
    }
}
