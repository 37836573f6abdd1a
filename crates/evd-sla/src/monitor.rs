//! SLA evaluation and alert synchronization against the store.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sqlx::SqlitePool;

use evd_audit::AuditLog;
use evd_db as db;
use evd_schemas::{
    BreachStage, BreachType, ConnectorRecord, FailureStatus, SignalLevel, SlaAlertState,
    SlaAlertStateSummary, SlaAlertSyncResult, SlaBreach, SlaPolicy, SlaReport, SlaStatus,
};

use crate::policy::{resolve_policy, resolve_runbook_url, severity_stage};
use crate::state::{apply_breach, target_escalation_level};

/// Knobs for one alert-sync pass.
#[derive(Debug, Clone)]
pub struct SlaSyncOptions {
    pub cooldown_seconds: i64,
    pub warning_repeat_escalate: i64,
    pub critical_repeat_escalate: i64,
}

impl Default for SlaSyncOptions {
    fn default() -> Self {
        Self {
            cooldown_seconds: 900,
            warning_repeat_escalate: 3,
            critical_repeat_escalate: 2,
        }
    }
}

pub struct SlaMonitor {
    pool: SqlitePool,
    audit: Option<Arc<AuditLog>>,
    defaults: SlaPolicy,
}

impl SlaMonitor {
    pub fn new(pool: SqlitePool, audit: Option<Arc<AuditLog>>, defaults: SlaPolicy) -> Self {
        Self { pool, audit, defaults }
    }

    fn audit_event(&self, event_type: &str, action: &str, status: &str, payload: Value) {
        if let Some(audit) = &self.audit {
            audit.log_event(event_type, action, status, payload);
        }
    }

    /// Evaluate every connector against its policy. Disabled connectors get
    /// a status row but never breach.
    pub async fn evaluate_sla(
        &self,
        now: DateTime<Utc>,
        include_disabled: bool,
    ) -> Result<SlaReport> {
        let connectors = db::list_connectors(&self.pool, 5000, !include_disabled).await?;

        let mut statuses: Vec<SlaStatus> = Vec::new();
        let mut breaches: Vec<SlaBreach> = Vec::new();

        for connector in &connectors {
            let policy = resolve_policy(&self.defaults, &connector.config);
            let pending = db::count_failures(
                &self.pool,
                Some(&connector.connector_name),
                Some(FailureStatus::Pending),
            )
            .await?;
            let dead = db::count_failures(
                &self.pool,
                Some(&connector.connector_name),
                Some(FailureStatus::Dead),
            )
            .await?;
            let checkpoint = db::get_checkpoint(&self.pool, &connector.connector_name).await?;
            let latest_run = db::latest_run(&self.pool, &connector.connector_name).await?;

            let freshness_ref = checkpoint
                .as_ref()
                .and_then(|c| c.checkpoint_publish_time.or(c.last_success_at).or(c.last_run_at))
                .or_else(|| latest_run.as_ref().and_then(|r| r.finished_at.or(Some(r.started_at))));
            let freshness_minutes =
                freshness_ref.map(|reference| ((now - reference).num_seconds() / 60).max(0));

            let mut connector_breach_types: Vec<BreachType> = Vec::new();
            let mut connector_max_sev = SignalLevel::Info;

            if connector.enabled {
                let mut push_breach =
                    |breach_type: BreachType, severity: SignalLevel, stage: BreachStage, message: String| {
                        breaches.push(SlaBreach {
                            connector_name: connector.connector_name.clone(),
                            source_name: connector.source_name.clone(),
                            breach_type,
                            severity,
                            stage,
                            message,
                            freshness_minutes,
                            pending_failures: pending,
                            dead_failures: dead,
                            latest_run_status: latest_run.as_ref().map(|r| r.status),
                            latest_run_at: latest_run.as_ref().map(|r| r.started_at),
                        });
                        connector_breach_types.push(breach_type);
                        connector_max_sev = SignalLevel::max(connector_max_sev, severity);
                    };

                match freshness_minutes {
                    None => {
                        push_breach(
                            BreachType::Freshness,
                            SignalLevel::Warning,
                            BreachStage::Warning,
                            "No freshness checkpoint found yet.".to_string(),
                        );
                    }
                    Some(minutes) => {
                        if let Some((severity, stage)) = severity_stage(
                            minutes,
                            policy.freshness_warning_minutes,
                            policy.freshness_critical_minutes,
                            policy.freshness_escalation_minutes,
                        ) {
                            push_breach(
                                BreachType::Freshness,
                                severity,
                                stage,
                                format!(
                                    "Freshness lag={minutes}m exceeds {} threshold.",
                                    stage.as_str()
                                ),
                            );
                        }
                    }
                }

                if let Some((severity, stage)) = severity_stage(
                    pending,
                    policy.pending_warning,
                    policy.pending_critical,
                    policy.pending_escalation,
                ) {
                    push_breach(
                        BreachType::PendingBacklog,
                        severity,
                        stage,
                        format!("Pending failure backlog={pending} exceeds {} threshold.", stage.as_str()),
                    );
                }

                if let Some((severity, stage)) = severity_stage(
                    dead,
                    policy.dead_warning,
                    policy.dead_critical,
                    policy.dead_escalation,
                ) {
                    push_breach(
                        BreachType::DeadBacklog,
                        severity,
                        stage,
                        format!("Dead-letter backlog={dead} exceeds {} threshold.", stage.as_str()),
                    );
                }
            }

            connector_breach_types.sort();
            connector_breach_types.dedup();
            statuses.push(SlaStatus {
                connector_name: connector.connector_name.clone(),
                source_name: connector.source_name.clone(),
                enabled: connector.enabled,
                freshness_minutes,
                pending_failures: pending,
                dead_failures: dead,
                latest_run_status: latest_run.as_ref().map(|r| r.status),
                latest_run_at: latest_run.as_ref().map(|r| r.started_at),
                severity: connector_max_sev,
                breach_types: connector_breach_types,
            });
        }

        let warning_count = breaches.iter().filter(|b| b.severity == SignalLevel::Warning).count() as i64;
        let critical_count = breaches.iter().filter(|b| b.severity == SignalLevel::Critical).count() as i64;
        let escalated_count = breaches.iter().filter(|b| b.stage == BreachStage::Escalated).count() as i64;

        Ok(SlaReport {
            generated_at: now,
            policy_defaults: self.defaults.clone(),
            connector_count: connectors.len() as i64,
            warning_count,
            critical_count,
            escalated_count,
            statuses,
            breaches,
        })
    }

    /// Evaluate, record history, upsert alert states with dedupe/cooldown,
    /// escalate on repetition, and close recovered alerts — emitting audit
    /// events along the way.
    pub async fn sync_sla_alerts(&self, options: &SlaSyncOptions) -> Result<SlaAlertSyncResult> {
        let now = Utc::now();
        let report = self.evaluate_sla(now, true).await?;
        db::append_sla_history(&self.pool, now, &report.breaches).await?;

        let connector_map: BTreeMap<String, ConnectorRecord> =
            db::list_connectors(&self.pool, 5000, false)
                .await?
                .into_iter()
                .map(|c| (c.connector_name.clone(), c))
                .collect();
        let runbook = |connector_name: &str| -> String {
            connector_map
                .get(connector_name)
                .map(|c| resolve_runbook_url(&c.config))
                .unwrap_or_default()
        };

        let mut emitted = 0i64;
        let mut skipped = 0i64;
        let mut escalated = 0i64;
        let mut active_keys: HashSet<String> = HashSet::new();

        for breach in &report.breaches {
            let dedupe_key = SlaAlertState::key_for(&breach.connector_name, breach.breach_type);
            active_keys.insert(dedupe_key.clone());

            let existing = db::get_sla_alert_state(&self.pool, &dedupe_key).await?;
            let transition = apply_breach(existing.as_ref(), breach, now, options.cooldown_seconds);
            db::put_sla_alert_state(&self.pool, &transition.state).await?;
            let mut state = transition.state;

            let (target_level, target_reason) = target_escalation_level(
                &state,
                options.warning_repeat_escalate,
                options.critical_repeat_escalate,
            );
            if target_level > state.escalation_level {
                if let Some(escalated_state) = db::update_sla_state_escalation(
                    &self.pool,
                    &dedupe_key,
                    target_level,
                    &target_reason,
                    now,
                )
                .await?
                {
                    state = escalated_state;
                    escalated += 1;
                    self.audit_event(
                        evd_audit::EVENT_CONNECTOR_SLA_ESCALATION,
                        &format!("level_{target_level}"),
                        if target_level >= 2 { "ERROR" } else { "OK" },
                        json!({
                            "connector_name": state.connector_name,
                            "source_name": state.source_name,
                            "breach_type": state.breach_type.as_str(),
                            "severity": state.severity.as_str(),
                            "stage": state.stage.as_str(),
                            "dedupe_key": state.dedupe_key,
                            "repeat_count": state.repeat_count,
                            "escalation_level": state.escalation_level,
                            "escalation_reason": state.escalation_reason,
                            "last_escalated_at": state.last_escalated_at.map(|t| t.to_rfc3339()),
                            "runbook_url": runbook(&state.connector_name),
                        }),
                    );
                }
            }

            if !transition.should_emit {
                skipped += 1;
                continue;
            }
            self.audit_event(
                evd_audit::EVENT_CONNECTOR_SLA,
                &breach.breach_type.as_str().to_lowercase(),
                if breach.severity == SignalLevel::Critical { "ERROR" } else { "OK" },
                json!({
                    "connector_name": breach.connector_name,
                    "source_name": breach.source_name,
                    "breach_type": breach.breach_type.as_str(),
                    "severity": breach.severity.as_str(),
                    "stage": breach.stage.as_str(),
                    "message": breach.message,
                    "freshness_minutes": breach.freshness_minutes,
                    "pending_failures": breach.pending_failures,
                    "dead_failures": breach.dead_failures,
                    "dedupe_key": state.dedupe_key,
                    "repeat_count": state.repeat_count,
                    "escalation_level": state.escalation_level,
                    "escalation_reason": state.escalation_reason,
                    "first_seen_at": state.first_seen_at.to_rfc3339(),
                    "last_seen_at": state.last_seen_at.to_rfc3339(),
                    "last_emitted_at": state.last_emitted_at.map(|t| t.to_rfc3339()),
                    "last_escalated_at": state.last_escalated_at.map(|t| t.to_rfc3339()),
                    "runbook_url": runbook(&breach.connector_name),
                }),
            );
            emitted += 1;
        }

        let recovered_states = db::close_sla_alert_states_not_in(&self.pool, &active_keys, now).await?;
        for state in &recovered_states {
            self.audit_event(
                evd_audit::EVENT_CONNECTOR_SLA_RECOVERY,
                "resolved",
                "OK",
                json!({
                    "connector_name": state.connector_name,
                    "source_name": state.source_name,
                    "breach_type": state.breach_type.as_str(),
                    "dedupe_key": state.dedupe_key,
                    "repeat_count": state.repeat_count,
                    "last_stage": state.stage.as_str(),
                    "last_severity": state.severity.as_str(),
                    "last_escalation_level": state.escalation_level,
                    "last_escalation_reason": state.escalation_reason,
                    "first_seen_at": state.first_seen_at.to_rfc3339(),
                    "last_seen_at": state.last_seen_at.to_rfc3339(),
                    "last_recovered_at": state.last_recovered_at.map(|t| t.to_rfc3339()),
                    "runbook_url": runbook(&state.connector_name),
                }),
            );
        }

        Ok(SlaAlertSyncResult {
            generated_at: now,
            emitted,
            skipped,
            recovered: recovered_states.len() as i64,
            escalated,
            open_states: db::count_open_sla_alert_states(&self.pool, None, 0).await?,
            open_escalated: db::count_open_sla_alert_states(&self.pool, None, 1).await?,
            report,
        })
    }

    /// Aggregate the open alert states by severity, breach type, and
    /// escalation level.
    pub async fn alert_state_summary(
        &self,
        connector_name: Option<&str>,
    ) -> Result<SlaAlertStateSummary> {
        let open_states =
            db::list_sla_alert_states(&self.pool, connector_name, true, 5000).await?;

        let mut open_by_severity: BTreeMap<String, i64> = BTreeMap::new();
        let mut open_by_breach_type: BTreeMap<String, i64> = BTreeMap::new();
        let mut open_by_escalation_level: BTreeMap<i64, i64> = BTreeMap::new();
        for state in &open_states {
            *open_by_severity.entry(state.severity.as_str().to_string()).or_insert(0) += 1;
            *open_by_breach_type.entry(state.breach_type.as_str().to_string()).or_insert(0) += 1;
            *open_by_escalation_level.entry(state.escalation_level).or_insert(0) += 1;
        }

        Ok(SlaAlertStateSummary {
            generated_at: Utc::now(),
            connector_name: connector_name.map(str::to_string),
            open_states: open_states.len() as i64,
            escalated_open_states: open_states.iter().filter(|s| s.escalation_level > 0).count() as i64,
            open_by_severity,
            open_by_breach_type,
            open_by_escalation_level,
        })
    }
}
