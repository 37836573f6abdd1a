use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::connector::RunStatus;
use crate::error::DomainError;
use crate::event::SignalLevel;

// ---------------------------------------------------------------------------
// Breach taxonomy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreachType {
    Freshness,
    PendingBacklog,
    DeadBacklog,
}

impl BreachType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreachType::Freshness => "FRESHNESS",
            BreachType::PendingBacklog => "PENDING_BACKLOG",
            BreachType::DeadBacklog => "DEAD_BACKLOG",
        }
    }

    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "FRESHNESS" => Ok(BreachType::Freshness),
            "PENDING_BACKLOG" => Ok(BreachType::PendingBacklog),
            "DEAD_BACKLOG" => Ok(BreachType::DeadBacklog),
            other => Err(DomainError::invalid(format!("invalid breach type: {other}"))),
        }
    }
}

/// The threshold band a breach landed in. `Escalated` is the highest band
/// and always carries CRITICAL severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BreachStage {
    Warning,
    Critical,
    Escalated,
}

impl BreachStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreachStage::Warning => "warning",
            BreachStage::Critical => "critical",
            BreachStage::Escalated => "escalated",
        }
    }

    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "warning" => Ok(BreachStage::Warning),
            "critical" => Ok(BreachStage::Critical),
            "escalated" => Ok(BreachStage::Escalated),
            other => Err(DomainError::invalid(format!("invalid breach stage: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Per-axis thresholds. Each triple must be ascending; `validate()` enforces
/// it and the policy loader falls back to defaults on violation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlaPolicy {
    pub freshness_warning_minutes: i64,
    pub freshness_critical_minutes: i64,
    pub freshness_escalation_minutes: i64,
    pub pending_warning: i64,
    pub pending_critical: i64,
    pub pending_escalation: i64,
    pub dead_warning: i64,
    pub dead_critical: i64,
    pub dead_escalation: i64,
}

impl Default for SlaPolicy {
    fn default() -> Self {
        Self {
            freshness_warning_minutes: 180,
            freshness_critical_minutes: 720,
            freshness_escalation_minutes: 1440,
            pending_warning: 10,
            pending_critical: 30,
            pending_escalation: 80,
            dead_warning: 1,
            dead_critical: 5,
            dead_escalation: 20,
        }
    }
}

impl SlaPolicy {
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.freshness_warning_minutes < 1 {
            return Err(DomainError::invalid("freshness_warning_minutes must be >= 1"));
        }
        if !(self.freshness_warning_minutes <= self.freshness_critical_minutes
            && self.freshness_critical_minutes <= self.freshness_escalation_minutes)
        {
            return Err(DomainError::invalid(
                "freshness thresholds must satisfy warning <= critical <= escalation",
            ));
        }
        if !(self.pending_warning <= self.pending_critical
            && self.pending_critical <= self.pending_escalation)
        {
            return Err(DomainError::invalid(
                "pending thresholds must satisfy warning <= critical <= escalation",
            ));
        }
        if !(self.dead_warning <= self.dead_critical && self.dead_critical <= self.dead_escalation) {
            return Err(DomainError::invalid(
                "dead thresholds must satisfy warning <= critical <= escalation",
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Evaluation output
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaBreach {
    pub connector_name: String,
    pub source_name: String,
    pub breach_type: BreachType,
    pub severity: SignalLevel,
    pub stage: BreachStage,
    pub message: String,
    pub freshness_minutes: Option<i64>,
    pub pending_failures: i64,
    pub dead_failures: i64,
    pub latest_run_status: Option<RunStatus>,
    pub latest_run_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaStatus {
    pub connector_name: String,
    pub source_name: String,
    pub enabled: bool,
    pub freshness_minutes: Option<i64>,
    pub pending_failures: i64,
    pub dead_failures: i64,
    pub latest_run_status: Option<RunStatus>,
    pub latest_run_at: Option<DateTime<Utc>>,
    pub severity: SignalLevel,
    pub breach_types: Vec<BreachType>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaReport {
    pub generated_at: DateTime<Utc>,
    pub policy_defaults: SlaPolicy,
    pub connector_count: i64,
    pub warning_count: i64,
    pub critical_count: i64,
    pub escalated_count: i64,
    pub statuses: Vec<SlaStatus>,
    pub breaches: Vec<SlaBreach>,
}

// ---------------------------------------------------------------------------
// Alert state machine
// ---------------------------------------------------------------------------

/// Current alert state keyed by `"{connector_name}|{breach_type}"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaAlertState {
    pub dedupe_key: String,
    pub connector_name: String,
    pub source_name: String,
    pub breach_type: BreachType,
    pub stage: BreachStage,
    pub severity: SignalLevel,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub last_emitted_at: Option<DateTime<Utc>>,
    pub last_recovered_at: Option<DateTime<Utc>>,
    pub last_escalated_at: Option<DateTime<Utc>>,
    pub repeat_count: i64,
    pub escalation_level: i64,
    pub escalation_reason: String,
    pub is_open: bool,
    pub message: String,
}

impl SlaAlertState {
    /// Dedupe key for a breach.
    pub fn key_for(connector_name: &str, breach_type: BreachType) -> String {
        format!("{}|{}", connector_name, breach_type.as_str())
    }
}

/// Append-only SLA observation row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaHistoryRow {
    pub id: i64,
    pub observed_at: DateTime<Utc>,
    pub connector_name: String,
    pub source_name: String,
    pub breach_type: BreachType,
    pub severity: SignalLevel,
    pub stage: BreachStage,
    pub freshness_minutes: Option<i64>,
    pub pending_failures: i64,
    pub dead_failures: i64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaAlertSyncResult {
    pub generated_at: DateTime<Utc>,
    pub emitted: i64,
    pub skipped: i64,
    pub recovered: i64,
    pub escalated: i64,
    pub open_states: i64,
    pub open_escalated: i64,
    pub report: SlaReport,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaAlertStateSummary {
    pub generated_at: DateTime<Utc>,
    pub connector_name: Option<String>,
    pub open_states: i64,
    pub escalated_open_states: i64,
    pub open_by_severity: BTreeMap<String, i64>,
    pub open_by_breach_type: BTreeMap<String, i64>,
    pub open_by_escalation_level: BTreeMap<i64, i64>,
}
