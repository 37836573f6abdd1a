use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DomainError;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectorType {
    TushareAnnouncement,
    FileAnnouncement,
    HttpJsonAnnouncement,
    AkshareAnnouncement,
}

impl ConnectorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectorType::TushareAnnouncement => "TUSHARE_ANNOUNCEMENT",
            ConnectorType::FileAnnouncement => "FILE_ANNOUNCEMENT",
            ConnectorType::HttpJsonAnnouncement => "HTTP_JSON_ANNOUNCEMENT",
            ConnectorType::AkshareAnnouncement => "AKSHARE_ANNOUNCEMENT",
        }
    }

    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "TUSHARE_ANNOUNCEMENT" => Ok(ConnectorType::TushareAnnouncement),
            "FILE_ANNOUNCEMENT" => Ok(ConnectorType::FileAnnouncement),
            "HTTP_JSON_ANNOUNCEMENT" => Ok(ConnectorType::HttpJsonAnnouncement),
            "AKSHARE_ANNOUNCEMENT" => Ok(ConnectorType::AkshareAnnouncement),
            other => Err(DomainError::invalid(format!("invalid connector type: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Success,
    Partial,
    Failed,
    DryRun,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Success => "SUCCESS",
            RunStatus::Partial => "PARTIAL",
            RunStatus::Failed => "FAILED",
            RunStatus::DryRun => "DRY_RUN",
        }
    }

    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "RUNNING" => Ok(RunStatus::Running),
            "SUCCESS" => Ok(RunStatus::Success),
            "PARTIAL" => Ok(RunStatus::Partial),
            "FAILED" => Ok(RunStatus::Failed),
            "DRY_RUN" => Ok(RunStatus::DryRun),
            other => Err(DomainError::invalid(format!("invalid run status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureStatus {
    Pending,
    Replayed,
    Dead,
}

impl FailureStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureStatus::Pending => "PENDING",
            FailureStatus::Replayed => "REPLAYED",
            FailureStatus::Dead => "DEAD",
        }
    }

    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "PENDING" => Ok(FailureStatus::Pending),
            "REPLAYED" => Ok(FailureStatus::Replayed),
            "DEAD" => Ok(FailureStatus::Dead),
            other => Err(DomainError::invalid(format!("invalid failure status: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Connector registry
// ---------------------------------------------------------------------------

/// Upsert request for a connector. `connector_name` is the natural key.
///
/// `config` is the free-form JSON object documented in the connector
/// configuration reference (`source_matrix`, `failover`, `sla`, credentials,
/// budgets, runbook pointers, adapter options).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorRegisterRequest {
    pub connector_name: String,
    pub source_name: String,
    pub connector_type: ConnectorType,
    pub enabled: bool,
    pub fetch_limit: i64,
    pub poll_interval_minutes: i64,
    pub replay_backoff_seconds: i64,
    pub max_retry: i64,
    pub checkpoint_cursor: Option<String>,
    pub checkpoint_publish_time: Option<DateTime<Utc>>,
    pub config: Value,
    pub created_by: String,
    pub note: String,
}

impl ConnectorRegisterRequest {
    pub fn new(
        connector_name: impl Into<String>,
        source_name: impl Into<String>,
        connector_type: ConnectorType,
    ) -> Self {
        Self {
            connector_name: connector_name.into(),
            source_name: source_name.into(),
            connector_type,
            enabled: true,
            fetch_limit: 500,
            poll_interval_minutes: 10,
            replay_backoff_seconds: 300,
            max_retry: 5,
            checkpoint_cursor: None,
            checkpoint_publish_time: None,
            config: Value::Object(serde_json::Map::new()),
            created_by: "system".to_string(),
            note: String::new(),
        }
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        if self.connector_name.trim().is_empty() {
            return Err(DomainError::invalid("connector_name must not be empty"));
        }
        if self.source_name.trim().is_empty() {
            return Err(DomainError::invalid("source_name must not be empty"));
        }
        if !(1..=5000).contains(&self.fetch_limit) {
            return Err(DomainError::invalid("fetch_limit must be within 1..=5000"));
        }
        if !(1..=7 * 24 * 60).contains(&self.poll_interval_minutes) {
            return Err(DomainError::invalid("poll_interval_minutes must be within 1..=10080"));
        }
        if !(1..=86_400).contains(&self.replay_backoff_seconds) {
            return Err(DomainError::invalid("replay_backoff_seconds must be within 1..=86400"));
        }
        if !(1..=100).contains(&self.max_retry) {
            return Err(DomainError::invalid("max_retry must be within 1..=100"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorRecord {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub connector_name: String,
    pub source_name: String,
    pub connector_type: ConnectorType,
    pub enabled: bool,
    pub fetch_limit: i64,
    pub poll_interval_minutes: i64,
    pub replay_backoff_seconds: i64,
    pub max_retry: i64,
    pub config: Value,
    pub created_by: String,
    pub note: String,
}

/// One checkpoint row per connector; advanced only by non-dry runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub connector_name: String,
    pub checkpoint_cursor: Option<String>,
    pub checkpoint_publish_time: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorRunRecord {
    pub run_id: String,
    pub connector_name: String,
    pub source_name: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub triggered_by: String,
    pub pulled_count: i64,
    pub normalized_count: i64,
    pub inserted_count: i64,
    pub updated_count: i64,
    pub failed_count: i64,
    pub replayed_count: i64,
    pub checkpoint_before: Option<String>,
    pub checkpoint_after: Option<String>,
    pub error_message: Option<String>,
    pub details: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorRunRequest {
    pub connector_name: String,
    pub triggered_by: String,
    pub dry_run: bool,
    pub force_full_sync: bool,
    pub fetch_limit_override: Option<i64>,
}

impl ConnectorRunRequest {
    pub fn new(connector_name: impl Into<String>) -> Self {
        Self {
            connector_name: connector_name.into(),
            triggered_by: "manual".to_string(),
            dry_run: false,
            force_full_sync: false,
            fetch_limit_override: None,
        }
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        if let Some(limit) = self.fetch_limit_override {
            if !(1..=10_000).contains(&limit) {
                return Err(DomainError::invalid("fetch_limit_override must be within 1..=10000"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorRunResult {
    pub run: ConnectorRunRecord,
    pub errors: Vec<String>,
}

// ---------------------------------------------------------------------------
// Failures (dead-letter workbench)
// ---------------------------------------------------------------------------

/// A materialized per-row failure. `payload` carries
/// `{phase, raw_record?, event?, source_key?, error}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub id: i64,
    pub connector_name: String,
    pub source_name: String,
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: FailureStatus,
    pub retry_count: i64,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: String,
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRepairRequest {
    pub connector_name: String,
    pub failure_id: i64,
    pub patch_raw_record: Value,
    pub patch_event: Value,
    pub reset_retry_count: bool,
    pub triggered_by: String,
    pub note: String,
}

impl FailureRepairRequest {
    pub fn validate(&self) -> Result<(), DomainError> {
        let raw_empty = !matches!(&self.patch_raw_record, Value::Object(m) if !m.is_empty());
        let event_empty = !matches!(&self.patch_event, Value::Object(m) if !m.is_empty());
        if raw_empty && event_empty {
            return Err(DomainError::invalid(
                "at least one of patch_raw_record or patch_event must be provided",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRepairResult {
    pub connector_name: String,
    pub failure_id: i64,
    pub updated: bool,
    pub failure: Option<FailureRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayRequest {
    pub connector_name: String,
    pub limit: i64,
    pub triggered_by: String,
}

impl ReplayRequest {
    pub fn new(connector_name: impl Into<String>) -> Self {
        Self {
            connector_name: connector_name.into(),
            limit: 100,
            triggered_by: "manual_replay".to_string(),
        }
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        if !(1..=2000).contains(&self.limit) {
            return Err(DomainError::invalid("limit must be within 1..=2000"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayResult {
    pub connector_name: String,
    pub picked: i64,
    pub replayed: i64,
    pub failed: i64,
    pub dead: i64,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManualReplayRequest {
    pub connector_name: String,
    pub failure_ids: Vec<i64>,
    pub triggered_by: String,
}

impl ManualReplayRequest {
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.failure_ids.is_empty() {
            return Err(DomainError::invalid("failure_ids must not be empty"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManualReplayItem {
    pub failure_id: i64,
    pub status: FailureStatus,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManualReplayResult {
    pub connector_name: String,
    pub picked: i64,
    pub replayed: i64,
    pub failed: i64,
    pub dead: i64,
    pub items: Vec<ManualReplayItem>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairReplayItemRequest {
    pub failure_id: i64,
    pub patch_raw_record: Value,
    pub patch_event: Value,
    pub reset_retry_count: bool,
    pub note: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairReplayRequest {
    pub connector_name: String,
    pub items: Vec<RepairReplayItemRequest>,
    pub triggered_by: String,
}

impl RepairReplayRequest {
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.items.is_empty() {
            return Err(DomainError::invalid("items must not be empty"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairReplayResult {
    pub connector_name: String,
    pub repaired: i64,
    pub picked: i64,
    pub replayed: i64,
    pub failed: i64,
    pub dead: i64,
    pub repaired_failure_ids: Vec<i64>,
    pub items: Vec<ManualReplayItem>,
    pub errors: Vec<String>,
}

// ---------------------------------------------------------------------------
// Source matrix & per-source state
// ---------------------------------------------------------------------------

/// One resolved source-matrix candidate. Budget and credential aliases are
/// folded into `config` during resolution so the runtime reads a single map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceMatrixItem {
    pub source_key: String,
    pub connector_type: ConnectorType,
    pub priority: i64,
    pub enabled: bool,
    pub config: Value,
}

/// Failover knobs parsed from `config.failover`.
#[derive(Debug, Clone, PartialEq)]
pub struct FailoverConfig {
    pub enabled: bool,
    pub health_threshold: f64,
    pub max_candidates_per_run: usize,
}

/// Per-`(connector, source_key)` health and checkpoint state.
///
/// `effective_health_score` = `max(0, health − staleness_penalty)` where the
/// penalty is `min(20, minutes_since_last_attempt / 30)`; it is computed at
/// read time, not stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceStateRecord {
    pub connector_name: String,
    pub source_key: String,
    pub connector_type: ConnectorType,
    pub priority: i64,
    pub enabled: bool,
    pub health_score: f64,
    pub effective_health_score: f64,
    pub consecutive_failures: i64,
    pub total_success: i64,
    pub total_failures: i64,
    pub last_latency_ms: Option<i64>,
    pub last_error: String,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub checkpoint_cursor: Option<String>,
    pub checkpoint_publish_time: Option<DateTime<Utc>>,
    pub is_active: bool,
}

/// Ops view of one connector: active source, latest run, backlog counts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorOverviewItem {
    pub connector_name: String,
    pub source_name: String,
    pub connector_type: ConnectorType,
    pub enabled: bool,
    pub active_source_key: Option<String>,
    pub active_source_health: Option<f64>,
    pub last_run_status: Option<RunStatus>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub checkpoint_publish_time: Option<DateTime<Utc>>,
    pub pending_failures: i64,
    pub dead_failures: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_request_defaults_are_valid() {
        let req = ConnectorRegisterRequest::new("c1", "s1", ConnectorType::FileAnnouncement);
        assert!(req.validate().is_ok());
        assert_eq!(req.fetch_limit, 500);
        assert_eq!(req.max_retry, 5);
    }

    #[test]
    fn register_request_rejects_out_of_range_limits() {
        let mut req = ConnectorRegisterRequest::new("c1", "s1", ConnectorType::FileAnnouncement);
        req.fetch_limit = 0;
        assert!(req.validate().is_err());
        req.fetch_limit = 500;
        req.max_retry = 101;
        assert!(req.validate().is_err());
    }

    #[test]
    fn repair_request_requires_some_patch() {
        let req = FailureRepairRequest {
            connector_name: "c1".to_string(),
            failure_id: 1,
            patch_raw_record: Value::Object(serde_json::Map::new()),
            patch_event: Value::Object(serde_json::Map::new()),
            reset_retry_count: false,
            triggered_by: "manual_repair".to_string(),
            note: String::new(),
        };
        assert!(req.validate().is_err());
    }

    #[test]
    fn run_status_serde_uses_wire_names() {
        let s = serde_json::to_string(&RunStatus::DryRun).unwrap();
        assert_eq!(s, "\"DRY_RUN\"");
        assert_eq!(RunStatus::parse("DRY_RUN").unwrap(), RunStatus::DryRun);
    }
}
