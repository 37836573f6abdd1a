use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::event::{EventPolarity, EventRecordCreate, Metadata, SignalLevel};

// ---------------------------------------------------------------------------
// Raw announcements
// ---------------------------------------------------------------------------

/// A raw announcement row as returned by an adapter, before standardization.
///
/// At least one of `title` / `summary` / `content` must be non-blank; publish
/// time may arrive pre-parsed or as provider text (`publish_time_text`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AnnouncementRawRecord {
    pub source_event_id: Option<String>,
    pub symbol: Option<String>,
    pub ts_code: Option<String>,
    pub title: String,
    pub summary: String,
    pub content: String,
    pub publish_time: Option<DateTime<Utc>>,
    pub publish_time_text: Option<String>,
    pub url: Option<String>,
    pub metadata: Metadata,
}

impl AnnouncementRawRecord {
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.title.trim().is_empty()
            && self.summary.trim().is_empty()
            && self.content.trim().is_empty()
        {
            return Err(DomainError::invalid(
                "at least one of title/summary/content must be provided",
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Rulesets
// ---------------------------------------------------------------------------

/// One text-pattern rule. Patterns match case-insensitively as substrings
/// over the concatenated title/summary/content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NlpRule {
    pub rule_id: String,
    pub event_type: String,
    pub polarity: EventPolarity,
    pub weight: f64,
    pub tag: String,
    pub patterns: Vec<String>,
}

impl NlpRule {
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.rule_id.trim().is_empty() {
            return Err(DomainError::invalid("rule_id must not be empty"));
        }
        if self.patterns.is_empty() {
            return Err(DomainError::invalid("patterns must not be empty"));
        }
        if !(0.0..=1.0).contains(&self.weight) {
            return Err(DomainError::invalid("rule weight must be within [0, 1]"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NlpRulesetUpsertRequest {
    pub version: String,
    pub created_by: String,
    pub note: String,
    pub activate: bool,
    pub rules: Vec<NlpRule>,
}

impl NlpRulesetUpsertRequest {
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.version.trim().is_empty() {
            return Err(DomainError::invalid("version must not be empty"));
        }
        if self.rules.is_empty() {
            return Err(DomainError::invalid("rules must not be empty"));
        }
        for rule in &self.rules {
            rule.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NlpRulesetRecord {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: String,
    pub created_by: String,
    pub note: String,
    pub is_active: bool,
    pub rule_count: i64,
    pub rules: Vec<NlpRule>,
}

/// Per-record scoring output recorded alongside the normalized event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NlpScoreResult {
    pub event_type: String,
    pub polarity: EventPolarity,
    pub score: f64,
    pub confidence: f64,
    pub ruleset_version: String,
    pub tags: Vec<String>,
    pub matched_rules: Vec<String>,
    pub rationale: String,
}

// ---------------------------------------------------------------------------
// Normalize preview / ingest
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizePreviewRequest {
    pub source_name: String,
    pub records: Vec<AnnouncementRawRecord>,
    pub default_symbol: Option<String>,
    pub default_timezone: String,
    pub source_reliability_score: f64,
}

impl NormalizePreviewRequest {
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.records.is_empty() {
            return Err(DomainError::invalid("records must not be empty"));
        }
        if !(0.0..=1.0).contains(&self.source_reliability_score) {
            return Err(DomainError::invalid("source_reliability_score must be within [0, 1]"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub row_index: usize,
    pub event: EventRecordCreate,
    pub nlp: NlpScoreResult,
    pub warning: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizePreviewResult {
    pub source_name: String,
    pub normalized: Vec<NormalizedRecord>,
    pub dropped: i64,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizeIngestRequest {
    pub request: NormalizePreviewRequest,
    pub allow_partial: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizeIngestResult {
    pub source_name: String,
    pub preview: NormalizePreviewResult,
    pub ingest: Option<crate::event::EventBatchIngestResult>,
}

// ---------------------------------------------------------------------------
// Drift
// ---------------------------------------------------------------------------

/// Alerting bands for each tracked drift metric. Drops are expressed as
/// positive magnitudes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftThresholds {
    pub hit_rate_drop_warning: f64,
    pub hit_rate_drop_critical: f64,
    pub score_p50_shift_warning: f64,
    pub score_p50_shift_critical: f64,
    pub contribution_drop_warning: f64,
    pub contribution_drop_critical: f64,
    pub feedback_polarity_accuracy_drop_warning: f64,
    pub feedback_polarity_accuracy_drop_critical: f64,
    pub feedback_event_type_accuracy_drop_warning: f64,
    pub feedback_event_type_accuracy_drop_critical: f64,
}

impl Default for DriftThresholds {
    fn default() -> Self {
        Self {
            hit_rate_drop_warning: 0.08,
            hit_rate_drop_critical: 0.15,
            score_p50_shift_warning: 0.08,
            score_p50_shift_critical: 0.18,
            contribution_drop_warning: 0.03,
            contribution_drop_critical: 0.08,
            feedback_polarity_accuracy_drop_warning: 0.08,
            feedback_polarity_accuracy_drop_critical: 0.15,
            feedback_event_type_accuracy_drop_warning: 0.10,
            feedback_event_type_accuracy_drop_critical: 0.20,
        }
    }
}

/// Contribution compare parameters forwarded to the external backtest
/// comparator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContributionParams {
    pub symbol: String,
    pub strategy_name: String,
    pub event_lookback_days: i64,
    pub event_decay_half_life_days: f64,
}

impl Default for ContributionParams {
    fn default() -> Self {
        Self {
            symbol: "000001".to_string(),
            strategy_name: "event_driven".to_string(),
            event_lookback_days: 30,
            event_decay_half_life_days: 7.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftCheckRequest {
    pub source_name: Option<String>,
    pub current_start: NaiveDate,
    pub current_end: NaiveDate,
    pub baseline_start: Option<NaiveDate>,
    pub baseline_end: Option<NaiveDate>,
    pub thresholds: DriftThresholds,
    pub include_contribution: bool,
    pub contribution: ContributionParams,
    pub include_feedback_quality: bool,
    pub feedback_min_samples: i64,
    pub save_snapshot: bool,
}

impl DriftCheckRequest {
    pub fn new(current_start: NaiveDate, current_end: NaiveDate) -> Self {
        Self {
            source_name: None,
            current_start,
            current_end,
            baseline_start: None,
            baseline_end: None,
            thresholds: DriftThresholds::default(),
            include_contribution: true,
            contribution: ContributionParams::default(),
            include_feedback_quality: true,
            feedback_min_samples: 20,
            save_snapshot: true,
        }
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        if self.current_start > self.current_end {
            return Err(DomainError::invalid("current_start must be <= current_end"));
        }
        if let (Some(start), Some(end)) = (self.baseline_start, self.baseline_end) {
            if start > end {
                return Err(DomainError::invalid("baseline_start must be <= baseline_end"));
            }
        }
        if self.feedback_min_samples < 1 {
            return Err(DomainError::invalid("feedback_min_samples must be >= 1"));
        }
        Ok(())
    }
}

/// Aggregated NLP metrics over one date window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowMetrics {
    pub source_name: Option<String>,
    pub ruleset_version: String,
    pub sample_size: i64,
    pub hit_count: i64,
    pub hit_rate: f64,
    pub score_mean: f64,
    pub score_p10: f64,
    pub score_p50: f64,
    pub score_p90: f64,
    pub positive_ratio: f64,
    pub negative_ratio: f64,
    pub neutral_ratio: f64,
    pub top_event_types: Vec<(String, i64)>,
}

impl WindowMetrics {
    pub fn empty(source_name: Option<String>, ruleset_version: String) -> Self {
        Self {
            source_name,
            ruleset_version,
            sample_size: 0,
            hit_count: 0,
            hit_rate: 0.0,
            score_mean: 0.0,
            score_p10: 0.0,
            score_p50: 0.0,
            score_p90: 0.0,
            positive_ratio: 0.0,
            negative_ratio: 0.0,
            neutral_ratio: 0.0,
            top_event_types: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftAlert {
    pub severity: SignalLevel,
    pub metric: String,
    pub message: String,
    pub current: Option<f64>,
    pub baseline: Option<f64>,
    pub delta: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContributionWindow {
    pub symbol: String,
    pub strategy_name: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub total_return_delta: f64,
    pub sharpe_delta: f64,
    pub event_row_ratio: f64,
    pub events_loaded: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftCheckResult {
    pub generated_at: DateTime<Utc>,
    pub source_name: Option<String>,
    pub ruleset_version: String,
    pub current: WindowMetrics,
    pub baseline: WindowMetrics,
    pub hit_rate_delta: f64,
    pub score_p50_delta: f64,
    pub contribution_current: Option<ContributionWindow>,
    pub contribution_baseline: Option<ContributionWindow>,
    pub contribution_delta: Option<f64>,
    pub feedback_current: Option<FeedbackSummary>,
    pub feedback_baseline: Option<FeedbackSummary>,
    pub feedback_polarity_accuracy_delta: Option<f64>,
    pub feedback_event_type_accuracy_delta: Option<f64>,
    pub alerts: Vec<DriftAlert>,
    pub snapshot_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftSnapshotRecord {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub source_name: Option<String>,
    pub ruleset_version: String,
    pub current_start: NaiveDate,
    pub current_end: NaiveDate,
    pub baseline_start: NaiveDate,
    pub baseline_end: NaiveDate,
    pub sample_size: i64,
    pub hit_rate: f64,
    pub baseline_hit_rate: f64,
    pub hit_rate_delta: f64,
    pub score_p50: f64,
    pub baseline_score_p50: f64,
    pub score_p50_delta: f64,
    pub contribution_delta: Option<f64>,
    pub feedback_polarity_accuracy_delta: Option<f64>,
    pub feedback_event_type_accuracy_delta: Option<f64>,
    pub alerts: Vec<DriftAlert>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftMonitorPoint {
    pub snapshot_id: i64,
    pub created_at: DateTime<Utc>,
    pub ruleset_version: String,
    pub hit_rate_delta: f64,
    pub score_p50_delta: f64,
    pub contribution_delta: Option<f64>,
    pub feedback_polarity_accuracy_delta: Option<f64>,
    pub feedback_event_type_accuracy_delta: Option<f64>,
    pub warning_alerts: i64,
    pub critical_alerts: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftMonitorSummary {
    pub generated_at: DateTime<Utc>,
    pub source_name: Option<String>,
    pub window_size: i64,
    pub latest_snapshot_id: Option<i64>,
    pub latest_ruleset_version: Option<String>,
    pub latest_risk_level: SignalLevel,
    pub warning_alert_snapshots: i64,
    pub critical_alert_snapshots: i64,
    pub hit_rate_delta_trend: Option<f64>,
    pub score_p50_delta_trend: Option<f64>,
    pub contribution_delta_trend: Option<f64>,
    pub feedback_polarity_accuracy_delta_trend: Option<f64>,
    pub feedback_event_type_accuracy_delta_trend: Option<f64>,
    pub points: Vec<DriftMonitorPoint>,
}

// ---------------------------------------------------------------------------
// Feedback & labels
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackUpsertRequest {
    pub source_name: String,
    pub event_id: String,
    pub label_event_type: String,
    pub label_polarity: EventPolarity,
    pub label_score: Option<f64>,
    pub labeler: String,
    pub note: String,
}

impl FeedbackUpsertRequest {
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.label_event_type.trim().is_empty() {
            return Err(DomainError::invalid("label_event_type must not be empty"));
        }
        if let Some(score) = self.label_score {
            if !(0.0..=1.0).contains(&score) {
                return Err(DomainError::invalid("label_score must be within [0, 1]"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub source_name: String,
    pub event_id: String,
    pub symbol: String,
    pub publish_time: DateTime<Utc>,
    pub predicted_event_type: String,
    pub predicted_polarity: EventPolarity,
    pub predicted_score: f64,
    pub label_event_type: String,
    pub label_polarity: EventPolarity,
    pub label_score: Option<f64>,
    pub labeler: String,
    pub note: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackSummary {
    pub source_name: Option<String>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub sample_size: i64,
    pub polarity_accuracy: f64,
    pub event_type_accuracy: f64,
    pub score_mae: Option<f64>,
    pub top_mismatches: Vec<(String, i64)>,
}

/// One labeler's judgement on one event. Unique on
/// `(source_name, event_id, labeler)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelEntryUpsertRequest {
    pub source_name: String,
    pub event_id: String,
    pub labeler: String,
    pub label_event_type: String,
    pub label_polarity: EventPolarity,
    pub label_score: Option<f64>,
    pub note: String,
}

impl LabelEntryUpsertRequest {
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.labeler.trim().is_empty() {
            return Err(DomainError::invalid("labeler must not be empty"));
        }
        if self.label_event_type.trim().is_empty() {
            return Err(DomainError::invalid("label_event_type must not be empty"));
        }
        if let Some(score) = self.label_score {
            if !(0.0..=1.0).contains(&score) {
                return Err(DomainError::invalid("label_score must be within [0, 1]"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelEntryRecord {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub source_name: String,
    pub event_id: String,
    pub symbol: String,
    pub publish_time: DateTime<Utc>,
    pub predicted_score: f64,
    pub label_event_type: String,
    pub label_polarity: EventPolarity,
    pub label_score: Option<f64>,
    pub labeler: String,
    pub note: String,
}

// ---------------------------------------------------------------------------
// Adjudication / consensus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdjudicationRequest {
    pub source_name: Option<String>,
    pub event_ids: Vec<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub min_labelers: i64,
    pub require_unanimous: bool,
    pub save_consensus: bool,
    pub adjudicated_by: String,
    pub label_version: String,
}

impl AdjudicationRequest {
    pub fn validate(&self) -> Result<(), DomainError> {
        if !(1..=20).contains(&self.min_labelers) {
            return Err(DomainError::invalid("min_labelers must be within 1..=20"));
        }
        Ok(())
    }
}

impl Default for AdjudicationRequest {
    fn default() -> Self {
        Self {
            source_name: None,
            event_ids: Vec::new(),
            start_date: None,
            end_date: None,
            min_labelers: 2,
            require_unanimous: false,
            save_consensus: true,
            adjudicated_by: "system".to_string(),
            label_version: "v1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdjudicationItem {
    pub source_name: String,
    pub event_id: String,
    pub symbol: String,
    pub publish_time: DateTime<Utc>,
    pub label_count: i64,
    pub labelers: Vec<String>,
    pub consensus_event_type: Option<String>,
    pub consensus_polarity: Option<EventPolarity>,
    pub consensus_score: Option<f64>,
    pub consensus_confidence: f64,
    pub conflict: bool,
    pub conflict_reasons: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdjudicationResult {
    pub generated_at: DateTime<Utc>,
    pub source_name: Option<String>,
    pub total_events: i64,
    pub adjudicated: i64,
    pub conflicts: i64,
    pub skipped: i64,
    pub items: Vec<AdjudicationItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusRecord {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub source_name: String,
    pub event_id: String,
    pub symbol: String,
    pub publish_time: DateTime<Utc>,
    pub consensus_event_type: String,
    pub consensus_polarity: EventPolarity,
    pub consensus_score: Option<f64>,
    pub consensus_confidence: f64,
    pub label_count: i64,
    pub conflict: bool,
    pub conflict_reasons: Vec<String>,
    pub adjudicated_by: String,
    pub label_version: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_record_requires_some_text() {
        let rec = AnnouncementRawRecord::default();
        assert!(rec.validate().is_err());
        let rec = AnnouncementRawRecord {
            title: "回购公告".to_string(),
            ..AnnouncementRawRecord::default()
        };
        assert!(rec.validate().is_ok());
    }

    #[test]
    fn rule_requires_patterns() {
        let rule = NlpRule {
            rule_id: "r1".to_string(),
            event_type: "buyback".to_string(),
            polarity: EventPolarity::Positive,
            weight: 0.8,
            tag: "buyback".to_string(),
            patterns: vec![],
        };
        assert!(rule.validate().is_err());
    }

    #[test]
    fn drift_request_rejects_inverted_window() {
        let start = NaiveDate::from_ymd_opt(2024, 5, 10).unwrap();
        let end = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        assert!(DriftCheckRequest::new(start, end).validate().is_err());
    }
}
