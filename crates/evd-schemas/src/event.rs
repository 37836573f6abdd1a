use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DomainError;

// ---------------------------------------------------------------------------
// Severity
// ---------------------------------------------------------------------------

/// Shared severity scale for SLA breaches and NLP drift alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalLevel {
    Info,
    Warning,
    Critical,
}

impl SignalLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalLevel::Info => "INFO",
            SignalLevel::Warning => "WARNING",
            SignalLevel::Critical => "CRITICAL",
        }
    }

    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "INFO" => Ok(SignalLevel::Info),
            "WARNING" => Ok(SignalLevel::Warning),
            "CRITICAL" => Ok(SignalLevel::Critical),
            other => Err(DomainError::invalid(format!("invalid signal level: {other}"))),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            SignalLevel::Info => 1,
            SignalLevel::Warning => 2,
            SignalLevel::Critical => 3,
        }
    }

    /// The more severe of the two levels.
    pub fn max(a: SignalLevel, b: SignalLevel) -> SignalLevel {
        if a.rank() >= b.rank() {
            a
        } else {
            b
        }
    }
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventSourceType {
    Manual,
    Announcement,
    News,
    Model,
}

impl EventSourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSourceType::Manual => "MANUAL",
            EventSourceType::Announcement => "ANNOUNCEMENT",
            EventSourceType::News => "NEWS",
            EventSourceType::Model => "MODEL",
        }
    }

    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "MANUAL" => Ok(EventSourceType::Manual),
            "ANNOUNCEMENT" => Ok(EventSourceType::Announcement),
            "NEWS" => Ok(EventSourceType::News),
            "MODEL" => Ok(EventSourceType::Model),
            other => Err(DomainError::invalid(format!("invalid source type: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventPolarity {
    Positive,
    Negative,
    Neutral,
}

impl EventPolarity {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventPolarity::Positive => "POSITIVE",
            EventPolarity::Negative => "NEGATIVE",
            EventPolarity::Neutral => "NEUTRAL",
        }
    }

    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "POSITIVE" => Ok(EventPolarity::Positive),
            "NEGATIVE" => Ok(EventPolarity::Negative),
            "NEUTRAL" => Ok(EventPolarity::Neutral),
            other => Err(DomainError::invalid(format!("invalid polarity: {other}"))),
        }
    }
}

/// Upsert request for an event source. `source_name` is the natural key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSourceRegisterRequest {
    pub source_name: String,
    pub source_type: EventSourceType,
    pub provider: String,
    pub timezone: String,
    pub ingestion_lag_minutes: i64,
    pub reliability_score: f64,
    pub description: String,
    pub created_by: String,
    pub note: String,
}

impl EventSourceRegisterRequest {
    pub fn new(source_name: impl Into<String>) -> Self {
        Self {
            source_name: source_name.into(),
            source_type: EventSourceType::Manual,
            provider: "internal".to_string(),
            timezone: "Asia/Shanghai".to_string(),
            ingestion_lag_minutes: 0,
            reliability_score: 0.7,
            description: String::new(),
            created_by: "system".to_string(),
            note: String::new(),
        }
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        if self.source_name.trim().is_empty() {
            return Err(DomainError::invalid("source_name must not be empty"));
        }
        if self.ingestion_lag_minutes < 0 {
            return Err(DomainError::invalid("ingestion_lag_minutes must be >= 0"));
        }
        if !(0.0..=1.0).contains(&self.reliability_score) {
            return Err(DomainError::invalid("reliability_score must be within [0, 1]"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSourceRecord {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub source_name: String,
    pub source_type: EventSourceType,
    pub provider: String,
    pub timezone: String,
    pub ingestion_lag_minutes: i64,
    pub reliability_score: f64,
    pub description: String,
    pub created_by: String,
    pub note: String,
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

pub type Metadata = BTreeMap<String, Value>;

/// A normalized event ready for ingest. Unique on `(source_name, event_id)`
/// at the store; ingest is upsert-on-conflict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecordCreate {
    pub event_id: String,
    pub symbol: String,
    pub event_type: String,
    pub publish_time: DateTime<Utc>,
    pub effective_time: Option<DateTime<Utc>>,
    pub polarity: EventPolarity,
    pub score: f64,
    pub confidence: f64,
    pub title: String,
    pub summary: String,
    pub raw_ref: Option<String>,
    pub tags: Vec<String>,
    pub metadata: Metadata,
}

impl EventRecordCreate {
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.event_id.trim().is_empty() {
            return Err(DomainError::invalid("event_id must not be empty"));
        }
        if self.symbol.trim().is_empty() {
            return Err(DomainError::invalid("symbol must not be empty"));
        }
        if !(0.0..=1.0).contains(&self.score) {
            return Err(DomainError::invalid("score must be within [0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(DomainError::invalid("confidence must be within [0, 1]"));
        }
        if let Some(eff) = self.effective_time {
            if eff < self.publish_time {
                return Err(DomainError::invalid("effective_time must be >= publish_time"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub source_name: String,
    pub event_id: String,
    pub symbol: String,
    pub event_type: String,
    pub publish_time: DateTime<Utc>,
    pub effective_time: Option<DateTime<Utc>>,
    pub polarity: EventPolarity,
    pub score: f64,
    pub confidence: f64,
    pub title: String,
    pub summary: String,
    pub raw_ref: Option<String>,
    pub tags: Vec<String>,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBatchIngestRequest {
    pub source_name: String,
    pub events: Vec<EventRecordCreate>,
}

impl EventBatchIngestRequest {
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.events.is_empty() {
            return Err(DomainError::invalid("events must not be empty"));
        }
        Ok(())
    }
}

/// Ingest outcome. `errors` entries are prefixed `idx=N:` so callers can map
/// them back to input positions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBatchIngestResult {
    pub source_name: String,
    pub inserted: i64,
    pub updated: i64,
    pub total: i64,
    pub errors: Vec<String>,
}

/// Read filters for the event list.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub symbol: Option<String>,
    pub source_name: Option<String>,
    pub event_type: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub limit: i64,
}

/// Raw projection used by NLP drift aggregation.
#[derive(Debug, Clone)]
pub struct EventMetricsRow {
    pub source_name: String,
    pub event_type: String,
    pub polarity: EventPolarity,
    pub score: f64,
    pub metadata: Metadata,
}

// ---------------------------------------------------------------------------
// Point-in-time join validation
// ---------------------------------------------------------------------------

/// One joined usage of an event by a downstream consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventJoinPitRow {
    pub event_id: String,
    pub symbol: String,
    pub used_in_trade_time: DateTime<Utc>,
    pub source_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventJoinPitValidationRequest {
    pub rows: Vec<EventJoinPitRow>,
    pub strict_symbol_match: bool,
}

impl EventJoinPitValidationRequest {
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.rows.is_empty() {
            return Err(DomainError::invalid("rows must not be empty"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventJoinPitIssue {
    pub row_index: usize,
    pub event_id: String,
    pub issue_type: String,
    pub severity: SignalLevel,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventJoinPitValidationResult {
    pub passed: bool,
    pub checked_rows: i64,
    pub issues: Vec<EventJoinPitIssue>,
}

// ---------------------------------------------------------------------------
// Event features
// ---------------------------------------------------------------------------

/// Per-trade-date decayed event aggregates consumed by bar enrichment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFeaturePoint {
    pub trade_date: NaiveDate,
    pub event_score: f64,
    pub negative_event_score: f64,
    pub event_count: i64,
    pub positive_event_count: i64,
    pub negative_event_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFeaturePreviewRequest {
    pub symbol: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub lookback_days: i64,
    pub decay_half_life_days: f64,
}

impl EventFeaturePreviewRequest {
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.symbol.trim().is_empty() {
            return Err(DomainError::invalid("symbol must not be empty"));
        }
        if self.start_date > self.end_date {
            return Err(DomainError::invalid("start_date must be <= end_date"));
        }
        if !(1..=3650).contains(&self.lookback_days) {
            return Err(DomainError::invalid("lookback_days must be within 1..=3650"));
        }
        if self.decay_half_life_days <= 0.0 || self.decay_half_life_days > 365.0 {
            return Err(DomainError::invalid("decay_half_life_days must be within (0, 365]"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_event() -> EventRecordCreate {
        EventRecordCreate {
            event_id: "evt-1".to_string(),
            symbol: "600000".to_string(),
            event_type: "buyback".to_string(),
            publish_time: Utc.with_ymd_and_hms(2024, 5, 6, 1, 30, 0).unwrap(),
            effective_time: None,
            polarity: EventPolarity::Positive,
            score: 0.8,
            confidence: 0.6,
            title: "t".to_string(),
            summary: String::new(),
            raw_ref: None,
            tags: vec![],
            metadata: Metadata::new(),
        }
    }

    #[test]
    fn event_effective_time_must_not_precede_publish_time() {
        let mut ev = sample_event();
        ev.effective_time = Some(ev.publish_time - chrono::Duration::seconds(1));
        assert!(ev.validate().is_err());
        ev.effective_time = Some(ev.publish_time);
        assert!(ev.validate().is_ok());
    }

    #[test]
    fn event_score_bounds_enforced() {
        let mut ev = sample_event();
        ev.score = 1.2;
        assert!(ev.validate().is_err());
    }

    #[test]
    fn severity_max_prefers_higher_rank() {
        assert_eq!(
            SignalLevel::max(SignalLevel::Warning, SignalLevel::Critical),
            SignalLevel::Critical
        );
        assert_eq!(
            SignalLevel::max(SignalLevel::Warning, SignalLevel::Info),
            SignalLevel::Warning
        );
    }

    #[test]
    fn polarity_round_trips_through_str() {
        for p in [EventPolarity::Positive, EventPolarity::Negative, EventPolarity::Neutral] {
            assert_eq!(EventPolarity::parse(p.as_str()).unwrap(), p);
        }
    }
}
