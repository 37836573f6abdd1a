//! evd-nlp
//!
//! The announcement standardizer: applies a versioned ruleset to raw
//! announcement rows and produces normalized events with polarity, score,
//! confidence, tags, and matched-rule provenance.
//!
//! This crate is pure and deterministic — no I/O, no clock. Given the same
//! record, ruleset, and reliability score, the output is byte-identical.

pub mod ruleset;
pub mod time;

use std::fmt;

use serde_json::Value;
use sha2::{Digest, Sha256};

use evd_schemas::{
    AnnouncementRawRecord, EventPolarity, EventRecordCreate, NlpRule, NlpScoreResult,
    NormalizePreviewRequest, NormalizePreviewResult, NormalizedRecord,
};

pub use ruleset::{builtin_ruleset, BUILTIN_RULESET_VERSION};
pub use time::parse_announcement_time;

pub const GENERIC_EVENT_TYPE: &str = "generic_announcement";

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizeError {
    /// No symbol on the record and no default to fall back to.
    MissingSymbol,
    /// Publish time absent and unparseable from text fields.
    MissingPublishTime,
    /// None of title/summary/content carried text.
    EmptyText,
}

impl fmt::Display for NormalizeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NormalizeError::MissingSymbol => write!(f, "normalize failed: missing symbol"),
            NormalizeError::MissingPublishTime => {
                write!(f, "normalize failed: missing or unparseable publish_time")
            }
            NormalizeError::EmptyText => {
                write!(f, "normalize failed: at least one of title/summary/content must be provided")
            }
        }
    }
}

impl std::error::Error for NormalizeError {}

// ---------------------------------------------------------------------------
// Standardizer
// ---------------------------------------------------------------------------

/// Rule-driven standardizer bound to one ruleset version.
#[derive(Debug, Clone)]
pub struct Standardizer {
    version: String,
    rules: Vec<NlpRule>,
}

impl Standardizer {
    pub fn new(version: impl Into<String>, rules: Vec<NlpRule>) -> Self {
        Self { version: version.into(), rules }
    }

    /// The built-in fallback used when no ruleset has been activated.
    pub fn builtin() -> Self {
        let (version, rules) = builtin_ruleset();
        Self { version, rules }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Normalize one raw announcement into an event.
    ///
    /// Returns the event, the scoring detail, and an optional warning for
    /// weak-signal rows (kept, but flagged to the caller).
    pub fn normalize_record(
        &self,
        record: &AnnouncementRawRecord,
        source_name: &str,
        default_symbol: Option<&str>,
        default_timezone: &str,
        source_reliability_score: f64,
    ) -> Result<(EventRecordCreate, NlpScoreResult, Option<String>), NormalizeError> {
        let text = full_text(record);
        if text.trim().is_empty() {
            return Err(NormalizeError::EmptyText);
        }

        let symbol = resolve_symbol(record, default_symbol).ok_or(NormalizeError::MissingSymbol)?;

        let publish_time = match record.publish_time {
            Some(t) => t,
            None => record
                .publish_time_text
                .as_deref()
                .and_then(|raw| parse_announcement_time(raw, default_timezone))
                .ok_or(NormalizeError::MissingPublishTime)?,
        };

        let lowered = text.to_lowercase();
        let matched: Vec<&NlpRule> = self
            .rules
            .iter()
            .filter(|rule| {
                rule.patterns
                    .iter()
                    .any(|p| !p.trim().is_empty() && lowered.contains(&p.trim().to_lowercase()))
            })
            .collect();

        let (event_type, polarity, score, confidence) =
            score_matches(&matched, &lowered, source_reliability_score);

        let mut tags: Vec<String> = Vec::new();
        let mut matched_rules: Vec<String> = Vec::new();
        for rule in &matched {
            if !tags.contains(&rule.tag) {
                tags.push(rule.tag.clone());
            }
            matched_rules.push(rule.rule_id.clone());
        }

        let (event_id, synthetic) = match record.source_event_id.as_deref() {
            Some(id) if !id.trim().is_empty() => (id.trim().to_string(), false),
            _ => (synthetic_event_id(source_name, publish_time, record), true),
        };

        let mut metadata = record.metadata.clone();
        metadata.insert("nlp_ruleset_version".to_string(), Value::String(self.version.clone()));
        metadata.insert("matched_rules".to_string(), Value::String(matched_rules.join(",")));
        if synthetic {
            metadata.insert("synthetic_event_id".to_string(), Value::String("true".to_string()));
        }

        let warning = if matched.is_empty() && text.trim().chars().count() < 8 {
            Some("no rule matched and announcement text is very short".to_string())
        } else {
            None
        };

        let rationale = if matched.is_empty() {
            format!("no rule matched; defaulted to {GENERIC_EVENT_TYPE}")
        } else {
            format!("matched rules: {}", matched_rules.join(","))
        };

        let nlp = NlpScoreResult {
            event_type: event_type.clone(),
            polarity,
            score,
            confidence,
            ruleset_version: self.version.clone(),
            tags: tags.clone(),
            matched_rules,
            rationale,
        };

        let event = EventRecordCreate {
            event_id,
            symbol,
            event_type,
            publish_time,
            effective_time: None,
            polarity,
            score,
            confidence,
            title: record.title.trim().to_string(),
            summary: record.summary.trim().to_string(),
            raw_ref: record.url.clone(),
            tags,
            metadata,
        };

        Ok((event, nlp, warning))
    }

    /// Normalize a batch without persisting. Per-row errors become
    /// `idx=N: message` entries and the row is dropped.
    pub fn normalize_preview(&self, req: &NormalizePreviewRequest) -> NormalizePreviewResult {
        let mut normalized = Vec::new();
        let mut errors = Vec::new();
        let mut dropped = 0i64;

        for (idx, record) in req.records.iter().enumerate() {
            match self.normalize_record(
                record,
                &req.source_name,
                req.default_symbol.as_deref(),
                &req.default_timezone,
                req.source_reliability_score,
            ) {
                Ok((event, nlp, warning)) => {
                    if let Some(warning) = &warning {
                        errors.push(format!("idx={idx}: {warning}"));
                    }
                    normalized.push(NormalizedRecord { row_index: idx, event, nlp, warning });
                }
                Err(err) => {
                    dropped += 1;
                    errors.push(format!("idx={idx}: {err}"));
                }
            }
        }

        NormalizePreviewResult {
            source_name: req.source_name.clone(),
            normalized,
            dropped,
            errors,
        }
    }
}

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

fn score_matches(
    matched: &[&NlpRule],
    lowered_text: &str,
    reliability: f64,
) -> (String, EventPolarity, f64, f64) {
    let reliability_factor = 0.5 + 0.5 * reliability.clamp(0.0, 1.0);
    let text_len = lowered_text.trim().chars().count();

    if matched.is_empty() {
        let score = (0.3 * reliability_factor).clamp(0.0, 1.0);
        let confidence = confidence_for(0, text_len);
        return (GENERIC_EVENT_TYPE.to_string(), EventPolarity::Neutral, score, confidence);
    }

    // Dominant type = highest summed weight; ties resolve to the earliest
    // matching rule's type.
    let mut type_order: Vec<&str> = Vec::new();
    let mut type_weights: Vec<(&str, f64)> = Vec::new();
    let mut vote = 0.0f64;
    let mut weight_sum = 0.0f64;

    for rule in matched {
        weight_sum += rule.weight;
        match rule.polarity {
            EventPolarity::Positive => vote += rule.weight,
            EventPolarity::Negative => vote -= rule.weight,
            EventPolarity::Neutral => {}
        }
        match type_weights.iter_mut().find(|(t, _)| *t == rule.event_type.as_str()) {
            Some((_, w)) => *w += rule.weight,
            None => {
                type_order.push(rule.event_type.as_str());
                type_weights.push((rule.event_type.as_str(), rule.weight));
            }
        }
    }

    let mut best_type = type_order[0];
    let mut best_weight = f64::MIN;
    for t in &type_order {
        let w = type_weights.iter().find(|(ty, _)| ty == t).map(|(_, w)| *w).unwrap_or(0.0);
        if w > best_weight {
            best_weight = w;
            best_type = t;
        }
    }

    let polarity = if vote > 0.0 {
        EventPolarity::Positive
    } else if vote < 0.0 {
        EventPolarity::Negative
    } else {
        EventPolarity::Neutral
    };

    let base = 0.25 + 0.5 * weight_sum.min(1.0);
    let score = (base * reliability_factor).clamp(0.0, 1.0);
    let confidence = confidence_for(matched.len(), text_len);

    (best_type.to_string(), polarity, score, confidence)
}

fn confidence_for(distinct_hits: usize, text_len: usize) -> f64 {
    let hits_term = 0.15 * distinct_hits.min(4) as f64;
    let length_term = (text_len as f64 / 2000.0).min(0.2);
    (0.25 + hits_term + length_term).clamp(0.2, 0.95)
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

fn resolve_symbol(record: &AnnouncementRawRecord, default_symbol: Option<&str>) -> Option<String> {
    if let Some(symbol) = non_blank(record.symbol.as_deref()) {
        return Some(strip_exchange_suffix(symbol));
    }
    if let Some(ts_code) = non_blank(record.ts_code.as_deref()) {
        return Some(strip_exchange_suffix(ts_code));
    }
    non_blank(default_symbol).map(|s| s.to_string())
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}

/// `600000.SH` → `600000`; bare codes pass through.
fn strip_exchange_suffix(code: &str) -> String {
    match code.split_once('.') {
        Some((head, _)) if !head.is_empty() => head.to_string(),
        _ => code.to_string(),
    }
}

/// Stable idempotency key for records without a provider id:
/// `{source_name}-{hex(sha256(publish_time|title|url))[..16]}`.
fn synthetic_event_id(
    source_name: &str,
    publish_time: chrono::DateTime<chrono::Utc>,
    record: &AnnouncementRawRecord,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(publish_time.to_rfc3339().as_bytes());
    hasher.update(b"|");
    hasher.update(record.title.trim().as_bytes());
    hasher.update(b"|");
    hasher.update(record.url.as_deref().unwrap_or("").as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("{source_name}-{}", &digest[..16])
}

fn full_text(record: &AnnouncementRawRecord) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in [&record.title, &record.summary, &record.content] {
        if !part.trim().is_empty() {
            parts.push(part.trim());
        }
    }
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn record(title: &str) -> AnnouncementRawRecord {
        AnnouncementRawRecord {
            symbol: Some("600000".to_string()),
            title: title.to_string(),
            publish_time: Some(Utc.with_ymd_and_hms(2024, 5, 6, 1, 30, 0).unwrap()),
            ..AnnouncementRawRecord::default()
        }
    }

    #[test]
    fn buyback_announcement_scores_positive() {
        let standardizer = Standardizer::builtin();
        let (event, nlp, _) = standardizer
            .normalize_record(&record("公司发布股份回购进展公告"), "ann_cn", None, "Asia/Shanghai", 0.8)
            .unwrap();
        assert_eq!(event.polarity, EventPolarity::Positive);
        assert_ne!(event.event_type, GENERIC_EVENT_TYPE);
        assert!(!nlp.matched_rules.is_empty());
        assert!(event.score > 0.3 && event.score <= 1.0);
        assert_eq!(
            event.metadata.get("nlp_ruleset_version").and_then(|v| v.as_str()),
            Some(BUILTIN_RULESET_VERSION)
        );
    }

    #[test]
    fn investigation_announcement_scores_negative() {
        let standardizer = Standardizer::builtin();
        let (event, _, _) = standardizer
            .normalize_record(&record("公司收到证监会立案调查通知"), "ann_cn", None, "Asia/Shanghai", 0.8)
            .unwrap();
        assert_eq!(event.polarity, EventPolarity::Negative);
    }

    #[test]
    fn unmatched_text_falls_back_to_generic() {
        let standardizer = Standardizer::builtin();
        let (event, nlp, _) = standardizer
            .normalize_record(&record("例行日常经营情况说明"), "ann_cn", None, "Asia/Shanghai", 0.7)
            .unwrap();
        assert_eq!(event.event_type, GENERIC_EVENT_TYPE);
        assert_eq!(event.polarity, EventPolarity::Neutral);
        assert!(nlp.matched_rules.is_empty());
    }

    #[test]
    fn missing_symbol_is_an_error_not_a_warning() {
        let standardizer = Standardizer::builtin();
        let mut rec = record("回购公告");
        rec.symbol = None;
        let err = standardizer
            .normalize_record(&rec, "ann_cn", None, "Asia/Shanghai", 0.7)
            .unwrap_err();
        assert_eq!(err, NormalizeError::MissingSymbol);
    }

    #[test]
    fn ts_code_suffix_is_stripped() {
        let standardizer = Standardizer::builtin();
        let mut rec = record("回购公告");
        rec.symbol = None;
        rec.ts_code = Some("000001.SZ".to_string());
        let (event, _, _) = standardizer
            .normalize_record(&rec, "ann_cn", None, "Asia/Shanghai", 0.7)
            .unwrap();
        assert_eq!(event.symbol, "000001");
    }

    #[test]
    fn missing_publish_time_is_an_error() {
        let standardizer = Standardizer::builtin();
        let mut rec = record("回购公告");
        rec.publish_time = None;
        rec.publish_time_text = Some("not a time".to_string());
        let err = standardizer
            .normalize_record(&rec, "ann_cn", None, "Asia/Shanghai", 0.7)
            .unwrap_err();
        assert_eq!(err, NormalizeError::MissingPublishTime);
    }

    #[test]
    fn synthetic_event_id_is_stable() {
        let standardizer = Standardizer::builtin();
        let rec = record("回购公告");
        let (a, _, _) = standardizer
            .normalize_record(&rec, "ann_cn", None, "Asia/Shanghai", 0.7)
            .unwrap();
        let (b, _, _) = standardizer
            .normalize_record(&rec, "ann_cn", None, "Asia/Shanghai", 0.7)
            .unwrap();
        assert_eq!(a.event_id, b.event_id);
        assert!(a.event_id.starts_with("ann_cn-"));
        assert_eq!(a.metadata.get("synthetic_event_id").and_then(|v| v.as_str()), Some("true"));
    }

    #[test]
    fn normalize_is_deterministic() {
        let standardizer = Standardizer::builtin();
        let rec = record("业绩预增公告：净利润同比增长");
        let (a, nlp_a, _) = standardizer
            .normalize_record(&rec, "ann_cn", None, "Asia/Shanghai", 0.7)
            .unwrap();
        let (b, nlp_b, _) = standardizer
            .normalize_record(&rec, "ann_cn", None, "Asia/Shanghai", 0.7)
            .unwrap();
        assert_eq!(serde_json::to_string(&a).unwrap(), serde_json::to_string(&b).unwrap());
        assert_eq!(nlp_a.score, nlp_b.score);
        assert_eq!(nlp_a.confidence, nlp_b.confidence);
    }

    #[test]
    fn preview_maps_errors_by_row_index() {
        let standardizer = Standardizer::builtin();
        let good = record("回购公告");
        let mut bad = record("减持公告");
        bad.symbol = None;
        let req = NormalizePreviewRequest {
            source_name: "ann_cn".to_string(),
            records: vec![good, bad],
            default_symbol: None,
            default_timezone: "Asia/Shanghai".to_string(),
            source_reliability_score: 0.7,
        };
        let result = standardizer.normalize_preview(&req);
        assert_eq!(result.normalized.len(), 1);
        assert_eq!(result.dropped, 1);
        assert!(result.errors.iter().any(|e| e.starts_with("idx=1:")));
    }
}
