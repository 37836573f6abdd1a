//! evd-service
//!
//! Thin transactional facade over the event store. Callers outside the core
//! (factor computation, strategy engines, the connector runtime) go through
//! this service for source registration, validated ingest, reads, and
//! decayed event-feature enrichment.

use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, NaiveDate};
use serde_json::json;
use sqlx::SqlitePool;

use evd_audit::AuditLog;
use evd_db as db;
use evd_nlp::Standardizer;
use evd_schemas::{
    DomainError, EventBatchIngestRequest, EventBatchIngestResult, EventFeaturePoint,
    EventFeaturePreviewRequest, EventFilter, EventJoinPitIssue, EventJoinPitValidationRequest,
    EventJoinPitValidationResult, EventPolarity, EventRecord, EventSourceRecord,
    EventSourceRegisterRequest, NormalizeIngestRequest, NormalizeIngestResult,
    NormalizePreviewRequest, NormalizePreviewResult, SignalLevel,
};

/// Facade handle. Cheap to clone; the pool and audit log are shared.
#[derive(Clone)]
pub struct EventService {
    pool: SqlitePool,
    audit: Option<Arc<AuditLog>>,
}

impl EventService {
    pub fn new(pool: SqlitePool, audit: Option<Arc<AuditLog>>) -> Self {
        Self { pool, audit }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn audit(&self, event_type: &str, action: &str, status: &str, payload: serde_json::Value) {
        if let Some(audit) = &self.audit {
            audit.log_event(event_type, action, status, payload);
        }
    }

    // -----------------------------------------------------------------------
    // Sources
    // -----------------------------------------------------------------------

    pub async fn register_source(&self, req: &EventSourceRegisterRequest) -> Result<i64> {
        let id = db::register_source(&self.pool, req).await?;
        self.audit(
            evd_audit::EVENT_SOURCE,
            "register",
            "OK",
            json!({
                "source_name": req.source_name,
                "source_type": req.source_type.as_str(),
                "provider": req.provider,
            }),
        );
        Ok(id)
    }

    pub async fn get_source(&self, source_name: &str) -> Result<Option<EventSourceRecord>> {
        db::get_source(&self.pool, source_name).await
    }

    pub async fn require_source(&self, source_name: &str) -> Result<EventSourceRecord> {
        self.get_source(source_name).await?.ok_or_else(|| {
            DomainError::not_found(format!("event source '{source_name}' not found")).into()
        })
    }

    pub async fn list_sources(&self, limit: i64) -> Result<Vec<EventSourceRecord>> {
        db::list_sources(&self.pool, limit).await
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    /// Validated batch ingest. The source must exist; per-row failures are
    /// reported as `idx=N:` errors without aborting the batch.
    pub async fn ingest(&self, req: &EventBatchIngestRequest) -> Result<EventBatchIngestResult> {
        self.require_source(&req.source_name).await?;
        let result = db::ingest_events(&self.pool, req).await?;
        self.audit(
            evd_audit::EVENT_INGEST,
            "batch",
            if result.errors.is_empty() { "OK" } else { "PARTIAL" },
            json!({
                "source_name": result.source_name,
                "inserted": result.inserted,
                "updated": result.updated,
                "total": result.total,
                "errors": result.errors.len() as i64,
            }),
        );
        Ok(result)
    }

    pub async fn list_events(&self, filter: &EventFilter) -> Result<Vec<EventRecord>> {
        db::list_events(&self.pool, filter).await
    }

    /// Point-in-time validation of event joins produced by a downstream
    /// consumer: every referenced event must exist, symbols must line up
    /// (when strict), and an event must not be used before it became
    /// effective.
    pub async fn validate_join(
        &self,
        req: &EventJoinPitValidationRequest,
    ) -> Result<EventJoinPitValidationResult> {
        req.validate()?;
        let mut issues: Vec<EventJoinPitIssue> = Vec::new();

        for (row_index, row) in req.rows.iter().enumerate() {
            let event = match &row.source_name {
                Some(source) => db::get_event(&self.pool, source, &row.event_id).await?,
                None => db::get_event_any_source(&self.pool, &row.event_id).await?,
            };
            let Some(event) = event else {
                issues.push(EventJoinPitIssue {
                    row_index,
                    event_id: row.event_id.clone(),
                    issue_type: "event_not_found".to_string(),
                    severity: SignalLevel::Critical,
                    message: format!("event '{}' not found", row.event_id),
                });
                continue;
            };

            if req.strict_symbol_match && event.symbol != row.symbol {
                issues.push(EventJoinPitIssue {
                    row_index,
                    event_id: row.event_id.clone(),
                    issue_type: "symbol_mismatch".to_string(),
                    severity: SignalLevel::Critical,
                    message: format!(
                        "joined symbol '{}' does not match event symbol '{}'",
                        row.symbol, event.symbol
                    ),
                });
            }

            let effective = event.effective_time.unwrap_or(event.publish_time);
            if row.used_in_trade_time < effective {
                issues.push(EventJoinPitIssue {
                    row_index,
                    event_id: row.event_id.clone(),
                    issue_type: "lookahead_violation".to_string(),
                    severity: SignalLevel::Critical,
                    message: format!(
                        "event used at {} before it became effective at {}",
                        row.used_in_trade_time.to_rfc3339(),
                        effective.to_rfc3339()
                    ),
                });
            }
        }

        Ok(EventJoinPitValidationResult {
            passed: issues.is_empty(),
            checked_rows: req.rows.len() as i64,
            issues,
        })
    }

    // -----------------------------------------------------------------------
    // Normalize preview / ingest
    // -----------------------------------------------------------------------

    pub async fn normalize_preview(
        &self,
        req: &NormalizePreviewRequest,
    ) -> Result<NormalizePreviewResult> {
        req.validate()?;
        let standardizer = active_standardizer(&self.pool).await?;
        Ok(standardizer.normalize_preview(req))
    }

    /// Standardize then ingest. With `allow_partial=false`, any normalize
    /// error aborts before anything is persisted.
    pub async fn normalize_and_ingest(
        &self,
        req: &NormalizeIngestRequest,
    ) -> Result<NormalizeIngestResult> {
        let preview = self.normalize_preview(&req.request).await?;
        if !preview.errors.is_empty() && !req.allow_partial {
            return Err(DomainError::invalid(format!(
                "normalize failed with {} errors",
                preview.errors.len()
            ))
            .into());
        }

        let ingest = if preview.normalized.is_empty() {
            None
        } else {
            let batch = EventBatchIngestRequest {
                source_name: req.request.source_name.clone(),
                events: preview.normalized.iter().map(|n| n.event.clone()).collect(),
            };
            Some(self.ingest(&batch).await?)
        };

        Ok(NormalizeIngestResult {
            source_name: req.request.source_name.clone(),
            preview,
            ingest,
        })
    }

    // -----------------------------------------------------------------------
    // Event features
    // -----------------------------------------------------------------------

    pub async fn preview_features(
        &self,
        req: &EventFeaturePreviewRequest,
    ) -> Result<Vec<EventFeaturePoint>> {
        req.validate()?;
        let mut dates = Vec::new();
        let mut d = req.start_date;
        while d <= req.end_date {
            dates.push(d);
            d = d + Duration::days(1);
        }
        self.enrich_bars(&req.symbol, &dates, req.lookback_days, req.decay_half_life_days)
            .await
    }

    /// Per trade date, the exponentially decayed sum of event scores over
    /// the trailing `lookback_days`. Positive and negative polarities
    /// aggregate separately; the weight is `2^(-age_days / half_life)`.
    pub async fn enrich_bars(
        &self,
        symbol: &str,
        trade_dates: &[NaiveDate],
        lookback_days: i64,
        decay_half_life_days: f64,
    ) -> Result<Vec<EventFeaturePoint>> {
        if trade_dates.is_empty() {
            return Ok(Vec::new());
        }
        let min_date = *trade_dates.iter().min().expect("non-empty dates");
        let max_date = *trade_dates.iter().max().expect("non-empty dates");
        let window_start = min_date - Duration::days(lookback_days.max(1));

        let filter = EventFilter {
            symbol: Some(symbol.to_string()),
            start_time: Some(day_start(window_start)),
            end_time: Some(day_end(max_date)),
            limit: 5000,
            ..EventFilter::default()
        };
        let events = db::list_events(&self.pool, &filter).await?;

        let mut points = Vec::with_capacity(trade_dates.len());
        for trade_date in trade_dates {
            let mut point = EventFeaturePoint {
                trade_date: *trade_date,
                event_score: 0.0,
                negative_event_score: 0.0,
                event_count: 0,
                positive_event_count: 0,
                negative_event_count: 0,
            };
            for event in &events {
                let publish_date = event.publish_time.date_naive();
                if publish_date > *trade_date {
                    continue;
                }
                let age_days = (*trade_date - publish_date).num_days();
                if age_days > lookback_days {
                    continue;
                }
                let weight = (2.0f64).powf(-(age_days as f64) / decay_half_life_days.max(f64::MIN_POSITIVE));
                point.event_count += 1;
                match event.polarity {
                    EventPolarity::Positive => {
                        point.event_score += weight * event.score;
                        point.positive_event_count += 1;
                    }
                    EventPolarity::Negative => {
                        point.negative_event_score += weight * event.score;
                        point.negative_event_count += 1;
                    }
                    EventPolarity::Neutral => {}
                }
            }
            points.push(point);
        }
        Ok(points)
    }
}

/// Build a standardizer from the active ruleset, falling back to the
/// built-in one when nothing has been activated.
pub async fn active_standardizer(pool: &SqlitePool) -> Result<Standardizer> {
    match db::get_active_ruleset(pool, true).await? {
        Some(ruleset) => Ok(Standardizer::new(ruleset.version, ruleset.rules)),
        None => Ok(Standardizer::builtin()),
    }
}

fn day_start(d: NaiveDate) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::from_naive_utc_and_offset(d.and_hms_opt(0, 0, 0).expect("valid"), chrono::Utc)
}

fn day_end(d: NaiveDate) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::from_naive_utc_and_offset(
        d.and_hms_micro_opt(23, 59, 59, 999_999).expect("valid"),
        chrono::Utc,
    )
}
