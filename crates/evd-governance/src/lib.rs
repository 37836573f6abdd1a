//! evd-governance
//!
//! NLP governance: versioned rulesets with a single active version, drift
//! checks of current vs. baseline windows, a trend monitor over stored
//! snapshots, labeler feedback quality, and multi-labeler adjudication into
//! consensus labels.
//!
//! The backtest contribution comparator is an external collaborator behind
//! [`ContributionComparator`]; comparator failures degrade to warnings and
//! never fail a drift check.

pub mod adjudicate;
pub mod compare;
pub mod drift;

use std::sync::Arc;

use anyhow::Result;
use chrono::NaiveDate;
use serde_json::json;
use sqlx::SqlitePool;

use evd_audit::AuditLog;
use evd_db as db;
use evd_schemas::{
    AdjudicationRequest, AdjudicationResult, ConsensusRecord, DriftCheckRequest, DriftCheckResult,
    DriftMonitorSummary, DriftSnapshotRecord, FeedbackRecord, FeedbackSummary,
    FeedbackUpsertRequest, LabelEntryRecord, LabelEntryUpsertRequest, NlpRulesetRecord,
    NlpRulesetUpsertRequest,
};

pub use compare::{ContributionComparator, ContributionCompareOutcome, ContributionCompareRequest};

pub struct NlpGovernance {
    pool: SqlitePool,
    audit: Option<Arc<AuditLog>>,
    comparator: Option<Arc<dyn ContributionComparator>>,
}

impl NlpGovernance {
    pub fn new(
        pool: SqlitePool,
        audit: Option<Arc<AuditLog>>,
        comparator: Option<Arc<dyn ContributionComparator>>,
    ) -> Self {
        Self { pool, audit, comparator }
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub(crate) fn comparator(&self) -> Option<&Arc<dyn ContributionComparator>> {
        self.comparator.as_ref()
    }

    pub(crate) fn audit_event(
        &self,
        action: &str,
        status: &str,
        payload: serde_json::Value,
    ) {
        if let Some(audit) = &self.audit {
            audit.log_event(evd_audit::EVENT_NLP, action, status, payload);
        }
    }

    // -----------------------------------------------------------------------
    // Ruleset lifecycle
    // -----------------------------------------------------------------------

    pub async fn upsert_ruleset(&self, req: &NlpRulesetUpsertRequest) -> Result<i64> {
        let id = db::upsert_ruleset(&self.pool, req).await?;
        if req.activate {
            self.audit_event(
                "activate",
                "OK",
                json!({"version": req.version, "rule_count": req.rules.len() as i64}),
            );
        }
        Ok(id)
    }

    /// Make `version` the single active ruleset. Returns false (no
    /// mutation) for an unknown version.
    pub async fn activate_ruleset(&self, version: &str, note: &str) -> Result<bool> {
        let activated = db::activate_ruleset(&self.pool, version, note).await?;
        if activated {
            self.audit_event("activate", "OK", json!({"version": version}));
        }
        Ok(activated)
    }

    pub async fn list_rulesets(&self, limit: i64, include_rules: bool) -> Result<Vec<NlpRulesetRecord>> {
        db::list_rulesets(&self.pool, limit, include_rules).await
    }

    pub async fn get_active_ruleset(&self, include_rules: bool) -> Result<Option<NlpRulesetRecord>> {
        db::get_active_ruleset(&self.pool, include_rules).await
    }

    // -----------------------------------------------------------------------
    // Drift
    // -----------------------------------------------------------------------

    pub async fn drift_check(&self, req: &DriftCheckRequest) -> Result<DriftCheckResult> {
        drift::drift_check(self, req).await
    }

    pub async fn drift_monitor(
        &self,
        source_name: Option<&str>,
        limit: i64,
    ) -> Result<DriftMonitorSummary> {
        drift::drift_monitor(&self.pool, source_name, limit).await
    }

    pub async fn list_drift_snapshots(
        &self,
        source_name: Option<&str>,
        limit: i64,
    ) -> Result<Vec<DriftSnapshotRecord>> {
        db::list_drift_snapshots(&self.pool, source_name, limit).await
    }

    // -----------------------------------------------------------------------
    // Feedback & labels
    // -----------------------------------------------------------------------

    pub async fn upsert_feedback(&self, req: &FeedbackUpsertRequest) -> Result<i64> {
        db::upsert_feedback(&self.pool, req).await
    }

    pub async fn list_feedback(
        &self,
        source_name: Option<&str>,
        labeler: Option<&str>,
        start_date: Option<NaiveDate>,
        end_date: Option<NaiveDate>,
        limit: i64,
    ) -> Result<Vec<FeedbackRecord>> {
        db::list_feedback(&self.pool, source_name, labeler, start_date, end_date, limit).await
    }

    pub async fn feedback_summary(
        &self,
        source_name: Option<&str>,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> Result<FeedbackSummary> {
        adjudicate::feedback_summary(&self.pool, source_name, start_date, end_date).await
    }

    pub async fn upsert_label_entry(&self, req: &LabelEntryUpsertRequest) -> Result<i64> {
        db::upsert_label_entry(&self.pool, req).await
    }

    pub async fn list_label_entries(
        &self,
        source_name: Option<&str>,
        event_ids: &[String],
        start_date: Option<NaiveDate>,
        end_date: Option<NaiveDate>,
        limit: i64,
    ) -> Result<Vec<LabelEntryRecord>> {
        db::load_label_entries_for_scope(&self.pool, source_name, event_ids, start_date, end_date, limit)
            .await
    }

    pub async fn adjudicate_labels(&self, req: &AdjudicationRequest) -> Result<AdjudicationResult> {
        adjudicate::adjudicate_labels(&self.pool, req).await
    }

    pub async fn list_consensus_labels(
        &self,
        source_name: Option<&str>,
        start_date: Option<NaiveDate>,
        end_date: Option<NaiveDate>,
        limit: i64,
    ) -> Result<Vec<ConsensusRecord>> {
        db::list_consensus(&self.pool, source_name, start_date, end_date, limit).await
    }
}
