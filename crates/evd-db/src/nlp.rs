//! NLP governance tables: versioned rulesets, drift snapshots, labeler
//! feedback, multi-labeler entries, and adjudicated consensus rows.

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use evd_schemas::{
    ConsensusRecord, DomainError, DriftAlert, DriftSnapshotRecord, EventPolarity, FeedbackRecord,
    FeedbackUpsertRequest, LabelEntryRecord, LabelEntryUpsertRequest, NlpRule, NlpRulesetRecord,
    NlpRulesetUpsertRequest, WindowMetrics,
};

use crate::{clamp_limit, day_end_iso, day_start_iso, events, from_iso, to_iso};

// ---------------------------------------------------------------------------
// Rulesets
// ---------------------------------------------------------------------------

/// Upsert a ruleset by version; optionally make it the single active one in
/// the same transaction. Returns the row id.
pub async fn upsert_ruleset(pool: &SqlitePool, req: &NlpRulesetUpsertRequest) -> Result<i64> {
    req.validate()?;
    let now = to_iso(Utc::now());
    let rules_json = serde_json::to_string(&req.rules).context("rules serialize failed")?;

    let mut tx = pool.begin().await.context("upsert_ruleset begin failed")?;
    sqlx::query(
        r#"
        INSERT INTO event_nlp_rulesets(
            created_at, updated_at, version, created_by, note, is_active, rules_json
        )
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(version) DO UPDATE SET
            updated_at = excluded.updated_at,
            created_by = excluded.created_by,
            note = excluded.note,
            rules_json = excluded.rules_json
        "#,
    )
    .bind(&now)
    .bind(&now)
    .bind(&req.version)
    .bind(&req.created_by)
    .bind(&req.note)
    .bind(req.activate as i64)
    .bind(rules_json)
    .execute(&mut *tx)
    .await
    .context("upsert_ruleset failed")?;

    if req.activate {
        sqlx::query("UPDATE event_nlp_rulesets SET is_active = 0")
            .execute(&mut *tx)
            .await
            .context("upsert_ruleset deactivate failed")?;
        sqlx::query("UPDATE event_nlp_rulesets SET is_active = 1, updated_at = ? WHERE version = ?")
            .bind(&now)
            .bind(&req.version)
            .execute(&mut *tx)
            .await
            .context("upsert_ruleset activate failed")?;
    }

    let row = sqlx::query("SELECT id FROM event_nlp_rulesets WHERE version = ? LIMIT 1")
        .bind(&req.version)
        .fetch_one(&mut *tx)
        .await
        .context("upsert_ruleset id lookup failed")?;
    let id: i64 = row.try_get("id")?;
    tx.commit().await.context("upsert_ruleset commit failed")?;
    Ok(id)
}

/// Atomically clear all `is_active` flags and set one version active.
/// Returns false (and mutates nothing) when the version is unknown.
pub async fn activate_ruleset(pool: &SqlitePool, version: &str, note: &str) -> Result<bool> {
    let now = to_iso(Utc::now());
    let mut tx = pool.begin().await.context("activate_ruleset begin failed")?;

    let exists: Option<(i64,)> =
        sqlx::query_as("SELECT id FROM event_nlp_rulesets WHERE version = ? LIMIT 1")
            .bind(version)
            .fetch_optional(&mut *tx)
            .await
            .context("activate_ruleset lookup failed")?;
    if exists.is_none() {
        return Ok(false);
    }

    sqlx::query("UPDATE event_nlp_rulesets SET is_active = 0")
        .execute(&mut *tx)
        .await
        .context("activate_ruleset deactivate failed")?;
    let result = sqlx::query(
        "UPDATE event_nlp_rulesets SET is_active = 1, updated_at = ?, note = ? WHERE version = ?",
    )
    .bind(&now)
    .bind(note)
    .bind(version)
    .execute(&mut *tx)
    .await
    .context("activate_ruleset failed")?;

    tx.commit().await.context("activate_ruleset commit failed")?;
    Ok(result.rows_affected() > 0)
}

pub async fn get_ruleset(
    pool: &SqlitePool,
    version: &str,
    include_rules: bool,
) -> Result<Option<NlpRulesetRecord>> {
    let row = sqlx::query(
        r#"
        SELECT id, created_at, updated_at, version, created_by, note, is_active, rules_json
        FROM event_nlp_rulesets
        WHERE version = ?
        LIMIT 1
        "#,
    )
    .bind(version)
    .fetch_optional(pool)
    .await
    .context("get_ruleset failed")?;
    row.map(|r| to_ruleset(&r, include_rules)).transpose()
}

pub async fn get_active_ruleset(
    pool: &SqlitePool,
    include_rules: bool,
) -> Result<Option<NlpRulesetRecord>> {
    let row = sqlx::query(
        r#"
        SELECT id, created_at, updated_at, version, created_by, note, is_active, rules_json
        FROM event_nlp_rulesets
        WHERE is_active = 1
        ORDER BY updated_at DESC
        LIMIT 1
        "#,
    )
    .fetch_optional(pool)
    .await
    .context("get_active_ruleset failed")?;
    row.map(|r| to_ruleset(&r, include_rules)).transpose()
}

pub async fn list_rulesets(
    pool: &SqlitePool,
    limit: i64,
    include_rules: bool,
) -> Result<Vec<NlpRulesetRecord>> {
    let rows = sqlx::query(
        r#"
        SELECT id, created_at, updated_at, version, created_by, note, is_active, rules_json
        FROM event_nlp_rulesets
        ORDER BY updated_at DESC, id DESC
        LIMIT ?
        "#,
    )
    .bind(clamp_limit(limit, 500))
    .fetch_all(pool)
    .await
    .context("list_rulesets failed")?;
    rows.iter().map(|r| to_ruleset(r, include_rules)).collect()
}

// ---------------------------------------------------------------------------
// Drift snapshots
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
pub async fn insert_drift_snapshot(
    pool: &SqlitePool,
    source_name: Option<&str>,
    ruleset_version: &str,
    current_start: NaiveDate,
    current_end: NaiveDate,
    baseline_start: NaiveDate,
    baseline_end: NaiveDate,
    current: &WindowMetrics,
    baseline: &WindowMetrics,
    hit_rate_delta: f64,
    score_p50_delta: f64,
    contribution_delta: Option<f64>,
    feedback_polarity_accuracy_delta: Option<f64>,
    feedback_event_type_accuracy_delta: Option<f64>,
    alerts: &[DriftAlert],
    payload: &Value,
) -> Result<i64> {
    let result = sqlx::query(
        r#"
        INSERT INTO event_nlp_drift_snapshots(
            created_at, source_name, ruleset_version, current_start, current_end,
            baseline_start, baseline_end, sample_size, hit_rate, baseline_hit_rate,
            hit_rate_delta, score_p50, baseline_score_p50, score_p50_delta,
            contribution_delta, feedback_polarity_accuracy_delta,
            feedback_event_type_accuracy_delta, alerts_json, payload_json
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(to_iso(Utc::now()))
    .bind(source_name)
    .bind(ruleset_version)
    .bind(current_start.to_string())
    .bind(current_end.to_string())
    .bind(baseline_start.to_string())
    .bind(baseline_end.to_string())
    .bind(current.sample_size)
    .bind(current.hit_rate)
    .bind(baseline.hit_rate)
    .bind(hit_rate_delta)
    .bind(current.score_p50)
    .bind(baseline.score_p50)
    .bind(score_p50_delta)
    .bind(contribution_delta)
    .bind(feedback_polarity_accuracy_delta)
    .bind(feedback_event_type_accuracy_delta)
    .bind(serde_json::to_string(alerts).context("alerts serialize failed")?)
    .bind(serde_json::to_string(payload).context("payload serialize failed")?)
    .execute(pool)
    .await
    .context("insert_drift_snapshot failed")?;
    Ok(result.last_insert_rowid())
}

pub async fn list_drift_snapshots(
    pool: &SqlitePool,
    source_name: Option<&str>,
    limit: i64,
) -> Result<Vec<DriftSnapshotRecord>> {
    let mut sql = String::from(
        r#"
        SELECT id, created_at, source_name, ruleset_version, current_start, current_end,
               baseline_start, baseline_end, sample_size, hit_rate, baseline_hit_rate,
               hit_rate_delta, score_p50, baseline_score_p50, score_p50_delta,
               contribution_delta, feedback_polarity_accuracy_delta,
               feedback_event_type_accuracy_delta, alerts_json
        FROM event_nlp_drift_snapshots
        "#,
    );
    if source_name.is_some() {
        sql.push_str(" WHERE source_name = ?");
    }
    sql.push_str(" ORDER BY created_at DESC, id DESC LIMIT ?");

    let mut query = sqlx::query(&sql);
    if let Some(source) = source_name {
        query = query.bind(source);
    }
    query = query.bind(clamp_limit(limit, 2000));

    let rows = query.fetch_all(pool).await.context("list_drift_snapshots failed")?;
    rows.iter().map(to_snapshot).collect()
}

// ---------------------------------------------------------------------------
// Feedback
// ---------------------------------------------------------------------------

/// Upsert one labeled correction; the referenced event must exist and its
/// predicted fields are copied into the feedback row.
pub async fn upsert_feedback(pool: &SqlitePool, req: &FeedbackUpsertRequest) -> Result<i64> {
    req.validate()?;
    let event = events::get_event(pool, &req.source_name, &req.event_id)
        .await?
        .ok_or_else(|| {
            DomainError::not_found(format!(
                "event not found: source_name='{}', event_id='{}'",
                req.source_name, req.event_id
            ))
        })?;

    let now = to_iso(Utc::now());
    sqlx::query(
        r#"
        INSERT INTO event_nlp_label_feedback(
            created_at, updated_at, source_name, event_id, symbol, publish_time,
            predicted_event_type, predicted_polarity, predicted_score,
            label_event_type, label_polarity, label_score, labeler, note
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(source_name, event_id) DO UPDATE SET
            updated_at = excluded.updated_at,
            symbol = excluded.symbol,
            publish_time = excluded.publish_time,
            predicted_event_type = excluded.predicted_event_type,
            predicted_polarity = excluded.predicted_polarity,
            predicted_score = excluded.predicted_score,
            label_event_type = excluded.label_event_type,
            label_polarity = excluded.label_polarity,
            label_score = excluded.label_score,
            labeler = excluded.labeler,
            note = excluded.note
        "#,
    )
    .bind(&now)
    .bind(&now)
    .bind(&req.source_name)
    .bind(&req.event_id)
    .bind(&event.symbol)
    .bind(to_iso(event.publish_time))
    .bind(&event.event_type)
    .bind(event.polarity.as_str())
    .bind(event.score)
    .bind(&req.label_event_type)
    .bind(req.label_polarity.as_str())
    .bind(req.label_score)
    .bind(&req.labeler)
    .bind(&req.note)
    .execute(pool)
    .await
    .context("upsert_feedback failed")?;

    let row = sqlx::query(
        "SELECT id FROM event_nlp_label_feedback WHERE source_name = ? AND event_id = ? LIMIT 1",
    )
    .bind(&req.source_name)
    .bind(&req.event_id)
    .fetch_one(pool)
    .await
    .context("upsert_feedback id lookup failed")?;
    Ok(row.try_get("id")?)
}

pub async fn list_feedback(
    pool: &SqlitePool,
    source_name: Option<&str>,
    labeler: Option<&str>,
    start_date: Option<NaiveDate>,
    end_date: Option<NaiveDate>,
    limit: i64,
) -> Result<Vec<FeedbackRecord>> {
    let mut sql = String::from(
        r#"
        SELECT id, created_at, updated_at, source_name, event_id, symbol, publish_time,
               predicted_event_type, predicted_polarity, predicted_score,
               label_event_type, label_polarity, label_score, labeler, note
        FROM event_nlp_label_feedback
        "#,
    );
    let mut conditions: Vec<&str> = Vec::new();
    if source_name.is_some() {
        conditions.push("source_name = ?");
    }
    if labeler.is_some() {
        conditions.push("labeler = ?");
    }
    if start_date.is_some() {
        conditions.push("publish_time >= ?");
    }
    if end_date.is_some() {
        conditions.push("publish_time <= ?");
    }
    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }
    sql.push_str(" ORDER BY updated_at DESC, id DESC LIMIT ?");

    let mut query = sqlx::query(&sql);
    if let Some(source) = source_name {
        query = query.bind(source);
    }
    if let Some(labeler) = labeler {
        query = query.bind(labeler);
    }
    if let Some(start) = start_date {
        query = query.bind(day_start_iso(start));
    }
    if let Some(end) = end_date {
        query = query.bind(day_end_iso(end));
    }
    query = query.bind(clamp_limit(limit, 5000));

    let rows = query.fetch_all(pool).await.context("list_feedback failed")?;
    rows.iter().map(to_feedback).collect()
}

// ---------------------------------------------------------------------------
// Label entries (multi-labeler)
// ---------------------------------------------------------------------------

/// Upsert one labeler's judgement; the referenced event must exist.
pub async fn upsert_label_entry(pool: &SqlitePool, req: &LabelEntryUpsertRequest) -> Result<i64> {
    req.validate()?;
    let event = events::get_event(pool, &req.source_name, &req.event_id)
        .await?
        .ok_or_else(|| {
            DomainError::not_found(format!(
                "event not found: source_name='{}', event_id='{}'",
                req.source_name, req.event_id
            ))
        })?;

    let now = to_iso(Utc::now());
    sqlx::query(
        r#"
        INSERT INTO event_nlp_label_entries(
            created_at, updated_at, source_name, event_id, symbol, publish_time,
            predicted_score, label_event_type, label_polarity, label_score, labeler, note
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(source_name, event_id, labeler) DO UPDATE SET
            updated_at = excluded.updated_at,
            symbol = excluded.symbol,
            publish_time = excluded.publish_time,
            predicted_score = excluded.predicted_score,
            label_event_type = excluded.label_event_type,
            label_polarity = excluded.label_polarity,
            label_score = excluded.label_score,
            note = excluded.note
        "#,
    )
    .bind(&now)
    .bind(&now)
    .bind(&req.source_name)
    .bind(&req.event_id)
    .bind(&event.symbol)
    .bind(to_iso(event.publish_time))
    .bind(event.score)
    .bind(&req.label_event_type)
    .bind(req.label_polarity.as_str())
    .bind(req.label_score)
    .bind(&req.labeler)
    .bind(&req.note)
    .execute(pool)
    .await
    .context("upsert_label_entry failed")?;

    let row = sqlx::query(
        "SELECT id FROM event_nlp_label_entries WHERE source_name = ? AND event_id = ? AND labeler = ? LIMIT 1",
    )
    .bind(&req.source_name)
    .bind(&req.event_id)
    .bind(&req.labeler)
    .fetch_one(pool)
    .await
    .context("upsert_label_entry id lookup failed")?;
    Ok(row.try_get("id")?)
}

/// Load label entries for an adjudication scope. `event_ids` narrows to
/// explicit events; date bounds apply to publish time.
pub async fn load_label_entries_for_scope(
    pool: &SqlitePool,
    source_name: Option<&str>,
    event_ids: &[String],
    start_date: Option<NaiveDate>,
    end_date: Option<NaiveDate>,
    limit: i64,
) -> Result<Vec<LabelEntryRecord>> {
    let mut sql = String::from(
        r#"
        SELECT id, created_at, updated_at, source_name, event_id, symbol, publish_time,
               predicted_score, label_event_type, label_polarity, label_score, labeler, note
        FROM event_nlp_label_entries
        "#,
    );
    let mut conditions: Vec<String> = Vec::new();
    if source_name.is_some() {
        conditions.push("source_name = ?".to_string());
    }
    if !event_ids.is_empty() {
        let placeholders = vec!["?"; event_ids.len()].join(", ");
        conditions.push(format!("event_id IN ({placeholders})"));
    }
    if start_date.is_some() {
        conditions.push("publish_time >= ?".to_string());
    }
    if end_date.is_some() {
        conditions.push("publish_time <= ?".to_string());
    }
    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }
    sql.push_str(" ORDER BY source_name ASC, event_id ASC, labeler ASC LIMIT ?");

    let mut query = sqlx::query(&sql);
    if let Some(source) = source_name {
        query = query.bind(source);
    }
    for event_id in event_ids {
        query = query.bind(event_id);
    }
    if let Some(start) = start_date {
        query = query.bind(day_start_iso(start));
    }
    if let Some(end) = end_date {
        query = query.bind(day_end_iso(end));
    }
    query = query.bind(clamp_limit(limit, 500_000));

    let rows = query
        .fetch_all(pool)
        .await
        .context("load_label_entries_for_scope failed")?;
    rows.iter().map(to_label_entry).collect()
}

// ---------------------------------------------------------------------------
// Consensus
// ---------------------------------------------------------------------------

pub async fn upsert_consensus(pool: &SqlitePool, record: &ConsensusRecord) -> Result<i64> {
    let now = to_iso(Utc::now());
    sqlx::query(
        r#"
        INSERT INTO event_nlp_consensus(
            created_at, updated_at, source_name, event_id, symbol, publish_time,
            consensus_event_type, consensus_polarity, consensus_score, consensus_confidence,
            label_count, conflict, conflict_reasons, adjudicated_by, label_version
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(source_name, event_id) DO UPDATE SET
            updated_at = excluded.updated_at,
            symbol = excluded.symbol,
            publish_time = excluded.publish_time,
            consensus_event_type = excluded.consensus_event_type,
            consensus_polarity = excluded.consensus_polarity,
            consensus_score = excluded.consensus_score,
            consensus_confidence = excluded.consensus_confidence,
            label_count = excluded.label_count,
            conflict = excluded.conflict,
            conflict_reasons = excluded.conflict_reasons,
            adjudicated_by = excluded.adjudicated_by,
            label_version = excluded.label_version
        "#,
    )
    .bind(&now)
    .bind(&now)
    .bind(&record.source_name)
    .bind(&record.event_id)
    .bind(&record.symbol)
    .bind(to_iso(record.publish_time))
    .bind(&record.consensus_event_type)
    .bind(record.consensus_polarity.as_str())
    .bind(record.consensus_score)
    .bind(record.consensus_confidence)
    .bind(record.label_count)
    .bind(record.conflict as i64)
    .bind(serde_json::to_string(&record.conflict_reasons).context("conflict reasons serialize failed")?)
    .bind(&record.adjudicated_by)
    .bind(&record.label_version)
    .execute(pool)
    .await
    .context("upsert_consensus failed")?;

    let row = sqlx::query(
        "SELECT id FROM event_nlp_consensus WHERE source_name = ? AND event_id = ? LIMIT 1",
    )
    .bind(&record.source_name)
    .bind(&record.event_id)
    .fetch_one(pool)
    .await
    .context("upsert_consensus id lookup failed")?;
    Ok(row.try_get("id")?)
}

pub async fn list_consensus(
    pool: &SqlitePool,
    source_name: Option<&str>,
    start_date: Option<NaiveDate>,
    end_date: Option<NaiveDate>,
    limit: i64,
) -> Result<Vec<ConsensusRecord>> {
    let mut sql = String::from(
        r#"
        SELECT id, created_at, updated_at, source_name, event_id, symbol, publish_time,
               consensus_event_type, consensus_polarity, consensus_score, consensus_confidence,
               label_count, conflict, conflict_reasons, adjudicated_by, label_version
        FROM event_nlp_consensus
        "#,
    );
    let mut conditions: Vec<&str> = Vec::new();
    if source_name.is_some() {
        conditions.push("source_name = ?");
    }
    if start_date.is_some() {
        conditions.push("publish_time >= ?");
    }
    if end_date.is_some() {
        conditions.push("publish_time <= ?");
    }
    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }
    sql.push_str(" ORDER BY publish_time DESC, id DESC LIMIT ?");

    let mut query = sqlx::query(&sql);
    if let Some(source) = source_name {
        query = query.bind(source);
    }
    if let Some(start) = start_date {
        query = query.bind(day_start_iso(start));
    }
    if let Some(end) = end_date {
        query = query.bind(day_end_iso(end));
    }
    query = query.bind(clamp_limit(limit, 500_000));

    let rows = query.fetch_all(pool).await.context("list_consensus failed")?;
    rows.iter().map(to_consensus).collect()
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn to_ruleset(row: &SqliteRow, include_rules: bool) -> Result<NlpRulesetRecord> {
    let rules: Vec<NlpRule> =
        serde_json::from_str(&row.try_get::<String, _>("rules_json")?).unwrap_or_default();
    Ok(NlpRulesetRecord {
        id: row.try_get("id")?,
        created_at: from_iso(&row.try_get::<String, _>("created_at")?)?,
        updated_at: from_iso(&row.try_get::<String, _>("updated_at")?)?,
        version: row.try_get("version")?,
        created_by: row.try_get("created_by")?,
        note: row.try_get("note")?,
        is_active: row.try_get::<i64, _>("is_active")? != 0,
        rule_count: rules.len() as i64,
        rules: if include_rules { rules } else { Vec::new() },
    })
}

fn to_snapshot(row: &SqliteRow) -> Result<DriftSnapshotRecord> {
    let alerts: Vec<DriftAlert> =
        serde_json::from_str(&row.try_get::<String, _>("alerts_json")?).unwrap_or_default();
    Ok(DriftSnapshotRecord {
        id: row.try_get("id")?,
        created_at: from_iso(&row.try_get::<String, _>("created_at")?)?,
        source_name: row.try_get("source_name")?,
        ruleset_version: row.try_get("ruleset_version")?,
        current_start: parse_date(&row.try_get::<String, _>("current_start")?)?,
        current_end: parse_date(&row.try_get::<String, _>("current_end")?)?,
        baseline_start: parse_date(&row.try_get::<String, _>("baseline_start")?)?,
        baseline_end: parse_date(&row.try_get::<String, _>("baseline_end")?)?,
        sample_size: row.try_get("sample_size")?,
        hit_rate: row.try_get("hit_rate")?,
        baseline_hit_rate: row.try_get("baseline_hit_rate")?,
        hit_rate_delta: row.try_get("hit_rate_delta")?,
        score_p50: row.try_get("score_p50")?,
        baseline_score_p50: row.try_get("baseline_score_p50")?,
        score_p50_delta: row.try_get("score_p50_delta")?,
        contribution_delta: row.try_get("contribution_delta")?,
        feedback_polarity_accuracy_delta: row.try_get("feedback_polarity_accuracy_delta")?,
        feedback_event_type_accuracy_delta: row.try_get("feedback_event_type_accuracy_delta")?,
        alerts,
    })
}

fn to_feedback(row: &SqliteRow) -> Result<FeedbackRecord> {
    Ok(FeedbackRecord {
        id: row.try_get("id")?,
        created_at: from_iso(&row.try_get::<String, _>("created_at")?)?,
        updated_at: from_iso(&row.try_get::<String, _>("updated_at")?)?,
        source_name: row.try_get("source_name")?,
        event_id: row.try_get("event_id")?,
        symbol: row.try_get("symbol")?,
        publish_time: from_iso(&row.try_get::<String, _>("publish_time")?)?,
        predicted_event_type: row.try_get("predicted_event_type")?,
        predicted_polarity: EventPolarity::parse(&row.try_get::<String, _>("predicted_polarity")?)?,
        predicted_score: row.try_get("predicted_score")?,
        label_event_type: row.try_get("label_event_type")?,
        label_polarity: EventPolarity::parse(&row.try_get::<String, _>("label_polarity")?)?,
        label_score: row.try_get("label_score")?,
        labeler: row.try_get("labeler")?,
        note: row.try_get("note")?,
    })
}

fn to_label_entry(row: &SqliteRow) -> Result<LabelEntryRecord> {
    Ok(LabelEntryRecord {
        id: row.try_get("id")?,
        created_at: from_iso(&row.try_get::<String, _>("created_at")?)?,
        updated_at: from_iso(&row.try_get::<String, _>("updated_at")?)?,
        source_name: row.try_get("source_name")?,
        event_id: row.try_get("event_id")?,
        symbol: row.try_get("symbol")?,
        publish_time: from_iso(&row.try_get::<String, _>("publish_time")?)?,
        predicted_score: row.try_get("predicted_score")?,
        label_event_type: row.try_get("label_event_type")?,
        label_polarity: EventPolarity::parse(&row.try_get::<String, _>("label_polarity")?)?,
        label_score: row.try_get("label_score")?,
        labeler: row.try_get("labeler")?,
        note: row.try_get("note")?,
    })
}

fn to_consensus(row: &SqliteRow) -> Result<ConsensusRecord> {
    let reasons: Vec<String> =
        serde_json::from_str(&row.try_get::<String, _>("conflict_reasons")?).unwrap_or_default();
    Ok(ConsensusRecord {
        id: row.try_get("id")?,
        created_at: from_iso(&row.try_get::<String, _>("created_at")?)?,
        updated_at: from_iso(&row.try_get::<String, _>("updated_at")?)?,
        source_name: row.try_get("source_name")?,
        event_id: row.try_get("event_id")?,
        symbol: row.try_get("symbol")?,
        publish_time: from_iso(&row.try_get::<String, _>("publish_time")?)?,
        consensus_event_type: row.try_get("consensus_event_type")?,
        consensus_polarity: EventPolarity::parse(&row.try_get::<String, _>("consensus_polarity")?)?,
        consensus_score: row.try_get("consensus_score")?,
        consensus_confidence: row.try_get("consensus_confidence")?,
        label_count: row.try_get("label_count")?,
        conflict: row.try_get::<i64, _>("conflict")? != 0,
        conflict_reasons: reasons,
        adjudicated_by: row.try_get("adjudicated_by")?,
        label_version: row.try_get("label_version")?,
    })
}

fn parse_date(raw: &str) -> Result<NaiveDate> {
    raw.parse::<NaiveDate>()
        .with_context(|| format!("invalid stored date: {raw}"))
}
