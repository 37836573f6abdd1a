//! SLA alert states (current) and SLA history (append-only).

use std::collections::HashSet;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use evd_schemas::{BreachStage, BreachType, SignalLevel, SlaAlertState, SlaBreach, SlaHistoryRow};

use crate::{clamp_limit, from_iso, from_iso_opt, to_iso, to_iso_opt};

const STATE_COLUMNS: &str = r#"
    dedupe_key, connector_name, source_name, breach_type, stage, severity,
    first_seen_at, last_seen_at, last_emitted_at, last_recovered_at, last_escalated_at,
    repeat_count, escalation_level, escalation_reason, is_open, message
"#;

pub async fn get_sla_alert_state(
    pool: &SqlitePool,
    dedupe_key: &str,
) -> Result<Option<SlaAlertState>> {
    let sql = format!(
        "SELECT {STATE_COLUMNS} FROM event_connector_sla_alert_states WHERE dedupe_key = ? LIMIT 1"
    );
    let row = sqlx::query(&sql)
        .bind(dedupe_key)
        .fetch_optional(pool)
        .await
        .context("get_sla_alert_state failed")?;
    row.map(|r| to_state(&r)).transpose()
}

/// Persist a full alert state (insert or overwrite by dedupe key).
///
/// The caller computes the next state with the pure transition function and
/// hands it here; this function does no decision-making of its own.
pub async fn put_sla_alert_state(pool: &SqlitePool, state: &SlaAlertState) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO event_connector_sla_alert_states(
            dedupe_key, connector_name, source_name, breach_type, stage, severity,
            first_seen_at, last_seen_at, last_emitted_at, last_recovered_at, last_escalated_at,
            repeat_count, escalation_level, escalation_reason, is_open, message
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(dedupe_key) DO UPDATE SET
            connector_name = excluded.connector_name,
            source_name = excluded.source_name,
            breach_type = excluded.breach_type,
            stage = excluded.stage,
            severity = excluded.severity,
            first_seen_at = excluded.first_seen_at,
            last_seen_at = excluded.last_seen_at,
            last_emitted_at = excluded.last_emitted_at,
            last_recovered_at = excluded.last_recovered_at,
            last_escalated_at = excluded.last_escalated_at,
            repeat_count = excluded.repeat_count,
            escalation_level = excluded.escalation_level,
            escalation_reason = excluded.escalation_reason,
            is_open = excluded.is_open,
            message = excluded.message
        "#,
    )
    .bind(&state.dedupe_key)
    .bind(&state.connector_name)
    .bind(&state.source_name)
    .bind(state.breach_type.as_str())
    .bind(state.stage.as_str())
    .bind(state.severity.as_str())
    .bind(to_iso(state.first_seen_at))
    .bind(to_iso(state.last_seen_at))
    .bind(to_iso_opt(state.last_emitted_at))
    .bind(to_iso_opt(state.last_recovered_at))
    .bind(to_iso_opt(state.last_escalated_at))
    .bind(state.repeat_count)
    .bind(state.escalation_level)
    .bind(&state.escalation_reason)
    .bind(state.is_open as i64)
    .bind(&state.message)
    .execute(pool)
    .await
    .context("put_sla_alert_state failed")?;
    Ok(())
}

/// Raise the escalation level of an open state. Persists only on a strict
/// increase; returns the refreshed state when it did.
pub async fn update_sla_state_escalation(
    pool: &SqlitePool,
    dedupe_key: &str,
    escalation_level: i64,
    escalation_reason: &str,
    escalated_at: DateTime<Utc>,
) -> Result<Option<SlaAlertState>> {
    let level = escalation_level.max(0);
    let result = sqlx::query(
        r#"
        UPDATE event_connector_sla_alert_states
        SET escalation_level = ?,
            escalation_reason = ?,
            last_escalated_at = ?
        WHERE dedupe_key = ?
          AND is_open = 1
          AND escalation_level < ?
        "#,
    )
    .bind(level)
    .bind(escalation_reason)
    .bind(to_iso(escalated_at))
    .bind(dedupe_key)
    .bind(level)
    .execute(pool)
    .await
    .context("update_sla_state_escalation failed")?;

    if result.rows_affected() == 0 {
        return Ok(None);
    }
    get_sla_alert_state(pool, dedupe_key).await
}

/// Close every open state whose key did not appear in the latest evaluation.
/// Returns the closed states for recovery audit emission.
pub async fn close_sla_alert_states_not_in(
    pool: &SqlitePool,
    active_dedupe_keys: &HashSet<String>,
    observed_at: DateTime<Utc>,
) -> Result<Vec<SlaAlertState>> {
    let sql = format!("SELECT {STATE_COLUMNS} FROM event_connector_sla_alert_states WHERE is_open = 1");
    let rows = sqlx::query(&sql)
        .fetch_all(pool)
        .await
        .context("close_sla_alert_states open scan failed")?;

    let now_iso = to_iso(observed_at);
    let mut closed = Vec::new();
    for row in rows {
        let state = to_state(&row)?;
        if active_dedupe_keys.contains(&state.dedupe_key) {
            continue;
        }
        sqlx::query(
            r#"
            UPDATE event_connector_sla_alert_states
            SET is_open = 0,
                last_recovered_at = ?,
                last_seen_at = ?
            WHERE dedupe_key = ?
            "#,
        )
        .bind(&now_iso)
        .bind(&now_iso)
        .bind(&state.dedupe_key)
        .execute(pool)
        .await
        .context("close_sla_alert_states update failed")?;

        if let Some(refreshed) = get_sla_alert_state(pool, &state.dedupe_key).await? {
            closed.push(refreshed);
        }
    }
    Ok(closed)
}

pub async fn list_sla_alert_states(
    pool: &SqlitePool,
    connector_name: Option<&str>,
    open_only: bool,
    limit: i64,
) -> Result<Vec<SlaAlertState>> {
    let mut sql = format!("SELECT {STATE_COLUMNS} FROM event_connector_sla_alert_states");
    let mut conditions: Vec<&str> = Vec::new();
    if connector_name.is_some() {
        conditions.push("connector_name = ?");
    }
    if open_only {
        conditions.push("is_open = 1");
    }
    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }
    sql.push_str(" ORDER BY is_open DESC, last_seen_at DESC, repeat_count DESC LIMIT ?");

    let mut query = sqlx::query(&sql);
    if let Some(name) = connector_name {
        query = query.bind(name);
    }
    query = query.bind(clamp_limit(limit, 5000));

    let rows = query.fetch_all(pool).await.context("list_sla_alert_states failed")?;
    rows.iter().map(to_state).collect()
}

pub async fn count_open_sla_alert_states(
    pool: &SqlitePool,
    connector_name: Option<&str>,
    min_escalation_level: i64,
) -> Result<i64> {
    let mut sql =
        String::from("SELECT COUNT(1) AS c FROM event_connector_sla_alert_states WHERE is_open = 1");
    if connector_name.is_some() {
        sql.push_str(" AND connector_name = ?");
    }
    if min_escalation_level > 0 {
        sql.push_str(" AND escalation_level >= ?");
    }

    let mut query = sqlx::query(&sql);
    if let Some(name) = connector_name {
        query = query.bind(name);
    }
    if min_escalation_level > 0 {
        query = query.bind(min_escalation_level);
    }
    let row = query
        .fetch_one(pool)
        .await
        .context("count_open_sla_alert_states failed")?;
    Ok(row.try_get("c")?)
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

pub async fn append_sla_history(
    pool: &SqlitePool,
    observed_at: DateTime<Utc>,
    breaches: &[SlaBreach],
) -> Result<i64> {
    if breaches.is_empty() {
        return Ok(0);
    }
    let now_iso = to_iso(observed_at);
    let mut inserted = 0i64;
    for breach in breaches {
        sqlx::query(
            r#"
            INSERT INTO event_connector_sla_history(
                observed_at, connector_name, source_name, breach_type, severity, stage,
                freshness_minutes, pending_failures, dead_failures, message
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&now_iso)
        .bind(&breach.connector_name)
        .bind(&breach.source_name)
        .bind(breach.breach_type.as_str())
        .bind(breach.severity.as_str())
        .bind(breach.stage.as_str())
        .bind(breach.freshness_minutes)
        .bind(breach.pending_failures)
        .bind(breach.dead_failures)
        .bind(&breach.message)
        .execute(pool)
        .await
        .context("append_sla_history failed")?;
        inserted += 1;
    }
    Ok(inserted)
}

pub async fn list_sla_history(
    pool: &SqlitePool,
    connector_name: Option<&str>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    limit: i64,
) -> Result<Vec<SlaHistoryRow>> {
    let mut sql = String::from(
        r#"
        SELECT id, observed_at, connector_name, source_name, breach_type, severity, stage,
               freshness_minutes, pending_failures, dead_failures, message
        FROM event_connector_sla_history
        "#,
    );
    let mut conditions: Vec<&str> = Vec::new();
    if connector_name.is_some() {
        conditions.push("connector_name = ?");
    }
    if start_time.is_some() {
        conditions.push("observed_at >= ?");
    }
    if end_time.is_some() {
        conditions.push("observed_at <= ?");
    }
    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }
    sql.push_str(" ORDER BY observed_at DESC, id DESC LIMIT ?");

    let mut query = sqlx::query(&sql);
    if let Some(name) = connector_name {
        query = query.bind(name);
    }
    if let Some(start) = start_time {
        query = query.bind(to_iso(start));
    }
    if let Some(end) = end_time {
        query = query.bind(to_iso(end));
    }
    query = query.bind(clamp_limit(limit, 500_000));

    let rows = query.fetch_all(pool).await.context("list_sla_history failed")?;
    rows.iter()
        .map(|row| {
            Ok(SlaHistoryRow {
                id: row.try_get("id")?,
                observed_at: from_iso(&row.try_get::<String, _>("observed_at")?)?,
                connector_name: row.try_get("connector_name")?,
                source_name: row.try_get("source_name")?,
                breach_type: BreachType::parse(&row.try_get::<String, _>("breach_type")?)?,
                severity: SignalLevel::parse(&row.try_get::<String, _>("severity")?)?,
                stage: BreachStage::parse(&row.try_get::<String, _>("stage")?)?,
                freshness_minutes: row.try_get("freshness_minutes")?,
                pending_failures: row.try_get("pending_failures")?,
                dead_failures: row.try_get("dead_failures")?,
                message: row.try_get("message")?,
            })
        })
        .collect()
}

fn to_state(row: &SqliteRow) -> Result<SlaAlertState> {
    Ok(SlaAlertState {
        dedupe_key: row.try_get("dedupe_key")?,
        connector_name: row.try_get("connector_name")?,
        source_name: row.try_get("source_name")?,
        breach_type: BreachType::parse(&row.try_get::<String, _>("breach_type")?)?,
        stage: BreachStage::parse(&row.try_get::<String, _>("stage")?)?,
        severity: SignalLevel::parse(&row.try_get::<String, _>("severity")?)?,
        first_seen_at: from_iso(&row.try_get::<String, _>("first_seen_at")?)?,
        last_seen_at: from_iso(&row.try_get::<String, _>("last_seen_at")?)?,
        last_emitted_at: from_iso_opt(row.try_get("last_emitted_at")?)?,
        last_recovered_at: from_iso_opt(row.try_get("last_recovered_at")?)?,
        last_escalated_at: from_iso_opt(row.try_get("last_escalated_at")?)?,
        repeat_count: row.try_get("repeat_count")?,
        escalation_level: row.try_get("escalation_level")?,
        escalation_reason: row.try_get("escalation_reason")?,
        is_open: row.try_get::<i64, _>("is_open")? != 0,
        message: row.try_get("message")?,
    })
}
