//! Connector registry, checkpoints, runs, failures, and per-source runtime
//! state (health, budgets, credential cursors).

use anyhow::{Context, Result};
use chrono::{DateTime, Timelike, Utc};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};

use evd_schemas::{
    CheckpointRecord, ConnectorOverviewItem, ConnectorRecord, ConnectorRegisterRequest,
    ConnectorRunRecord, ConnectorType, FailureRecord, FailureStatus, RunStatus, SourceStateRecord,
};

use crate::{clamp_limit, from_iso, from_iso_opt, to_iso, to_iso_opt};

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Upsert a connector by `connector_name` and seed its checkpoint row.
/// Returns the connector row id.
pub async fn register_connector(pool: &SqlitePool, req: &ConnectorRegisterRequest) -> Result<i64> {
    req.validate()?;
    let now = to_iso(Utc::now());
    let config_json = serde_json::to_string(&req.config).context("config serialize failed")?;

    let mut tx = pool.begin().await.context("register_connector begin failed")?;

    sqlx::query(
        r#"
        INSERT INTO event_connectors(
            created_at, updated_at, connector_name, source_name, connector_type, enabled,
            fetch_limit, poll_interval_minutes, replay_backoff_seconds, max_retry, config,
            created_by, note
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(connector_name) DO UPDATE SET
            updated_at = excluded.updated_at,
            source_name = excluded.source_name,
            connector_type = excluded.connector_type,
            enabled = excluded.enabled,
            fetch_limit = excluded.fetch_limit,
            poll_interval_minutes = excluded.poll_interval_minutes,
            replay_backoff_seconds = excluded.replay_backoff_seconds,
            max_retry = excluded.max_retry,
            config = excluded.config,
            created_by = excluded.created_by,
            note = excluded.note
        "#,
    )
    .bind(&now)
    .bind(&now)
    .bind(&req.connector_name)
    .bind(&req.source_name)
    .bind(req.connector_type.as_str())
    .bind(req.enabled as i64)
    .bind(req.fetch_limit)
    .bind(req.poll_interval_minutes)
    .bind(req.replay_backoff_seconds)
    .bind(req.max_retry)
    .bind(config_json)
    .bind(&req.created_by)
    .bind(&req.note)
    .execute(&mut *tx)
    .await
    .context("register_connector failed")?;

    // Seed the checkpoint; an existing cursor is only overwritten by a
    // non-null request value.
    sqlx::query(
        r#"
        INSERT INTO event_connector_checkpoints(
            connector_name, checkpoint_cursor, checkpoint_publish_time, updated_at,
            last_run_at, last_success_at
        )
        VALUES (?, ?, ?, ?, NULL, NULL)
        ON CONFLICT(connector_name) DO UPDATE SET
            checkpoint_cursor = COALESCE(excluded.checkpoint_cursor, event_connector_checkpoints.checkpoint_cursor),
            checkpoint_publish_time = COALESCE(
                excluded.checkpoint_publish_time,
                event_connector_checkpoints.checkpoint_publish_time
            ),
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&req.connector_name)
    .bind(&req.checkpoint_cursor)
    .bind(to_iso_opt(req.checkpoint_publish_time))
    .bind(&now)
    .execute(&mut *tx)
    .await
    .context("register_connector checkpoint seed failed")?;

    let row = sqlx::query("SELECT id FROM event_connectors WHERE connector_name = ? LIMIT 1")
        .bind(&req.connector_name)
        .fetch_one(&mut *tx)
        .await
        .context("register_connector id lookup failed")?;
    let id: i64 = row.try_get("id")?;

    tx.commit().await.context("register_connector commit failed")?;
    Ok(id)
}

pub async fn get_connector(pool: &SqlitePool, connector_name: &str) -> Result<Option<ConnectorRecord>> {
    let row = sqlx::query(
        r#"
        SELECT id, created_at, updated_at, connector_name, source_name, connector_type, enabled,
               fetch_limit, poll_interval_minutes, replay_backoff_seconds, max_retry, config,
               created_by, note
        FROM event_connectors
        WHERE connector_name = ?
        LIMIT 1
        "#,
    )
    .bind(connector_name)
    .fetch_optional(pool)
    .await
    .context("get_connector failed")?;

    row.map(|r| to_connector(&r)).transpose()
}

pub async fn list_connectors(
    pool: &SqlitePool,
    limit: i64,
    enabled_only: bool,
) -> Result<Vec<ConnectorRecord>> {
    let mut sql = String::from(
        r#"
        SELECT id, created_at, updated_at, connector_name, source_name, connector_type, enabled,
               fetch_limit, poll_interval_minutes, replay_backoff_seconds, max_retry, config,
               created_by, note
        FROM event_connectors
        "#,
    );
    if enabled_only {
        sql.push_str(" WHERE enabled = 1");
    }
    sql.push_str(" ORDER BY id DESC LIMIT ?");

    let rows = sqlx::query(&sql)
        .bind(clamp_limit(limit, 2000))
        .fetch_all(pool)
        .await
        .context("list_connectors failed")?;
    rows.iter().map(to_connector).collect()
}

// ---------------------------------------------------------------------------
// Source states
// ---------------------------------------------------------------------------

/// Insert-or-refresh one source-state row. Only registry fields change on
/// conflict; runtime health/checkpoint state is preserved.
pub async fn upsert_source_state(
    pool: &SqlitePool,
    connector_name: &str,
    source_key: &str,
    connector_type: ConnectorType,
    priority: i64,
    enabled: bool,
) -> Result<()> {
    let now = to_iso(Utc::now());
    sqlx::query(
        r#"
        INSERT INTO event_connector_source_states(
            connector_name, source_key, connector_type, priority, enabled, health_score,
            consecutive_failures, total_success, total_failures, last_latency_ms, last_error,
            last_attempt_at, last_success_at, last_failure_at, checkpoint_cursor,
            checkpoint_publish_time, is_active, updated_at
        )
        VALUES (?, ?, ?, ?, ?, 100.0, 0, 0, 0, NULL, '', NULL, NULL, NULL, NULL, NULL, 0, ?)
        ON CONFLICT(connector_name, source_key) DO UPDATE SET
            connector_type = excluded.connector_type,
            priority = excluded.priority,
            enabled = excluded.enabled,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(connector_name)
    .bind(source_key)
    .bind(connector_type.as_str())
    .bind(priority.max(0))
    .bind(enabled as i64)
    .bind(&now)
    .execute(pool)
    .await
    .context("upsert_source_state failed")?;
    Ok(())
}

pub async fn get_source_state(
    pool: &SqlitePool,
    connector_name: &str,
    source_key: &str,
) -> Result<Option<SourceStateRecord>> {
    let row = sqlx::query(
        r#"
        SELECT connector_name, source_key, connector_type, priority, enabled, health_score,
               consecutive_failures, total_success, total_failures, last_latency_ms, last_error,
               last_attempt_at, last_success_at, last_failure_at, checkpoint_cursor,
               checkpoint_publish_time, is_active
        FROM event_connector_source_states
        WHERE connector_name = ? AND source_key = ?
        LIMIT 1
        "#,
    )
    .bind(connector_name)
    .bind(source_key)
    .fetch_optional(pool)
    .await
    .context("get_source_state failed")?;

    row.map(|r| to_source_state(&r, Utc::now())).transpose()
}

pub async fn list_source_states(
    pool: &SqlitePool,
    connector_name: Option<&str>,
    limit: i64,
) -> Result<Vec<SourceStateRecord>> {
    let mut sql = String::from(
        r#"
        SELECT connector_name, source_key, connector_type, priority, enabled, health_score,
               consecutive_failures, total_success, total_failures, last_latency_ms, last_error,
               last_attempt_at, last_success_at, last_failure_at, checkpoint_cursor,
               checkpoint_publish_time, is_active
        FROM event_connector_source_states
        "#,
    );
    if connector_name.is_some() {
        sql.push_str(" WHERE connector_name = ?");
    }
    sql.push_str(
        " ORDER BY connector_name ASC, is_active DESC, enabled DESC, priority ASC, source_key ASC LIMIT ?",
    );

    let mut query = sqlx::query(&sql);
    if let Some(name) = connector_name {
        query = query.bind(name);
    }
    query = query.bind(clamp_limit(limit, 5000));

    let rows = query.fetch_all(pool).await.context("list_source_states failed")?;
    let now = Utc::now();
    rows.iter().map(|r| to_source_state(r, now)).collect()
}

/// Record a successful fetch attempt: health recovers (bounded by latency),
/// the per-source checkpoint advances, and this source becomes the single
/// active one for its connector.
pub async fn mark_source_attempt_success(
    pool: &SqlitePool,
    connector_name: &str,
    source_key: &str,
    checkpoint_cursor: Option<&str>,
    checkpoint_publish_time: Option<DateTime<Utc>>,
    latency_ms: i64,
) -> Result<Option<SourceStateRecord>> {
    let Some(current) = get_source_state(pool, connector_name, source_key).await? else {
        return Ok(None);
    };

    let latency_penalty = if latency_ms > 0 {
        (latency_ms as f64 / 2000.0).min(6.0)
    } else {
        0.0
    };
    let next_health = (current.health_score.max(35.0) + 8.0 - latency_penalty).min(100.0);
    let now_iso = to_iso(Utc::now());

    let mut tx = pool.begin().await.context("mark_source_attempt_success begin failed")?;
    sqlx::query(
        r#"
        UPDATE event_connector_source_states
        SET health_score = ?,
            consecutive_failures = 0,
            total_success = total_success + 1,
            last_latency_ms = ?,
            last_error = '',
            last_attempt_at = ?,
            last_success_at = ?,
            checkpoint_cursor = ?,
            checkpoint_publish_time = ?,
            is_active = CASE WHEN enabled = 1 THEN 1 ELSE 0 END,
            updated_at = ?
        WHERE connector_name = ? AND source_key = ?
        "#,
    )
    .bind(next_health)
    .bind(latency_ms)
    .bind(&now_iso)
    .bind(&now_iso)
    .bind(checkpoint_cursor)
    .bind(to_iso_opt(checkpoint_publish_time))
    .bind(&now_iso)
    .bind(connector_name)
    .bind(source_key)
    .execute(&mut *tx)
    .await
    .context("mark_source_attempt_success failed")?;

    sqlx::query(
        r#"
        UPDATE event_connector_source_states
        SET is_active = 0
        WHERE connector_name = ? AND source_key <> ?
        "#,
    )
    .bind(connector_name)
    .bind(source_key)
    .execute(&mut *tx)
    .await
    .context("mark_source_attempt_success deactivate failed")?;
    tx.commit().await.context("mark_source_attempt_success commit failed")?;

    get_source_state(pool, connector_name, source_key).await
}

/// Record a failed fetch attempt: health degrades with consecutive failures
/// and excessive latency, and the source loses its active flag.
pub async fn mark_source_attempt_failure(
    pool: &SqlitePool,
    connector_name: &str,
    source_key: &str,
    error_message: &str,
    latency_ms: i64,
) -> Result<Option<SourceStateRecord>> {
    let Some(current) = get_source_state(pool, connector_name, source_key).await? else {
        return Ok(None);
    };

    let next_failures = current.consecutive_failures + 1;
    let mut penalty = 12.0 + (next_failures as f64 * 4.0).min(30.0);
    if latency_ms > 5000 {
        penalty += ((latency_ms - 5000) as f64 / 1000.0).min(15.0);
    }
    let next_health = (current.health_score - penalty).max(0.0);
    let now_iso = to_iso(Utc::now());
    let truncated: String = error_message.chars().take(500).collect();

    sqlx::query(
        r#"
        UPDATE event_connector_source_states
        SET health_score = ?,
            consecutive_failures = ?,
            total_failures = total_failures + 1,
            last_latency_ms = ?,
            last_error = ?,
            last_attempt_at = ?,
            last_failure_at = ?,
            is_active = 0,
            updated_at = ?
        WHERE connector_name = ? AND source_key = ?
        "#,
    )
    .bind(next_health)
    .bind(next_failures)
    .bind(latency_ms)
    .bind(truncated)
    .bind(&now_iso)
    .bind(&now_iso)
    .bind(&now_iso)
    .bind(connector_name)
    .bind(source_key)
    .execute(pool)
    .await
    .context("mark_source_attempt_failure failed")?;

    get_source_state(pool, connector_name, source_key).await
}

// ---------------------------------------------------------------------------
// Budgets & credentials
// ---------------------------------------------------------------------------

/// Consume one request from the source's hourly budget.
///
/// Returns `(allowed, used, limit, window)`. A missing or non-positive
/// budget means unlimited. The read-modify-write runs in one transaction.
pub async fn try_consume_source_budget(
    pool: &SqlitePool,
    connector_name: &str,
    source_key: &str,
    budget_per_hour: Option<i64>,
    as_of: DateTime<Utc>,
) -> Result<(bool, i64, i64, String)> {
    let window = to_iso(
        as_of
            .with_minute(0)
            .and_then(|t| t.with_second(0))
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(as_of),
    );
    let budget = budget_per_hour.unwrap_or(0).max(0);
    if budget <= 0 {
        return Ok((true, 0, 0, window));
    }

    let mut tx = pool.begin().await.context("budget begin failed")?;
    let row: Option<(i64,)> = sqlx::query_as(
        r#"
        SELECT request_count
        FROM event_connector_source_budgets
        WHERE connector_name = ? AND source_key = ? AND window_hour = ?
        LIMIT 1
        "#,
    )
    .bind(connector_name)
    .bind(source_key)
    .bind(&window)
    .fetch_optional(&mut *tx)
    .await
    .context("budget lookup failed")?;

    let result = match row {
        None => {
            sqlx::query(
                r#"
                INSERT INTO event_connector_source_budgets(
                    connector_name, source_key, window_hour, request_count, updated_at
                )
                VALUES (?, ?, ?, 1, ?)
                "#,
            )
            .bind(connector_name)
            .bind(source_key)
            .bind(&window)
            .bind(to_iso(as_of))
            .execute(&mut *tx)
            .await
            .context("budget insert failed")?;
            (true, 1, budget, window)
        }
        Some((used,)) if used >= budget => (false, used, budget, window),
        Some((used,)) => {
            let next = used + 1;
            sqlx::query(
                r#"
                UPDATE event_connector_source_budgets
                SET request_count = ?, updated_at = ?
                WHERE connector_name = ? AND source_key = ? AND window_hour = ?
                "#,
            )
            .bind(next)
            .bind(to_iso(as_of))
            .bind(connector_name)
            .bind(source_key)
            .bind(&window)
            .execute(&mut *tx)
            .await
            .context("budget update failed")?;
            (true, next, budget, window)
        }
    };
    tx.commit().await.context("budget commit failed")?;
    Ok(result)
}

/// Round-robin the next credential alias for a source. Returns `None` when
/// the alias list is empty after trimming.
pub async fn next_source_credential_alias(
    pool: &SqlitePool,
    connector_name: &str,
    source_key: &str,
    aliases: &[String],
) -> Result<Option<String>> {
    let cleaned: Vec<&str> = aliases
        .iter()
        .map(|a| a.trim())
        .filter(|a| !a.is_empty())
        .collect();
    if cleaned.is_empty() {
        return Ok(None);
    }

    let mut tx = pool.begin().await.context("credential cursor begin failed")?;
    let row: Option<(i64,)> = sqlx::query_as(
        r#"
        SELECT cursor
        FROM event_connector_source_credentials
        WHERE connector_name = ? AND source_key = ?
        LIMIT 1
        "#,
    )
    .bind(connector_name)
    .bind(source_key)
    .fetch_optional(&mut *tx)
    .await
    .context("credential cursor lookup failed")?;

    let cursor = row.map(|(c,)| c).unwrap_or(-1);
    let next_cursor = ((cursor + 1).rem_euclid(cleaned.len() as i64)) as usize;
    sqlx::query(
        r#"
        INSERT INTO event_connector_source_credentials(connector_name, source_key, cursor, updated_at)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(connector_name, source_key) DO UPDATE SET
            cursor = excluded.cursor,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(connector_name)
    .bind(source_key)
    .bind(next_cursor as i64)
    .bind(to_iso(Utc::now()))
    .execute(&mut *tx)
    .await
    .context("credential cursor update failed")?;
    tx.commit().await.context("credential cursor commit failed")?;

    Ok(Some(cleaned[next_cursor].to_string()))
}

// ---------------------------------------------------------------------------
// Checkpoints
// ---------------------------------------------------------------------------

pub async fn get_checkpoint(pool: &SqlitePool, connector_name: &str) -> Result<Option<CheckpointRecord>> {
    let row = sqlx::query(
        r#"
        SELECT connector_name, checkpoint_cursor, checkpoint_publish_time, updated_at,
               last_run_at, last_success_at
        FROM event_connector_checkpoints
        WHERE connector_name = ?
        LIMIT 1
        "#,
    )
    .bind(connector_name)
    .fetch_optional(pool)
    .await
    .context("get_checkpoint failed")?;

    row.map(|r| to_checkpoint(&r)).transpose()
}

/// Parameters for one checkpoint advancement.
#[derive(Debug, Clone, Default)]
pub struct CheckpointUpdate {
    pub checkpoint_cursor: Option<String>,
    pub checkpoint_publish_time: Option<DateTime<Utc>>,
    pub mark_run_at: Option<DateTime<Utc>>,
    pub mark_success_at: Option<DateTime<Utc>>,
}

pub async fn update_checkpoint(
    pool: &SqlitePool,
    connector_name: &str,
    update: &CheckpointUpdate,
) -> Result<()> {
    let mut conn = pool.acquire().await.context("update_checkpoint acquire failed")?;
    update_checkpoint_in(&mut *conn, connector_name, update).await
}

pub async fn update_checkpoint_in(
    conn: &mut SqliteConnection,
    connector_name: &str,
    update: &CheckpointUpdate,
) -> Result<()> {
    let now = to_iso(Utc::now());
    sqlx::query(
        r#"
        INSERT INTO event_connector_checkpoints(
            connector_name, checkpoint_cursor, checkpoint_publish_time, updated_at,
            last_run_at, last_success_at
        )
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(connector_name) DO UPDATE SET
            checkpoint_cursor = excluded.checkpoint_cursor,
            checkpoint_publish_time = excluded.checkpoint_publish_time,
            updated_at = excluded.updated_at,
            last_run_at = COALESCE(excluded.last_run_at, event_connector_checkpoints.last_run_at),
            last_success_at = COALESCE(excluded.last_success_at, event_connector_checkpoints.last_success_at)
        "#,
    )
    .bind(connector_name)
    .bind(&update.checkpoint_cursor)
    .bind(to_iso_opt(update.checkpoint_publish_time))
    .bind(&now)
    .bind(to_iso_opt(update.mark_run_at))
    .bind(to_iso_opt(update.mark_success_at))
    .execute(conn)
    .await
    .context("update_checkpoint failed")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

pub async fn create_run(pool: &SqlitePool, run: &ConnectorRunRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO event_connector_runs(
            run_id, connector_name, source_name, started_at, finished_at, status, triggered_by,
            pulled_count, normalized_count, inserted_count, updated_count, failed_count,
            replayed_count, checkpoint_before, checkpoint_after, error_message, details
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&run.run_id)
    .bind(&run.connector_name)
    .bind(&run.source_name)
    .bind(to_iso(run.started_at))
    .bind(to_iso_opt(run.finished_at))
    .bind(run.status.as_str())
    .bind(&run.triggered_by)
    .bind(run.pulled_count)
    .bind(run.normalized_count)
    .bind(run.inserted_count)
    .bind(run.updated_count)
    .bind(run.failed_count)
    .bind(run.replayed_count)
    .bind(&run.checkpoint_before)
    .bind(&run.checkpoint_after)
    .bind(&run.error_message)
    .bind(serde_json::to_string(&run.details).context("details serialize failed")?)
    .execute(pool)
    .await
    .context("create_run failed")?;
    Ok(())
}

pub async fn update_run(pool: &SqlitePool, run: &ConnectorRunRecord) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE event_connector_runs
        SET finished_at = ?,
            status = ?,
            pulled_count = ?,
            normalized_count = ?,
            inserted_count = ?,
            updated_count = ?,
            failed_count = ?,
            replayed_count = ?,
            checkpoint_before = ?,
            checkpoint_after = ?,
            error_message = ?,
            details = ?
        WHERE run_id = ?
        "#,
    )
    .bind(to_iso_opt(run.finished_at))
    .bind(run.status.as_str())
    .bind(run.pulled_count)
    .bind(run.normalized_count)
    .bind(run.inserted_count)
    .bind(run.updated_count)
    .bind(run.failed_count)
    .bind(run.replayed_count)
    .bind(&run.checkpoint_before)
    .bind(&run.checkpoint_after)
    .bind(&run.error_message)
    .bind(serde_json::to_string(&run.details).context("details serialize failed")?)
    .bind(&run.run_id)
    .execute(pool)
    .await
    .context("update_run failed")?;
    Ok(())
}

pub async fn list_runs(
    pool: &SqlitePool,
    connector_name: Option<&str>,
    limit: i64,
) -> Result<Vec<ConnectorRunRecord>> {
    let mut sql = String::from(
        r#"
        SELECT run_id, connector_name, source_name, started_at, finished_at, status, triggered_by,
               pulled_count, normalized_count, inserted_count, updated_count, failed_count,
               replayed_count, checkpoint_before, checkpoint_after, error_message, details
        FROM event_connector_runs
        "#,
    );
    if connector_name.is_some() {
        sql.push_str(" WHERE connector_name = ?");
    }
    sql.push_str(" ORDER BY started_at DESC LIMIT ?");

    let mut query = sqlx::query(&sql);
    if let Some(name) = connector_name {
        query = query.bind(name);
    }
    query = query.bind(clamp_limit(limit, 500_000));

    let rows = query.fetch_all(pool).await.context("list_runs failed")?;
    rows.iter().map(to_run).collect()
}

pub async fn latest_run(pool: &SqlitePool, connector_name: &str) -> Result<Option<ConnectorRunRecord>> {
    Ok(list_runs(pool, Some(connector_name), 1).await?.into_iter().next())
}

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

/// Failure rows to append alongside a run outcome.
#[derive(Debug, Clone)]
pub struct FailureAppend {
    pub connector_name: String,
    pub source_name: String,
    pub run_id: String,
    pub payloads: Vec<Value>,
    pub error_message: String,
    pub next_retry_at: Option<DateTime<Utc>>,
}

pub async fn append_failures(pool: &SqlitePool, append: &FailureAppend) -> Result<i64> {
    let mut conn = pool.acquire().await.context("append_failures acquire failed")?;
    append_failures_in(&mut *conn, append).await
}

pub async fn append_failures_in(conn: &mut SqliteConnection, append: &FailureAppend) -> Result<i64> {
    if append.payloads.is_empty() {
        return Ok(0);
    }
    let now = to_iso(Utc::now());
    let mut inserted = 0i64;
    for payload in &append.payloads {
        sqlx::query(
            r#"
            INSERT INTO event_connector_failures(
                connector_name, source_name, run_id, created_at, updated_at, status,
                retry_count, next_retry_at, last_error, payload
            )
            VALUES (?, ?, ?, ?, ?, ?, 0, ?, ?, ?)
            "#,
        )
        .bind(&append.connector_name)
        .bind(&append.source_name)
        .bind(&append.run_id)
        .bind(&now)
        .bind(&now)
        .bind(FailureStatus::Pending.as_str())
        .bind(to_iso_opt(append.next_retry_at))
        .bind(&append.error_message)
        .bind(serde_json::to_string(payload).context("failure payload serialize failed")?)
        .execute(&mut *conn)
        .await
        .context("append_failures failed")?;
        inserted += 1;
    }
    Ok(inserted)
}

pub async fn list_failures(
    pool: &SqlitePool,
    connector_name: Option<&str>,
    status: Option<FailureStatus>,
    error_keyword: Option<&str>,
    limit: i64,
) -> Result<Vec<FailureRecord>> {
    let mut sql = String::from(
        r#"
        SELECT id, connector_name, source_name, run_id, created_at, updated_at, status,
               retry_count, next_retry_at, last_error, payload
        FROM event_connector_failures
        "#,
    );
    let mut conditions: Vec<&str> = Vec::new();
    if connector_name.is_some() {
        conditions.push("connector_name = ?");
    }
    if status.is_some() {
        conditions.push("status = ?");
    }
    if error_keyword.is_some() {
        conditions.push("LOWER(last_error) LIKE ?");
    }
    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }
    sql.push_str(" ORDER BY id DESC LIMIT ?");

    let mut query = sqlx::query(&sql);
    if let Some(name) = connector_name {
        query = query.bind(name);
    }
    if let Some(status) = status {
        query = query.bind(status.as_str());
    }
    if let Some(keyword) = error_keyword {
        query = query.bind(format!("%{}%", keyword.to_lowercase()));
    }
    query = query.bind(clamp_limit(limit, 5000));

    let rows = query.fetch_all(pool).await.context("list_failures failed")?;
    rows.iter().map(to_failure).collect()
}

pub async fn get_failure(pool: &SqlitePool, failure_id: i64) -> Result<Option<FailureRecord>> {
    let row = sqlx::query(
        r#"
        SELECT id, connector_name, source_name, run_id, created_at, updated_at, status,
               retry_count, next_retry_at, last_error, payload
        FROM event_connector_failures
        WHERE id = ?
        LIMIT 1
        "#,
    )
    .bind(failure_id)
    .fetch_optional(pool)
    .await
    .context("get_failure failed")?;

    row.map(|r| to_failure(&r)).transpose()
}

pub async fn update_failure_payload(
    pool: &SqlitePool,
    failure_id: i64,
    payload: &Value,
    last_error: &str,
    next_retry_at: Option<DateTime<Utc>>,
    reset_retry_count: bool,
) -> Result<bool> {
    let now = to_iso(Utc::now());
    let result = sqlx::query(
        r#"
        UPDATE event_connector_failures
        SET updated_at = ?,
            status = ?,
            next_retry_at = ?,
            last_error = ?,
            payload = ?,
            retry_count = CASE WHEN ? = 1 THEN 0 ELSE retry_count END
        WHERE id = ?
        "#,
    )
    .bind(&now)
    .bind(FailureStatus::Pending.as_str())
    .bind(to_iso_opt(next_retry_at))
    .bind(last_error)
    .bind(serde_json::to_string(payload).context("failure payload serialize failed")?)
    .bind(reset_retry_count as i64)
    .bind(failure_id)
    .execute(pool)
    .await
    .context("update_failure_payload failed")?;
    Ok(result.rows_affected() > 0)
}

/// Claim pending rows whose retry window opened, oldest id first.
pub async fn claim_pending_failures(
    pool: &SqlitePool,
    connector_name: &str,
    limit: i64,
    max_retry: i64,
    as_of: DateTime<Utc>,
) -> Result<Vec<FailureRecord>> {
    let rows = sqlx::query(
        r#"
        SELECT id, connector_name, source_name, run_id, created_at, updated_at, status,
               retry_count, next_retry_at, last_error, payload
        FROM event_connector_failures
        WHERE connector_name = ?
          AND status = ?
          AND retry_count < ?
          AND (next_retry_at IS NULL OR next_retry_at <= ?)
        ORDER BY id ASC
        LIMIT ?
        "#,
    )
    .bind(connector_name)
    .bind(FailureStatus::Pending.as_str())
    .bind(max_retry.max(1))
    .bind(to_iso(as_of))
    .bind(clamp_limit(limit, 5000))
    .fetch_all(pool)
    .await
    .context("claim_pending_failures failed")?;
    rows.iter().map(to_failure).collect()
}

/// Claim explicit ids for operator-driven replay (retry caps are ignored).
pub async fn claim_failures_by_ids(
    pool: &SqlitePool,
    connector_name: &str,
    failure_ids: &[i64],
) -> Result<Vec<FailureRecord>> {
    let mut ids: Vec<i64> = failure_ids.iter().copied().filter(|x| *x > 0).collect();
    ids.sort_unstable();
    ids.dedup();
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    let placeholders = vec!["?"; ids.len()].join(", ");
    let sql = format!(
        r#"
        SELECT id, connector_name, source_name, run_id, created_at, updated_at, status,
               retry_count, next_retry_at, last_error, payload
        FROM event_connector_failures
        WHERE connector_name = ? AND id IN ({placeholders})
        ORDER BY id ASC
        "#,
    );
    let mut query = sqlx::query(&sql).bind(connector_name);
    for id in &ids {
        query = query.bind(id);
    }
    let rows = query.fetch_all(pool).await.context("claim_failures_by_ids failed")?;
    rows.iter().map(to_failure).collect()
}

pub async fn mark_failure_replayed(pool: &SqlitePool, failure_id: i64) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE event_connector_failures
        SET status = ?, updated_at = ?, next_retry_at = NULL
        WHERE id = ?
        "#,
    )
    .bind(FailureStatus::Replayed.as_str())
    .bind(to_iso(Utc::now()))
    .bind(failure_id)
    .execute(pool)
    .await
    .context("mark_failure_replayed failed")?;
    Ok(())
}

pub async fn mark_failure_retry(
    pool: &SqlitePool,
    failure_id: i64,
    next_retry_at: DateTime<Utc>,
    error_message: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE event_connector_failures
        SET updated_at = ?,
            retry_count = retry_count + 1,
            next_retry_at = ?,
            last_error = ?,
            status = ?
        WHERE id = ?
        "#,
    )
    .bind(to_iso(Utc::now()))
    .bind(to_iso(next_retry_at))
    .bind(error_message)
    .bind(FailureStatus::Pending.as_str())
    .bind(failure_id)
    .execute(pool)
    .await
    .context("mark_failure_retry failed")?;
    Ok(())
}

pub async fn mark_failure_dead(pool: &SqlitePool, failure_id: i64, error_message: &str) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE event_connector_failures
        SET updated_at = ?, status = ?, last_error = ?
        WHERE id = ?
        "#,
    )
    .bind(to_iso(Utc::now()))
    .bind(FailureStatus::Dead.as_str())
    .bind(error_message)
    .bind(failure_id)
    .execute(pool)
    .await
    .context("mark_failure_dead failed")?;
    Ok(())
}

pub async fn count_failures(
    pool: &SqlitePool,
    connector_name: Option<&str>,
    status: Option<FailureStatus>,
) -> Result<i64> {
    let mut sql = String::from("SELECT COUNT(1) AS c FROM event_connector_failures");
    let mut conditions: Vec<&str> = Vec::new();
    if connector_name.is_some() {
        conditions.push("connector_name = ?");
    }
    if status.is_some() {
        conditions.push("status = ?");
    }
    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }

    let mut query = sqlx::query(&sql);
    if let Some(name) = connector_name {
        query = query.bind(name);
    }
    if let Some(status) = status {
        query = query.bind(status.as_str());
    }
    let row = query.fetch_one(pool).await.context("count_failures failed")?;
    Ok(row.try_get("c")?)
}

// ---------------------------------------------------------------------------
// Overview
// ---------------------------------------------------------------------------

pub async fn connector_overview(pool: &SqlitePool, limit: i64) -> Result<Vec<ConnectorOverviewItem>> {
    let connectors = list_connectors(pool, limit, false).await?;
    let mut out = Vec::with_capacity(connectors.len());
    for connector in connectors {
        let checkpoint = get_checkpoint(pool, &connector.connector_name).await?;
        let latest = latest_run(pool, &connector.connector_name).await?;
        let states = list_source_states(pool, Some(&connector.connector_name), 200).await?;
        let active = states.iter().find(|s| s.is_active);
        let pending =
            count_failures(pool, Some(&connector.connector_name), Some(FailureStatus::Pending)).await?;
        let dead =
            count_failures(pool, Some(&connector.connector_name), Some(FailureStatus::Dead)).await?;
        out.push(ConnectorOverviewItem {
            connector_name: connector.connector_name.clone(),
            source_name: connector.source_name.clone(),
            connector_type: connector.connector_type,
            enabled: connector.enabled,
            active_source_key: active.map(|s| s.source_key.clone()),
            active_source_health: active.map(|s| s.health_score),
            last_run_status: latest.as_ref().map(|r| r.status),
            last_run_at: latest.as_ref().map(|r| r.started_at),
            last_success_at: checkpoint.as_ref().and_then(|c| c.last_success_at),
            checkpoint_publish_time: checkpoint.as_ref().and_then(|c| c.checkpoint_publish_time),
            pending_failures: pending,
            dead_failures: dead,
        });
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn to_connector(row: &SqliteRow) -> Result<ConnectorRecord> {
    Ok(ConnectorRecord {
        id: row.try_get("id")?,
        created_at: from_iso(&row.try_get::<String, _>("created_at")?)?,
        updated_at: from_iso(&row.try_get::<String, _>("updated_at")?)?,
        connector_name: row.try_get("connector_name")?,
        source_name: row.try_get("source_name")?,
        connector_type: ConnectorType::parse(&row.try_get::<String, _>("connector_type")?)?,
        enabled: row.try_get::<i64, _>("enabled")? != 0,
        fetch_limit: row.try_get("fetch_limit")?,
        poll_interval_minutes: row.try_get("poll_interval_minutes")?,
        replay_backoff_seconds: row.try_get("replay_backoff_seconds")?,
        max_retry: row.try_get("max_retry")?,
        config: serde_json::from_str(&row.try_get::<String, _>("config")?)
            .unwrap_or(Value::Object(serde_json::Map::new())),
        created_by: row.try_get("created_by")?,
        note: row.try_get("note")?,
    })
}

fn to_checkpoint(row: &SqliteRow) -> Result<CheckpointRecord> {
    Ok(CheckpointRecord {
        connector_name: row.try_get("connector_name")?,
        checkpoint_cursor: row.try_get("checkpoint_cursor")?,
        checkpoint_publish_time: from_iso_opt(row.try_get("checkpoint_publish_time")?)?,
        updated_at: from_iso(&row.try_get::<String, _>("updated_at")?)?,
        last_run_at: from_iso_opt(row.try_get("last_run_at")?)?,
        last_success_at: from_iso_opt(row.try_get("last_success_at")?)?,
    })
}

fn to_run(row: &SqliteRow) -> Result<ConnectorRunRecord> {
    Ok(ConnectorRunRecord {
        run_id: row.try_get("run_id")?,
        connector_name: row.try_get("connector_name")?,
        source_name: row.try_get("source_name")?,
        started_at: from_iso(&row.try_get::<String, _>("started_at")?)?,
        finished_at: from_iso_opt(row.try_get("finished_at")?)?,
        status: RunStatus::parse(&row.try_get::<String, _>("status")?)?,
        triggered_by: row.try_get("triggered_by")?,
        pulled_count: row.try_get("pulled_count")?,
        normalized_count: row.try_get("normalized_count")?,
        inserted_count: row.try_get("inserted_count")?,
        updated_count: row.try_get("updated_count")?,
        failed_count: row.try_get("failed_count")?,
        replayed_count: row.try_get("replayed_count")?,
        checkpoint_before: row.try_get("checkpoint_before")?,
        checkpoint_after: row.try_get("checkpoint_after")?,
        error_message: row.try_get("error_message")?,
        details: serde_json::from_str(&row.try_get::<String, _>("details")?)
            .unwrap_or(Value::Object(serde_json::Map::new())),
    })
}

fn to_failure(row: &SqliteRow) -> Result<FailureRecord> {
    Ok(FailureRecord {
        id: row.try_get("id")?,
        connector_name: row.try_get("connector_name")?,
        source_name: row.try_get("source_name")?,
        run_id: row.try_get("run_id")?,
        created_at: from_iso(&row.try_get::<String, _>("created_at")?)?,
        updated_at: from_iso(&row.try_get::<String, _>("updated_at")?)?,
        status: FailureStatus::parse(&row.try_get::<String, _>("status")?)?,
        retry_count: row.try_get("retry_count")?,
        next_retry_at: from_iso_opt(row.try_get("next_retry_at")?)?,
        last_error: row.try_get("last_error")?,
        payload: serde_json::from_str(&row.try_get::<String, _>("payload")?)
            .unwrap_or(Value::Object(serde_json::Map::new())),
    })
}

fn to_source_state(row: &SqliteRow, now: DateTime<Utc>) -> Result<SourceStateRecord> {
    let health_score: f64 = row.try_get("health_score")?;
    let last_attempt_at = from_iso_opt(row.try_get("last_attempt_at")?)?;

    // Staleness penalty: up to 20 points, one point per 30 idle minutes.
    let stale_penalty = match last_attempt_at {
        Some(at) => {
            let stale_minutes = (now - at).num_seconds().max(0) as f64 / 60.0;
            (stale_minutes / 30.0).min(20.0)
        }
        None => 0.0,
    };
    let effective = (health_score - stale_penalty).max(0.0);

    Ok(SourceStateRecord {
        connector_name: row.try_get("connector_name")?,
        source_key: row.try_get("source_key")?,
        connector_type: ConnectorType::parse(&row.try_get::<String, _>("connector_type")?)?,
        priority: row.try_get("priority")?,
        enabled: row.try_get::<i64, _>("enabled")? != 0,
        health_score,
        effective_health_score: (effective * 10_000.0).round() / 10_000.0,
        consecutive_failures: row.try_get("consecutive_failures")?,
        total_success: row.try_get("total_success")?,
        total_failures: row.try_get("total_failures")?,
        last_latency_ms: row.try_get("last_latency_ms")?,
        last_error: row.try_get("last_error")?,
        last_attempt_at,
        last_success_at: from_iso_opt(row.try_get("last_success_at")?)?,
        last_failure_at: from_iso_opt(row.try_get("last_failure_at")?)?,
        checkpoint_cursor: row.try_get("checkpoint_cursor")?,
        checkpoint_publish_time: from_iso_opt(row.try_get("checkpoint_publish_time")?)?,
        is_active: row.try_get::<i64, _>("is_active")? != 0,
    })
}
