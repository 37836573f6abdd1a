//! evd-db
//!
//! The EventDesk event store: a single-file SQLite database holding sources,
//! normalized events, connector registry/runtime state, SLA alert state, and
//! NLP governance tables.
//!
//! Writers are serialized by capping the pool at one connection; multi-step
//! read-modify-write operations (source budgets, SLA alert states, run
//! ingest + checkpoint) additionally run inside explicit transactions.
//!
//! All timestamps are persisted as ISO-8601 UTC strings with a fixed
//! microsecond precision so lexicographic and chronological ordering agree.

use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqliteConnection, SqlitePool};

pub mod connectors;
pub mod events;
pub mod nlp;
pub mod sla;

pub use connectors::*;
pub use events::*;
pub use nlp::*;
pub use sla::*;

pub const ENV_DB_URL: &str = "EVD_DATABASE_URL";

/// Open (creating if missing) the store at `path`.
///
/// The pool holds exactly one connection: SQLite allows a single writer and
/// the store contract requires serialized writers, so the pool is the lock.
pub async fn connect(path: impl AsRef<Path>) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path.as_ref())
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .context("failed to open sqlite store")?;

    Ok(pool)
}

/// Connect using the `EVD_DATABASE_URL` env var (a path or sqlite URL).
pub async fn connect_from_env() -> Result<SqlitePool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;

    let options = SqliteConnectOptions::from_str(&url)
        .with_context(|| format!("invalid sqlite url in {ENV_DB_URL}"))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .context("failed to open sqlite store")?;

    Ok(pool)
}

/// Apply the schema. Idempotent: tables are `CREATE TABLE IF NOT EXISTS` and
/// later additions are guarded `ALTER TABLE ADD COLUMN`. Columns are never
/// dropped.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    for ddl in SCHEMA_DDL {
        sqlx::query(ddl)
            .execute(pool)
            .await
            .with_context(|| format!("schema statement failed: {}", ddl.lines().next().unwrap_or("")))?;
    }

    let mut conn = pool.acquire().await.context("migrate acquire failed")?;
    ensure_column(&mut conn, "event_connector_sla_alert_states", "last_escalated_at", "TEXT").await?;
    ensure_column(
        &mut conn,
        "event_connector_sla_alert_states",
        "escalation_level",
        "INTEGER NOT NULL DEFAULT 0",
    )
    .await?;
    ensure_column(
        &mut conn,
        "event_connector_sla_alert_states",
        "escalation_reason",
        "TEXT NOT NULL DEFAULT ''",
    )
    .await?;
    ensure_column(&mut conn, "event_nlp_drift_snapshots", "feedback_polarity_accuracy_delta", "REAL").await?;
    ensure_column(
        &mut conn,
        "event_nlp_drift_snapshots",
        "feedback_event_type_accuracy_delta",
        "REAL",
    )
    .await?;

    Ok(())
}

/// Add a column if it does not exist yet.
async fn ensure_column(
    conn: &mut SqliteConnection,
    table_name: &str,
    column_name: &str,
    column_type: &str,
) -> Result<()> {
    let rows = sqlx::query(&format!("PRAGMA table_info({table_name})"))
        .fetch_all(&mut *conn)
        .await
        .with_context(|| format!("pragma table_info failed for {table_name}"))?;

    let exists = rows.iter().any(|row| {
        row.try_get::<String, _>("name")
            .map(|name| name == column_name)
            .unwrap_or(false)
    });
    if exists {
        return Ok(());
    }

    sqlx::query(&format!("ALTER TABLE {table_name} ADD COLUMN {column_name} {column_type}"))
        .execute(conn)
        .await
        .with_context(|| format!("add column {table_name}.{column_name} failed"))?;
    Ok(())
}

const SCHEMA_DDL: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS event_sources (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        source_name TEXT NOT NULL UNIQUE,
        source_type TEXT NOT NULL,
        provider TEXT NOT NULL,
        timezone TEXT NOT NULL,
        ingestion_lag_minutes INTEGER NOT NULL,
        reliability_score REAL NOT NULL,
        description TEXT NOT NULL,
        created_by TEXT NOT NULL,
        note TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS event_records (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        source_name TEXT NOT NULL,
        event_id TEXT NOT NULL,
        symbol TEXT NOT NULL,
        event_type TEXT NOT NULL,
        publish_time TEXT NOT NULL,
        effective_time TEXT,
        polarity TEXT NOT NULL,
        score REAL NOT NULL,
        confidence REAL NOT NULL,
        title TEXT NOT NULL,
        summary TEXT NOT NULL,
        raw_ref TEXT,
        tags TEXT NOT NULL,
        metadata TEXT NOT NULL,
        UNIQUE(source_name, event_id)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_event_records_symbol_time
    ON event_records(symbol, publish_time DESC)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_event_records_source_time
    ON event_records(source_name, publish_time DESC)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS event_connectors (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        connector_name TEXT NOT NULL UNIQUE,
        source_name TEXT NOT NULL,
        connector_type TEXT NOT NULL,
        enabled INTEGER NOT NULL,
        fetch_limit INTEGER NOT NULL,
        poll_interval_minutes INTEGER NOT NULL,
        replay_backoff_seconds INTEGER NOT NULL,
        max_retry INTEGER NOT NULL,
        config TEXT NOT NULL,
        created_by TEXT NOT NULL,
        note TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS event_connector_checkpoints (
        connector_name TEXT PRIMARY KEY,
        checkpoint_cursor TEXT,
        checkpoint_publish_time TEXT,
        updated_at TEXT NOT NULL,
        last_run_at TEXT,
        last_success_at TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS event_connector_runs (
        run_id TEXT PRIMARY KEY,
        connector_name TEXT NOT NULL,
        source_name TEXT NOT NULL,
        started_at TEXT NOT NULL,
        finished_at TEXT,
        status TEXT NOT NULL,
        triggered_by TEXT NOT NULL,
        pulled_count INTEGER NOT NULL,
        normalized_count INTEGER NOT NULL,
        inserted_count INTEGER NOT NULL,
        updated_count INTEGER NOT NULL,
        failed_count INTEGER NOT NULL,
        replayed_count INTEGER NOT NULL,
        checkpoint_before TEXT,
        checkpoint_after TEXT,
        error_message TEXT,
        details TEXT NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_event_connector_runs_conn_time
    ON event_connector_runs(connector_name, started_at DESC)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS event_connector_failures (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        connector_name TEXT NOT NULL,
        source_name TEXT NOT NULL,
        run_id TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        status TEXT NOT NULL,
        retry_count INTEGER NOT NULL,
        next_retry_at TEXT,
        last_error TEXT NOT NULL,
        payload TEXT NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_event_connector_failures_lookup
    ON event_connector_failures(connector_name, status, next_retry_at)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS event_connector_source_states (
        connector_name TEXT NOT NULL,
        source_key TEXT NOT NULL,
        connector_type TEXT NOT NULL,
        priority INTEGER NOT NULL,
        enabled INTEGER NOT NULL,
        health_score REAL NOT NULL,
        consecutive_failures INTEGER NOT NULL,
        total_success INTEGER NOT NULL,
        total_failures INTEGER NOT NULL,
        last_latency_ms INTEGER,
        last_error TEXT NOT NULL,
        last_attempt_at TEXT,
        last_success_at TEXT,
        last_failure_at TEXT,
        checkpoint_cursor TEXT,
        checkpoint_publish_time TEXT,
        is_active INTEGER NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY(connector_name, source_key)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS event_connector_source_budgets (
        connector_name TEXT NOT NULL,
        source_key TEXT NOT NULL,
        window_hour TEXT NOT NULL,
        request_count INTEGER NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY(connector_name, source_key, window_hour)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS event_connector_source_credentials (
        connector_name TEXT NOT NULL,
        source_key TEXT NOT NULL,
        cursor INTEGER NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY(connector_name, source_key)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS event_connector_sla_alert_states (
        dedupe_key TEXT PRIMARY KEY,
        connector_name TEXT NOT NULL,
        source_name TEXT NOT NULL,
        breach_type TEXT NOT NULL,
        stage TEXT NOT NULL,
        severity TEXT NOT NULL,
        first_seen_at TEXT NOT NULL,
        last_seen_at TEXT NOT NULL,
        last_emitted_at TEXT,
        last_recovered_at TEXT,
        repeat_count INTEGER NOT NULL,
        is_open INTEGER NOT NULL,
        message TEXT NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_event_connector_sla_states_lookup
    ON event_connector_sla_alert_states(connector_name, is_open, last_seen_at DESC)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS event_connector_sla_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        observed_at TEXT NOT NULL,
        connector_name TEXT NOT NULL,
        source_name TEXT NOT NULL,
        breach_type TEXT NOT NULL,
        severity TEXT NOT NULL,
        stage TEXT NOT NULL,
        freshness_minutes INTEGER,
        pending_failures INTEGER NOT NULL,
        dead_failures INTEGER NOT NULL,
        message TEXT NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_event_connector_sla_history_lookup
    ON event_connector_sla_history(connector_name, observed_at DESC)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS event_nlp_rulesets (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        version TEXT NOT NULL UNIQUE,
        created_by TEXT NOT NULL,
        note TEXT NOT NULL,
        is_active INTEGER NOT NULL,
        rules_json TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS event_nlp_drift_snapshots (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        created_at TEXT NOT NULL,
        source_name TEXT,
        ruleset_version TEXT NOT NULL,
        current_start TEXT NOT NULL,
        current_end TEXT NOT NULL,
        baseline_start TEXT NOT NULL,
        baseline_end TEXT NOT NULL,
        sample_size INTEGER NOT NULL,
        hit_rate REAL NOT NULL,
        baseline_hit_rate REAL NOT NULL,
        hit_rate_delta REAL NOT NULL,
        score_p50 REAL NOT NULL,
        baseline_score_p50 REAL NOT NULL,
        score_p50_delta REAL NOT NULL,
        contribution_delta REAL,
        alerts_json TEXT NOT NULL,
        payload_json TEXT NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_event_nlp_drift_snapshots_lookup
    ON event_nlp_drift_snapshots(source_name, created_at DESC)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS event_nlp_label_feedback (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        source_name TEXT NOT NULL,
        event_id TEXT NOT NULL,
        symbol TEXT NOT NULL,
        publish_time TEXT NOT NULL,
        predicted_event_type TEXT NOT NULL,
        predicted_polarity TEXT NOT NULL,
        predicted_score REAL NOT NULL,
        label_event_type TEXT NOT NULL,
        label_polarity TEXT NOT NULL,
        label_score REAL,
        labeler TEXT NOT NULL,
        note TEXT NOT NULL,
        UNIQUE(source_name, event_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS event_nlp_label_entries (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        source_name TEXT NOT NULL,
        event_id TEXT NOT NULL,
        symbol TEXT NOT NULL,
        publish_time TEXT NOT NULL,
        predicted_score REAL NOT NULL,
        label_event_type TEXT NOT NULL,
        label_polarity TEXT NOT NULL,
        label_score REAL,
        labeler TEXT NOT NULL,
        note TEXT NOT NULL,
        UNIQUE(source_name, event_id, labeler)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS event_nlp_consensus (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        source_name TEXT NOT NULL,
        event_id TEXT NOT NULL,
        symbol TEXT NOT NULL,
        publish_time TEXT NOT NULL,
        consensus_event_type TEXT NOT NULL,
        consensus_polarity TEXT NOT NULL,
        consensus_score REAL,
        consensus_confidence REAL NOT NULL,
        label_count INTEGER NOT NULL,
        conflict INTEGER NOT NULL,
        conflict_reasons TEXT NOT NULL,
        adjudicated_by TEXT NOT NULL,
        label_version TEXT NOT NULL,
        UNIQUE(source_name, event_id)
    )
    "#,
];

// ---------------------------------------------------------------------------
// Timestamp helpers
// ---------------------------------------------------------------------------

/// Canonical persisted form: RFC 3339 UTC with microsecond precision and a
/// `Z` suffix, so string ordering matches time ordering.
pub fn to_iso(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn to_iso_opt(dt: Option<DateTime<Utc>>) -> Option<String> {
    dt.map(to_iso)
}

pub fn from_iso(value: &str) -> Result<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("invalid stored timestamp: {value}"))?;
    Ok(parsed.with_timezone(&Utc))
}

pub fn from_iso_opt(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    match value {
        Some(v) if !v.is_empty() => Ok(Some(from_iso(&v)?)),
        _ => Ok(None),
    }
}

/// Expand a local date bound to the start of its UTC day.
pub fn day_start_iso(d: NaiveDate) -> String {
    to_iso(DateTime::<Utc>::from_naive_utc_and_offset(d.and_time(NaiveTime::MIN), Utc))
}

/// Expand a local date bound to `23:59:59.999999` UTC.
pub fn day_end_iso(d: NaiveDate) -> String {
    let end = d
        .and_hms_micro_opt(23, 59, 59, 999_999)
        .expect("valid end-of-day time");
    to_iso(DateTime::<Utc>::from_naive_utc_and_offset(end, Utc))
}

pub(crate) fn clamp_limit(limit: i64, max: i64) -> i64 {
    limit.clamp(1, max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn iso_round_trip_preserves_instant() {
        let dt = Utc.with_ymd_and_hms(2024, 5, 6, 1, 30, 15).unwrap();
        let iso = to_iso(dt);
        assert!(iso.ends_with('Z'));
        assert_eq!(from_iso(&iso).unwrap(), dt);
    }

    #[test]
    fn iso_strings_order_chronologically() {
        let a = to_iso(Utc.with_ymd_and_hms(2024, 5, 6, 1, 30, 15).unwrap());
        let b = to_iso(Utc.with_ymd_and_hms(2024, 5, 6, 1, 30, 16).unwrap());
        assert!(a < b);
    }

    #[test]
    fn day_bounds_cover_the_whole_day() {
        let d = NaiveDate::from_ymd_opt(2024, 5, 6).unwrap();
        assert!(day_start_iso(d) < day_end_iso(d));
        assert!(day_end_iso(d).contains("23:59:59.999999"));
    }
}
