//! Source registry and normalized event records.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};

use evd_schemas::{
    DomainError, EventBatchIngestRequest, EventBatchIngestResult, EventFilter, EventMetricsRow,
    EventPolarity, EventRecord, EventSourceRecord, EventSourceRegisterRequest, EventSourceType,
    Metadata,
};

use crate::{clamp_limit, day_end_iso, day_start_iso, from_iso, from_iso_opt, to_iso, to_iso_opt};

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

/// Upsert a source by `source_name`; returns its row id.
pub async fn register_source(pool: &SqlitePool, req: &EventSourceRegisterRequest) -> Result<i64> {
    req.validate()?;
    let now = to_iso(Utc::now());

    sqlx::query(
        r#"
        INSERT INTO event_sources(
            created_at, updated_at, source_name, source_type, provider, timezone,
            ingestion_lag_minutes, reliability_score, description, created_by, note
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(source_name) DO UPDATE SET
            updated_at = excluded.updated_at,
            source_type = excluded.source_type,
            provider = excluded.provider,
            timezone = excluded.timezone,
            ingestion_lag_minutes = excluded.ingestion_lag_minutes,
            reliability_score = excluded.reliability_score,
            description = excluded.description,
            created_by = excluded.created_by,
            note = excluded.note
        "#,
    )
    .bind(&now)
    .bind(&now)
    .bind(&req.source_name)
    .bind(req.source_type.as_str())
    .bind(&req.provider)
    .bind(&req.timezone)
    .bind(req.ingestion_lag_minutes)
    .bind(req.reliability_score)
    .bind(&req.description)
    .bind(&req.created_by)
    .bind(&req.note)
    .execute(pool)
    .await
    .context("register_source failed")?;

    let row = sqlx::query("SELECT id FROM event_sources WHERE source_name = ? LIMIT 1")
        .bind(&req.source_name)
        .fetch_one(pool)
        .await
        .context("register_source id lookup failed")?;
    Ok(row.try_get("id")?)
}

pub async fn get_source(pool: &SqlitePool, source_name: &str) -> Result<Option<EventSourceRecord>> {
    let row = sqlx::query(
        r#"
        SELECT id, created_at, updated_at, source_name, source_type, provider, timezone,
               ingestion_lag_minutes, reliability_score, description, created_by, note
        FROM event_sources
        WHERE source_name = ?
        LIMIT 1
        "#,
    )
    .bind(source_name)
    .fetch_optional(pool)
    .await
    .context("get_source failed")?;

    row.map(|r| to_source(&r)).transpose()
}

pub async fn list_sources(pool: &SqlitePool, limit: i64) -> Result<Vec<EventSourceRecord>> {
    let rows = sqlx::query(
        r#"
        SELECT id, created_at, updated_at, source_name, source_type, provider, timezone,
               ingestion_lag_minutes, reliability_score, description, created_by, note
        FROM event_sources
        ORDER BY id DESC
        LIMIT ?
        "#,
    )
    .bind(clamp_limit(limit, 2000))
    .fetch_all(pool)
    .await
    .context("list_sources failed")?;

    rows.iter().map(to_source).collect()
}

fn to_source(row: &SqliteRow) -> Result<EventSourceRecord> {
    Ok(EventSourceRecord {
        id: row.try_get("id")?,
        created_at: from_iso(&row.try_get::<String, _>("created_at")?)?,
        updated_at: from_iso(&row.try_get::<String, _>("updated_at")?)?,
        source_name: row.try_get("source_name")?,
        source_type: EventSourceType::parse(&row.try_get::<String, _>("source_type")?)?,
        provider: row.try_get("provider")?,
        timezone: row.try_get("timezone")?,
        ingestion_lag_minutes: row.try_get("ingestion_lag_minutes")?,
        reliability_score: row.try_get("reliability_score")?,
        description: row.try_get("description")?,
        created_by: row.try_get("created_by")?,
        note: row.try_get("note")?,
    })
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Ingest a batch in its own transaction.
pub async fn ingest_events(
    pool: &SqlitePool,
    req: &EventBatchIngestRequest,
) -> Result<EventBatchIngestResult> {
    let mut tx = pool.begin().await.context("ingest begin failed")?;
    let result = ingest_events_in(&mut *tx, req).await?;
    tx.commit().await.context("ingest commit failed")?;
    Ok(result)
}

/// Ingest a batch on an existing connection/transaction.
///
/// The source must exist. Rows are validated and upserted one by one;
/// per-row errors are collected as `idx=N: message` and do not abort the
/// batch.
pub async fn ingest_events_in(
    conn: &mut SqliteConnection,
    req: &EventBatchIngestRequest,
) -> Result<EventBatchIngestResult> {
    req.validate()?;

    let exists: Option<(i64,)> = sqlx::query_as("SELECT id FROM event_sources WHERE source_name = ? LIMIT 1")
        .bind(&req.source_name)
        .fetch_optional(&mut *conn)
        .await
        .context("ingest source lookup failed")?;
    if exists.is_none() {
        return Err(DomainError::not_found(format!(
            "event source '{}' not found",
            req.source_name
        ))
        .into());
    }

    let now = to_iso(Utc::now());
    let mut inserted = 0i64;
    let mut updated = 0i64;
    let mut errors: Vec<String> = Vec::new();

    for (idx, event) in req.events.iter().enumerate() {
        if let Err(err) = event.validate() {
            errors.push(format!("idx={idx}: {err}"));
            continue;
        }

        let existing: Option<(i64,)> = sqlx::query_as(
            "SELECT id FROM event_records WHERE source_name = ? AND event_id = ? LIMIT 1",
        )
        .bind(&req.source_name)
        .bind(&event.event_id)
        .fetch_optional(&mut *conn)
        .await
        .context("ingest existence check failed")?;

        let tags_json = serde_json::to_string(&event.tags).context("tags serialize failed")?;
        let metadata_json =
            serde_json::to_string(&event.metadata).context("metadata serialize failed")?;

        let outcome = sqlx::query(
            r#"
            INSERT INTO event_records(
                created_at, updated_at, source_name, event_id, symbol, event_type,
                publish_time, effective_time, polarity, score, confidence, title, summary,
                raw_ref, tags, metadata
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(source_name, event_id) DO UPDATE SET
                updated_at = excluded.updated_at,
                symbol = excluded.symbol,
                event_type = excluded.event_type,
                publish_time = excluded.publish_time,
                effective_time = excluded.effective_time,
                polarity = excluded.polarity,
                score = excluded.score,
                confidence = excluded.confidence,
                title = excluded.title,
                summary = excluded.summary,
                raw_ref = excluded.raw_ref,
                tags = excluded.tags,
                metadata = excluded.metadata
            "#,
        )
        .bind(&now)
        .bind(&now)
        .bind(&req.source_name)
        .bind(&event.event_id)
        .bind(&event.symbol)
        .bind(&event.event_type)
        .bind(to_iso(event.publish_time))
        .bind(to_iso_opt(event.effective_time))
        .bind(event.polarity.as_str())
        .bind(event.score)
        .bind(event.confidence)
        .bind(&event.title)
        .bind(&event.summary)
        .bind(&event.raw_ref)
        .bind(tags_json)
        .bind(metadata_json)
        .execute(&mut *conn)
        .await;

        match outcome {
            Ok(_) => {
                if existing.is_some() {
                    updated += 1;
                } else {
                    inserted += 1;
                }
            }
            Err(err) => errors.push(format!("idx={idx}: {err}")),
        }
    }

    Ok(EventBatchIngestResult {
        source_name: req.source_name.clone(),
        inserted,
        updated,
        total: req.events.len() as i64,
        errors,
    })
}

pub async fn list_events(pool: &SqlitePool, filter: &EventFilter) -> Result<Vec<EventRecord>> {
    let mut sql = String::from(
        r#"
        SELECT id, created_at, updated_at, source_name, event_id, symbol, event_type,
               publish_time, effective_time, polarity, score, confidence, title, summary,
               raw_ref, tags, metadata
        FROM event_records
        "#,
    );
    let mut conditions: Vec<&str> = Vec::new();
    if filter.symbol.is_some() {
        conditions.push("symbol = ?");
    }
    if filter.source_name.is_some() {
        conditions.push("source_name = ?");
    }
    if filter.event_type.is_some() {
        conditions.push("event_type = ?");
    }
    if filter.start_time.is_some() {
        conditions.push("publish_time >= ?");
    }
    if filter.end_time.is_some() {
        conditions.push("publish_time <= ?");
    }
    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }
    sql.push_str(" ORDER BY publish_time DESC, id DESC LIMIT ?");

    let mut query = sqlx::query(&sql);
    if let Some(symbol) = &filter.symbol {
        query = query.bind(symbol);
    }
    if let Some(source) = &filter.source_name {
        query = query.bind(source);
    }
    if let Some(event_type) = &filter.event_type {
        query = query.bind(event_type);
    }
    if let Some(start) = filter.start_time {
        query = query.bind(to_iso(start));
    }
    if let Some(end) = filter.end_time {
        query = query.bind(to_iso(end));
    }
    let limit = if filter.limit > 0 { filter.limit } else { 200 };
    query = query.bind(clamp_limit(limit, 5000));

    let rows = query.fetch_all(pool).await.context("list_events failed")?;
    rows.iter().map(to_event).collect()
}

/// Lookup by event id alone, for callers that did not record the source.
/// The most recently published match wins.
pub async fn get_event_any_source(
    pool: &SqlitePool,
    event_id: &str,
) -> Result<Option<EventRecord>> {
    let row = sqlx::query(
        r#"
        SELECT id, created_at, updated_at, source_name, event_id, symbol, event_type,
               publish_time, effective_time, polarity, score, confidence, title, summary,
               raw_ref, tags, metadata
        FROM event_records
        WHERE event_id = ?
        ORDER BY publish_time DESC
        LIMIT 1
        "#,
    )
    .bind(event_id)
    .fetch_optional(pool)
    .await
    .context("get_event_any_source failed")?;

    row.map(|r| to_event(&r)).transpose()
}

pub async fn get_event(
    pool: &SqlitePool,
    source_name: &str,
    event_id: &str,
) -> Result<Option<EventRecord>> {
    let row = sqlx::query(
        r#"
        SELECT id, created_at, updated_at, source_name, event_id, symbol, event_type,
               publish_time, effective_time, polarity, score, confidence, title, summary,
               raw_ref, tags, metadata
        FROM event_records
        WHERE source_name = ? AND event_id = ?
        LIMIT 1
        "#,
    )
    .bind(source_name)
    .bind(event_id)
    .fetch_optional(pool)
    .await
    .context("get_event failed")?;

    row.map(|r| to_event(&r)).transpose()
}

/// Raw projection for drift aggregation over a local-date window.
pub async fn load_event_rows_for_metrics(
    pool: &SqlitePool,
    source_name: Option<&str>,
    start_date: chrono::NaiveDate,
    end_date: chrono::NaiveDate,
    limit: i64,
) -> Result<Vec<EventMetricsRow>> {
    let mut sql = String::from(
        r#"
        SELECT source_name, event_type, polarity, score, metadata
        FROM event_records
        WHERE publish_time >= ? AND publish_time <= ?
        "#,
    );
    if source_name.is_some() {
        sql.push_str(" AND source_name = ?");
    }
    sql.push_str(" ORDER BY publish_time DESC LIMIT ?");

    let mut query = sqlx::query(&sql)
        .bind(day_start_iso(start_date))
        .bind(day_end_iso(end_date));
    if let Some(source) = source_name {
        query = query.bind(source);
    }
    query = query.bind(clamp_limit(limit, 500_000));

    let rows = query
        .fetch_all(pool)
        .await
        .context("load_event_rows_for_metrics failed")?;

    rows.iter()
        .map(|row| {
            Ok(EventMetricsRow {
                source_name: row.try_get("source_name")?,
                event_type: row.try_get("event_type")?,
                polarity: EventPolarity::parse(&row.try_get::<String, _>("polarity")?)?,
                score: row.try_get("score")?,
                metadata: parse_metadata(&row.try_get::<String, _>("metadata")?),
            })
        })
        .collect()
}

fn to_event(row: &SqliteRow) -> Result<EventRecord> {
    let tags: Vec<String> =
        serde_json::from_str(&row.try_get::<String, _>("tags")?).unwrap_or_default();
    Ok(EventRecord {
        id: row.try_get("id")?,
        created_at: from_iso(&row.try_get::<String, _>("created_at")?)?,
        updated_at: from_iso(&row.try_get::<String, _>("updated_at")?)?,
        source_name: row.try_get("source_name")?,
        event_id: row.try_get("event_id")?,
        symbol: row.try_get("symbol")?,
        event_type: row.try_get("event_type")?,
        publish_time: from_iso(&row.try_get::<String, _>("publish_time")?)?,
        effective_time: from_iso_opt(row.try_get("effective_time")?)?,
        polarity: EventPolarity::parse(&row.try_get::<String, _>("polarity")?)?,
        score: row.try_get("score")?,
        confidence: row.try_get("confidence")?,
        title: row.try_get("title")?,
        summary: row.try_get("summary")?,
        raw_ref: row.try_get("raw_ref")?,
        tags,
        metadata: parse_metadata(&row.try_get::<String, _>("metadata")?),
    })
}

fn parse_metadata(raw: &str) -> Metadata {
    serde_json::from_str(raw).unwrap_or_default()
}
