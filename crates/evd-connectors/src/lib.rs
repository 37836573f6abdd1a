//! evd-connectors
//!
//! Typed announcement adapters. Each adapter pulls one batch from its
//! upstream, ordered by publish time ascending, together with the next
//! cursor and the latest publish time observed. Adapters never mutate
//! external state; failures propagate as [`FetchError`] for the runtime to
//! classify.

pub mod akshare;
pub mod file;
pub mod http_json;
pub mod tushare;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

use evd_nlp::parse_announcement_time;
use evd_schemas::{AnnouncementRawRecord, ConnectorType, Metadata};

pub use akshare::AkshareAnnouncementConnector;
pub use file::FileAnnouncementConnector;
pub use http_json::HttpJsonAnnouncementConnector;
pub use tushare::TushareAnnouncementConnector;

/// Default network timeout; per-connector `timeout_seconds` may raise it to
/// at most [`MAX_TIMEOUT_SECONDS`].
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 10;
pub const MAX_TIMEOUT_SECONDS: u64 = 60;

// ---------------------------------------------------------------------------
// Outcome & error types
// ---------------------------------------------------------------------------

/// One fetched batch.
#[derive(Debug, Clone, Default)]
pub struct FetchOutcome {
    /// Records ordered by publish time ascending.
    pub records: Vec<AnnouncementRawRecord>,
    /// High-water mark for the next run; `None` only when nothing has ever
    /// been observed.
    pub next_cursor: Option<String>,
    /// Latest publish time observed (drives SLA freshness).
    pub checkpoint_publish_time: Option<DateTime<Utc>>,
}

/// Errors an adapter may return.
#[derive(Debug)]
pub enum FetchError {
    /// Network or filesystem failure.
    Transport(String),
    /// The upstream returned an application-level error.
    Api { code: Option<i64>, message: String },
    /// A response payload could not be decoded.
    Decode(String),
    /// A required configuration value is missing or invalid.
    Config(String),
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::Transport(msg) => write!(f, "transport error: {msg}"),
            FetchError::Api { code: Some(c), message } => {
                write!(f, "provider api error code={c}: {message}")
            }
            FetchError::Api { code: None, message } => write!(f, "provider api error: {message}"),
            FetchError::Decode(msg) => write!(f, "decode error: {msg}"),
            FetchError::Config(msg) => write!(f, "config error: {msg}"),
        }
    }
}

impl std::error::Error for FetchError {}

// ---------------------------------------------------------------------------
// Connector trait & factory
// ---------------------------------------------------------------------------

/// Upstream announcement source contract.
///
/// Implementations must be object-safe (`Box<dyn AnnouncementConnector>`)
/// and `Send + Sync` so the runtime can hold them across await points.
#[async_trait]
pub trait AnnouncementConnector: Send + Sync {
    fn connector_type(&self) -> ConnectorType;

    /// Pull up to `limit` records strictly after `cursor`. A `None` cursor
    /// means an initial pull bounded by the adapter's lookback window.
    async fn fetch(&self, cursor: Option<&str>, limit: usize) -> Result<FetchOutcome, FetchError>;
}

/// Build the adapter for a resolved source-matrix candidate.
pub fn build_connector(
    connector_type: ConnectorType,
    config: &Value,
) -> Result<Box<dyn AnnouncementConnector>, FetchError> {
    match connector_type {
        ConnectorType::FileAnnouncement => {
            Ok(Box::new(FileAnnouncementConnector::from_config(config)?))
        }
        ConnectorType::HttpJsonAnnouncement => {
            Ok(Box::new(HttpJsonAnnouncementConnector::from_config(config)?))
        }
        ConnectorType::TushareAnnouncement => {
            Ok(Box::new(TushareAnnouncementConnector::from_config(config)?))
        }
        ConnectorType::AkshareAnnouncement => {
            Ok(Box::new(AkshareAnnouncementConnector::from_config(config)?))
        }
    }
}

// ---------------------------------------------------------------------------
// Shared config/row helpers
// ---------------------------------------------------------------------------

pub(crate) fn cfg_str(config: &Value, key: &str) -> Option<String> {
    config
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

pub(crate) fn cfg_i64(config: &Value, key: &str) -> Option<i64> {
    config.get(key).and_then(Value::as_i64)
}

pub(crate) fn cfg_map(config: &Value, key: &str) -> Map<String, Value> {
    config
        .get(key)
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

pub(crate) fn cfg_timezone(config: &Value) -> String {
    cfg_str(config, "timezone").unwrap_or_else(|| "Asia/Shanghai".to_string())
}

pub(crate) fn cfg_timeout_seconds(config: &Value) -> u64 {
    let raw = cfg_i64(config, "timeout_seconds").unwrap_or(DEFAULT_TIMEOUT_SECONDS as i64);
    (raw.max(1) as u64).min(MAX_TIMEOUT_SECONDS)
}

pub(crate) fn parse_cursor(cursor: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = cursor?.trim();
    if raw.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

pub(crate) fn cursor_iso(dt: Option<DateTime<Utc>>) -> Option<String> {
    dt.map(|t| t.to_rfc3339_opts(SecondsFormat::Micros, true))
}

/// First candidate key present with a non-blank value wins.
pub(crate) fn pick<'a>(row: &'a Map<String, Value>, candidates: &[String]) -> Option<&'a Value> {
    for name in candidates {
        if let Some(value) = row.get(name.as_str()) {
            if value.is_null() {
                continue;
            }
            if let Some(s) = value.as_str() {
                if s.trim().is_empty() {
                    continue;
                }
            }
            return Some(value);
        }
    }
    None
}

pub(crate) fn pick_existing_key<'a>(
    row: &Map<String, Value>,
    candidates: &'a [String],
) -> Option<&'a str> {
    candidates
        .iter()
        .find(|name| row.contains_key(name.as_str()))
        .map(|s| s.as_str())
}

pub(crate) fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    }
}

/// Flatten a provider cell into the scalar metadata representation.
pub(crate) fn safe_meta(value: &Value) -> Value {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => value.clone(),
        other => Value::String(other.to_string()),
    }
}

/// Candidate column names per logical record field, in priority order.
#[derive(Debug, Clone)]
pub(crate) struct FieldCandidates {
    pub publish_time: Vec<String>,
    pub event_id: Vec<String>,
    pub symbol: Vec<String>,
    pub ts_code: Vec<String>,
    pub title: Vec<String>,
    pub summary: Vec<String>,
    pub content: Vec<String>,
    pub url: Vec<String>,
}

impl FieldCandidates {
    pub fn http_defaults() -> Self {
        fn v(names: &[&str]) -> Vec<String> {
            names.iter().map(|s| s.to_string()).collect()
        }
        Self {
            publish_time: v(&["publish_time", "publish_time_text", "f_ann_date", "ann_date", "pub_date", "time"]),
            event_id: v(&["source_event_id", "event_id", "ann_id", "id"]),
            symbol: v(&["symbol", "ts_code", "code"]),
            ts_code: v(&["ts_code", "symbol", "code"]),
            title: v(&["title", "ann_title", "headline", "name"]),
            summary: v(&["summary", "brief", "description", "desc"]),
            content: v(&["content", "detail", "body", "text"]),
            url: v(&["url", "link"]),
        }
    }
}

/// Map one provider row into a raw announcement.
///
/// Returns `None` when the row has no parseable publish time or falls at or
/// before the cursor. Columns consumed by a field are excluded from
/// metadata; everything else is carried along as scalars.
pub(crate) fn row_to_record(
    row: &Map<String, Value>,
    fields: &FieldCandidates,
    timezone_name: &str,
    cursor_dt: Option<DateTime<Utc>>,
) -> Option<AnnouncementRawRecord> {
    let publish_raw = pick(row, &fields.publish_time)?;
    let publish_time = parse_announcement_time(&value_to_string(publish_raw), timezone_name)?;
    if let Some(cursor) = cursor_dt {
        if publish_time <= cursor {
            return None;
        }
    }

    let mut used_keys: Vec<&str> = Vec::new();
    for candidates in [
        &fields.publish_time,
        &fields.event_id,
        &fields.symbol,
        &fields.ts_code,
        &fields.title,
        &fields.summary,
        &fields.content,
        &fields.url,
    ] {
        if let Some(key) = pick_existing_key(row, candidates) {
            used_keys.push(key);
        }
    }

    let mut metadata = Metadata::new();
    for (key, value) in row {
        if used_keys.contains(&key.as_str()) {
            continue;
        }
        metadata.insert(key.clone(), safe_meta(value));
    }

    let symbol = pick(row, &fields.symbol).map(value_to_string);
    let ts_code = pick(row, &fields.ts_code).map(value_to_string).or_else(|| symbol.clone());
    let title = pick(row, &fields.title).map(value_to_string).unwrap_or_default();
    let summary = pick(row, &fields.summary).map(value_to_string).unwrap_or_default();

    Some(AnnouncementRawRecord {
        source_event_id: pick(row, &fields.event_id).map(value_to_string),
        symbol,
        ts_code,
        title,
        summary,
        content: pick(row, &fields.content).map(value_to_string).unwrap_or_default(),
        publish_time: Some(publish_time),
        publish_time_text: None,
        url: pick(row, &fields.url).map(value_to_string),
        metadata,
    })
}

/// Sort by publish time ascending and derive cursor/checkpoint from the
/// latest observation (falling back to the input cursor).
pub(crate) fn finish_batch(
    mut records: Vec<AnnouncementRawRecord>,
    cursor_dt: Option<DateTime<Utc>>,
) -> FetchOutcome {
    records.sort_by_key(|r| r.publish_time);
    let latest = records
        .iter()
        .filter_map(|r| r.publish_time)
        .max()
        .or(cursor_dt);
    FetchOutcome {
        records,
        next_cursor: cursor_iso(latest),
        checkpoint_publish_time: latest,
    }
}
