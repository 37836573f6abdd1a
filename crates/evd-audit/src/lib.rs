//! evd-audit
//!
//! Append-only audit log for governance-relevant operations. Writes JSON
//! Lines (one event per line) with canonically sorted keys; an optional hash
//! chain links consecutive events.
//!
//! Audit writes are best-effort by contract: `log_event` never fails the
//! calling operation. A write error is reported through `tracing` and
//! swallowed.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Audit event types emitted by the core.
pub const EVENT_SOURCE: &str = "event_source";
pub const EVENT_INGEST: &str = "event_ingest";
pub const EVENT_CONNECTOR: &str = "event_connector";
pub const EVENT_CONNECTOR_SLA: &str = "event_connector_sla";
pub const EVENT_CONNECTOR_SLA_ESCALATION: &str = "event_connector_sla_escalation";
pub const EVENT_CONNECTOR_SLA_RECOVERY: &str = "event_connector_sla_recovery";
pub const EVENT_NLP: &str = "event_nlp";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub seq: u64,
    pub ts_utc: DateTime<Utc>,
    pub event_type: String,
    pub action: String,
    pub status: String,
    pub payload: Value,
    pub hash_prev: Option<String>,
    pub hash_self: Option<String>,
}

struct AuditLogState {
    last_hash: Option<String>,
    seq: u64,
}

/// Append-only audit writer shared across subsystems.
pub struct AuditLog {
    path: PathBuf,
    hash_chain: bool,
    state: Mutex<AuditLogState>,
}

impl AuditLog {
    /// Creates the audit log and ensures parent dirs exist.
    pub fn new(path: impl AsRef<Path>, hash_chain: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create_dir_all {parent:?}"))?;
        }
        Ok(Self {
            path,
            hash_chain,
            state: Mutex::new(AuditLogState { last_hash: None, seq: 0 }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event. Best-effort: failures are logged and swallowed so
    /// the calling operation always commits.
    pub fn log_event(&self, event_type: &str, action: &str, status: &str, payload: Value) {
        if let Err(err) = self.append(event_type, action, status, payload) {
            tracing::warn!(event_type, action, error = %err, "audit append failed");
        }
    }

    fn append(&self, event_type: &str, action: &str, status: &str, payload: Value) -> Result<AuditEvent> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow::anyhow!("audit state lock poisoned"))?;

        let mut ev = AuditEvent {
            seq: state.seq,
            ts_utc: Utc::now(),
            event_type: event_type.to_string(),
            action: action.to_string(),
            status: status.to_string(),
            payload,
            hash_prev: None,
            hash_self: None,
        };
        state.seq += 1;

        if self.hash_chain {
            ev.hash_prev = state.last_hash.clone();
            let self_hash = compute_event_hash(&ev)?;
            ev.hash_self = Some(self_hash.clone());
            state.last_hash = Some(self_hash);
        }

        let line = canonical_json_line(&ev)?;
        append_line(&self.path, &line)?;
        Ok(ev)
    }

    /// Read back all events (test/ops helper).
    pub fn read_all(&self) -> Result<Vec<AuditEvent>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err).with_context(|| format!("read audit log {:?}", self.path)),
        };
        let mut out = Vec::new();
        for (i, line) in content.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let ev: AuditEvent = serde_json::from_str(trimmed)
                .with_context(|| format!("parse audit event at line {}", i + 1))?;
            out.push(ev);
        }
        Ok(out)
    }
}

/// Write a single line to file (with trailing newline).
fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open audit log {path:?}"))?;
    f.write_all(line.as_bytes()).context("write audit line failed")?;
    f.write_all(b"\n").context("write newline failed")?;
    Ok(())
}

/// Canonicalize by sorting keys recursively and emitting compact JSON.
/// One event == one JSON line.
fn canonical_json_line<T: Serialize>(v: &T) -> Result<String> {
    let raw = serde_json::to_value(v).context("serialize audit event failed")?;
    let sorted = sort_keys(&raw);
    serde_json::to_string(&sorted).context("json stringify failed")
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut new = serde_json::Map::new();
            for k in keys {
                new.insert(k.clone(), sort_keys(&map[&k]));
            }
            Value::Object(new)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}

/// Hash is computed from canonical JSON of the event WITHOUT hash_self.
pub fn compute_event_hash(ev: &AuditEvent) -> Result<String> {
    let mut clone = ev.clone();
    clone.hash_self = None;
    let canonical = canonical_json_line(&clone)?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn events_append_in_sequence_with_chain() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path().join("audit.jsonl"), true).unwrap();

        log.log_event(EVENT_SOURCE, "register", "OK", json!({"source_name": "ann_cn"}));
        log.log_event(EVENT_INGEST, "batch", "OK", json!({"inserted": 2}));

        let events = log.read_all().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].seq, 0);
        assert_eq!(events[1].seq, 1);
        assert!(events[0].hash_prev.is_none());
        assert_eq!(events[1].hash_prev, events[0].hash_self);
        assert_eq!(
            events[1].hash_self.as_deref().unwrap(),
            compute_event_hash(&events[1]).unwrap()
        );
    }

    #[test]
    fn log_event_swallows_write_failures() {
        let dir = tempfile::tempdir().unwrap();
        // A directory at the log path makes the open fail.
        let path = dir.path().join("blocked");
        fs::create_dir_all(&path).unwrap();
        let log = AuditLog::new(&path, false).unwrap();
        log.log_event(EVENT_NLP, "activate", "OK", json!({}));
    }

    #[test]
    fn read_all_on_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path().join("none.jsonl"), false).unwrap();
        assert!(log.read_all().unwrap().is_empty());
    }
}
