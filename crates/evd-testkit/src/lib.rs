//! evd-testkit
//!
//! Shared fixtures for scenario tests: a temp-file store with migrations
//! applied, an audit log beside it, and helpers for seeding sources,
//! connectors, and announcement fixture files.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use sqlx::SqlitePool;
use tempfile::TempDir;

use evd_audit::AuditLog;
use evd_schemas::{
    ConnectorRegisterRequest, ConnectorType, EventSourceRegisterRequest, EventSourceType,
};
use evd_service::EventService;

/// A throwaway store. Keep the struct alive for the lifetime of the test —
/// dropping it removes the backing directory.
pub struct TestStore {
    pub pool: SqlitePool,
    pub audit: Arc<AuditLog>,
    pub dir: TempDir,
}

impl TestStore {
    pub async fn new() -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let pool = evd_db::connect(dir.path().join("evd.db")).await?;
        evd_db::migrate(&pool).await?;
        let audit = Arc::new(AuditLog::new(dir.path().join("audit.jsonl"), false)?);
        Ok(Self { pool, audit, dir })
    }

    pub fn service(&self) -> EventService {
        EventService::new(self.pool.clone(), Some(self.audit.clone()))
    }

    /// Write a JSON-array announcement fixture and return its path.
    pub fn write_fixture(&self, name: &str, rows: &[Value]) -> Result<PathBuf> {
        let path = self.dir.path().join(name);
        std::fs::write(&path, serde_json::to_string_pretty(&Value::Array(rows.to_vec()))?)?;
        Ok(path)
    }
}

/// Register a default announcement source.
pub async fn seed_source(service: &EventService, source_name: &str) -> Result<()> {
    let mut req = EventSourceRegisterRequest::new(source_name);
    req.source_type = EventSourceType::Announcement;
    req.provider = "exchange".to_string();
    req.reliability_score = 0.8;
    service.register_source(&req).await?;
    Ok(())
}

/// A file-connector registration request with the given config.
pub fn file_connector_request(
    connector_name: &str,
    source_name: &str,
    config: Value,
) -> ConnectorRegisterRequest {
    let mut req = ConnectorRegisterRequest::new(connector_name, source_name, ConnectorType::FileAnnouncement);
    req.config = config;
    req
}

/// Fixed publish times keep scenario assertions deterministic.
pub fn ts(year: i32, month: u32, day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, hour, minute, 0).unwrap()
}
