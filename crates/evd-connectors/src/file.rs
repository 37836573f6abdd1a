//! File-backed announcement source: a JSON array or JSONL file on disk.
//! Used for offline fixtures and manual backfills.

use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::{Map, Value};

use evd_schemas::ConnectorType;

use crate::{
    cfg_str, cfg_timezone, finish_batch, parse_cursor, row_to_record, AnnouncementConnector,
    FetchError, FetchOutcome, FieldCandidates,
};

#[derive(Debug)]
pub struct FileAnnouncementConnector {
    path: PathBuf,
    timezone: String,
    fields: FieldCandidates,
}

impl FileAnnouncementConnector {
    pub fn from_config(config: &Value) -> Result<Self, FetchError> {
        let path = cfg_str(config, "file_path")
            .ok_or_else(|| FetchError::Config("file connector requires config.file_path".to_string()))?;
        Ok(Self {
            path: PathBuf::from(path),
            timezone: cfg_timezone(config),
            fields: FieldCandidates::http_defaults(),
        })
    }
}

#[async_trait]
impl AnnouncementConnector for FileAnnouncementConnector {
    fn connector_type(&self) -> ConnectorType {
        ConnectorType::FileAnnouncement
    }

    async fn fetch(&self, cursor: Option<&str>, limit: usize) -> Result<FetchOutcome, FetchError> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|err| FetchError::Transport(format!("connector file not found: {}: {err}", self.path.display())))?;

        let rows: Vec<Map<String, Value>> = if self
            .path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("jsonl"))
            .unwrap_or(false)
        {
            let mut rows = Vec::new();
            for line in content.lines() {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let value: Value = serde_json::from_str(trimmed)
                    .map_err(|err| FetchError::Decode(format!("invalid jsonl line: {err}")))?;
                match value {
                    Value::Object(map) => rows.push(map),
                    _ => return Err(FetchError::Decode("jsonl line must be an object".to_string())),
                }
            }
            rows
        } else {
            let value: Value = serde_json::from_str(&content)
                .map_err(|err| FetchError::Decode(format!("invalid json file: {err}")))?;
            match value {
                Value::Array(items) => items
                    .into_iter()
                    .map(|item| match item {
                        Value::Object(map) => Ok(map),
                        _ => Err(FetchError::Decode("connector file must be a list of records".to_string())),
                    })
                    .collect::<Result<Vec<_>, _>>()?,
                _ => return Err(FetchError::Decode("connector file must be a list of records".to_string())),
            }
        };

        let cursor_dt = parse_cursor(cursor);
        let mut records = Vec::new();
        for row in &rows {
            let Some(record) = row_to_record(row, &self.fields, &self.timezone, cursor_dt) else {
                continue;
            };
            records.push(record);
            if records.len() >= limit {
                break;
            }
        }

        Ok(finish_batch(records, cursor_dt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_fixture(dir: &tempfile::TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    fn connector_for(path: &std::path::Path) -> FileAnnouncementConnector {
        FileAnnouncementConnector::from_config(&serde_json::json!({
            "file_path": path.to_string_lossy(),
            "timezone": "Asia/Shanghai",
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn reads_json_array_and_respects_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_fixture(
            &dir,
            "ann.json",
            r#"[
                {"event_id": "a1", "symbol": "600000", "title": "回购公告", "publish_time": "2024-05-06 09:00:00"},
                {"event_id": "a2", "symbol": "600000", "title": "减持公告", "publish_time": "2024-05-07 09:00:00"}
            ]"#,
        );
        let connector = connector_for(&path);

        let first = connector.fetch(None, 100).await.unwrap();
        assert_eq!(first.records.len(), 2);
        assert_eq!(first.records[0].source_event_id.as_deref(), Some("a1"));

        // Re-fetch from the advanced cursor: nothing new.
        let second = connector.fetch(first.next_cursor.as_deref(), 100).await.unwrap();
        assert!(second.records.is_empty());
        assert_eq!(second.next_cursor, first.next_cursor);
    }

    #[tokio::test]
    async fn reads_jsonl_and_caps_at_limit() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_fixture(
            &dir,
            "ann.jsonl",
            concat!(
                r#"{"event_id": "a1", "symbol": "600000", "title": "t1", "publish_time": "2024-05-06"}"#,
                "\n",
                r#"{"event_id": "a2", "symbol": "600000", "title": "t2", "publish_time": "2024-05-07"}"#,
                "\n",
            ),
        );
        let connector = connector_for(&path);
        let outcome = connector.fetch(None, 1).await.unwrap();
        assert_eq!(outcome.records.len(), 1);
    }

    #[tokio::test]
    async fn missing_file_is_a_transport_error() {
        let dir = tempfile::tempdir().unwrap();
        let connector = connector_for(&dir.path().join("absent.json"));
        let err = connector.fetch(None, 10).await.unwrap_err();
        assert!(matches!(err, FetchError::Transport(_)));
    }

    #[test]
    fn missing_path_is_a_config_error() {
        let err = FileAnnouncementConnector::from_config(&serde_json::json!({})).unwrap_err();
        assert!(matches!(err, FetchError::Config(_)));
    }
}
