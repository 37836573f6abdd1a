//! Generic JSON-over-HTTP announcement source.
//!
//! GET or POST with cursor/limit injected as query or body parameters and a
//! dotted `records_path` pointing at the record list inside the response.
//! `file://` and `local://` URLs load local fixture files, which keeps
//! connector configs testable offline.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use evd_schemas::ConnectorType;

use crate::{
    cfg_map, cfg_str, cfg_timeout_seconds, cfg_timezone, finish_batch, parse_cursor, row_to_record,
    AnnouncementConnector, FetchError, FetchOutcome, FieldCandidates,
};

pub struct HttpJsonAnnouncementConnector {
    url: String,
    method: String,
    headers: Map<String, Value>,
    query_params: Map<String, Value>,
    body: Map<String, Value>,
    records_path: String,
    cursor_param: String,
    limit_param: String,
    timeout_seconds: u64,
    timezone: String,
    fields: FieldCandidates,
}

impl HttpJsonAnnouncementConnector {
    pub fn from_config(config: &Value) -> Result<Self, FetchError> {
        let url = cfg_str(config, "url")
            .ok_or_else(|| FetchError::Config("http_json connector requires config.url".to_string()))?;
        Ok(Self {
            url,
            method: cfg_str(config, "method").unwrap_or_else(|| "GET".to_string()).to_uppercase(),
            headers: cfg_map(config, "headers"),
            query_params: cfg_map(config, "query_params"),
            body: cfg_map(config, "body"),
            records_path: cfg_str(config, "records_path").unwrap_or_default(),
            cursor_param: cfg_str(config, "cursor_param").unwrap_or_else(|| "cursor".to_string()),
            limit_param: cfg_str(config, "limit_param").unwrap_or_else(|| "limit".to_string()),
            timeout_seconds: cfg_timeout_seconds(config),
            timezone: cfg_timezone(config),
            fields: FieldCandidates::http_defaults(),
        })
    }

    async fn load_payload(&self, cursor: Option<&str>, limit: usize) -> Result<Value, FetchError> {
        if let Some(path) = self.url.strip_prefix("file://").or_else(|| self.url.strip_prefix("local://")) {
            let content = tokio::fs::read_to_string(path)
                .await
                .map_err(|err| FetchError::Transport(format!("fixture read failed: {path}: {err}")))?;
            return serde_json::from_str(&content)
                .map_err(|err| FetchError::Decode(format!("fixture json decode failed: {err}")));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_seconds))
            .build()
            .map_err(|err| FetchError::Transport(format!("http client build failed: {err}")))?;

        let mut request = match self.method.as_str() {
            "POST" | "PUT" | "PATCH" => {
                let mut body = self.body.clone();
                body.insert(self.limit_param.clone(), Value::from(limit as i64));
                if let Some(cursor) = cursor {
                    body.insert(self.cursor_param.clone(), Value::String(cursor.to_string()));
                }
                client
                    .request(
                        self.method.parse().unwrap_or(reqwest::Method::POST),
                        &self.url,
                    )
                    .json(&Value::Object(body))
            }
            _ => {
                let mut query: Vec<(String, String)> = self
                    .query_params
                    .iter()
                    .map(|(k, v)| (k.clone(), crate::value_to_string(v)))
                    .collect();
                query.push((self.limit_param.clone(), limit.to_string()));
                if let Some(cursor) = cursor {
                    query.push((self.cursor_param.clone(), cursor.to_string()));
                }
                client.get(&self.url).query(&query)
            }
        };

        request = request.header("Accept", "application/json");
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), crate::value_to_string(value));
        }

        let response = request
            .send()
            .await
            .map_err(|err| FetchError::Transport(format!("http request failed: {err}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Api {
                code: Some(status.as_u16() as i64),
                message: format!("http status {status}"),
            });
        }
        response
            .json::<Value>()
            .await
            .map_err(|err| FetchError::Decode(format!("response json decode failed: {err}")))
    }
}

#[async_trait]
impl AnnouncementConnector for HttpJsonAnnouncementConnector {
    fn connector_type(&self) -> ConnectorType {
        ConnectorType::HttpJsonAnnouncement
    }

    async fn fetch(&self, cursor: Option<&str>, limit: usize) -> Result<FetchOutcome, FetchError> {
        let payload = self.load_payload(cursor, limit).await?;
        let rows = extract_path(&payload, &self.records_path)
            .and_then(Value::as_array)
            .ok_or_else(|| FetchError::Decode("http_json connector response must map to a list".to_string()))?;

        let cursor_dt = parse_cursor(cursor);
        let mut records = Vec::new();
        for row in rows {
            let Some(map) = row.as_object() else { continue };
            let Some(record) = row_to_record(map, &self.fields, &self.timezone, cursor_dt) else {
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

/// Dotted-path traversal over maps and array indices. An empty path returns
/// the payload itself.
fn extract_path<'a>(payload: &'a Value, path: &str) -> Option<&'a Value> {
    if path.trim().is_empty() {
        return Some(payload);
    }
    let mut node = payload;
    for part in path.split('.').filter(|p| !p.trim().is_empty()) {
        node = match node {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => {
                let idx: usize = part.parse().ok()?;
                items.get(idx)?
            }
            _ => return None,
        };
    }
    Some(node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn extract_path_walks_maps_and_arrays() {
        let payload = json!({"data": {"items": [{"title": "t"}]}});
        assert!(extract_path(&payload, "data.items").unwrap().is_array());
        assert_eq!(
            extract_path(&payload, "data.items.0.title").unwrap(),
            &json!("t")
        );
        assert!(extract_path(&payload, "data.missing").is_none());
    }

    #[tokio::test]
    async fn fetches_from_file_url_fixture() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("http.json");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(
            r#"{"data": {"records": [
                {"event_id": "http-1", "symbol": "600000", "title": "回购公告", "publish_time": "2024-05-06 10:00:00"}
            ]}}"#
            .as_bytes(),
        )
        .unwrap();

        let connector = HttpJsonAnnouncementConnector::from_config(&json!({
            "url": format!("file://{}", path.display()),
            "records_path": "data.records",
            "timezone": "Asia/Shanghai",
        }))
        .unwrap();

        let outcome = connector.fetch(None, 10).await.unwrap();
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.records[0].source_event_id.as_deref(), Some("http-1"));
        assert!(outcome.checkpoint_publish_time.is_some());
    }

    #[tokio::test]
    async fn get_injects_cursor_and_limit_params() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/announcements")
                    .query_param("limit", "5")
                    .query_param("cursor", "2024-05-06T00:00:00Z");
                then.status(200).json_body(json!({"records": [
                    {"event_id": "h2", "symbol": "000001", "title": "增持公告", "publish_time": "2024-05-07 09:00:00"}
                ]}));
            })
            .await;

        let connector = HttpJsonAnnouncementConnector::from_config(&json!({
            "url": server.url("/announcements"),
            "records_path": "records",
        }))
        .unwrap();

        let outcome = connector.fetch(Some("2024-05-06T00:00:00Z"), 5).await.unwrap();
        mock.assert_async().await;
        assert_eq!(outcome.records.len(), 1);
    }

    #[tokio::test]
    async fn non_list_response_is_a_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, r#"{"records": {"not": "a list"}}"#).unwrap();

        let connector = HttpJsonAnnouncementConnector::from_config(&json!({
            "url": format!("local://{}", path.display()),
            "records_path": "records",
        }))
        .unwrap();

        let err = connector.fetch(None, 10).await.unwrap_err();
        assert!(matches!(err, FetchError::Decode(_)));
    }
}
