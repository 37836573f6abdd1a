//! Tushare announcement source.
//!
//! Speaks the provider's HTTP envelope: a POST carrying
//! `{api_name, token, params, fields}`, answered by
//! `{code, msg, data: {fields: [...], items: [[...], ...]}}`.
//! The date window is derived from the cursor minus `lookback_days` in the
//! source timezone; the initial pull looks back one year.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use chrono_tz::Tz;
use serde::Deserialize;
use serde_json::{Map, Value};

use evd_schemas::ConnectorType;

use crate::{
    cfg_i64, cfg_map, cfg_str, cfg_timeout_seconds, cfg_timezone, finish_batch, parse_cursor,
    row_to_record, AnnouncementConnector, FetchError, FetchOutcome, FieldCandidates,
};

const DEFAULT_ENDPOINT: &str = "http://api.tushare.pro";
const INITIAL_LOOKBACK_DAYS: i64 = 365;

#[derive(Debug)]
pub struct TushareAnnouncementConnector {
    token: String,
    endpoint: String,
    api_name: String,
    start_param: String,
    end_param: String,
    symbol_param: String,
    symbol_value: Option<String>,
    lookback_days: i64,
    timezone: String,
    extra_params: Map<String, Value>,
    timeout_seconds: u64,
    fields: FieldCandidates,
}

impl TushareAnnouncementConnector {
    pub fn from_config(config: &Value) -> Result<Self, FetchError> {
        let token = cfg_str(config, "token")
            .ok_or_else(|| FetchError::Config("tushare connector requires token in config.token".to_string()))?;

        let mut fields = FieldCandidates::http_defaults();
        // Tushare labels the announcement date `f_ann_date`/`ann_date`.
        fields.publish_time = ["f_ann_date", "ann_date", "publish_time", "pub_date"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        Ok(Self {
            token,
            endpoint: cfg_str(config, "endpoint").unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            api_name: cfg_str(config, "api_name").unwrap_or_else(|| "anns_d".to_string()),
            start_param: cfg_str(config, "start_param").unwrap_or_else(|| "start_date".to_string()),
            end_param: cfg_str(config, "end_param").unwrap_or_else(|| "end_date".to_string()),
            symbol_param: cfg_str(config, "symbol_param").unwrap_or_else(|| "ts_code".to_string()),
            symbol_value: cfg_str(config, "ts_code"),
            lookback_days: cfg_i64(config, "lookback_days").unwrap_or(2).max(0),
            timezone: cfg_timezone(config),
            extra_params: cfg_map(config, "request_params"),
            timeout_seconds: cfg_timeout_seconds(config),
            fields,
        })
    }
}

#[derive(Debug, Deserialize)]
struct TushareResponse {
    code: i64,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    data: Option<TushareFrame>,
}

#[derive(Debug, Deserialize)]
struct TushareFrame {
    #[serde(default)]
    fields: Vec<String>,
    #[serde(default)]
    items: Vec<Vec<Value>>,
}

#[async_trait]
impl AnnouncementConnector for TushareAnnouncementConnector {
    fn connector_type(&self) -> ConnectorType {
        ConnectorType::TushareAnnouncement
    }

    async fn fetch(&self, cursor: Option<&str>, limit: usize) -> Result<FetchOutcome, FetchError> {
        let cursor_dt = parse_cursor(cursor);
        let tz: Tz = self.timezone.parse().unwrap_or(chrono_tz::UTC);
        let now_local = Utc::now().with_timezone(&tz);
        let start_local = match cursor_dt {
            Some(cursor) => cursor.with_timezone(&tz) - ChronoDuration::days(self.lookback_days),
            None => now_local - ChronoDuration::days(INITIAL_LOOKBACK_DAYS),
        };

        let mut params = self.extra_params.clone();
        params.insert(
            self.start_param.clone(),
            Value::String(start_local.format("%Y%m%d").to_string()),
        );
        params.insert(
            self.end_param.clone(),
            Value::String(now_local.format("%Y%m%d").to_string()),
        );
        if let Some(symbol) = &self.symbol_value {
            params.insert(self.symbol_param.clone(), Value::String(symbol.clone()));
        }

        let body = serde_json::json!({
            "api_name": self.api_name,
            "token": self.token,
            "params": Value::Object(params),
            "fields": "",
        });

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_seconds))
            .build()
            .map_err(|err| FetchError::Transport(format!("http client build failed: {err}")))?;
        let response = client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|err| FetchError::Transport(format!("tushare request failed: {err}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Api {
                code: Some(status.as_u16() as i64),
                message: format!("tushare http status {status}"),
            });
        }

        let parsed: TushareResponse = response
            .json()
            .await
            .map_err(|err| FetchError::Decode(format!("tushare response decode failed: {err}")))?;
        if parsed.code != 0 {
            return Err(FetchError::Api {
                code: Some(parsed.code),
                message: parsed.msg.unwrap_or_else(|| "unknown tushare error".to_string()),
            });
        }

        let frame = parsed.data.unwrap_or(TushareFrame { fields: Vec::new(), items: Vec::new() });
        if frame.items.is_empty() {
            return Ok(finish_batch(Vec::new(), cursor_dt));
        }

        let mut records = Vec::new();
        for item in &frame.items {
            let mut row = Map::new();
            for (field, value) in frame.fields.iter().zip(item.iter()) {
                row.insert(field.clone(), value.clone());
            }
            let Some(record) = row_to_record(&row, &self.fields, &self.timezone, cursor_dt) else {
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
    use httpmock::prelude::*;
    use serde_json::json;

    fn connector(endpoint: String) -> TushareAnnouncementConnector {
        TushareAnnouncementConnector::from_config(&json!({
            "token": "test-token",
            "endpoint": endpoint,
            "timezone": "Asia/Shanghai",
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn decodes_column_frame_into_records() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/").json_body_partial(
                    json!({"api_name": "anns_d", "token": "test-token"}).to_string(),
                );
                then.status(200).json_body(json!({
                    "code": 0,
                    "msg": null,
                    "data": {
                        "fields": ["ann_id", "ts_code", "title", "ann_date"],
                        "items": [
                            ["t-1", "600000.SH", "回购进展公告", "20240506"],
                            ["t-2", "600000.SH", "分红公告", "20240507"]
                        ]
                    }
                }));
            })
            .await;

        let outcome = connector(server.url("/")).fetch(None, 10).await.unwrap();
        mock.assert_async().await;
        assert_eq!(outcome.records.len(), 2);
        assert_eq!(outcome.records[0].source_event_id.as_deref(), Some("t-1"));
        assert_eq!(outcome.records[0].ts_code.as_deref(), Some("600000.SH"));
        assert!(outcome.records[0].publish_time < outcome.records[1].publish_time);
    }

    #[tokio::test]
    async fn non_zero_code_is_an_api_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/");
                then.status(200)
                    .json_body(json!({"code": 40001, "msg": "token invalid"}));
            })
            .await;

        let err = connector(server.url("/")).fetch(None, 10).await.unwrap_err();
        match err {
            FetchError::Api { code, message } => {
                assert_eq!(code, Some(40001));
                assert!(message.contains("token invalid"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn empty_frame_keeps_cursor() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/");
                then.status(200)
                    .json_body(json!({"code": 0, "data": {"fields": [], "items": []}}));
            })
            .await;

        let cursor = "2024-05-06T00:00:00Z";
        let outcome = connector(server.url("/")).fetch(Some(cursor), 10).await.unwrap();
        assert!(outcome.records.is_empty());
        assert_eq!(parse_cursor(outcome.next_cursor.as_deref()), parse_cursor(Some(cursor)));
    }

    #[test]
    fn missing_token_is_a_config_error() {
        let err = TushareAnnouncementConnector::from_config(&json!({})).unwrap_err();
        assert!(matches!(err, FetchError::Config(_)));
    }
}
