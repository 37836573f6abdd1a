//! AkShare announcement source, reached through an AKTools-style HTTP
//! gateway (`GET {base_url}/{api_name}` returning a JSON list of rows).
//!
//! The upstream surface is uneven: several API names cover announcements
//! and their accepted parameters differ by deployment. The adapter walks an
//! ordered `api_candidates` list and, for each, a list of
//! `request_variants`, keeping the first non-empty frame. Chinese-labeled
//! columns are resolved through a configurable `column_map` merged over
//! built-in defaults.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use chrono_tz::Tz;
use serde_json::{Map, Value};

use evd_schemas::ConnectorType;

use crate::{
    cfg_i64, cfg_map, cfg_str, cfg_timeout_seconds, cfg_timezone, finish_batch, parse_cursor,
    row_to_record, value_to_string, AnnouncementConnector, FetchError, FetchOutcome,
    FieldCandidates,
};

#[derive(Debug)]
pub struct AkshareAnnouncementConnector {
    base_url: String,
    api_candidates: Vec<String>,
    request_kwargs: Map<String, Value>,
    request_variants: Vec<Map<String, Value>>,
    timezone: String,
    lookback_days: i64,
    symbol: Option<String>,
    timeout_seconds: u64,
    fields: FieldCandidates,
}

impl AkshareAnnouncementConnector {
    pub fn from_config(config: &Value) -> Result<Self, FetchError> {
        let base_url = cfg_str(config, "base_url")
            .ok_or_else(|| FetchError::Config("akshare connector requires config.base_url".to_string()))?;

        let api_name = cfg_str(config, "api_name").unwrap_or_else(|| "stock_notice_report".to_string());
        let mut api_candidates = vec![api_name];
        if let Some(raw) = config.get("api_candidates").and_then(Value::as_array) {
            for item in raw {
                let name = value_to_string(item);
                let name = name.trim();
                if name.is_empty() || api_candidates.iter().any(|x| x == name) {
                    continue;
                }
                api_candidates.push(name.to_string());
            }
        }

        let request_variants: Vec<Map<String, Value>> = config
            .get("request_variants")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_object)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_candidates,
            request_kwargs: cfg_map(config, "request_kwargs"),
            request_variants,
            timezone: cfg_timezone(config),
            lookback_days: cfg_i64(config, "lookback_days").unwrap_or(7).clamp(0, 3650),
            symbol: cfg_str(config, "symbol"),
            timeout_seconds: cfg_timeout_seconds(config),
            fields: field_candidates(config),
        })
    }

    fn build_request_variants(&self, cursor_dt: Option<chrono::DateTime<Utc>>) -> Vec<Map<String, Value>> {
        let base_variants: Vec<Map<String, Value>> = if self.request_variants.is_empty() {
            vec![Map::new()]
        } else {
            self.request_variants.clone()
        };

        let tz: Tz = self.timezone.parse().unwrap_or(chrono_tz::UTC);
        let now_local = Utc::now().with_timezone(&tz);

        let mut out = Vec::with_capacity(base_variants.len());
        for variant in base_variants {
            let mut merged = self.request_kwargs.clone();
            for (key, value) in variant {
                merged.insert(key, value);
            }
            if let Some(symbol) = &self.symbol {
                if !merged.contains_key("symbol")
                    && !merged.contains_key("ts_code")
                    && !merged.contains_key("code")
                {
                    merged.insert("symbol".to_string(), Value::String(symbol.clone()));
                }
            }
            if let Some(cursor) = cursor_dt {
                let local_from = cursor.with_timezone(&tz) - ChronoDuration::days(self.lookback_days);
                let from = local_from.format("%Y%m%d").to_string();
                let until = now_local.format("%Y%m%d").to_string();
                merged.entry("start_date".to_string()).or_insert(Value::String(from.clone()));
                merged.entry("begin_date".to_string()).or_insert(Value::String(from));
                merged.entry("end_date".to_string()).or_insert(Value::String(until));
            }
            out.push(merged);
        }
        out
    }

    async fn call_api(
        &self,
        client: &reqwest::Client,
        api_name: &str,
        kwargs: &Map<String, Value>,
    ) -> Result<Vec<Map<String, Value>>, FetchError> {
        let url = format!("{}/{}", self.base_url, api_name);
        let query: Vec<(String, String)> =
            kwargs.iter().map(|(k, v)| (k.clone(), value_to_string(v))).collect();

        let response = client
            .get(&url)
            .query(&query)
            .send()
            .await
            .map_err(|err| FetchError::Transport(format!("akshare request failed: {err}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Api {
                code: Some(status.as_u16() as i64),
                message: format!("akshare http status {status}"),
            });
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|err| FetchError::Decode(format!("akshare response decode failed: {err}")))?;
        match payload {
            Value::Array(items) => Ok(items
                .into_iter()
                .filter_map(|item| item.as_object().cloned())
                .collect()),
            _ => Err(FetchError::Decode("akshare api did not return a record list".to_string())),
        }
    }
}

#[async_trait]
impl AnnouncementConnector for AkshareAnnouncementConnector {
    fn connector_type(&self) -> ConnectorType {
        ConnectorType::AkshareAnnouncement
    }

    async fn fetch(&self, cursor: Option<&str>, limit: usize) -> Result<FetchOutcome, FetchError> {
        let cursor_dt = parse_cursor(cursor);
        let variants = self.build_request_variants(cursor_dt);

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_seconds))
            .build()
            .map_err(|err| FetchError::Transport(format!("http client build failed: {err}")))?;

        let mut selected_rows: Option<Vec<Map<String, Value>>> = None;
        let mut selected_api = String::new();
        let mut selected_keys: Vec<String> = Vec::new();
        let mut had_empty_success = false;
        let mut errors: Vec<String> = Vec::new();

        'candidates: for api_name in &self.api_candidates {
            for kwargs in &variants {
                match self.call_api(&client, api_name, kwargs).await {
                    Ok(rows) if rows.is_empty() => {
                        had_empty_success = true;
                    }
                    Ok(rows) => {
                        selected_rows = Some(rows);
                        selected_api = api_name.clone();
                        selected_keys = kwargs.keys().cloned().collect();
                        break 'candidates;
                    }
                    Err(err) => {
                        errors.push(format!("api='{api_name}': {err}"));
                    }
                }
            }
        }

        let Some(rows) = selected_rows else {
            if had_empty_success {
                return Ok(finish_batch(Vec::new(), cursor_dt));
            }
            let summary = if errors.is_empty() {
                "no candidate API was executed".to_string()
            } else {
                errors[..errors.len().min(6)].join(" | ")
            };
            return Err(FetchError::Api {
                code: None,
                message: format!("akshare connector exhausted candidates: {summary}"),
            });
        };

        let mut records = Vec::new();
        for row in &rows {
            let Some(mut record) = row_to_record(row, &self.fields, &self.timezone, cursor_dt) else {
                continue;
            };
            record
                .metadata
                .insert("akshare_api_name".to_string(), Value::String(selected_api.clone()));
            if !selected_keys.is_empty() {
                let mut keys = selected_keys.clone();
                keys.sort();
                record
                    .metadata
                    .insert("akshare_request_keys".to_string(), Value::String(keys.join(",")));
            }
            if record.summary.trim().is_empty() {
                record.summary = record.title.clone();
            }
            records.push(record);
            if records.len() >= limit {
                break;
            }
        }

        Ok(finish_batch(records, cursor_dt))
    }
}

/// Built-in candidates include the Chinese provider labels; a per-field
/// `column_map` entry (string or list) takes priority over them.
fn field_candidates(config: &Value) -> FieldCandidates {
    let column_map = cfg_map(config, "column_map");

    let merged = |field: &str, defaults: &[&str]| -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        match column_map.get(field) {
            Some(Value::String(s)) if !s.trim().is_empty() => out.push(s.trim().to_string()),
            Some(Value::Array(items)) => {
                for item in items {
                    let name = value_to_string(item);
                    let name = name.trim();
                    if !name.is_empty() && !out.iter().any(|x| x == name) {
                        out.push(name.to_string());
                    }
                }
            }
            _ => {}
        }
        for name in defaults {
            if !out.iter().any(|x| x == name) {
                out.push(name.to_string());
            }
        }
        out
    };

    FieldCandidates {
        publish_time: merged(
            "publish_time",
            &[
                "publish_time",
                "publish_time_text",
                "f_ann_date",
                "ann_date",
                "pub_date",
                "date",
                "time",
                "公告日期",
                "发布时间",
                "公告时间",
                "日期",
            ],
        ),
        event_id: merged(
            "event_id",
            &["source_event_id", "event_id", "id", "ann_id", "notice_id", "公告编号", "公告ID", "编号"],
        ),
        symbol: merged(
            "symbol",
            &["symbol", "ts_code", "code", "ticker", "股票代码", "证券代码", "代码"],
        ),
        ts_code: merged(
            "ts_code",
            &["ts_code", "symbol", "code", "ticker", "证券代码", "股票代码", "代码"],
        ),
        title: merged(
            "title",
            &["title", "ann_title", "headline", "name", "notice_title", "公告标题", "标题"],
        ),
        summary: merged(
            "summary",
            &["summary", "brief", "description", "desc", "notice_type", "公告摘要", "摘要", "公告类型"],
        ),
        content: merged(
            "content",
            &["content", "detail", "body", "text", "content_text", "公告内容", "正文", "详情", "内容"],
        ),
        url: merged("url", &["url", "link", "notice_url", "公告链接", "链接", "地址"]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    #[tokio::test]
    async fn falls_back_to_second_api_and_maps_cn_columns() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/stock_notice_report");
                then.status(500).body("boom");
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/stock_notice_em");
                then.status(200).json_body(json!([
                    {
                        "公告编号": "ak-1",
                        "证券代码": "600519",
                        "公告标题": "回购进展公告",
                        "公告摘要": "公司继续推进股份回购",
                        "公告日期": "2024-05-06",
                        "公告链接": "https://example.com/ak-1"
                    }
                ]));
            })
            .await;

        let connector = AkshareAnnouncementConnector::from_config(&json!({
            "base_url": server.base_url(),
            "api_candidates": ["stock_notice_em"],
            "timezone": "Asia/Shanghai",
        }))
        .unwrap();

        let outcome = connector.fetch(None, 10).await.unwrap();
        assert_eq!(outcome.records.len(), 1);
        let record = &outcome.records[0];
        assert_eq!(record.source_event_id.as_deref(), Some("ak-1"));
        assert_eq!(record.symbol.as_deref(), Some("600519"));
        assert_eq!(record.title, "回购进展公告");
        assert_eq!(record.summary, "公司继续推进股份回购");
        assert_eq!(
            record.metadata.get("akshare_api_name").and_then(|v| v.as_str()),
            Some("stock_notice_em")
        );
    }

    #[tokio::test]
    async fn all_empty_candidates_return_empty_batch() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/stock_notice_report");
                then.status(200).json_body(json!([]));
            })
            .await;

        let connector = AkshareAnnouncementConnector::from_config(&json!({
            "base_url": server.base_url(),
        }))
        .unwrap();

        let cursor = "2024-05-06T00:00:00Z";
        let outcome = connector.fetch(Some(cursor), 10).await.unwrap();
        assert!(outcome.records.is_empty());
        assert_eq!(parse_cursor(outcome.next_cursor.as_deref()), parse_cursor(Some(cursor)));
    }

    #[tokio::test]
    async fn exhausted_candidates_is_an_api_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/stock_notice_report");
                then.status(500).body("boom");
            })
            .await;

        let connector = AkshareAnnouncementConnector::from_config(&json!({
            "base_url": server.base_url(),
        }))
        .unwrap();

        let err = connector.fetch(None, 10).await.unwrap_err();
        match err {
            FetchError::Api { message, .. } => assert!(message.contains("exhausted candidates")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn custom_column_map_takes_priority() {
        let fields = field_candidates(&json!({
            "column_map": {"title": ["my_title"]}
        }));
        assert_eq!(fields.title[0], "my_title");
        assert!(fields.title.iter().any(|c| c == "公告标题"));
    }

    #[test]
    fn missing_base_url_is_a_config_error() {
        let err = AkshareAnnouncementConnector::from_config(&json!({})).unwrap_err();
        assert!(matches!(err, FetchError::Config(_)));
    }
}
