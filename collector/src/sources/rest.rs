use super::{string_at, timestamp_at, LogSource};
use crate::model::{CollectionOrder, LogEntry, Page};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use collector_core::{Error, Result};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use reqwest::StatusCode;
use serde_json::Value;
use std::num::NonZeroU32;
use std::time::Duration;
use tracing::debug;

const DEFAULT_ID_PATH: &str = "/id";
const DEFAULT_TIMESTAMP_PATH: &str = "/created_at";
const DEFAULT_CURSOR_PARAM: &str = "cursor";
const DEFAULT_PAGE_SIZE_PARAM: &str = "limit";
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Generic cursor-paged JSON API source. Vendor specifics are all carried
/// in instance parameters: where the records array lives, which fields hold
/// the identifier and event time, and how pagination tokens are exchanged.
#[derive(Debug)]
pub struct RestSource {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
    records_path: String,
    id_path: String,
    timestamp_path: String,
    cursor_path: Option<String>,
    has_more_path: Option<String>,
    cursor_param: String,
    since_param: Option<String>,
    page_size_param: String,
    page_size: Option<u64>,
    order: CollectionOrder,
    limiter: Option<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
}

impl RestSource {
    pub fn from_params(
        params: &serde_json::Map<String, Value>,
        token: Option<String>,
    ) -> Result<Self> {
        let url = required_str(params, "url")?;
        let records_path = required_str(params, "records_path")?;

        let timeout = optional_u64(params, "timeout_secs")?.unwrap_or(DEFAULT_TIMEOUT_SECS);
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout))
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;

        let order = match optional_str(params, "order")?.as_deref() {
            Some("cursor") => CollectionOrder::Cursor,
            Some("chronological") | None => CollectionOrder::Chronological,
            Some(other) => {
                return Err(Error::Config(format!(
                    "unknown order '{other}', expected 'chronological' or 'cursor'"
                )))
            }
        };

        let limiter = match optional_u64(params, "requests_per_minute")? {
            Some(limit) => {
                let limit = NonZeroU32::new(u32::try_from(limit).unwrap_or(0)).ok_or_else(|| {
                    Error::Config("requests_per_minute must be a positive integer".to_string())
                })?;
                Some(RateLimiter::direct(Quota::per_minute(limit)))
            }
            None => None,
        };

        Ok(Self {
            client,
            url,
            token,
            records_path,
            id_path: optional_str(params, "id_path")?.unwrap_or_else(|| DEFAULT_ID_PATH.to_string()),
            timestamp_path: optional_str(params, "timestamp_path")?
                .unwrap_or_else(|| DEFAULT_TIMESTAMP_PATH.to_string()),
            cursor_path: optional_str(params, "cursor_path")?,
            has_more_path: optional_str(params, "has_more_path")?,
            cursor_param: optional_str(params, "cursor_param")?
                .unwrap_or_else(|| DEFAULT_CURSOR_PARAM.to_string()),
            since_param: optional_str(params, "since_param")?,
            page_size_param: optional_str(params, "page_size_param")?
                .unwrap_or_else(|| DEFAULT_PAGE_SIZE_PARAM.to_string()),
            page_size: optional_u64(params, "page_size")?,
            order,
            limiter,
        })
    }

    fn parse_records(&self, body: &Value) -> Result<Vec<LogEntry>> {
        let records = body
            .pointer(&self.records_path)
            .and_then(Value::as_array)
            .ok_or_else(|| {
                Error::Validation(format!(
                    "response has no record array at '{}'",
                    self.records_path
                ))
            })?;

        let mut entries = Vec::with_capacity(records.len());
        for record in records {
            let id = string_at(record, &self.id_path).ok_or_else(|| {
                Error::Validation(format!("record has no identifier at '{}'", self.id_path))
            })?;
            let timestamp = timestamp_at(record, &self.timestamp_path)?;
            entries.push(LogEntry::new(id, timestamp, record.clone()));
        }

        Ok(entries)
    }
}

#[async_trait]
impl LogSource for RestSource {
    fn kind(&self) -> &'static str {
        "rest"
    }

    fn order(&self) -> CollectionOrder {
        self.order
    }

    async fn fetch_page(
        &self,
        since: Option<DateTime<Utc>>,
        cursor: Option<String>,
    ) -> Result<Page> {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }

        let mut query: Vec<(String, String)> = Vec::new();
        if let Some(size) = self.page_size {
            query.push((self.page_size_param.clone(), size.to_string()));
        }
        if let Some(cursor) = &cursor {
            query.push((self.cursor_param.clone(), cursor.clone()));
        } else if let (Some(param), Some(since)) = (&self.since_param, since) {
            query.push((param.clone(), since.to_rfc3339()));
        }

        let mut request = self.client.get(&self.url).query(&query);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.parse().ok());
            return Err(classify_status(status, retry_after, &self.url));
        }

        let body: Value = response.json().await?;
        let entries = self.parse_records(&body)?;

        let next_cursor = self
            .cursor_path
            .as_ref()
            .and_then(|path| string_at(&body, path));
        let has_more = match &self.has_more_path {
            Some(path) => {
                body.pointer(path).and_then(Value::as_bool).unwrap_or(false)
                    && next_cursor.is_some()
            }
            // Without an explicit flag, an empty page ends the run even if
            // the API keeps handing out cursors.
            None => next_cursor.is_some() && !entries.is_empty(),
        };

        debug!(
            url = %self.url,
            fetched = entries.len(),
            has_more,
            "Fetched page"
        );

        Ok(Page {
            entries,
            cursor: next_cursor,
            has_more,
        })
    }
}

fn classify_status(status: StatusCode, retry_after: Option<u64>, url: &str) -> Error {
    if status == StatusCode::TOO_MANY_REQUESTS {
        Error::RateLimit {
            retry_after_secs: retry_after.unwrap_or(60),
        }
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        Error::Auth(format!("{url} returned {status}"))
    } else if status.is_client_error() {
        Error::Config(format!("{url} rejected the request with {status}"))
    } else {
        Error::Source {
            connector: "rest".to_string(),
            details: format!("{url} returned {status}"),
        }
    }
}

fn required_str(params: &serde_json::Map<String, Value>, key: &str) -> Result<String> {
    optional_str(params, key)?
        .ok_or_else(|| Error::Config(format!("rest source requires the '{key}' parameter")))
}

fn optional_str(params: &serde_json::Map<String, Value>, key: &str) -> Result<Option<String>> {
    match params.get(key) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(Error::Config(format!(
            "parameter '{key}' must be a string, got {other}"
        ))),
    }
}

fn optional_u64(params: &serde_json::Map<String, Value>, key: &str) -> Result<Option<u64>> {
    match params.get(key) {
        None => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| Error::Config(format!("parameter '{key}' must be a positive integer"))),
        Some(other) => Err(Error::Config(format!(
            "parameter '{key}' must be an integer, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(values: Value) -> serde_json::Map<String, Value> {
        values.as_object().unwrap().clone()
    }

    fn source() -> RestSource {
        RestSource::from_params(
            &params(json!({
                "url": "https://corp.example.com/api/v2/audit_logs",
                "records_path": "/audit_logs",
                "cursor_path": "/meta/after_cursor",
                "has_more_path": "/meta/has_more",
            })),
            Some("token".to_string()),
        )
        .unwrap()
    }

    #[test]
    fn url_and_records_path_are_required() {
        let error = RestSource::from_params(&params(json!({})), None).unwrap_err();
        assert!(error.is_fatal());

        let error = RestSource::from_params(
            &params(json!({ "url": "https://example.com" })),
            None,
        )
        .unwrap_err();
        assert!(error.is_fatal());
    }

    #[test]
    fn unknown_order_is_rejected() {
        let error = RestSource::from_params(
            &params(json!({
                "url": "https://example.com",
                "records_path": "/items",
                "order": "random",
            })),
            None,
        )
        .unwrap_err();
        assert!(error.is_fatal());
    }

    #[test]
    fn records_are_normalized_in_retrieval_order() {
        let body = json!({
            "audit_logs": [
                { "id": 101, "created_at": "2026-01-02T03:04:05Z", "action": "login" },
                { "id": "102", "created_at": "2026-01-02T03:04:06Z", "action": "logout" },
            ],
            "meta": { "after_cursor": "abc", "has_more": true },
        });

        let entries = source().parse_records(&body).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, "101");
        assert_eq!(entries[1].id, "102");
        assert!(entries[0].timestamp < entries[1].timestamp);
        assert_eq!(entries[0].payload["action"], json!("login"));
    }

    #[test]
    fn record_without_identifier_is_a_validation_error() {
        let body = json!({ "audit_logs": [ { "created_at": "2026-01-02T03:04:05Z" } ] });
        assert!(source().parse_records(&body).unwrap_err().is_fatal());
    }

    #[test]
    fn status_classification_follows_the_taxonomy() {
        let rate_limited = classify_status(StatusCode::TOO_MANY_REQUESTS, Some(120), "u");
        assert!(matches!(
            rate_limited,
            Error::RateLimit { retry_after_secs: 120 }
        ));

        assert!(classify_status(StatusCode::UNAUTHORIZED, None, "u").is_fatal());
        assert!(classify_status(StatusCode::BAD_REQUEST, None, "u").is_fatal());
        assert!(classify_status(StatusCode::BAD_GATEWAY, None, "u").is_retryable());
    }
}
