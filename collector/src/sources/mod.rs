pub mod file;
pub mod rest;

use crate::model::{CollectionOrder, Page};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use collector_core::{Error, Result};
use serde_json::Value;

/// A connector plugin: one external log source's pagination logic. Sources
/// are constructed fresh for every run and hold no cross-run state; all
/// progress lives in the cache behind the instance's pointer key.
#[async_trait]
pub trait LogSource: std::fmt::Debug + Send + Sync {
    fn kind(&self) -> &'static str;

    /// Ordering discipline, which decides the pointer scheme the runtime
    /// keeps for this source.
    fn order(&self) -> CollectionOrder;

    /// Fetch one page of records in retrieval order. `since` carries the
    /// current watermark for chronological sources; `cursor` is the
    /// resumption token, either from the stored pointer (cursor sources) or
    /// from the previous page of this run.
    async fn fetch_page(
        &self,
        since: Option<DateTime<Utc>>,
        cursor: Option<String>,
    ) -> Result<Page>;
}

/// Read a string-ish scalar at a JSON pointer path.
pub(crate) fn string_at(value: &Value, path: &str) -> Option<String> {
    match value.pointer(path)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Read an event time at a JSON pointer path. Accepts RFC 3339 strings and
/// epoch numbers (seconds, or milliseconds above the year-33658 cutoff).
pub(crate) fn timestamp_at(value: &Value, path: &str) -> Result<DateTime<Utc>> {
    let raw = value
        .pointer(path)
        .ok_or_else(|| Error::Validation(format!("record has no timestamp at '{path}'")))?;

    match raw {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|e| Error::Validation(format!("bad timestamp '{s}': {e}"))),
        Value::Number(n) => {
            let epoch = n
                .as_i64()
                .ok_or_else(|| Error::Validation(format!("bad epoch timestamp '{n}'")))?;
            let parsed = if epoch >= 1_000_000_000_000 {
                Utc.timestamp_millis_opt(epoch).single()
            } else {
                Utc.timestamp_opt(epoch, 0).single()
            };
            parsed.ok_or_else(|| Error::Validation(format!("epoch timestamp '{epoch}' out of range")))
        }
        other => Err(Error::Validation(format!(
            "unsupported timestamp value at '{path}': {other}"
        ))),
    }
}

pub use file::FileSource;
pub use rest::RestSource;
