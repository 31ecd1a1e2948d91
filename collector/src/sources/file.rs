use super::{string_at, timestamp_at, LogSource};
use crate::model::{CollectionOrder, LogEntry, Page};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use collector_core::{Error, Result};
use serde_json::Value;
use std::path::PathBuf;

const DEFAULT_ID_PATH: &str = "/id";
const DEFAULT_TIMESTAMP_PATH: &str = "/timestamp";
const DEFAULT_PAGE_SIZE: usize = 500;

/// Local NDJSON file source, mainly for development and smoke testing the
/// engine without a vendor API. Each run re-reads the file from the top and
/// relies on the watermark to drop already-collected lines.
#[derive(Debug)]
pub struct FileSource {
    path: PathBuf,
    id_path: String,
    timestamp_path: String,
    page_size: usize,
}

impl FileSource {
    pub fn from_params(params: &serde_json::Map<String, Value>) -> Result<Self> {
        let path = params
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Config("file source requires the 'path' parameter".to_string()))?;

        let page_size = match params.get("page_size") {
            None => DEFAULT_PAGE_SIZE,
            Some(value) => value
                .as_u64()
                .and_then(|size| usize::try_from(size).ok())
                .filter(|size| *size > 0)
                .ok_or_else(|| {
                    Error::Config("parameter 'page_size' must be a positive integer".to_string())
                })?,
        };

        Ok(Self {
            path: PathBuf::from(path),
            id_path: params
                .get("id_path")
                .and_then(Value::as_str)
                .unwrap_or(DEFAULT_ID_PATH)
                .to_string(),
            timestamp_path: params
                .get("timestamp_path")
                .and_then(Value::as_str)
                .unwrap_or(DEFAULT_TIMESTAMP_PATH)
                .to_string(),
            page_size,
        })
    }
}

#[async_trait]
impl LogSource for FileSource {
    fn kind(&self) -> &'static str {
        "file"
    }

    fn order(&self) -> CollectionOrder {
        CollectionOrder::Chronological
    }

    async fn fetch_page(
        &self,
        _since: Option<DateTime<Utc>>,
        cursor: Option<String>,
    ) -> Result<Page> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::Config(format!(
                    "source file {} does not exist",
                    self.path.display()
                )))
            }
            Err(e) => return Err(e.into()),
        };

        let lines: Vec<&str> = raw.lines().filter(|line| !line.trim().is_empty()).collect();

        let start = match cursor {
            Some(cursor) => cursor
                .parse::<usize>()
                .map_err(|_| Error::Validation(format!("bad file cursor '{cursor}'")))?,
            None => 0,
        };
        let end = (start + self.page_size).min(lines.len());

        let mut entries = Vec::with_capacity(end.saturating_sub(start));
        for line in &lines[start.min(lines.len())..end] {
            let record: Value = serde_json::from_str(line)?;
            let id = string_at(&record, &self.id_path).ok_or_else(|| {
                Error::Validation(format!("line has no identifier at '{}'", self.id_path))
            })?;
            let timestamp = timestamp_at(&record, &self.timestamp_path)?;
            entries.push(LogEntry::new(id, timestamp, record));
        }

        let has_more = end < lines.len();
        Ok(Page {
            entries,
            cursor: has_more.then(|| end.to_string()),
            has_more,
        })
    }
}
