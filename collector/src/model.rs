use chrono::{DateTime, Utc};
use collector_core::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Addresses one collection stream: a connector kind plus the logical name
/// given to a configured instance of it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectorIdentity {
    pub connector: String,
    pub name: String,
}

impl ConnectorIdentity {
    pub fn new(connector: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            connector: connector.into(),
            name: name.into(),
        }
    }

    /// Canonical reference used to namespace cache keys and output metadata.
    pub fn reference(&self) -> String {
        format!("{}/{}", self.connector, self.name)
    }

    pub fn pointer_key(&self) -> String {
        format!("pointer/{}", self.reference())
    }

    pub fn marker_key(&self) -> String {
        format!("marker/{}", self.reference())
    }

    pub fn last_run_key(&self) -> String {
        format!("last/{}", self.reference())
    }
}

impl fmt::Display for ConnectorIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.connector, self.name)
    }
}

/// Normalized unit of collected data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Source-assigned record identifier, unique within the stream.
    pub id: String,
    /// Event time reported by the source; drives the watermark.
    pub timestamp: DateTime<Utc>,
    pub collected_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl LogEntry {
    pub fn new(id: impl Into<String>, timestamp: DateTime<Utc>, payload: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            timestamp,
            collected_at: Utc::now(),
            payload,
        }
    }
}

/// One page of records as returned by a source, in retrieval order.
#[derive(Debug, Clone)]
pub struct Page {
    pub entries: Vec<LogEntry>,
    pub cursor: Option<String>,
    pub has_more: bool,
}

/// Ordering discipline of a source, which decides the pointer scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionOrder {
    /// Records carry comparable event times; progress is a watermark plus a
    /// tie-break set of identifiers seen exactly at the watermark instant.
    Chronological,
    /// The API hands out an opaque resumption token with strict ordering,
    /// so no client-side dedup is needed.
    Cursor,
}

/// Persisted progress for one identity. Overwritten only after a successful
/// output flush, via a conditional cache write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Pointer {
    Watermark {
        at: DateTime<Utc>,
        /// Identifiers of records observed exactly at `at`. Cleared once the
        /// watermark moves past that instant.
        seen: BTreeSet<String>,
    },
    Cursor {
        token: Option<String>,
    },
}

impl Pointer {
    pub fn watermark(at: DateTime<Utc>) -> Self {
        Pointer::Watermark {
            at,
            seen: BTreeSet::new(),
        }
    }

    pub fn cursor() -> Self {
        Pointer::Cursor { token: None }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn watermark_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Pointer::Watermark { at, .. } => Some(*at),
            Pointer::Cursor { .. } => None,
        }
    }

    pub fn cursor_token(&self) -> Option<String> {
        match self {
            Pointer::Watermark { .. } => None,
            Pointer::Cursor { token } => token.clone(),
        }
    }

    /// Drop entries this pointer indicates were already collected, keeping
    /// retrieval order. A record at the exact watermark instant is dropped
    /// only if its identifier is in the tie-break set.
    pub fn filter_seen(&self, entries: Vec<LogEntry>) -> Vec<LogEntry> {
        match self {
            Pointer::Watermark { at, seen } => entries
                .into_iter()
                .filter(|entry| {
                    entry.timestamp > *at
                        || (entry.timestamp == *at && !seen.contains(&entry.id))
                })
                .collect(),
            Pointer::Cursor { .. } => entries,
        }
    }

    /// Fold a flushed batch into the pointer. Watermarks advance to the
    /// maximum timestamp seen; same-instant identifiers accumulate in the
    /// tie-break set. Cursor pointers adopt the page's resumption token.
    pub fn advance(&mut self, entries: &[LogEntry], page_cursor: Option<&str>) {
        match self {
            Pointer::Watermark { at, seen } => {
                for entry in entries {
                    if entry.timestamp > *at {
                        *at = entry.timestamp;
                        seen.clear();
                        seen.insert(entry.id.clone());
                    } else if entry.timestamp == *at {
                        seen.insert(entry.id.clone());
                    }
                }
            }
            Pointer::Cursor { token } => {
                if let Some(cursor) = page_cursor {
                    *token = Some(cursor.to_string());
                }
            }
        }
    }
}

/// Outcome of a single connector run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    TransientFailure,
    PermanentFailure,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::TransientFailure => "transient_failure",
            Outcome::PermanentFailure => "permanent_failure",
        }
    }
}

/// Result of one connector run, consumed by the scheduler for backoff and
/// alerting decisions. Not persisted.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub identity: ConnectorIdentity,
    pub outcome: Outcome,
    pub records: usize,
    pub duration: Duration,
    pub error: Option<String>,
}

impl RunResult {
    pub fn success(identity: ConnectorIdentity, records: usize, duration: Duration) -> Self {
        Self {
            identity,
            outcome: Outcome::Success,
            records,
            duration,
            error: None,
        }
    }

    pub fn failure(
        identity: ConnectorIdentity,
        outcome: Outcome,
        records: usize,
        duration: Duration,
        error: impl Into<String>,
    ) -> Self {
        Self {
            identity,
            outcome,
            records,
            duration,
            error: Some(error.into()),
        }
    }
}

/// Value held in the cache while a run is in flight. A marker past its
/// expiry may be taken over by another scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMarker {
    pub owner: Uuid,
    pub expires_at: DateTime<Utc>,
}

impl RunMarker {
    pub fn new(ttl: Duration) -> Self {
        Self {
            owner: Uuid::new_v4(),
            expires_at: Utc::now() + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero()),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}
