pub mod file;
pub mod http;
pub mod stdout;

use crate::model::{ConnectorIdentity, LogEntry};
use async_trait::async_trait;
use collector_core::Result;
use serde::Serialize;

/// Batched, ordered delivery sink for normalized records.
///
/// On `Ok` every entry in the batch has been durably delivered or staged.
/// Entries may arrive more than once across retries (at-least-once), never
/// fewer. On `Err` the caller must treat the whole batch as undelivered and
/// must not advance its pointer past it.
#[async_trait]
pub trait Output: Send + Sync {
    async fn flush(&self, identity: &ConnectorIdentity, entries: &[LogEntry]) -> Result<()>;
}

/// Wire shape shared by the sinks: one object per record, stamped with the
/// stream it came from.
#[derive(Debug, Serialize)]
pub struct Emitted<'a> {
    pub connector: &'a str,
    pub name: &'a str,
    #[serde(flatten)]
    pub entry: &'a LogEntry,
}

pub fn emitted<'a>(identity: &'a ConnectorIdentity, entry: &'a LogEntry) -> Emitted<'a> {
    Emitted {
        connector: &identity.connector,
        name: &identity.name,
        entry,
    }
}

pub use file::FileOutput;
pub use http::HttpOutput;
pub use stdout::StdoutOutput;
