use super::{emitted, Output};
use crate::model::{ConnectorIdentity, LogEntry};
use async_trait::async_trait;
use collector_core::{Error, Result};
use std::io::Write;
use tokio::sync::Mutex;

/// Writes each record as one JSON line to standard output. Batches from
/// concurrent workers are serialized so lines never interleave.
#[derive(Default)]
pub struct StdoutOutput {
    lock: Mutex<()>,
}

impl StdoutOutput {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Output for StdoutOutput {
    async fn flush(&self, identity: &ConnectorIdentity, entries: &[LogEntry]) -> Result<()> {
        let mut buffer = Vec::with_capacity(entries.len() * 256);
        for entry in entries {
            serde_json::to_writer(&mut buffer, &emitted(identity, entry))?;
            buffer.push(b'\n');
        }

        let _guard = self.lock.lock().await;
        let stdout = std::io::stdout();
        let mut handle = stdout.lock();
        handle
            .write_all(&buffer)
            .and_then(|_| handle.flush())
            .map_err(|e| Error::Output(format!("stdout write failed: {e}")))?;

        Ok(())
    }
}
