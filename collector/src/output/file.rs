use super::{emitted, Output};
use crate::model::{ConnectorIdentity, LogEntry};
use async_trait::async_trait;
use collector_core::{Error, Result};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

/// Appends records as JSON lines, one file per collection stream. Append
/// order matches flush order, so in-batch ordering is preserved end-to-end.
pub struct FileOutput {
    root: PathBuf,
    lock: Mutex<()>,
}

impl FileOutput {
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            lock: Mutex::new(()),
        })
    }

    fn path_for(&self, identity: &ConnectorIdentity) -> PathBuf {
        let file_name = format!("{}-{}.ndjson", identity.connector, identity.name)
            .replace(['/', '\\'], "_");
        self.root.join(file_name)
    }
}

#[async_trait]
impl Output for FileOutput {
    async fn flush(&self, identity: &ConnectorIdentity, entries: &[LogEntry]) -> Result<()> {
        let mut buffer = Vec::with_capacity(entries.len() * 256);
        for entry in entries {
            serde_json::to_writer(&mut buffer, &emitted(identity, entry))?;
            buffer.push(b'\n');
        }

        let path = self.path_for(identity);
        let _guard = self.lock.lock().await;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| Error::Output(format!("failed to open {}: {e}", path.display())))?;

        file.write_all(&buffer)
            .await
            .map_err(|e| Error::Output(format!("append to {} failed: {e}", path.display())))?;
        file.sync_data()
            .await
            .map_err(|e| Error::Output(format!("sync of {} failed: {e}", path.display())))?;

        debug!(
            identity = %identity,
            entries = entries.len(),
            path = %path.display(),
            "Flushed batch to file"
        );

        Ok(())
    }
}
