use super::{emitted, Output};
use crate::model::{ConnectorIdentity, LogEntry};
use async_trait::async_trait;
use collector_core::{Error, Result};
use std::time::Duration;
use tracing::debug;

/// Posts each batch as a JSON array to a remote endpoint. Any failure is
/// reported as an undelivered batch; the sink is expected to deduplicate by
/// record identifier across retries.
pub struct HttpOutput {
    client: reqwest::Client,
    url: String,
}

impl HttpOutput {
    pub fn new(url: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| Error::Output(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Output for HttpOutput {
    async fn flush(&self, identity: &ConnectorIdentity, entries: &[LogEntry]) -> Result<()> {
        let body: Vec<_> = entries.iter().map(|entry| emitted(identity, entry)).collect();

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Output(format!("POST {} failed: {e}", self.url)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Output(format!(
                "POST {} returned {status}",
                self.url
            )));
        }

        debug!(
            identity = %identity,
            entries = entries.len(),
            status = status.as_u16(),
            "Flushed batch over HTTP"
        );

        Ok(())
    }
}
