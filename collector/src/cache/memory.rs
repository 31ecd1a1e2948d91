use super::{Cache, Entry, Expected};
use async_trait::async_trait;
use collector_core::{Error, Result};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// In-process cache backend. Progress does not survive a restart, which is
/// acceptable for development and for single-shot invocations that re-collect
/// a bounded window.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Entry>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &str, expected: Expected) -> Result<u64> {
        let mut entries = self.entries.write().await;
        let current = entries.get(key);

        let next_version = match (expected, current) {
            (Expected::Absent, None) => 1,
            (Expected::Version(version), Some(entry)) if entry.version == version => {
                entry.version + 1
            }
            (Expected::Any, current) => current.map_or(1, |entry| entry.version + 1),
            _ => return Err(Error::Conflict(key.to_string())),
        };

        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                version: next_version,
            },
        );

        Ok(next_version)
    }

    async fn delete(&self, key: &str, expected: Expected) -> Result<()> {
        let mut entries = self.entries.write().await;
        match (expected, entries.get(key)) {
            (Expected::Any, _) => {
                entries.remove(key);
                Ok(())
            }
            (Expected::Version(version), Some(entry)) if entry.version == version => {
                entries.remove(key);
                Ok(())
            }
            (Expected::Absent, None) => Ok(()),
            _ => Err(Error::Conflict(key.to_string())),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .entries
            .read()
            .await
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }
}
