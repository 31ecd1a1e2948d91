use super::{Cache, Entry, Expected};
use async_trait::async_trait;
use collector_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

/// Local filesystem cache backend. One JSON document per key; writes go
/// through a temp file plus rename so a crash never leaves a torn document.
///
/// The filesystem has no native compare-and-swap, so all mutations are
/// serialized behind a process-wide mutex. Deployments that need multiple
/// writer processes on one store should use a backend with real CAS.
#[derive(Debug)]
pub struct FileCache {
    root: PathBuf,
    write_lock: Mutex<()>,
}

#[derive(Serialize, Deserialize)]
struct Document {
    value: String,
    version: u64,
}

impl FileCache {
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.json", encode_key(key)))
    }

    async fn read_document(&self, path: &Path) -> Result<Option<Document>> {
        match tokio::fs::read_to_string(path).await {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Cache(format!(
                "failed to read {}: {e}",
                path.display()
            ))),
        }
    }

    async fn write_document(&self, path: &Path, document: &Document) -> Result<()> {
        let raw = serde_json::to_string(document)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, raw.as_bytes()).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[async_trait]
impl Cache for FileCache {
    async fn get(&self, key: &str) -> Result<Option<Entry>> {
        let document = self.read_document(&self.path_for(key)).await?;
        Ok(document.map(|d| Entry {
            value: d.value,
            version: d.version,
        }))
    }

    async fn put(&self, key: &str, value: &str, expected: Expected) -> Result<u64> {
        let _guard = self.write_lock.lock().await;
        let path = self.path_for(key);
        let current = self.read_document(&path).await?;

        let next_version = match (expected, &current) {
            (Expected::Absent, None) => 1,
            (Expected::Version(version), Some(document)) if document.version == version => {
                document.version + 1
            }
            (Expected::Any, current) => current.as_ref().map_or(1, |d| d.version + 1),
            _ => return Err(Error::Conflict(key.to_string())),
        };

        self.write_document(
            &path,
            &Document {
                value: value.to_string(),
                version: next_version,
            },
        )
        .await?;

        debug!(key, version = next_version, "Cache entry written");
        Ok(next_version)
    }

    async fn delete(&self, key: &str, expected: Expected) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.path_for(key);
        let current = self.read_document(&path).await?;

        match (expected, &current) {
            (Expected::Absent, None) => return Ok(()),
            (Expected::Any, None) => return Ok(()),
            (Expected::Any, Some(_)) => {}
            (Expected::Version(version), Some(document)) if document.version == version => {}
            _ => return Err(Error::Conflict(key.to_string())),
        }

        tokio::fs::remove_file(&path).await?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.root).await?;

        while let Some(item) = dir.next_entry().await? {
            let file_name = item.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            let Some(encoded) = name.strip_suffix(".json") else {
                continue;
            };
            let key = decode_key(encoded);
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }

        Ok(keys)
    }
}

/// Keys contain `/` separators, so they are escaped into flat file names.
fn encode_key(key: &str) -> String {
    let mut encoded = String::with_capacity(key.len());
    for byte in key.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'.' | b'_' | b'-' => {
                encoded.push(byte as char)
            }
            other => encoded.push_str(&format!("%{other:02X}")),
        }
    }
    encoded
}

fn decode_key(encoded: &str) -> String {
    let bytes = encoded.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        if bytes[index] == b'%' && index + 2 < bytes.len() {
            if let Ok(byte) = u8::from_str_radix(&encoded[index + 1..index + 3], 16) {
                decoded.push(byte);
                index += 3;
                continue;
            }
        }
        decoded.push(bytes[index]);
        index += 1;
    }
    String::from_utf8_lossy(&decoded).into_owned()
}
