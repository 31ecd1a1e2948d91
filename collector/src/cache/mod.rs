pub mod file;
pub mod memory;

use async_trait::async_trait;
use collector_core::Result;

/// Expectation asserted by a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expected {
    /// The key must not exist.
    Absent,
    /// The key must exist at exactly this version.
    Version(u64),
    /// Unconditional write.
    Any,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub value: String,
    pub version: u64,
}

/// Durable key/value checkpoint store with atomic conditional writes.
///
/// `put` is linearizable per key: of two concurrent writes asserting the
/// same expected version, at most one succeeds. A backend without native
/// compare-and-swap must serialize access internally to preserve this.
/// This is the sole mechanism keeping concurrent runs of one instance from
/// corrupting each other's progress.
#[async_trait]
pub trait Cache: std::fmt::Debug + Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Entry>>;

    /// Returns the new version on success. Fails with `Error::Conflict`
    /// when the expectation does not hold.
    async fn put(&self, key: &str, value: &str, expected: Expected) -> Result<u64>;

    /// Removes a key, subject to the same expectation rules as `put`.
    /// Deleting an absent key with `Expected::Any` is a no-op.
    async fn delete(&self, key: &str, expected: Expected) -> Result<()>;

    /// Keys beginning with `prefix`, in unspecified order.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

pub use file::FileCache;
pub use memory::MemoryCache;
