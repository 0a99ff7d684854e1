//! Durable key/value store abstraction backing the event store

use crate::error::RelayerResult;

use async_trait::async_trait;

#[cfg(test)]
pub use memory::{FailingKvStore, MemoryKvStore};

/// Minimal durable store contract: point reads/writes, ordered prefix scans
/// and an atomic compare-and-swap.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> RelayerResult<Option<Vec<u8>>>;

    async fn put(&self, key: &str, value: Vec<u8>) -> RelayerResult<()>;

    async fn delete(&self, key: &str) -> RelayerResult<()>;

    /// All entries whose key starts with `prefix`, ordered by key
    async fn scan_prefix(&self, prefix: &str) -> RelayerResult<Vec<(String, Vec<u8>)>>;

    /// Atomically replace the value at `key` if it currently equals
    /// `expected` (`None` meaning absent). `new = None` deletes the key.
    /// Returns whether the swap happened.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<Vec<u8>>,
    ) -> RelayerResult<bool>;

    async fn health_check(&self) -> RelayerResult<()> {
        Ok(())
    }
}
