use crate::error::MeshResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// A stored value with its optimistic-concurrency version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedValue {
    /// The stored JSON snapshot.
    pub value: Value,
    /// Monotonic version, starting at 1 for the first write.
    pub version: u64,
}

/// Key-value persistence boundary for all mutable aggregates.
///
/// Every aggregate snapshot (worker record, saga run, problem) is written
/// through this trait at each state transition, so the in-memory default can
/// be swapped for a replicated store without touching the engines.
/// `compare_and_set` provides aggregate-level atomicity for backends that
/// cannot rely on in-process locks.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Read a key, returning the value and its current version.
    async fn get(&self, key: &str) -> MeshResult<Option<VersionedValue>>;

    /// Unconditionally write a key. Returns the new version.
    async fn set(&self, key: &str, value: Value) -> MeshResult<u64>;

    /// Write only if the current version equals `expected_version`
    /// (0 means "key must not exist"). Returns whether the write applied.
    async fn compare_and_set(
        &self,
        key: &str,
        value: Value,
        expected_version: u64,
    ) -> MeshResult<bool>;

    /// Remove a key. Removing a missing key is not an error.
    async fn remove(&self, key: &str) -> MeshResult<()>;
}

/// Default store: a process-local versioned map.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    entries: RwLock<HashMap<String, VersionedValue>>,
}

impl InMemoryStateStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether the store holds no keys.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn get(&self, key: &str) -> MeshResult<Option<VersionedValue>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> MeshResult<u64> {
        let mut entries = self.entries.write().await;
        let version = entries.get(key).map_or(1, |v| v.version + 1);
        entries.insert(key.to_string(), VersionedValue { value, version });
        Ok(version)
    }

    async fn compare_and_set(
        &self,
        key: &str,
        value: Value,
        expected_version: u64,
    ) -> MeshResult<bool> {
        let mut entries = self.entries.write().await;
        let current = entries.get(key).map_or(0, |v| v.version);
        if current != expected_version {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            VersionedValue {
                value,
                version: current + 1,
            },
        );
        Ok(true)
    }

    async fn remove(&self, key: &str) -> MeshResult<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}
