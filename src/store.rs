use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::Instant;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A value together with the store-level version token needed for
/// compare-and-swap writes.
#[derive(Clone, Debug)]
pub struct VersionedValue {
    pub value: Value,
    pub version: i64,
}

/// Durable shared key-value collaborator. Backends must provide per-key
/// expiry, prefix scans, and atomic compare-and-swap keyed on the version
/// token returned by `get_versioned`.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<Value>>;

    async fn get_versioned(&self, key: &str) -> StoreResult<Option<VersionedValue>>;

    /// Unconditional write. Clears any expiry on the entry.
    async fn put(&self, key: &str, value: Value) -> StoreResult<()>;

    /// Create-if-absent, optionally leased. Returns whether this call created
    /// the entry.
    async fn put_if_absent(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> StoreResult<bool>;

    /// Commit only if the entry's version token still matches `expected`;
    /// `None` means "only if no entry exists". Returns whether the write won.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<i64>,
        value: Value,
    ) -> StoreResult<bool>;

    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// All live entries whose key starts with `prefix`, ordered by key.
    async fn list(&self, prefix: &str) -> StoreResult<Vec<(String, Value)>>;
}

#[derive(Clone, Debug)]
struct Entry {
    value: Value,
    version: i64,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// HashMap-backed store for tests and single-node deployments. Expired
/// entries are dropped lazily on access.
#[derive(Clone, Default)]
pub struct MemoryStore {
    data: Arc<RwLock<HashMap<String, Entry>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        Ok(self.get_versioned(key).await?.map(|entry| entry.value))
    }

    async fn get_versioned(&self, key: &str) -> StoreResult<Option<VersionedValue>> {
        let data = self.data.read().await;
        Ok(data
            .get(key)
            .filter(|entry| !entry.is_expired())
            .map(|entry| VersionedValue {
                value: entry.value.clone(),
                version: entry.version,
            }))
    }

    async fn put(&self, key: &str, value: Value) -> StoreResult<()> {
        let mut data = self.data.write().await;
        // Version tokens keep counting across expired entries so a token
        // handed out before an expiry can never match again.
        let version = data.get(key).map(|entry| entry.version + 1).unwrap_or(1);
        data.insert(
            key.to_string(),
            Entry {
                value,
                version,
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> StoreResult<bool> {
        let mut data = self.data.write().await;
        if data.get(key).is_some_and(|entry| !entry.is_expired()) {
            return Ok(false);
        }
        let version = data.get(key).map(|entry| entry.version + 1).unwrap_or(1);
        data.insert(
            key.to_string(),
            Entry {
                value,
                version,
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<i64>,
        value: Value,
    ) -> StoreResult<bool> {
        let mut data = self.data.write().await;
        let live_version = data
            .get(key)
            .filter(|entry| !entry.is_expired())
            .map(|entry| entry.version);
        if live_version != expected {
            return Ok(false);
        }
        let version = data.get(key).map(|entry| entry.version + 1).unwrap_or(1);
        data.insert(
            key.to_string(),
            Entry {
                value,
                version,
                expires_at: None,
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.data.write().await.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<(String, Value)>> {
        let data = self.data.read().await;
        let mut entries: Vec<(String, Value)> = data
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && !entry.is_expired())
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }
}
