use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

use crate::store::{KvStore, StoreResult};

pub const DATA_VERSION_KEY: &str = "meta/data_version";
pub const REFRESH_LOCK_KEY: &str = "meta/refresh_lock";

const BUMP_RETRY_LIMIT: u32 = 3;

/// Generation counter for the key set. Processes compare their stamped
/// generation against this to notice writes made elsewhere.
#[derive(Clone)]
pub struct VersionLedger {
    store: Arc<dyn KvStore>,
}

impl VersionLedger {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Current generation; 0 when nothing was ever written.
    pub async fn current(&self) -> StoreResult<i64> {
        Ok(self
            .store
            .get(DATA_VERSION_KEY)
            .await?
            .and_then(|value| value.as_i64())
            .unwrap_or(0))
    }

    /// Increment the generation through compare-and-swap. After
    /// `BUMP_RETRY_LIMIT` conflicts a wall-clock value is written
    /// unconditionally: concurrent bumpers then still make progress with
    /// practically distinct values instead of blocking forever.
    pub async fn bump(&self) -> StoreResult<i64> {
        for _ in 0..BUMP_RETRY_LIMIT {
            let entry = self.store.get_versioned(DATA_VERSION_KEY).await?;
            let (current, token) = match &entry {
                Some(entry) => (entry.value.as_i64().unwrap_or(0), Some(entry.version)),
                None => (0, None),
            };
            let next = current + 1;
            if self
                .store
                .compare_and_swap(DATA_VERSION_KEY, token, json!(next))
                .await?
            {
                return Ok(next);
            }
        }
        let fallback = Utc::now().timestamp_millis();
        warn!(fallback, "version bump kept conflicting; writing wall-clock value");
        self.store.put(DATA_VERSION_KEY, json!(fallback)).await?;
        Ok(fallback)
    }
}

/// Leased cross-process mutual exclusion for refreshes. A crashed holder is
/// reclaimed by lease expiry; a live one releases explicitly.
pub struct RefreshLock {
    store: Arc<dyn KvStore>,
    ttl: Duration,
    holder: Uuid,
}

impl RefreshLock {
    pub fn new(store: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            holder: Uuid::new_v4(),
        }
    }

    /// Create-if-absent with the lease TTL. Returns whether this caller
    /// became the holder.
    pub async fn acquire(&self) -> StoreResult<bool> {
        self.store
            .put_if_absent(
                REFRESH_LOCK_KEY,
                json!(self.holder.to_string()),
                Some(self.ttl),
            )
            .await
    }

    /// Unconditional release.
    pub async fn release(&self) -> StoreResult<()> {
        self.store.delete(REFRESH_LOCK_KEY).await
    }
}
