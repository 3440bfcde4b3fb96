use dashmap::DashMap;
use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use super::models::{KeyInfo, KeyRecord};
use crate::cache::UsageCache;
use crate::fetch::UsageClient;
use crate::ledger::VersionLedger;
use crate::store::{KvStore, StoreResult};
use crate::usage::UsageResult;

pub const KEY_PREFIX: &str = "keys/";
const SECRET_INDEX_PREFIX: &str = "idx/secret/";
const SECRET_INDEX_READY_KEY: &str = "idx/ready";

#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct ImportOutcome {
    pub added: usize,
    pub duplicates: usize,
}

/// key: monitored-keys-service
/// Import, lookup, and deletion of monitored keys. Deletions tombstone the
/// cache before any durable write so a racing refresh cannot resurrect the
/// id; every key-set mutation bumps the data version for sibling processes.
pub struct KeyService {
    store: Arc<dyn KvStore>,
    cache: Arc<UsageCache>,
    client: UsageClient,
    ledger: VersionLedger,
    index_memo: DashMap<String, Uuid>,
}

impl KeyService {
    pub fn new(store: Arc<dyn KvStore>, cache: Arc<UsageCache>, client: UsageClient) -> Self {
        let ledger = VersionLedger::new(store.clone());
        Self {
            store,
            cache,
            client,
            ledger,
            index_memo: DashMap::new(),
        }
    }

    pub async fn list(&self) -> StoreResult<Vec<KeyInfo>> {
        Ok(load_key_records(self.store.as_ref())
            .await?
            .iter()
            .map(KeyInfo::from)
            .collect())
    }

    pub async fn get(&self, id: Uuid) -> anyhow::Result<Option<KeyRecord>> {
        let Some(value) = self.store.get(&record_key(id)).await? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_value(value)?))
    }

    /// Bulk import, deduplicated by secret value. Any store failure fails
    /// the whole operation; the version is still bumped when some records
    /// were already written so siblings reconcile the partial state.
    pub async fn import(&self, secrets: Vec<String>) -> anyhow::Result<ImportOutcome> {
        self.ensure_secret_index().await;
        let mut outcome = ImportOutcome::default();
        let result = self.write_batch(secrets, &mut outcome).await;
        if outcome.added > 0 {
            self.ledger.bump().await?;
            info!(
                added = outcome.added,
                duplicates = outcome.duplicates,
                "imported keys"
            );
        }
        result?;
        Ok(outcome)
    }

    async fn write_batch(
        &self,
        secrets: Vec<String>,
        outcome: &mut ImportOutcome,
    ) -> anyhow::Result<()> {
        let mut batch_digests = HashSet::new();
        for raw in secrets {
            let secret = raw.trim();
            if secret.is_empty() {
                continue;
            }
            let digest = secret_digest(secret);
            if !batch_digests.insert(digest.clone()) {
                outcome.duplicates += 1;
                continue;
            }
            if self.lookup_by_secret(&digest, secret).await?.is_some() {
                outcome.duplicates += 1;
                continue;
            }
            let record = KeyRecord::new(secret.to_string());
            self.store
                .put(&record_key(record.id), serde_json::to_value(&record)?)
                .await?;
            self.store
                .put(&index_key(&digest), json!(record.id.to_string()))
                .await?;
            self.index_memo.insert(digest, record.id);
            outcome.added += 1;
        }
        Ok(())
    }

    /// Delete by id, single or bulk. The cache tombstones land first, then
    /// the durable entries go, then the version bump announces the change.
    pub async fn delete(&self, ids: &[Uuid]) -> anyhow::Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.cache.mark_deleted(ids);
        let mut removed = 0;
        let result = self.delete_batch(ids, &mut removed).await;
        if removed > 0 {
            self.ledger.bump().await?;
            info!(removed, "deleted keys");
        }
        result?;
        Ok(removed)
    }

    async fn delete_batch(&self, ids: &[Uuid], removed: &mut usize) -> anyhow::Result<()> {
        for id in ids {
            let Some(record) = self.get(*id).await? else {
                continue;
            };
            let digest = secret_digest(&record.secret);
            self.store.delete(&index_key(&digest)).await?;
            self.index_memo.remove(&digest);
            self.store.delete(&record_key(*id)).await?;
            *removed += 1;
        }
        Ok(())
    }

    /// Fetch one key's usage on demand without touching the shared snapshot.
    pub async fn refresh_single(&self, id: Uuid) -> anyhow::Result<Option<UsageResult>> {
        let Some(record) = self.get(id).await? else {
            return Ok(None);
        };
        Ok(Some(self.client.fetch_one(&record).await))
    }

    async fn lookup_by_secret(&self, digest: &str, secret: &str) -> anyhow::Result<Option<Uuid>> {
        if let Some(hit) = self.index_memo.get(digest) {
            return Ok(Some(*hit));
        }
        if self.index_ready().await? {
            let id = self
                .store
                .get(&index_key(digest))
                .await?
                .and_then(|value| value.as_str().and_then(|raw| Uuid::parse_str(raw).ok()));
            if let Some(id) = id {
                self.index_memo.insert(digest.to_string(), id);
            }
            return Ok(id);
        }
        // Index not built: full scan against the live records.
        Ok(load_key_records(self.store.as_ref())
            .await?
            .into_iter()
            .find(|record| record.secret == secret)
            .map(|record| record.id))
    }

    /// Build the secret index once. A failed build only costs us the cheap
    /// lookup path; duplicate checks fall back to full scans until it exists.
    async fn ensure_secret_index(&self) {
        if let Err(err) = self.build_secret_index().await {
            warn!(?err, "secret index build failed; falling back to full scans");
        }
    }

    async fn build_secret_index(&self) -> anyhow::Result<()> {
        if self.index_ready().await? {
            return Ok(());
        }
        let records = load_key_records(self.store.as_ref()).await?;
        for record in &records {
            self.store
                .put(
                    &index_key(&secret_digest(&record.secret)),
                    json!(record.id.to_string()),
                )
                .await?;
        }
        self.store.put(SECRET_INDEX_READY_KEY, json!(true)).await?;
        info!(indexed = records.len(), "built secret index");
        Ok(())
    }

    async fn index_ready(&self) -> StoreResult<bool> {
        Ok(self
            .store
            .get(SECRET_INDEX_READY_KEY)
            .await?
            .and_then(|value| value.as_bool())
            .unwrap_or(false))
    }
}

/// Authoritative key list, read fresh from the store. Malformed entries are
/// skipped so one bad row cannot wedge every refresh.
pub async fn load_key_records(store: &dyn KvStore) -> StoreResult<Vec<KeyRecord>> {
    let mut records = Vec::new();
    for (key, value) in store.list(KEY_PREFIX).await? {
        match serde_json::from_value::<KeyRecord>(value) {
            Ok(record) => records.push(record),
            Err(err) => warn!(?err, %key, "skipping malformed key record"),
        }
    }
    Ok(records)
}

pub fn record_key(id: Uuid) -> String {
    format!("{KEY_PREFIX}{id}")
}

fn index_key(digest: &str) -> String {
    format!("{SECRET_INDEX_PREFIX}{digest}")
}

fn secret_digest(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::FetchOptions;
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn service(store: Arc<dyn KvStore>) -> KeyService {
        let cache = Arc::new(UsageCache::new(Duration::from_secs(120)));
        let client = UsageClient::new(
            "http://127.0.0.1:9",
            Duration::from_secs(1),
            FetchOptions::default(),
        );
        KeyService::new(store, cache, client)
    }

    #[tokio::test]
    async fn import_dedupes_within_and_across_batches() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let service = service(store.clone());

        let outcome = service
            .import(vec![
                "sk-alpha".to_string(),
                "sk-beta".to_string(),
                "sk-alpha".to_string(),
                "   ".to_string(),
            ])
            .await
            .unwrap();
        assert_eq!(outcome.added, 2);
        assert_eq!(outcome.duplicates, 1);

        let outcome = service.import(vec!["sk-alpha".to_string()]).await.unwrap();
        assert_eq!(outcome.added, 0);
        assert_eq!(outcome.duplicates, 1);

        assert_eq!(service.list().await.unwrap().len(), 2);
        // The index exists and is flagged ready.
        assert_eq!(store.get("idx/ready").await.unwrap(), Some(json!(true)));
        assert_eq!(store.list("idx/secret/").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn import_indexes_records_that_predate_the_index() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let existing = KeyRecord::new("sk-legacy".to_string());
        store
            .put(
                &record_key(existing.id),
                serde_json::to_value(&existing).unwrap(),
            )
            .await
            .unwrap();

        let service = service(store.clone());
        let outcome = service.import(vec!["sk-legacy".to_string()]).await.unwrap();
        assert_eq!(outcome.added, 0);
        assert_eq!(outcome.duplicates, 1);
        assert_eq!(store.list("idx/secret/").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn import_bumps_the_data_version_once() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let service = service(store.clone());
        let ledger = VersionLedger::new(store.clone());

        service
            .import(vec!["sk-one".to_string(), "sk-two".to_string()])
            .await
            .unwrap();
        assert_eq!(ledger.current().await.unwrap(), 1);

        // Pure-duplicate imports leave the version untouched.
        service.import(vec!["sk-one".to_string()]).await.unwrap();
        assert_eq!(ledger.current().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn delete_removes_record_and_index_and_bumps_version() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let service = service(store.clone());
        service.import(vec!["sk-doomed".to_string()]).await.unwrap();
        let id = service.list().await.unwrap()[0].id;

        let removed = service.delete(&[id]).await.unwrap();
        assert_eq!(removed, 1);
        assert!(service.list().await.unwrap().is_empty());
        assert!(store.list("idx/secret/").await.unwrap().is_empty());
        assert_eq!(VersionLedger::new(store).current().await.unwrap(), 2);

        // Deleting the same id again is a no-op.
        assert_eq!(service.delete(&[id]).await.unwrap(), 0);
    }
}
