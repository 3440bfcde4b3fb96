use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};
use std::time::Duration;

use crate::store::{KvStore, StoreResult, VersionedValue};

/// Postgres-backed durable store. All entries live in one `kv_entries` table;
/// compare-and-swap is an `UPDATE` conditioned on the row's version counter
/// and leases are `expires_at` timestamps filtered on read.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn purge_expired(&self, key: &str) -> StoreResult<()> {
        sqlx::query(
            "DELETE FROM kv_entries WHERE key = $1 AND expires_at IS NOT NULL AND expires_at <= now()",
        )
        .bind(key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl KvStore for PgStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        Ok(self.get_versioned(key).await?.map(|entry| entry.value))
    }

    async fn get_versioned(&self, key: &str) -> StoreResult<Option<VersionedValue>> {
        let row = sqlx::query(
            "SELECT value, version FROM kv_entries WHERE key = $1 AND (expires_at IS NULL OR expires_at > now())",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| VersionedValue {
            value: row.get("value"),
            version: row.get("version"),
        }))
    }

    async fn put(&self, key: &str, value: Value) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO kv_entries (key, value, version, expires_at) VALUES ($1, $2, 1, NULL) \
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, version = kv_entries.version + 1, expires_at = NULL",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> StoreResult<bool> {
        self.purge_expired(key).await?;
        let expires_at: Option<DateTime<Utc>> = ttl
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .map(|ttl| Utc::now() + ttl);
        let result = sqlx::query(
            "INSERT INTO kv_entries (key, value, version, expires_at) VALUES ($1, $2, 1, $3) \
             ON CONFLICT (key) DO NOTHING",
        )
        .bind(key)
        .bind(value)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<i64>,
        value: Value,
    ) -> StoreResult<bool> {
        let result = match expected {
            Some(version) => {
                sqlx::query(
                    "UPDATE kv_entries SET value = $2, version = version + 1, expires_at = NULL \
                     WHERE key = $1 AND version = $3 AND (expires_at IS NULL OR expires_at > now())",
                )
                .bind(key)
                .bind(value)
                .bind(version)
                .execute(&self.pool)
                .await?
            }
            None => {
                self.purge_expired(key).await?;
                sqlx::query(
                    "INSERT INTO kv_entries (key, value, version, expires_at) VALUES ($1, $2, 1, NULL) \
                     ON CONFLICT (key) DO NOTHING",
                )
                .bind(key)
                .bind(value)
                .execute(&self.pool)
                .await?
            }
        };
        Ok(result.rows_affected() == 1)
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM kv_entries WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<(String, Value)>> {
        let rows = sqlx::query(
            "SELECT key, value FROM kv_entries WHERE key LIKE $1 || '%' \
             AND (expires_at IS NULL OR expires_at > now()) ORDER BY key",
        )
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get("key"), row.get("value")))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    async fn connect() -> Option<PgPool> {
        let database_url = match std::env::var("DATABASE_URL") {
            Ok(url) => url,
            Err(_) => {
                eprintln!("skipping pg_store test: DATABASE_URL not set");
                return None;
            }
        };
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(5)
            .connect(&database_url)
            .await
            .expect("connect to postgres");
        sqlx::migrate!().run(&pool).await.expect("run migrations");
        Some(pool)
    }

    #[tokio::test]
    async fn roundtrip_and_prefix_scan() {
        let Some(pool) = connect().await else { return };
        let store = PgStore::new(pool);
        let ns = format!("test/{}/", Uuid::new_v4());

        store
            .put(&format!("{ns}keys/a"), json!({"id": "a"}))
            .await
            .unwrap();
        store
            .put(&format!("{ns}keys/b"), json!({"id": "b"}))
            .await
            .unwrap();
        assert_eq!(
            store.get(&format!("{ns}keys/a")).await.unwrap(),
            Some(json!({"id": "a"}))
        );
        assert_eq!(store.list(&format!("{ns}keys/")).await.unwrap().len(), 2);

        store.delete(&format!("{ns}keys/a")).await.unwrap();
        assert_eq!(store.get(&format!("{ns}keys/a")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn cas_honors_version_tokens() {
        let Some(pool) = connect().await else { return };
        let store = PgStore::new(pool);
        let key = format!("test/{}/version", Uuid::new_v4());

        assert!(store.compare_and_swap(&key, None, json!(1)).await.unwrap());
        assert!(!store.compare_and_swap(&key, None, json!(2)).await.unwrap());

        let entry = store.get_versioned(&key).await.unwrap().unwrap();
        assert!(!store
            .compare_and_swap(&key, Some(entry.version + 1), json!(2))
            .await
            .unwrap());
        assert!(store
            .compare_and_swap(&key, Some(entry.version), json!(2))
            .await
            .unwrap());
        assert_eq!(store.get(&key).await.unwrap(), Some(json!(2)));
    }
}
