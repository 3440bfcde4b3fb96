use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, Duration as TokioDuration};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{UpdateGate, UsageCache};
use crate::config;
use crate::fetch::UsageClient;
use crate::keys::service::load_key_records;
use crate::ledger::{RefreshLock, VersionLedger};
use crate::store::KvStore;
use crate::usage::AggregatedSnapshot;

pub const CACHED_SNAPSHOT_KEY: &str = "meta/cached_snapshot";

const DEMAND_LOCK_ATTEMPTS: u32 = 5;
const DEMAND_LOCK_PAUSE: Duration = Duration::from_millis(800);

/// Snapshot as published to the durable store, stamped with the data
/// version it was computed against.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CachedSnapshot {
    pub version: i64,
    pub snapshot: AggregatedSnapshot,
}

/// key: refresh-engine
/// Drives the fetch → reconcile → publish cycle. Exactly one of
/// `commit`/`fail` terminates every started update, and the cross-process
/// lock is released on every exit path of the critical section.
pub struct RefreshEngine {
    store: Arc<dyn KvStore>,
    cache: Arc<UsageCache>,
    client: UsageClient,
    ledger: VersionLedger,
    lock: RefreshLock,
}

impl RefreshEngine {
    pub fn new(
        store: Arc<dyn KvStore>,
        cache: Arc<UsageCache>,
        client: UsageClient,
        lock_ttl: Duration,
    ) -> Self {
        let ledger = VersionLedger::new(store.clone());
        let lock = RefreshLock::new(store.clone(), lock_ttl);
        Self {
            store,
            cache,
            client,
            ledger,
            lock,
        }
    }

    pub fn ledger(&self) -> &VersionLedger {
        &self.ledger
    }

    /// Timer-driven refresh. Never queues behind in-flight work, and skips
    /// when another process holds the lock; that process's result becomes
    /// visible through the durable cached snapshot instead.
    pub async fn refresh_scheduled(&self) {
        if self.cache.is_updating() {
            debug!("refresh already in flight; skipping scheduled pass");
            return;
        }
        match self.lock.acquire().await {
            Ok(true) => {}
            Ok(false) => {
                debug!("refresh lock held elsewhere; skipping scheduled pass");
                return;
            }
            Err(err) => {
                warn!(?err, "refresh lock acquisition failed");
                return;
            }
        }
        self.run_locked().await;
    }

    /// Refresh for callers that need a fresh answer now. Joins the in-flight
    /// update when one exists. Under persistent cross-process contention the
    /// caller gets whatever the durable cached snapshot holds rather than
    /// blocking indefinitely.
    pub async fn refresh_on_demand(&self) -> Option<AggregatedSnapshot> {
        if let Some(mut in_flight) = self.cache.watch_in_flight() {
            let _ = in_flight.changed().await;
            return self.cache.read();
        }
        for attempt in 0..DEMAND_LOCK_ATTEMPTS {
            match self.lock.acquire().await {
                Ok(true) => {
                    self.run_locked().await;
                    return self.cache.read();
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(?err, "refresh lock acquisition failed");
                    break;
                }
            }
            // An update may have started locally while we were contending.
            if let Some(mut in_flight) = self.cache.watch_in_flight() {
                let _ = in_flight.changed().await;
                return self.cache.read();
            }
            if attempt + 1 < DEMAND_LOCK_ATTEMPTS {
                time::sleep(DEMAND_LOCK_PAUSE).await;
            }
        }
        self.adopt_durable_snapshot().await;
        self.cache.read()
    }

    /// Read-path staleness check: when another process changed the key set,
    /// adopt its published snapshot if it matches the current generation,
    /// otherwise force a synchronous refresh.
    pub async fn ensure_fresh(&self) -> anyhow::Result<()> {
        let current = self.ledger.current().await?;
        if self.cache.stamped_version() == current || self.cache.is_updating() {
            return Ok(());
        }
        debug!(
            stamped = self.cache.stamped_version(),
            current, "cache stale relative to the durable store"
        );
        match self.load_durable_snapshot().await {
            Ok(Some(cached)) if cached.version == current => {
                self.cache.adopt(cached.snapshot, cached.version);
                return Ok(());
            }
            Ok(_) => {}
            Err(err) => warn!(?err, "durable snapshot read failed"),
        }
        self.refresh_on_demand().await;
        Ok(())
    }

    async fn run_locked(&self) {
        match self.cache.begin_update() {
            UpdateGate::Started => {}
            UpdateGate::InFlight(mut in_flight) => {
                // Lost the local race after winning the cross-process lock.
                if let Err(err) = self.lock.release().await {
                    warn!(?err, "refresh lock release failed");
                }
                let _ = in_flight.changed().await;
                return;
            }
        }
        if let Err(err) = self.run_cycle().await {
            warn!(?err, "refresh cycle failed");
            self.cache.fail(err.to_string());
        }
        if let Err(err) = self.lock.release().await {
            warn!(?err, "refresh lock release failed");
        }
    }

    async fn run_cycle(&self) -> anyhow::Result<()> {
        let records = load_key_records(self.store.as_ref())
            .await
            .context("load key records")?;
        info!(keys = records.len(), "refreshing usage snapshot");
        let results = self.client.fetch_all(&records).await;
        let snapshot = AggregatedSnapshot::build(results);

        // Reconcile against a re-read of the authoritative id set: ids
        // deleted by another process while we were fetching are dropped.
        let authoritative = self
            .authoritative_ids()
            .await
            .context("re-read authoritative ids")?;
        let snapshot = if snapshot
            .items
            .iter()
            .all(|item| authoritative.contains(&item.id()))
        {
            snapshot
        } else {
            snapshot.filtered(|id| authoritative.contains(id))
        };

        let version = self.ledger.current().await.context("read data version")?;
        let cached = CachedSnapshot {
            version,
            snapshot: snapshot.clone(),
        };
        self.store
            .put(
                CACHED_SNAPSHOT_KEY,
                serde_json::to_value(&cached).context("encode cached snapshot")?,
            )
            .await
            .context("publish cached snapshot")?;
        self.cache.commit(snapshot, &authoritative, version);
        Ok(())
    }

    async fn authoritative_ids(&self) -> anyhow::Result<HashSet<Uuid>> {
        Ok(load_key_records(self.store.as_ref())
            .await?
            .into_iter()
            .map(|record| record.id)
            .collect())
    }

    async fn adopt_durable_snapshot(&self) {
        match self.load_durable_snapshot().await {
            Ok(Some(cached)) => self.cache.adopt(cached.snapshot, cached.version),
            Ok(None) => {}
            Err(err) => warn!(?err, "durable snapshot read failed"),
        }
    }

    pub async fn load_durable_snapshot(&self) -> anyhow::Result<Option<CachedSnapshot>> {
        let Some(value) = self.store.get(CACHED_SNAPSHOT_KEY).await? else {
            return Ok(None);
        };
        Ok(Some(
            serde_json::from_value(value).context("decode cached snapshot")?,
        ))
    }
}

/// key: refresh-scheduler -> periodic snapshot rebuild
pub fn spawn(engine: Arc<RefreshEngine>) {
    let interval = TokioDuration::from_secs(*config::REFRESH_INTERVAL_SECS);
    tokio::spawn(async move {
        // The immediate first tick warms the cache at startup.
        let mut ticker = time::interval(interval);
        loop {
            ticker.tick().await;
            engine.refresh_scheduled().await;
        }
    });
}
