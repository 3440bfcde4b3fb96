use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

use crate::usage::AggregatedSnapshot;

/// Outcome of asking to start an update: either this caller became the
/// updater, or it gets a subscription to the one already in flight.
pub enum UpdateGate {
    Started,
    InFlight(watch::Receiver<bool>),
}

#[derive(Default)]
struct CacheState {
    snapshot: Option<AggregatedSnapshot>,
    last_error: Option<String>,
    updating: Option<watch::Sender<bool>>,
    tombstones: HashMap<Uuid, DateTime<Utc>>,
    stamped_version: i64,
}

/// key: usage-cache
/// Sole owner of the in-process aggregation state. All access goes through
/// these operations; `commit` and `fail` are the only exits from the
/// updating state, and exactly one of them runs per started update.
pub struct UsageCache {
    state: Mutex<CacheState>,
    tombstone_retention: ChronoDuration,
}

impl UsageCache {
    pub fn new(tombstone_retention: Duration) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            tombstone_retention: ChronoDuration::from_std(tombstone_retention)
                .unwrap_or_else(|_| ChronoDuration::seconds(120)),
        }
    }

    fn locked(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().expect("cache state poisoned")
    }

    /// Latest consistent snapshot, if any. With pending tombstones the
    /// caller gets a filtered copy; stored state is never mutated by reads,
    /// so concurrent readers during an in-flight update stay consistent.
    pub fn read(&self) -> Option<AggregatedSnapshot> {
        let state = self.locked();
        let snapshot = state.snapshot.as_ref()?;
        if state.tombstones.is_empty() {
            return Some(snapshot.clone());
        }
        Some(snapshot.filtered(|id| !state.tombstones.contains_key(id)))
    }

    /// Become the updater or subscribe to the in-flight update's completion
    /// signal. Supports any number of concurrent waiters.
    pub fn begin_update(&self) -> UpdateGate {
        let mut state = self.locked();
        if let Some(sender) = &state.updating {
            return UpdateGate::InFlight(sender.subscribe());
        }
        let (sender, _) = watch::channel(false);
        state.updating = Some(sender);
        UpdateGate::Started
    }

    /// Completion signal of the in-flight update, if one exists.
    pub fn watch_in_flight(&self) -> Option<watch::Receiver<bool>> {
        self.locked().updating.as_ref().map(|sender| sender.subscribe())
    }

    /// Publish a freshly reconciled snapshot. Items tombstoned since the
    /// refresh began are filtered out before storing, which closes the race
    /// where a refresh that started before a delete returns the deleted id.
    /// Tombstones are retired only once the id is gone from the
    /// authoritative set and the retention window has passed.
    pub fn commit(
        &self,
        snapshot: AggregatedSnapshot,
        authoritative: &HashSet<Uuid>,
        version: i64,
    ) {
        let now = Utc::now();
        let mut state = self.locked();
        let snapshot = if state.tombstones.is_empty() {
            snapshot
        } else {
            snapshot.filtered(|id| !state.tombstones.contains_key(id))
        };
        let retention = self.tombstone_retention;
        state.tombstones.retain(|id, created_at| {
            authoritative.contains(id) || now.signed_duration_since(*created_at) <= retention
        });
        state.snapshot = Some(snapshot);
        state.stamped_version = version;
        state.last_error = None;
        if let Some(sender) = state.updating.take() {
            let _ = sender.send(true);
        }
    }

    /// Terminate a failed update. The previous snapshot, if any, stays
    /// visible; waiters are released either way.
    pub fn fail(&self, message: impl Into<String>) {
        let mut state = self.locked();
        state.last_error = Some(message.into());
        if let Some(sender) = state.updating.take() {
            let _ = sender.send(true);
        }
    }

    /// Record accepted deletions. Tombstones land before the durable delete
    /// completes, and the current snapshot drops the items immediately so
    /// the very next read reflects the delete.
    pub fn mark_deleted(&self, ids: &[Uuid]) {
        if ids.is_empty() {
            return;
        }
        let now = Utc::now();
        let mut state = self.locked();
        for id in ids {
            state.tombstones.insert(*id, now);
        }
        if let Some(snapshot) = &state.snapshot {
            if ids.iter().any(|id| snapshot.contains(*id)) {
                state.snapshot = Some(snapshot.filtered(|id| !ids.contains(id)));
            }
        }
    }

    /// Install a snapshot another process published to the durable store.
    /// Skipped while an update is in flight; that update will supersede it.
    pub fn adopt(&self, snapshot: AggregatedSnapshot, version: i64) {
        let mut state = self.locked();
        if state.updating.is_some() {
            debug!("skipping snapshot adoption during in-flight update");
            return;
        }
        state.snapshot = Some(snapshot);
        state.stamped_version = version;
        state.last_error = None;
    }

    pub fn is_updating(&self) -> bool {
        self.locked().updating.is_some()
    }

    pub fn stamped_version(&self) -> i64 {
        self.locked().stamped_version
    }

    pub fn last_error(&self) -> Option<String> {
        self.locked().last_error.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usage::{KeyUsage, UsageResult};
    use std::sync::Arc;

    fn usage_for(id: Uuid, allowance: f64, used: f64) -> UsageResult {
        UsageResult::Ok(KeyUsage {
            id,
            masked_secret: "sk-…0000".to_string(),
            secret: "sk-test".to_string(),
            window_start: "2026-08-01".to_string(),
            window_end: "2026-08-31".to_string(),
            used,
            allowance,
            used_ratio: used / allowance,
            imported_at: Utc::now(),
        })
    }

    fn snapshot_of(items: Vec<UsageResult>) -> AggregatedSnapshot {
        AggregatedSnapshot::build(items)
    }

    #[test]
    fn deleted_ids_disappear_from_the_next_read() {
        let cache = UsageCache::new(Duration::from_secs(120));
        let keep = Uuid::new_v4();
        let gone = Uuid::new_v4();
        let authoritative = HashSet::from([keep, gone]);
        cache.begin_update();
        cache.commit(
            snapshot_of(vec![usage_for(keep, 1000.0, 400.0), usage_for(gone, 500.0, 100.0)]),
            &authoritative,
            1,
        );

        cache.mark_deleted(&[gone]);

        let read = cache.read().expect("snapshot present");
        assert!(!read.contains(gone));
        assert_eq!(read.total_count, 1);
        assert_eq!(read.totals.total_allowance, 1000.0);
    }

    #[test]
    fn stale_refresh_cannot_resurrect_a_tombstoned_id() {
        let cache = UsageCache::new(Duration::from_secs(120));
        let keep = Uuid::new_v4();
        let gone = Uuid::new_v4();

        // Refresh begins, then the delete lands mid-flight.
        cache.begin_update();
        cache.mark_deleted(&[gone]);

        // The stale result still contains the deleted id; the store even
        // claims it is authoritative because the durable delete has not
        // finished yet.
        let stale = snapshot_of(vec![usage_for(keep, 1000.0, 400.0), usage_for(gone, 500.0, 100.0)]);
        let authoritative = HashSet::from([keep, gone]);
        cache.commit(stale, &authoritative, 2);

        let read = cache.read().expect("snapshot present");
        assert!(!read.contains(gone));

        // A second refresh commits while the tombstone is still young; the
        // id must stay suppressed.
        cache.begin_update();
        cache.commit(
            snapshot_of(vec![usage_for(keep, 1000.0, 400.0), usage_for(gone, 500.0, 100.0)]),
            &HashSet::from([keep, gone]),
            3,
        );
        assert!(!cache.read().expect("snapshot present").contains(gone));
    }

    #[test]
    fn tombstones_retire_once_absent_and_aged_out() {
        // Zero retention ages tombstones out immediately once the store no
        // longer lists the id.
        let cache = UsageCache::new(Duration::ZERO);
        let keep = Uuid::new_v4();
        let gone = Uuid::new_v4();
        cache.mark_deleted(&[gone]);

        // Still authoritative upstream: retained despite its age.
        cache.begin_update();
        cache.commit(
            snapshot_of(vec![usage_for(keep, 1000.0, 400.0)]),
            &HashSet::from([keep, gone]),
            1,
        );
        cache.begin_update();
        cache.commit(
            snapshot_of(vec![usage_for(keep, 1000.0, 400.0), usage_for(gone, 500.0, 100.0)]),
            &HashSet::from([keep, gone]),
            2,
        );
        assert!(!cache.read().expect("snapshot present").contains(gone));

        // Gone from the authoritative set: the tombstone retires, and a
        // later (legitimate) reappearance is no longer suppressed.
        cache.begin_update();
        cache.commit(
            snapshot_of(vec![usage_for(keep, 1000.0, 400.0)]),
            &HashSet::from([keep]),
            3,
        );
        cache.begin_update();
        cache.commit(
            snapshot_of(vec![usage_for(keep, 1000.0, 400.0), usage_for(gone, 500.0, 100.0)]),
            &HashSet::from([keep, gone]),
            4,
        );
        assert!(cache.read().expect("snapshot present").contains(gone));
    }

    #[tokio::test]
    async fn commit_releases_every_waiter() {
        let cache = Arc::new(UsageCache::new(Duration::from_secs(120)));
        assert!(matches!(cache.begin_update(), UpdateGate::Started));

        let mut waiters = Vec::new();
        for _ in 0..3 {
            let UpdateGate::InFlight(mut rx) = cache.begin_update() else {
                panic!("second caller must join the in-flight update");
            };
            waiters.push(tokio::spawn(async move {
                let _ = rx.changed().await;
            }));
        }

        let id = Uuid::new_v4();
        cache.commit(
            snapshot_of(vec![usage_for(id, 10.0, 1.0)]),
            &HashSet::from([id]),
            1,
        );
        for waiter in waiters {
            tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .expect("waiter released")
                .expect("waiter completed");
        }
        assert!(!cache.is_updating());
        assert_eq!(cache.stamped_version(), 1);
    }

    #[tokio::test]
    async fn fail_releases_waiters_and_keeps_the_previous_snapshot() {
        let cache = UsageCache::new(Duration::from_secs(120));
        let id = Uuid::new_v4();
        cache.begin_update();
        cache.commit(
            snapshot_of(vec![usage_for(id, 10.0, 1.0)]),
            &HashSet::from([id]),
            1,
        );

        cache.begin_update();
        let UpdateGate::InFlight(mut rx) = cache.begin_update() else {
            panic!("expected in-flight update");
        };
        cache.fail("upstream outage");
        tokio::time::timeout(Duration::from_secs(1), rx.changed())
            .await
            .expect("waiter released")
            .expect("sender signalled before dropping");

        assert_eq!(cache.last_error().as_deref(), Some("upstream outage"));
        assert!(cache.read().is_some());

        // The next successful commit clears the error.
        cache.begin_update();
        cache.commit(
            snapshot_of(vec![usage_for(id, 10.0, 2.0)]),
            &HashSet::from([id]),
            2,
        );
        assert_eq!(cache.last_error(), None);
    }

    #[test]
    fn adoption_is_skipped_while_updating() {
        let cache = UsageCache::new(Duration::from_secs(120));
        cache.begin_update();
        let id = Uuid::new_v4();
        cache.adopt(snapshot_of(vec![usage_for(id, 10.0, 1.0)]), 7);
        assert!(cache.read().is_none());
        assert_eq!(cache.stamped_version(), 0);

        cache.fail("cycle lost");
        cache.adopt(snapshot_of(vec![usage_for(id, 10.0, 1.0)]), 7);
        assert_eq!(cache.stamped_version(), 7);
        assert!(cache.read().is_some());
    }
}
