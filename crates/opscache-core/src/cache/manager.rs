use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    CacheEntry, CacheError, CacheKey, EntryStatus, LocalEntryStore, PerformanceLedger,
    PerformanceSnapshot, Table, TableKey,
};
use crate::clock::{Clock, SystemClock};
use crate::config::CacheConfig;
use crate::persistence::{adapter, KeyValueSlot, PersistenceAdapter};
use crate::sync::{
    ChangeFeedSubscriber, ChangeRegistry, RemoteChangeRecord, StaleSink, SubscriberState,
};

#[derive(Debug, Default)]
struct CacheState {
    store: LocalEntryStore,
    performance: PerformanceLedger,
    /// Local change counter per table, bumped by anything that makes a
    /// reload in flight untrustworthy.
    generations: HashMap<String, u64>,
    snapshot_generation: u64,
    /// Most recently spawned slot write.
    pending_write: Option<JoinHandle<()>>,
}

impl CacheState {
    fn generation(&self, table: &str) -> u64 {
        self.generations.get(table).copied().unwrap_or(0)
    }

    fn touch(&mut self, table: &str) {
        *self.generations.entry(table.to_string()).or_insert(0) += 1;
    }
}

struct CacheCore {
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<CacheState>,
    persistence: Arc<PersistenceAdapter>,
    registry_readable: AtomicBool,
}

impl CacheCore {
    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot the store as of this mutation and release the lock. Inside a
    /// runtime the slot write runs on the blocking pool.
    fn commit(&self, mut state: MutexGuard<'_, CacheState>) {
        if self.persistence.is_disabled() {
            return;
        }
        state.snapshot_generation += 1;
        let generation = state.snapshot_generation;
        let blob = adapter::encode(&state.store);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let persistence = Arc::clone(&self.persistence);
                // Spawned under the lock so pending_write is always the newest
                state.pending_write = Some(
                    handle.spawn_blocking(move || persistence.write_snapshot(generation, blob)),
                );
            }
            Err(_) => {
                drop(state);
                self.persistence.write_snapshot(generation, blob);
            }
        }
    }

    fn registry_readable(&self) -> bool {
        self.registry_readable.load(Ordering::SeqCst)
    }
}

impl StaleSink for CacheCore {
    fn mark_stale(&self, table: &str) -> usize {
        let mut state = self.lock();
        state.touch(table);
        let marked = state.store.mark_stale(table);
        if marked > 0 {
            debug!(table, marked, "Marked cached entries stale");
            self.commit(state);
        }
        marked
    }

    fn reconcile(&self, records: &[RemoteChangeRecord]) -> usize {
        let mut state = self.lock();
        let mut marked = 0;
        for record in records {
            // A reload already in flight may predate this record
            state.touch(&record.table_name);
            marked += state
                .store
                .mark_stale_before(&record.table_name, record.last_updated);
        }
        if marked > 0 {
            self.commit(state);
        }
        marked
    }

    fn set_registry_access(&self, authorized: bool) {
        let previous = self.registry_readable.swap(authorized, Ordering::SeqCst);
        if previous != authorized {
            if authorized {
                info!("Change registry readable again, cached reads re-enabled");
            } else {
                warn!("Change registry unreadable, bypassing cached reads");
            }
        }
    }
}

/// Age and status of one cached key, for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheAge {
    pub key: CacheKey,
    pub records: usize,
    pub age: String,
    pub status: EntryStatus,
}

/// The cache façade. Construct once per session and share by cloning.
#[derive(Clone)]
pub struct OpsCache {
    core: Arc<CacheCore>,
    registry: Arc<dyn ChangeRegistry>,
    subscriber: Arc<ChangeFeedSubscriber>,
}

impl OpsCache {
    pub fn new(
        config: CacheConfig,
        registry: Arc<dyn ChangeRegistry>,
        slot: Arc<dyn KeyValueSlot>,
    ) -> Result<Self, CacheError> {
        Self::with_clock(config, registry, slot, Arc::new(SystemClock))
    }

    /// Build the cache, restoring any persisted entries from `slot`.
    pub fn with_clock(
        config: CacheConfig,
        registry: Arc<dyn ChangeRegistry>,
        slot: Arc<dyn KeyValueSlot>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CacheError> {
        config.validate()?;

        let persistence = Arc::new(PersistenceAdapter::new(slot));
        let store = persistence.load();
        info!(
            slot = persistence.slot_name(),
            entries = store.len(),
            "Cache initialized"
        );

        let core = Arc::new(CacheCore {
            state: Mutex::new(CacheState {
                store,
                ..Default::default()
            }),
            persistence,
            clock,
            registry_readable: AtomicBool::new(true),
            config,
        });
        let subscriber = Arc::new(ChangeFeedSubscriber::new(
            registry.clone(),
            core.clone(),
            core.config.resubscribe_backoff,
        ));

        Ok(Self {
            core,
            registry,
            subscriber,
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.core.config
    }

    // ===== Reads =====

    /// Return the cached records for `key`, or reload them with `loader`.
    ///
    /// A hit needs an entry that is not stale, younger than `max_age`, and
    /// decodable as `T::Record`. Loader errors are returned unchanged and
    /// leave the cache untouched.
    pub async fn fetch_or_load<T, F, Fut, E>(
        &self,
        key: &TableKey<T>,
        loader: F,
    ) -> Result<Vec<T::Record>, E>
    where
        T: Table,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<T::Record>, E>>,
    {
        let key = key.key();
        let generation = {
            let mut state = self.core.lock();
            let now = self.core.clock.now();
            let cached = if self.core.registry_readable() {
                state
                    .store
                    .get(key)
                    .filter(|entry| entry.is_servable(now, self.core.config.max_age_chrono()))
                    .and_then(|entry| decode_records::<T>(key, &entry.data))
            } else {
                None
            };

            state.performance.record_access(key, cached.is_some(), now);
            if let Some(records) = cached {
                debug!(key = %key, "Cache hit");
                return Ok(records);
            }
            debug!(key = %key, "Cache miss, reloading");
            state.generation(key.table_name())
        };

        let records = loader().await?;

        let data = match encode_records(key, &records) {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, "Loaded records not cached");
                return Ok(records);
            }
        };

        let mut state = self.core.lock();
        let mut entry = CacheEntry::new(data, self.core.clock.now());
        if state.generation(key.table_name()) != generation {
            // Invalidated while loading: hand the data back but do not trust it
            debug!(key = %key, "Table changed during reload, storing as stale");
            entry.is_stale = true;
        }
        state.store.insert(key.clone(), entry);
        self.core.commit(state);
        Ok(records)
    }

    // ===== Writes =====

    /// Overwrite the entry with data the caller knows to be authoritative.
    pub fn set_cache<T: Table>(
        &self,
        key: &TableKey<T>,
        records: &[T::Record],
    ) -> Result<(), CacheError> {
        let key = key.key();
        let data = encode_records(key, records)?;
        let mut state = self.core.lock();
        state.touch(key.table_name());
        state
            .store
            .insert(key.clone(), CacheEntry::new(data, self.core.clock.now()));
        self.core.commit(state);
        Ok(())
    }

    /// Drop the entry so the next read reloads.
    pub fn invalidate(&self, key: impl AsRef<CacheKey>) {
        let key = key.as_ref();
        let mut state = self.core.lock();
        state.touch(key.table_name());
        if state.store.remove(key).is_some() {
            debug!(key = %key, "Cache entry invalidated");
            self.core.commit(state);
        }
    }

    /// Mark every cached variant of `table` stale without dropping data.
    /// Driven by the change feed.
    pub fn mark_stale(&self, table: &str) -> usize {
        self.core.mark_stale(table)
    }

    /// Record in the remote registry that `table` changed now.
    ///
    /// An unauthorized registry is skipped with a warning; other registry
    /// failures are returned.
    pub async fn bump_table_timestamp(&self, table: &str) -> Result<(), CacheError> {
        super::key::validate_table_name(table)?;
        let now = self.core.clock.now();
        match self.registry.bump(table, now).await {
            Ok(()) => {
                debug!(table, at = %now, "Bumped table timestamp");
                Ok(())
            }
            Err(e) if e.is_unauthorized() => {
                warn!(table, error = %e, "Skipping table timestamp bump");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Writer path after a local create/update/delete: notify other clients,
    /// then drop our own copy. The local copy is dropped even if the bump fails.
    pub async fn record_mutation(&self, key: impl AsRef<CacheKey>) -> Result<(), CacheError> {
        let key = key.as_ref();
        let bumped = self.bump_table_timestamp(key.table_name()).await;
        self.invalidate(key);
        bumped
    }

    // ===== Change feed lifecycle =====

    /// Start listening for other clients' writes. Returns whether a new
    /// subscription was started.
    pub fn subscribe_to_changes(&self) -> bool {
        self.subscriber.subscribe()
    }

    /// Stop listening and leave degraded mode, so the next session starts
    /// from a clean slate.
    pub fn teardown(&self) {
        self.subscriber.teardown();
        self.core.set_registry_access(true);
    }

    /// Subscribe for the lifetime of the returned guard. If a subscription is
    /// already running, the guard does not own it and dropping it leaves the
    /// feed alone.
    pub fn start_session(&self) -> SessionGuard {
        let owns_feed = self.subscribe_to_changes();
        SessionGuard {
            cache: self.clone(),
            owns_feed,
        }
    }

    pub fn subscriber_state(&self) -> SubscriberState {
        self.subscriber.state()
    }

    pub fn watch_subscriber_state(&self) -> watch::Receiver<SubscriberState> {
        self.subscriber.watch_state()
    }

    pub fn known_update(&self, table: &str) -> Option<chrono::DateTime<chrono::Utc>> {
        self.subscriber.known_update(table)
    }

    // ===== Diagnostics =====

    pub fn performance_snapshot(&self) -> PerformanceSnapshot {
        self.core.lock().performance.snapshot()
    }

    pub fn reset_performance_counters(&self) {
        self.core.lock().performance.reset();
    }

    pub fn entry_status(&self, key: impl AsRef<CacheKey>) -> EntryStatus {
        let state = self.core.lock();
        match state.store.get(key.as_ref()) {
            Some(entry) => entry.status(
                self.core.clock.now(),
                self.core.config.max_age_chrono(),
                self.core.config.refresh_threshold_chrono(),
            ),
            None => EntryStatus::Missing,
        }
    }

    /// Every cached key with its age, sorted by key.
    pub fn cache_ages(&self) -> Vec<CacheAge> {
        let state = self.core.lock();
        let now = self.core.clock.now();
        let mut ages: Vec<CacheAge> = state
            .store
            .iter()
            .map(|(key, entry)| CacheAge {
                key: key.clone(),
                records: entry.data.len(),
                age: entry.age_display(now),
                status: entry.status(
                    now,
                    self.core.config.max_age_chrono(),
                    self.core.config.refresh_threshold_chrono(),
                ),
            })
            .collect();
        ages.sort_by(|a, b| a.key.cmp(&b.key));
        ages
    }

    /// Check if any cached entry would be reloaded on its next read
    pub fn any_needs_reload(&self) -> bool {
        self.cache_ages().iter().any(|age| age.status.needs_reload())
    }

    pub fn entry_count(&self) -> usize {
        self.core.lock().store.len()
    }

    pub fn is_persistence_disabled(&self) -> bool {
        self.core.persistence.is_disabled()
    }

    /// Wait for the latest snapshot to reach the slot.
    pub async fn flush(&self) {
        let pending = self.core.lock().pending_write.take();
        if let Some(handle) = pending {
            if let Err(e) = handle.await {
                warn!(error = %e, "Cache persistence task failed");
            }
        }
    }
}

/// Tears down the change feed when dropped, if this guard started it.
pub struct SessionGuard {
    cache: OpsCache,
    owns_feed: bool,
}

impl SessionGuard {
    pub fn owns_feed(&self) -> bool {
        self.owns_feed
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.owns_feed {
            self.cache.teardown();
        }
    }
}

fn decode_records<T: Table>(key: &CacheKey, data: &[Value]) -> Option<Vec<T::Record>> {
    let decoded = data
        .iter()
        .map(<T::Record as Deserialize>::deserialize)
        .collect::<Result<Vec<T::Record>, _>>();
    match decoded {
        Ok(records) => Some(records),
        Err(e) => {
            debug!(key = %key, error = %e, "Cached records no longer decode, reloading");
            None
        }
    }
}

fn encode_records<R: serde::Serialize>(
    key: &CacheKey,
    records: &[R],
) -> Result<Vec<Value>, CacheError> {
    records
        .iter()
        .map(serde_json::to_value)
        .collect::<Result<Vec<Value>, _>>()
        .map_err(|source| CacheError::Encode {
            key: key.to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::persistence::MemorySlot;
    use crate::sync::{ChangeRegistry, InMemoryRegistry};
    use chrono::{Duration, Utc};
    use serde::Serialize;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration as StdDuration;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Soldier {
        id: u32,
        name: String,
    }

    struct Soldiers;

    impl Table for Soldiers {
        const NAME: &'static str = "soldiers";
        type Record = Soldier;
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Duty {
        slot: String,
    }

    struct Duties;

    impl Table for Duties {
        const NAME: &'static str = "duties";
        type Record = Duty;
    }

    struct Harness {
        cache: OpsCache,
        clock: Arc<ManualClock>,
        slot: Arc<MemorySlot>,
        registry: Arc<InMemoryRegistry>,
    }

    fn harness() -> Harness {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let slot = Arc::new(MemorySlot::new("test"));
        let registry = Arc::new(InMemoryRegistry::new());
        let cache = OpsCache::with_clock(
            CacheConfig::default(),
            registry.clone(),
            slot.clone(),
            clock.clone(),
        )
        .unwrap();
        Harness {
            cache,
            clock,
            slot,
            registry,
        }
    }

    fn soldiers(n: u32) -> Vec<Soldier> {
        (0..n)
            .map(|id| Soldier {
                id,
                name: format!("soldier-{}", id),
            })
            .collect()
    }

    /// Loader that counts its invocations and returns `n` soldiers.
    fn counting_loader(
        calls: &Arc<AtomicUsize>,
        n: u32,
    ) -> impl FnOnce() -> futures::future::Ready<Result<Vec<Soldier>, String>> {
        let calls = calls.clone();
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(Ok(soldiers(n)))
        }
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let h = harness();
        let key = TableKey::<Soldiers>::all();
        let calls = Arc::new(AtomicUsize::new(0));

        let first = h.cache.fetch_or_load(&key, counting_loader(&calls, 3)).await.unwrap();
        let second = h.cache.fetch_or_load(&key, counting_loader(&calls, 5)).await.unwrap();

        assert_eq!(first.len(), 3);
        assert_eq!(second, first);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let snap = h.cache.performance_snapshot();
        assert_eq!(snap.total_requests, 2);
        assert_eq!(snap.per_key["soldiers"].hits, 1);
        assert_eq!(snap.per_key["soldiers"].misses, 1);
    }

    #[tokio::test]
    async fn test_ttl_boundary() {
        let h = harness();
        let key = TableKey::<Soldiers>::all();
        let calls = Arc::new(AtomicUsize::new(0));
        let max_age = Duration::days(7);

        h.cache.fetch_or_load(&key, counting_loader(&calls, 1)).await.unwrap();

        h.clock.advance(max_age - Duration::seconds(1));
        h.cache.fetch_or_load(&key, counting_loader(&calls, 1)).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1, "just under max_age is a hit");

        h.clock.advance(Duration::seconds(1));
        h.cache.fetch_or_load(&key, counting_loader(&calls, 1)).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2, "exactly max_age is a miss");

        h.clock.advance(max_age + Duration::seconds(1));
        h.cache.fetch_or_load(&key, counting_loader(&calls, 1)).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3, "past max_age is a miss");
    }

    #[tokio::test]
    async fn test_stale_entry_reloads_once() {
        let h = harness();
        let key = TableKey::<Soldiers>::all();
        let calls = Arc::new(AtomicUsize::new(0));

        h.cache.fetch_or_load(&key, counting_loader(&calls, 3)).await.unwrap();
        assert_eq!(h.cache.mark_stale("soldiers"), 1);
        assert_eq!(h.cache.entry_status(&key), EntryStatus::Stale);

        let reloaded = h.cache.fetch_or_load(&key, counting_loader(&calls, 4)).await.unwrap();
        assert_eq!(reloaded.len(), 4);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(h.cache.entry_status(&key), EntryStatus::Fresh);

        h.cache.fetch_or_load(&key, counting_loader(&calls, 9)).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_mark_stale_covers_owner_variants() {
        let h = harness();
        let all = TableKey::<Duties>::all();
        let mine = TableKey::<Duties>::owned_by("u1").unwrap();
        let theirs = TableKey::<Duties>::owned_by("u2").unwrap();
        let duty = vec![Duty { slot: "night".into() }];

        for key in [&all, &mine, &theirs] {
            h.cache.set_cache(key, &duty).unwrap();
        }
        h.cache.set_cache(&TableKey::<Soldiers>::all(), &soldiers(1)).unwrap();

        assert_eq!(h.cache.mark_stale("duties"), 3);
        assert_eq!(h.cache.entry_status(&mine), EntryStatus::Stale);
        assert_eq!(h.cache.entry_status(TableKey::<Soldiers>::all()), EntryStatus::Fresh);
    }

    #[tokio::test]
    async fn test_loader_failure_leaves_cache_untouched() {
        let h = harness();
        let key = TableKey::<Soldiers>::all();

        let err = h
            .cache
            .fetch_or_load(&key, || async { Err::<Vec<Soldier>, _>("remote down".to_string()) })
            .await
            .unwrap_err();
        assert_eq!(err, "remote down");
        assert_eq!(h.cache.entry_status(&key), EntryStatus::Missing);

        h.cache.set_cache(&key, &soldiers(2)).unwrap();
        h.cache.mark_stale("soldiers");
        let result = h
            .cache
            .fetch_or_load(&key, || async { Err::<Vec<Soldier>, _>("still down".to_string()) })
            .await;
        assert!(result.is_err());
        // previous stale data is kept, not replaced or removed
        assert_eq!(h.cache.entry_status(&key), EntryStatus::Stale);
        assert_eq!(h.cache.cache_ages()[0].records, 2);
    }

    #[tokio::test]
    async fn test_own_write_consistency() {
        let h = harness();
        let key = TableKey::<Soldiers>::all();
        let calls = Arc::new(AtomicUsize::new(0));

        h.cache.fetch_or_load(&key, counting_loader(&calls, 3)).await.unwrap();
        h.cache.record_mutation(&key).await.unwrap();
        assert!(h.registry.get("soldiers").is_some());

        h.cache.fetch_or_load(&key, counting_loader(&calls, 4)).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_set_cache_serves_without_loader() {
        let h = harness();
        let key = TableKey::<Soldiers>::owned_by("commander").unwrap();
        h.cache.set_cache(&key, &soldiers(2)).unwrap();

        let records = h
            .cache
            .fetch_or_load(&key, || async { Err::<Vec<Soldier>, String>("unused".into()) })
            .await
            .unwrap();
        assert_eq!(records, soldiers(2));
    }

    #[tokio::test]
    async fn test_invalidation_during_reload_stores_stale() {
        let h = harness();
        let key = TableKey::<Soldiers>::all();
        let cache = h.cache.clone();

        let records = h
            .cache
            .fetch_or_load(&key, move || async move {
                // another write lands while the remote read is in flight
                cache.mark_stale("soldiers");
                Ok::<_, String>(soldiers(2))
            })
            .await
            .unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(h.cache.entry_status(&key), EntryStatus::Stale);
    }

    #[tokio::test]
    async fn test_undecodable_entry_reloads() {
        let h = harness();
        let key = TableKey::<Duties>::all();
        // same table name, different record shape
        struct LegacyDuties;
        impl Table for LegacyDuties {
            const NAME: &'static str = "duties";
            type Record = u32;
        }
        h.cache.set_cache(&TableKey::<LegacyDuties>::all(), &[1, 2]).unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let records = h
            .cache
            .fetch_or_load(&key, move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, String>(vec![Duty { slot: "day".into() }]) }
            })
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_state_survives_restart() {
        let h = harness();
        let key = TableKey::<Soldiers>::all();
        let calls = Arc::new(AtomicUsize::new(0));
        h.cache.fetch_or_load(&key, counting_loader(&calls, 3)).await.unwrap();
        h.cache.set_cache(&TableKey::<Duties>::owned_by("u9").unwrap(), &[]).unwrap();
        h.cache.flush().await;

        let restarted = OpsCache::with_clock(
            CacheConfig::default(),
            h.registry.clone(),
            h.slot.clone(),
            h.clock.clone(),
        )
        .unwrap();
        assert_eq!(restarted.entry_count(), 2);

        let records = restarted.fetch_or_load(&key, counting_loader(&calls, 7)).await.unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_persistence_failure_keeps_working_in_memory() {
        let h = harness();
        h.slot.set_fail_writes(true);
        let key = TableKey::<Soldiers>::all();
        let calls = Arc::new(AtomicUsize::new(0));

        h.cache.fetch_or_load(&key, counting_loader(&calls, 3)).await.unwrap();
        h.cache.flush().await;
        assert!(h.cache.is_persistence_disabled());

        h.cache.fetch_or_load(&key, counting_loader(&calls, 3)).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.slot.contents(), None);
    }

    #[tokio::test]
    async fn test_invalidate_persists_removal() {
        let h = harness();
        let key = TableKey::<Soldiers>::all();
        h.cache.set_cache(&key, &soldiers(1)).unwrap();
        h.cache.invalidate(&key);
        h.cache.flush().await;

        let blob = h.slot.contents().unwrap();
        assert!(adapter::decode(&blob).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unreadable_registry_bypasses_cache() {
        let h = harness();
        let key = TableKey::<Soldiers>::all();
        let calls = Arc::new(AtomicUsize::new(0));
        h.cache.set_cache(&key, &soldiers(1)).unwrap();

        h.cache.core.set_registry_access(false);
        h.cache.fetch_or_load(&key, counting_loader(&calls, 1)).await.unwrap();
        h.cache.fetch_or_load(&key, counting_loader(&calls, 1)).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        h.cache.core.set_registry_access(true);
        h.cache.fetch_or_load(&key, counting_loader(&calls, 1)).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unauthorized_bump_is_skipped() {
        let h = harness();
        h.registry.set_authorized(false);
        assert!(h.cache.bump_table_timestamp("soldiers").await.is_ok());
        assert_eq!(h.registry.get("soldiers"), None);
        assert!(matches!(
            h.cache.bump_table_timestamp("bad name").await,
            Err(CacheError::InvalidKey(_))
        ));
    }

    #[tokio::test]
    async fn test_reconcile_marks_entries_changed_offline() {
        let h = harness();
        let key = TableKey::<Soldiers>::all();
        h.cache.set_cache(&key, &soldiers(1)).unwrap();
        h.cache.set_cache(&TableKey::<Duties>::all(), &[]).unwrap();

        let later = h.clock.now() + Duration::minutes(5);
        let marked = h.cache.core.reconcile(&[RemoteChangeRecord {
            table_name: "soldiers".into(),
            last_updated: later,
        }]);
        assert_eq!(marked, 1);
        assert_eq!(h.cache.entry_status(&key), EntryStatus::Stale);
        assert_eq!(h.cache.entry_status(TableKey::<Duties>::all()), EntryStatus::Fresh);
    }

    #[tokio::test]
    async fn test_cache_ages_and_status() {
        let h = harness();
        h.cache.set_cache(&TableKey::<Soldiers>::all(), &soldiers(2)).unwrap();
        h.clock.advance(Duration::hours(30));
        h.cache.set_cache(&TableKey::<Duties>::all(), &[]).unwrap();

        let ages = h.cache.cache_ages();
        assert_eq!(ages.len(), 2);
        assert_eq!(ages[0].key.to_string(), "duties");
        assert_eq!(ages[0].age, "just now");
        assert_eq!(ages[1].status, EntryStatus::Aging);
        assert_eq!(ages[1].age, "1d ago");
        assert!(!h.cache.any_needs_reload());

        h.cache.mark_stale("duties");
        assert!(h.cache.any_needs_reload());
    }

    #[tokio::test]
    async fn test_reset_performance_counters_keeps_entries() {
        let h = harness();
        let key = TableKey::<Soldiers>::all();
        let calls = Arc::new(AtomicUsize::new(0));
        h.cache.fetch_or_load(&key, counting_loader(&calls, 1)).await.unwrap();
        h.cache.reset_performance_counters();
        assert_eq!(h.cache.performance_snapshot().total_requests, 0);
        assert_eq!(h.cache.entry_count(), 1);
    }

    #[tokio::test]
    async fn test_session_guard_tears_down() {
        let h = harness();
        {
            let _session = h.cache.start_session();
            let mut rx = h.cache.watch_subscriber_state();
            rx.wait_for(|s| *s == SubscriberState::Active).await.unwrap();
        }
        assert_eq!(h.cache.subscriber_state(), SubscriberState::Unsubscribed);
    }

    #[tokio::test]
    async fn test_nested_session_leaves_feed_running() {
        let h = harness();
        let key = TableKey::<Soldiers>::all();
        let outer = h.cache.start_session();
        assert!(outer.owns_feed());
        let mut rx = h.cache.watch_subscriber_state();
        rx.wait_for(|s| *s == SubscriberState::Active).await.unwrap();

        {
            let inner = h.cache.start_session();
            assert!(!inner.owns_feed());
        }
        assert_eq!(h.cache.subscriber_state(), SubscriberState::Active);

        h.cache.set_cache(&key, &soldiers(2)).unwrap();
        h.registry
            .bump("soldiers", h.clock.now() + Duration::seconds(1))
            .await
            .unwrap();
        tokio::time::timeout(StdDuration::from_secs(5), async {
            while h.cache.entry_status(&key) != EntryStatus::Stale {
                tokio::time::sleep(StdDuration::from_millis(5)).await;
            }
        })
        .await
        .expect("remote write not seen after inner session ended");

        drop(outer);
        assert_eq!(h.cache.subscriber_state(), SubscriberState::Unsubscribed);
    }

    #[tokio::test]
    async fn test_teardown_leaves_degraded_mode() {
        let h = harness();
        let key = TableKey::<Soldiers>::all();
        let calls = Arc::new(AtomicUsize::new(0));
        h.cache.set_cache(&key, &soldiers(1)).unwrap();

        h.cache.core.set_registry_access(false);
        h.cache.teardown();
        h.cache.fetch_or_load(&key, counting_loader(&calls, 1)).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_reload_does_not_block_other_keys() {
        let h = harness();
        let soldiers_key = TableKey::<Soldiers>::all();
        let duties_key = TableKey::<Duties>::all();
        let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let slow = h.cache.fetch_or_load(&soldiers_key, move || async move {
            let _ = started_tx.send(());
            let _ = release_rx.await;
            Ok::<_, String>(soldiers(2))
        });

        let others = async {
            started_rx.await.unwrap();
            let duties = h
                .cache
                .fetch_or_load(&duties_key, || async {
                    Ok::<_, String>(vec![Duty { slot: "gate".into() }])
                })
                .await
                .unwrap();
            assert_eq!(duties.len(), 1);
            assert_eq!(h.cache.mark_stale("duties"), 1);
            h.cache.invalidate(&duties_key);
            assert_eq!(h.cache.entry_status(&duties_key), EntryStatus::Missing);
            release_tx.send(()).unwrap();
        };

        let (loaded, ()) = tokio::time::timeout(StdDuration::from_secs(5), async {
            tokio::join!(slow, others)
        })
        .await
        .expect("reload of one key blocked another");
        assert_eq!(loaded.unwrap().len(), 2);
        assert_eq!(h.cache.entry_status(&soldiers_key), EntryStatus::Fresh);
    }

    #[tokio::test]
    async fn test_reconcile_during_reload_stores_stale() {
        let h = harness();
        let key = TableKey::<Soldiers>::all();
        let cache = h.cache.clone();
        let at = h.clock.now();

        h.cache
            .fetch_or_load(&key, move || async move {
                // nothing cached yet, but the registry moved while loading
                let marked = cache.core.reconcile(&[RemoteChangeRecord {
                    table_name: "soldiers".into(),
                    last_updated: at,
                }]);
                assert_eq!(marked, 0);
                Ok::<_, String>(soldiers(1))
            })
            .await
            .unwrap();
        assert_eq!(h.cache.entry_status(&key), EntryStatus::Stale);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = OpsCache::new(
            CacheConfig::default().with_max_age(StdDuration::ZERO),
            Arc::new(InMemoryRegistry::new()),
            Arc::new(MemorySlot::new("s")),
        );
        assert!(matches!(result, Err(CacheError::Config(_))));
    }
}
