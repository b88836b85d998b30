//! Coherence between independent clients sharing one change registry.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};

use opscache_core::sync::ChangeStream;
use opscache_core::{
    CacheConfig, ChangeEvent, ChangeKind, ChangeRegistry, EntryStatus, FileSlot, InMemoryRegistry,
    MemorySlot, OpsCache, RegistryError, RemoteChangeRecord, SubscriberState, Table, TableKey,
};

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

fn soldiers(n: u32) -> Vec<Soldier> {
    (0..n)
        .map(|id| Soldier {
            id,
            name: format!("soldier-{}", id),
        })
        .collect()
}

fn client(registry: Arc<dyn ChangeRegistry>) -> OpsCache {
    OpsCache::new(
        CacheConfig::default(),
        registry,
        Arc::new(MemorySlot::new("client")),
    )
    .unwrap()
}

async fn wait_active(cache: &OpsCache) {
    let mut rx = cache.watch_subscriber_state();
    tokio::time::timeout(
        Duration::from_secs(5),
        rx.wait_for(|s| *s == SubscriberState::Active),
    )
    .await
    .expect("subscriber never became active")
    .unwrap();
}

async fn wait_status(cache: &OpsCache, key: &TableKey<Soldiers>, status: EntryStatus) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while cache.entry_status(key) != status {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("entry never reached expected status");
}

#[tokio::test]
async fn test_write_by_other_client_forces_reload() {
    let registry = Arc::new(InMemoryRegistry::new());
    let client_a = client(registry.clone());
    let client_b = client(registry.clone());
    let key = TableKey::<Soldiers>::all();

    let _session = client_a.start_session();
    wait_active(&client_a).await;

    let loaded = client_a
        .fetch_or_load(&key, || async { Ok::<_, String>(soldiers(3)) })
        .await
        .unwrap();
    assert_eq!(loaded.len(), 3);
    assert_eq!(client_a.entry_status(&key), EntryStatus::Fresh);

    // client B writes the table elsewhere
    client_b.record_mutation(&key).await.unwrap();
    wait_status(&client_a, &key, EntryStatus::Stale).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let reloaded = client_a
        .fetch_or_load(&key, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, String>(soldiers(4)) }
        })
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(reloaded.len(), 4);
    assert_eq!(client_a.entry_status(&key), EntryStatus::Fresh);
    assert_eq!(
        client_a.known_update("soldiers"),
        registry.get("soldiers")
    );
}

#[tokio::test]
async fn test_remote_change_while_offline_is_reconciled() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(InMemoryRegistry::new());
    let key = TableKey::<Soldiers>::owned_by("platoon-2").unwrap();

    {
        let slot = Arc::new(FileSlot::new(dir.path(), "store").unwrap());
        let cache = OpsCache::new(CacheConfig::default(), registry.clone(), slot).unwrap();
        cache.set_cache(&key, &soldiers(2)).unwrap();
        cache.flush().await;
    }

    registry
        .bump("soldiers", Utc::now() + chrono::Duration::seconds(30))
        .await
        .unwrap();

    let slot = Arc::new(FileSlot::new(dir.path(), "store").unwrap());
    let cache = OpsCache::new(CacheConfig::default(), registry.clone(), slot).unwrap();
    assert_eq!(cache.entry_status(&key), EntryStatus::Fresh);

    let _session = cache.start_session();
    wait_active(&cache).await;
    assert_eq!(cache.entry_status(&key), EntryStatus::Stale);
}

/// Registry whose feed replays a fixed list of events and then stays open.
struct ScriptedRegistry {
    seed: Vec<RemoteChangeRecord>,
    events: Vec<ChangeEvent>,
}

#[async_trait]
impl ChangeRegistry for ScriptedRegistry {
    async fn bump(&self, _table: &str, _at: DateTime<Utc>) -> Result<(), RegistryError> {
        Ok(())
    }

    async fn list(&self) -> Result<Vec<RemoteChangeRecord>, RegistryError> {
        Ok(self.seed.clone())
    }

    async fn subscribe(&self) -> Result<ChangeStream, RegistryError> {
        let events: Vec<Result<ChangeEvent, RegistryError>> =
            self.events.iter().cloned().map(Ok).collect();
        Ok(stream::iter(events).chain(stream::pending()).boxed())
    }
}

fn modified(table: &str, at: DateTime<Utc>) -> ChangeEvent {
    ChangeEvent {
        kind: ChangeKind::Modified,
        record: RemoteChangeRecord {
            table_name: table.to_string(),
            last_updated: at,
        },
    }
}

#[tokio::test]
async fn test_old_or_duplicate_events_leave_store_unchanged() {
    let t0 = Utc::now() - chrono::Duration::hours(1);
    let registry = Arc::new(ScriptedRegistry {
        seed: vec![RemoteChangeRecord {
            table_name: "soldiers".into(),
            last_updated: t0,
        }],
        events: vec![
            modified("soldiers", t0),
            modified("soldiers", t0 - chrono::Duration::seconds(10)),
        ],
    });
    let cache = client(registry);
    let key = TableKey::<Soldiers>::all();
    cache.set_cache(&key, &soldiers(1)).unwrap();

    let _session = cache.start_session();
    wait_active(&cache).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(cache.entry_status(&key), EntryStatus::Fresh);
    assert_eq!(cache.known_update("soldiers"), Some(t0));
}

#[tokio::test]
async fn test_newer_event_marks_every_owner_variant() {
    let t0 = Utc::now() - chrono::Duration::hours(1);
    let t1 = t0 + chrono::Duration::seconds(1);
    let registry = Arc::new(ScriptedRegistry {
        seed: vec![RemoteChangeRecord {
            table_name: "soldiers".into(),
            last_updated: t0,
        }],
        events: vec![modified("soldiers", t1)],
    });
    let cache = client(registry);
    let keys = [
        TableKey::<Soldiers>::all(),
        TableKey::<Soldiers>::owned_by("alpha").unwrap(),
        TableKey::<Soldiers>::owned_by("bravo").unwrap(),
    ];
    for key in &keys {
        cache.set_cache(key, &soldiers(1)).unwrap();
    }

    let _session = cache.start_session();
    for key in &keys {
        wait_status(&cache, key, EntryStatus::Stale).await;
    }
    assert_eq!(cache.known_update("soldiers"), Some(t1));
}
