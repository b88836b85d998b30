//! Two clients sharing one change registry, replaying a cross-client write.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use opscache_core::{
    CacheConfig, EntryStatus, InMemoryRegistry, MemorySlot, OpsCache, SubscriberState, TableKey,
};
use tracing::info;

use crate::tables::{soldier, Soldier, Soldiers, Vehicle, Vehicles};

/// How long to wait for the change feed to deliver a write.
const PROPAGATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Stand-in for the remote document store both clients read from.
#[derive(Default)]
struct RemoteStore {
    soldiers: Mutex<Vec<Soldier>>,
    vehicles: Mutex<Vec<Vehicle>>,
    reads: Mutex<HashMap<&'static str, usize>>,
}

impl RemoteStore {
    fn count_read(&self, table: &'static str) {
        *self
            .reads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(table)
            .or_insert(0) += 1;
    }

    async fn list_soldiers(&self) -> Result<Vec<Soldier>> {
        self.count_read("soldiers");
        Ok(self.soldiers.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    async fn list_vehicles(&self) -> Result<Vec<Vehicle>> {
        self.count_read("vehicles");
        Ok(self.vehicles.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn add_soldier(&self, soldier: Soldier) {
        self.soldiers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(soldier);
    }

    fn reads(&self, table: &'static str) -> usize {
        self.reads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(table)
            .copied()
            .unwrap_or(0)
    }
}

fn new_client(
    registry: &Arc<InMemoryRegistry>,
    config: &CacheConfig,
    name: &str,
) -> Result<OpsCache> {
    let cache = OpsCache::new(
        config.clone(),
        registry.clone(),
        Arc::new(MemorySlot::new(name)),
    )?;
    Ok(cache)
}

async fn wait_for_state(cache: &OpsCache, state: SubscriberState) -> Result<()> {
    let mut rx = cache.watch_subscriber_state();
    tokio::time::timeout(PROPAGATION_TIMEOUT, rx.wait_for(|s| *s == state))
        .await
        .context("Timed out waiting for change feed")?
        .context("Change feed closed")?;
    Ok(())
}

pub async fn run(config: CacheConfig) -> Result<()> {
    let remote = Arc::new(RemoteStore::default());
    for (id, name, rank) in [
        (1, "Avi Cohen", "Sergeant"),
        (2, "Noa Levi", "Corporal"),
        (3, "Dan Mizrahi", "Private"),
    ] {
        remote.add_soldier(soldier(id, name, rank));
    }
    remote
        .vehicles
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .push(Vehicle {
            id: "v-1".into(),
            plate: "12-345-67".into(),
            kind: "Hummer".into(),
            available: true,
        });

    let registry = Arc::new(InMemoryRegistry::new());
    let client_a = new_client(&registry, &config, "client-a")?;
    let client_b = new_client(&registry, &config, "client-b")?;

    let _session_a = client_a.start_session();
    let _session_b = client_b.start_session();
    wait_for_state(&client_a, SubscriberState::Active).await?;
    wait_for_state(&client_b, SubscriberState::Active).await?;

    let soldiers_key = TableKey::<Soldiers>::all();
    let vehicles_key = TableKey::<Vehicles>::all();

    let roster = client_a
        .fetch_or_load(&soldiers_key, || remote.list_soldiers())
        .await?;
    client_a
        .fetch_or_load(&vehicles_key, || remote.list_vehicles())
        .await?;
    client_a
        .fetch_or_load(&soldiers_key, || remote.list_soldiers())
        .await?;
    println!("client A: {} soldiers cached", roster.len());

    // Client B enlists a soldier and announces the write
    remote.add_soldier(soldier(4, "Yael Peretz", "Private"));
    client_b.record_mutation(&soldiers_key).await?;
    info!("Client B recorded a mutation on soldiers");

    tokio::time::timeout(PROPAGATION_TIMEOUT, async {
        while client_a.entry_status(&soldiers_key) != EntryStatus::Stale {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .context("Client A never observed client B's write")?;
    println!("client A: soldiers marked stale by the change feed");

    let roster = client_a
        .fetch_or_load(&soldiers_key, || remote.list_soldiers())
        .await?;
    client_a
        .fetch_or_load(&vehicles_key, || remote.list_vehicles())
        .await?;
    println!(
        "client A: reloaded {} soldiers (remote reads: soldiers={}, vehicles={})",
        roster.len(),
        remote.reads("soldiers"),
        remote.reads("vehicles")
    );

    println!("\nclient A performance:");
    println!("{}", serde_json::to_string_pretty(&client_a.performance_snapshot())?);
    println!("client B performance:");
    println!("{}", serde_json::to_string_pretty(&client_b.performance_snapshot())?);

    Ok(())
}
