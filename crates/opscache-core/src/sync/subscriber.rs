use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{ChangeRegistry, ChangeStream, RegistryError, RemoteChangeRecord};

/// Receiver of staleness signals. Implemented by the cache.
pub trait StaleSink: Send + Sync {
    /// Mark every cached variant of `table` stale. Returns entries changed.
    fn mark_stale(&self, table: &str) -> usize;

    /// Mark entries loaded before their table's registry timestamp stale.
    fn reconcile(&self, records: &[RemoteChangeRecord]) -> usize;

    /// Whether the registry is currently readable by this client.
    fn set_registry_access(&self, authorized: bool);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    Unsubscribed,
    Subscribing,
    Active,
    Retrying,
}

/// Last registry timestamp this client has observed, per table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KnownUpdateLedger {
    seen: HashMap<String, DateTime<Utc>>,
}

impl KnownUpdateLedger {
    pub fn get(&self, table: &str) -> Option<DateTime<Utc>> {
        self.seen.get(table).copied()
    }

    /// Record `at` for `table`. Returns true only if it is strictly newer
    /// than what was known; an absent table counts as older.
    pub fn observe(&mut self, table: &str, at: DateTime<Utc>) -> bool {
        match self.seen.get(table) {
            Some(known) if *known >= at => false,
            _ => {
                self.seen.insert(table.to_string(), at);
                true
            }
        }
    }

    pub fn seed(&mut self, records: &[RemoteChangeRecord]) {
        for record in records {
            self.observe(&record.table_name, record.last_updated);
        }
    }
}

struct Shared {
    registry: Arc<dyn ChangeRegistry>,
    sink: Arc<dyn StaleSink>,
    backoff: Duration,
    known: Mutex<KnownUpdateLedger>,
    state: watch::Sender<SubscriberState>,
    /// Bumped on every subscribe/teardown; a run loop from an older epoch
    /// never publishes state.
    epoch: AtomicU64,
}

/// Long-lived subscription to the change registry.
///
/// `Unsubscribed → Subscribing → Active`, dropping to `Retrying` on transport
/// failure and re-subscribing after a fixed backoff. At most one run loop
/// exists at a time.
pub struct ChangeFeedSubscriber {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ChangeFeedSubscriber {
    pub fn new(
        registry: Arc<dyn ChangeRegistry>,
        sink: Arc<dyn StaleSink>,
        backoff: Duration,
    ) -> Self {
        let (state, _) = watch::channel(SubscriberState::Unsubscribed);
        Self {
            shared: Arc::new(Shared {
                registry,
                sink,
                backoff,
                known: Mutex::new(KnownUpdateLedger::default()),
                state,
                epoch: AtomicU64::new(0),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SubscriberState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SubscriberState> {
        self.shared.state.subscribe()
    }

    pub fn known_update(&self, table: &str) -> Option<DateTime<Utc>> {
        self.shared.lock_known().get(table)
    }

    /// Start the run loop. A no-op while already subscribing, active or
    /// retrying. Returns whether a new loop was started; must be called from
    /// within a Tokio runtime.
    pub fn subscribe(&self) -> bool {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if self.state() != SubscriberState::Unsubscribed {
            debug!(state = ?self.state(), "Change feed already running");
            return false;
        }

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                warn!(error = %e, "Cannot subscribe to change feed outside a runtime");
                return false;
            }
        };

        let epoch = self.shared.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.state.send_replace(SubscriberState::Subscribing);
        *task = Some(handle.spawn(Arc::clone(&self.shared).run(epoch)));
        true
    }

    /// Cancel any active or pending subscription, including a backoff in
    /// progress. Safe to call repeatedly.
    pub fn teardown(&self) {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        self.shared.epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(handle) = task.take() {
            handle.abort();
            info!("Change feed torn down");
        }
        self.shared.state.send_replace(SubscriberState::Unsubscribed);
    }
}

impl Drop for ChangeFeedSubscriber {
    fn drop(&mut self) {
        if let Some(handle) = self.task.get_mut().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
    }
}

impl Shared {
    fn lock_known(&self) -> std::sync::MutexGuard<'_, KnownUpdateLedger> {
        self.known.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, epoch: u64, state: SubscriberState) {
        if self.epoch.load(Ordering::SeqCst) == epoch {
            self.state.send_replace(state);
        }
    }

    async fn run(self: Arc<Self>, epoch: u64) {
        let mut seeded = false;
        loop {
            self.set_state(epoch, SubscriberState::Subscribing);
            match self.open(&mut seeded).await {
                Ok(mut feed) => {
                    self.set_state(epoch, SubscriberState::Active);
                    self.sink.set_registry_access(true);
                    info!("Change feed active");

                    while let Some(item) = feed.next().await {
                        match item {
                            Ok(event) => self.apply(&event.record),
                            Err(e) => {
                                warn!(error = %e, "Change feed transport failure");
                                break;
                            }
                        }
                    }
                }
                Err(e) if e.is_unauthorized() => {
                    warn!(error = %e, "Change registry not readable, every read will reload");
                    self.sink.set_registry_access(false);
                }
                Err(e) => {
                    warn!(error = %e, "Failed to subscribe to change feed");
                }
            }

            self.set_state(epoch, SubscriberState::Retrying);
            debug!(backoff = ?self.backoff, "Re-subscribing to change feed after backoff");
            tokio::time::sleep(self.backoff).await;
        }
    }

    /// Seed the ledger once per run loop, then open the feed.
    async fn open(&self, seeded: &mut bool) -> Result<ChangeStream, RegistryError> {
        if !*seeded {
            let records = self.registry.list().await?;
            self.lock_known().seed(&records);
            let marked = self.sink.reconcile(&records);
            if marked > 0 {
                info!(marked, "Marked entries changed remotely while offline as stale");
            }
            *seeded = true;
        }
        self.registry.subscribe().await
    }

    fn apply(&self, record: &RemoteChangeRecord) {
        let newer = self
            .lock_known()
            .observe(&record.table_name, record.last_updated);
        if newer {
            let marked = self.sink.mark_stale(&record.table_name);
            debug!(
                table = %record.table_name,
                at = %record.last_updated,
                marked,
                "Remote change observed"
            );
        } else {
            debug!(table = %record.table_name, "Ignoring change already seen");
        }
    }
}
