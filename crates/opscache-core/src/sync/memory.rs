use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::debug;

use super::{
    ChangeEvent, ChangeKind, ChangeRegistry, ChangeStream, RegistryError, RemoteChangeRecord,
};
use crate::cache::key::validate_table_name;

/// Buffered change events per subscriber before it is considered lagged.
const FEED_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
enum FeedMessage {
    Change(ChangeEvent),
    Fault(String),
}

#[derive(Debug)]
struct RegistryState {
    records: BTreeMap<String, DateTime<Utc>>,
    authorized: bool,
    failing_subscribes: usize,
}

/// Change registry shared by clients in one process.
///
/// Share it behind an `Arc` between several caches to model independent
/// clients of the same remote store.
#[derive(Debug)]
pub struct InMemoryRegistry {
    state: Mutex<RegistryState>,
    feed: broadcast::Sender<FeedMessage>,
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            state: Mutex::new(RegistryState {
                records: BTreeMap::new(),
                authorized: true,
                failing_subscribes: 0,
            }),
            feed,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, table: &str) -> Option<DateTime<Utc>> {
        self.lock().records.get(table).copied()
    }

    /// Deny or allow every registry call, as an unauthenticated session would see.
    pub fn set_authorized(&self, authorized: bool) {
        self.lock().authorized = authorized;
    }

    /// Make the next `count` subscribe attempts fail with a transport error.
    pub fn fail_next_subscribes(&self, count: usize) {
        self.lock().failing_subscribes = count;
    }

    /// Break every open subscription with a transport error.
    pub fn inject_fault(&self, reason: &str) {
        let _ = self.feed.send(FeedMessage::Fault(reason.to_string()));
    }

    pub fn subscriber_count(&self) -> usize {
        self.feed.receiver_count()
    }
}

#[async_trait]
impl ChangeRegistry for InMemoryRegistry {
    async fn bump(&self, table: &str, at: DateTime<Utc>) -> Result<(), RegistryError> {
        validate_table_name(table).map_err(|e| RegistryError::Backend(e.to_string()))?;

        let mut state = self.lock();
        if !state.authorized {
            return Err(RegistryError::Unauthorized);
        }

        let kind = match state.records.get(table) {
            Some(existing) if *existing >= at => return Ok(()),
            Some(_) => ChangeKind::Modified,
            None => ChangeKind::Added,
        };
        state.records.insert(table.to_string(), at);
        debug!(table, at = %at, "Registry row updated");

        // No receivers is not an error
        let _ = self.feed.send(FeedMessage::Change(ChangeEvent {
            kind,
            record: RemoteChangeRecord {
                table_name: table.to_string(),
                last_updated: at,
            },
        }));
        Ok(())
    }

    async fn list(&self) -> Result<Vec<RemoteChangeRecord>, RegistryError> {
        let state = self.lock();
        if !state.authorized {
            return Err(RegistryError::Unauthorized);
        }
        Ok(state
            .records
            .iter()
            .map(|(table, at)| RemoteChangeRecord {
                table_name: table.clone(),
                last_updated: *at,
            })
            .collect())
    }

    async fn subscribe(&self) -> Result<ChangeStream, RegistryError> {
        let (initial, rx) = {
            let mut state = self.lock();
            if !state.authorized {
                return Err(RegistryError::Unauthorized);
            }
            if state.failing_subscribes > 0 {
                state.failing_subscribes -= 1;
                return Err(RegistryError::Transport("subscribe refused".into()));
            }

            // Subscribe before snapshotting so no change falls in between
            let rx = self.feed.subscribe();
            let initial: Vec<Result<ChangeEvent, RegistryError>> = state
                .records
                .iter()
                .map(|(table, at)| {
                    Ok(ChangeEvent {
                        kind: ChangeKind::Added,
                        record: RemoteChangeRecord {
                            table_name: table.clone(),
                            last_updated: *at,
                        },
                    })
                })
                .collect();
            (initial, rx)
        };

        let live = stream::unfold(rx, |mut rx| async move {
            let item = match rx.recv().await {
                Ok(FeedMessage::Change(event)) => Ok(event),
                Ok(FeedMessage::Fault(reason)) => Err(RegistryError::Transport(reason)),
                Err(RecvError::Lagged(missed)) => Err(RegistryError::Transport(format!(
                    "feed lagged, {} events dropped",
                    missed
                ))),
                Err(RecvError::Closed) => return None,
            };
            Some((item, rx))
        });

        Ok(stream::iter(initial).chain(live).boxed())
    }
}
