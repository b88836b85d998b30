use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{KeyValueSlot, StorageError};
use crate::cache::{CacheEntry, CacheKey, LocalEntryStore};

/// Current on-disk document version. Anything else loads as a cold start.
const STORE_FORMAT_VERSION: u32 = 1;

#[derive(Serialize)]
struct StoreDocumentRef<'a> {
    version: u32,
    entries: Vec<EntryRef<'a>>,
}

#[derive(Serialize)]
struct EntryRef<'a> {
    table: &'a str,
    owner: Option<&'a str>,
    #[serde(flatten)]
    entry: &'a CacheEntry,
}

#[derive(Deserialize)]
struct StoreDocument {
    version: u32,
    entries: Vec<PersistedEntry>,
}

#[derive(Deserialize)]
struct PersistedEntry {
    table: String,
    owner: Option<String>,
    #[serde(flatten)]
    entry: CacheEntry,
}

/// Serialize the whole store into one blob. Entries are sorted by key so
/// identical stores produce identical blobs.
pub fn encode(store: &LocalEntryStore) -> Result<String, StorageError> {
    let mut entries: Vec<(&CacheKey, &CacheEntry)> = store.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));

    let doc = StoreDocumentRef {
        version: STORE_FORMAT_VERSION,
        entries: entries
            .into_iter()
            .map(|(key, entry)| EntryRef {
                table: key.table_name(),
                owner: key.owner(),
                entry,
            })
            .collect(),
    };
    serde_json::to_string(&doc).map_err(StorageError::Encode)
}

pub fn decode(blob: &str) -> Result<LocalEntryStore, StorageError> {
    let doc: StoreDocument = serde_json::from_str(blob).map_err(StorageError::Decode)?;
    if doc.version != STORE_FORMAT_VERSION {
        return Err(StorageError::Corrupt(format!(
            "unsupported format version {}",
            doc.version
        )));
    }

    doc.entries
        .into_iter()
        .map(|persisted| {
            let key = match persisted.owner {
                Some(owner) => CacheKey::scoped(persisted.table, owner),
                None => CacheKey::table(persisted.table),
            }
            .map_err(|e| StorageError::Corrupt(e.to_string()))?;
            Ok((key, persisted.entry))
        })
        .collect()
}

#[derive(Debug, Default)]
struct WriteState {
    last_written: u64,
    disabled: bool,
}

/// Reads and writes the entry store through a `KeyValueSlot`.
pub struct PersistenceAdapter {
    slot: Arc<dyn KeyValueSlot>,
    state: Mutex<WriteState>,
}

impl PersistenceAdapter {
    pub fn new(slot: Arc<dyn KeyValueSlot>) -> Self {
        Self {
            slot,
            state: Mutex::new(WriteState::default()),
        }
    }

    pub fn slot_name(&self) -> &str {
        self.slot.name()
    }

    /// Encode and write the store, surfacing any failure.
    pub fn save(&self, store: &LocalEntryStore) -> Result<(), StorageError> {
        let blob = encode(store)?;
        self.slot.write(&blob)
    }

    /// Load the persisted store. Missing or unreadable data yields an empty
    /// store and the slot is cleared.
    pub fn load(&self) -> LocalEntryStore {
        let blob = match self.slot.read() {
            Ok(Some(blob)) => blob,
            Ok(None) => {
                debug!(slot = self.slot.name(), "No persisted cache store, starting cold");
                return LocalEntryStore::new();
            }
            Err(e) => {
                warn!(
                    slot = self.slot.name(),
                    error = %e,
                    "Failed to read cache store, starting cold"
                );
                self.clear_after_failure();
                return LocalEntryStore::new();
            }
        };

        match decode(&blob) {
            Ok(store) => {
                debug!(
                    slot = self.slot.name(),
                    entries = store.len(),
                    "Loaded persisted cache store"
                );
                store
            }
            Err(e) => {
                warn!(slot = self.slot.name(), error = %e, "Discarding corrupt cache store");
                self.clear_after_failure();
                LocalEntryStore::new()
            }
        }
    }

    pub fn clear(&self) -> Result<(), StorageError> {
        self.slot.clear()
    }

    fn clear_after_failure(&self) {
        if let Err(e) = self.slot.clear() {
            warn!(slot = self.slot.name(), error = %e, "Failed to clear cache store slot");
        }
    }

    /// Write a snapshot taken at `generation`. Older snapshots than the last
    /// one written are dropped. The first write failure disables persistence
    /// for the rest of the session; errors never reach the caller.
    pub(crate) fn write_snapshot(&self, generation: u64, blob: Result<String, StorageError>) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.disabled || generation <= state.last_written {
            return;
        }

        let result = blob.and_then(|blob| self.slot.write(&blob));
        match result {
            Ok(()) => state.last_written = generation,
            Err(e) => {
                state.disabled = true;
                warn!(
                    slot = self.slot.name(),
                    error = %e,
                    "Cache persistence failed, continuing in memory only"
                );
            }
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).disabled
    }
}
