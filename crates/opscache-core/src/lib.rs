//! Local cache coherence layer for the operations board.
//!
//! Application code reads whole-table snapshots (personnel, vehicles, trips,
//! duties) through [`OpsCache`]. Snapshots are kept in memory, persisted to a
//! local slot across restarts, and marked stale when another client's write
//! shows up on the remote change registry.
//!
//! ```ignore
//! let cache = OpsCache::new(CacheConfig::default(), registry, slot)?;
//! let _session = cache.start_session();
//!
//! let soldiers = cache
//!     .fetch_or_load(&TableKey::<Soldiers>::all(), || remote.list_soldiers())
//!     .await?;
//!
//! remote.update_soldier(&soldier).await?;
//! cache.record_mutation(TableKey::<Soldiers>::all()).await?;
//! ```

pub mod cache;
pub mod clock;
pub mod config;
pub mod persistence;
pub mod sync;

pub use cache::{
    CacheAge, CacheEntry, CacheError, CacheKey, EntryStatus, LocalEntryStore, OpsCache,
    PerformanceSnapshot, SessionGuard, Table, TableKey,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CacheConfig, Config};
pub use persistence::{FileSlot, KeyValueSlot, MemorySlot, PersistenceAdapter, StorageError};
pub use sync::{
    ChangeEvent, ChangeKind, ChangeRegistry, InMemoryRegistry, RegistryError, RemoteChangeRecord,
    SubscriberState,
};
