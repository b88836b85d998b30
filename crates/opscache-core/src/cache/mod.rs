//! Local caching of whole-table snapshots.
//!
//! `OpsCache` is the only surface application code talks to. It keeps one
//! snapshot per table (or per owner-scoped slice of a table), serves it while
//! it is neither stale nor older than `max_age`, and otherwise reloads through
//! a caller-supplied loader.
//!
//! Staleness comes from two places:
//! - this client's own writes (`invalidate` / `record_mutation`)
//! - other clients' writes, observed through the change feed (`mark_stale`)

pub mod entry;
pub mod error;
pub mod key;
pub mod manager;
pub mod performance;
pub mod store;

pub use entry::{CacheEntry, EntryStatus};
pub use error::CacheError;
pub use key::{CacheKey, Table, TableKey};
pub use manager::{CacheAge, OpsCache, SessionGuard};
pub use performance::{KeyCounters, PerformanceLedger, PerformanceSnapshot};
pub use store::LocalEntryStore;
