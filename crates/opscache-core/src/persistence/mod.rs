//! Durable storage for the local entry store.
//!
//! The whole store is serialized as one JSON document into a single named
//! slot, so cached data survives a process restart. A missing or corrupt
//! slot is never an error to the caller: it loads as an empty store.

pub mod adapter;
pub mod error;
pub mod slot;

pub use adapter::PersistenceAdapter;
pub use error::StorageError;
pub use slot::{FileSlot, KeyValueSlot, MemorySlot};
