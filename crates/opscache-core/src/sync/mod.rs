//! Cross-client change propagation.
//!
//! Every client that mutates a table bumps that table's row in the remote
//! change registry. Each client runs one change feed subscriber that watches
//! the registry and marks its local copies stale when another client's write
//! is observed.
//!
//! - `ChangeRegistry`: the remote registry and its realtime feed
//! - `InMemoryRegistry`: in-process registry shared by local clients
//! - `ChangeFeedSubscriber`: the subscription state machine

pub mod error;
pub mod memory;
pub mod registry;
pub mod subscriber;

pub use error::RegistryError;
pub use memory::InMemoryRegistry;
pub use registry::{ChangeEvent, ChangeKind, ChangeRegistry, ChangeStream, RemoteChangeRecord};
pub use subscriber::{ChangeFeedSubscriber, KnownUpdateLedger, StaleSink, SubscriberState};
