use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use super::RegistryError;

/// One row of the remote change registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteChangeRecord {
    pub table_name: String,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub record: RemoteChangeRecord,
}

/// Change events from one subscription. An `Err` item means the transport
/// failed; the stream is abandoned and the subscriber re-subscribes.
pub type ChangeStream = BoxStream<'static, Result<ChangeEvent, RegistryError>>;

/// Remote registry holding one "last mutated at" row per table.
#[async_trait]
pub trait ChangeRegistry: Send + Sync {
    /// Upsert the row for `table`. Last-write-wins: a timestamp older than
    /// the stored one leaves the row unchanged. Idempotent.
    async fn bump(&self, table: &str, at: DateTime<Utc>) -> Result<(), RegistryError>;

    /// All rows currently in the registry.
    async fn list(&self) -> Result<Vec<RemoteChangeRecord>, RegistryError>;

    /// Open a subscription. The stream first yields every existing row as
    /// `Added`, then one event per subsequent change.
    async fn subscribe(&self) -> Result<ChangeStream, RegistryError>;
}
