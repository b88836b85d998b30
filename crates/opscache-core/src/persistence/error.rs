use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error on slot {slot}: {source}")]
    Io {
        slot: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode cache store: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Failed to decode cache store: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("Corrupt cache store: {0}")]
    Corrupt(String),

    #[error("Slot {0} rejected the write")]
    Rejected(String),
}
