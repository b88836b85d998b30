use thiserror::Error;

use crate::sync::RegistryError;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Invalid cache key: {0}")]
    InvalidKey(String),

    #[error("Failed to encode records for {key}: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Change registry error: {0}")]
    Registry(#[from] RegistryError),
}
