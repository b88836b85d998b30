use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Unauthorized - change registry access denied")]
    Unauthorized,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Registry backend error: {0}")]
    Backend(String),
}

impl RegistryError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, RegistryError::Unauthorized)
    }
}
