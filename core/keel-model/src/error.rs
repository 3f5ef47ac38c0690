//! Error types for the metadata model.

use thiserror::Error;

/// Result type for model operations.
pub type ModelResult<T> = Result<T, ModelError>;

/// Errors raised while loading or querying definitions.
#[derive(Debug, Error)]
pub enum ModelError {
    /// No entity with this name is registered.
    #[error("unknown entity: {0}")]
    UnknownEntity(String),

    /// A definition is internally inconsistent or references something missing.
    #[error("invalid definition: {0}")]
    InvalidDefinition(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error reading a registry document.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
