use thiserror::Error;

use crate::cache::Id;

/// Application level error type used throughout the crate.
#[derive(Error, Debug)]
pub enum VigilError {
    /// I/O related failure
    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid or inconsistent configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Error while parsing YAML configuration files
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Error while encoding or decoding entity snapshots
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Requested id is absent from the named cache
    #[error("{cache} cache has no element with id {id}")]
    NotFound { cache: &'static str, id: Id },

    /// Malformed argument handed to a cache or engine operation
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Durable storage refused or failed a write
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Work item refused by a saturated or stopped executor
    #[error("Rejected: {0}")]
    Rejected(String),

    /// Runtime failure not covered by the other variants
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl VigilError {
    /// Shorthand for [`VigilError::NotFound`]
    pub fn not_found(cache: &'static str, id: Id) -> Self {
        VigilError::NotFound { cache, id }
    }

    /// True when the error reports a missing cache element
    pub fn is_not_found(&self) -> bool {
        matches!(self, VigilError::NotFound { .. })
    }
}

/// Convenient alias over [`Result`] using [`VigilError`]
pub type Result<T> = std::result::Result<T, VigilError>;
