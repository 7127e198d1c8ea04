//! Error types for the risk engine

use thiserror::Error;

/// Risk engine error
///
/// Only input and store failures reach the caller of an evaluation. Signals
/// that could not be computed are absorbed as [`SignalError`] and folded into
/// the decision as degraded signals.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed transaction event, rejected before scoring
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Profile or fingerprint store unavailable for read or write
    #[error("Store error: {0}")]
    Store(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Background task failure
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the caller should apply its store-outage policy (fail open / fail closed)
    pub fn is_store_error(&self) -> bool {
        matches!(self, Error::Store(_))
    }

    /// Whether the event itself was rejected
    pub fn is_input_error(&self) -> bool {
        matches!(self, Error::InvalidInput(_))
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

#[cfg(feature = "rocksdb-store")]
impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Store(err.to_string())
    }
}

/// Result type
pub type Result<T> = std::result::Result<T, Error>;

/// Failure of a single signal source (collaborator or model)
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignalError {
    /// Call did not complete within its budget
    #[error("timed out after {0}ms")]
    Timeout(u64),

    /// Collaborator unreachable or returned no data
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Model evaluation failed
    #[error("model failure: {0}")]
    Model(String),
}
