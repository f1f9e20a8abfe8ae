//! Error types for consensus validation
//!
//! Consensus rule violations are not errors: they are reported through
//! [`crate::types::ValidationResult`]. `ConsensusError` is reserved for
//! infrastructure failures and broken internal invariants.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConsensusError {
    #[error("Storage failure: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Missing chain data: {0}")]
    MissingData(String),

    #[error("Consensus invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Worker pool error: {0}")]
    ThreadPool(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl ConsensusError {
    /// Transient failures leave chain state untouched and may be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, ConsensusError::Storage(_) | ConsensusError::MissingData(_))
    }
}

impl From<serde_json::Error> for ConsensusError {
    fn from(error: serde_json::Error) -> Self {
        ConsensusError::Config(error.to_string())
    }
}

impl From<rayon::ThreadPoolBuildError> for ConsensusError {
    fn from(error: rayon::ThreadPoolBuildError) -> Self {
        ConsensusError::ThreadPool(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ConsensusError>;
