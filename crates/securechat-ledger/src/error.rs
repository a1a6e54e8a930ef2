//! Ledger error types

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, LedgerError>;

/// Ledger errors
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Append attempted before the genesis block exists
    #[error("Ledger not initialized: no genesis block")]
    NotInitialized,

    /// Another commit already took this position
    #[error("Write conflict at index {index}")]
    Conflict { index: u64 },

    /// Conflicts persisted past the retry budget
    #[error("Append failed after {attempts} attempts due to write conflicts")]
    RetriesExhausted { attempts: u32 },

    /// Rejected append input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Stored record could not be read back
    #[error("Corrupt record at index {index}: {reason}")]
    Corrupt { index: u64, reason: String },

    /// Field codec failure
    #[error("Codec error: {0}")]
    Codec(String),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl LedgerError {
    /// Whether the caller may retry the failed operation later
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LedgerError::Conflict { .. } | LedgerError::RetriesExhausted { .. }
        )
    }
}

impl From<sled::Error> for LedgerError {
    fn from(err: sled::Error) -> Self {
        LedgerError::Storage(err.to_string())
    }
}

impl From<bincode::Error> for LedgerError {
    fn from(err: bincode::Error) -> Self {
        LedgerError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for LedgerError {
    fn from(err: std::io::Error) -> Self {
        LedgerError::Storage(err.to_string())
    }
}
