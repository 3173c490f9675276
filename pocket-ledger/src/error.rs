//! Error types for the ledger

use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
///
/// Insufficient funds is deliberately absent: it is a decision point reported
/// through [`crate::types::PostOutcome`] and [`crate::types::EditOutcome`].
#[derive(Error, Debug)]
pub enum Error {
    /// Input rejected before any mutation (empty name, non-positive amount)
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    /// Root or leaf account not found
    #[error("Account not found: {0}")]
    AccountNotFound(String),

    /// Ledger entry not found
    #[error("Entry not found: {0}")]
    EntryNotFound(String),

    /// Category not found
    #[error("Category not found: {0}")]
    CategoryNotFound(String),

    /// Storage error (RocksDB); the unit of work was not applied
    #[error("Storage error: {0}")]
    Storage(String),

    /// Store contents are inconsistent (dangling index, missing column family);
    /// re-running the unit cannot help
    #[error("Store corruption: {0}")]
    Corruption(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Concurrency error (worker pool closed, response dropped, etc.)
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for the `NotFound` family (account, entry, category)
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::AccountNotFound(_) | Error::EntryNotFound(_) | Error::CategoryNotFound(_)
        )
    }

    /// True when the store failed to commit and the unit may be retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Storage(_))
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}
