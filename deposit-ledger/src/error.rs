//! Error types for the deposit ledger

use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Malformed reconciliation input (target, ordering, owner mix)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Remainder left for the last active row is negative beyond tolerance.
    ///
    /// The oracle reported less than what was already allocated to the
    /// earlier rows; this is an upstream data inconsistency.
    #[error("Remainder out of tolerance for row {row_id}: {remainder}")]
    RemainderOutOfTolerance {
        /// Last active row that would absorb the remainder
        row_id: Uuid,
        /// Remainder that was computed for it
        remainder: Decimal,
    },

    /// Row not found
    #[error("Row not found: {0}")]
    RowNotFound(Uuid),

    /// Concurrency error (actor mailbox closed, etc.)
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
    /// Short label used for metrics and API error kinds
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Storage(_) | Error::Serialization(_) | Error::Io(_) => "storage",
            Error::InvalidInput(_) => "invalid_input",
            Error::RemainderOutOfTolerance { .. } => "remainder_out_of_tolerance",
            Error::RowNotFound(_) => "row_not_found",
            Error::Concurrency(_) => "concurrency",
            Error::Config(_) => "config",
        }
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}
