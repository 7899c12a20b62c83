//! Error types for the reconciliation service

use deposit_ledger::OwnerKey;
use thiserror::Error;

/// Result type for service operations
pub type Result<T> = std::result::Result<T, Error>;

/// Service errors
#[derive(Error, Debug)]
pub enum Error {
    /// Ledger error (storage, engine, actor)
    #[error(transparent)]
    Ledger(#[from] deposit_ledger::Error),

    /// Balance oracle could not produce a target
    #[error("Oracle error: {0}")]
    Oracle(String),

    /// Owner has no deposit rows at all
    #[error("No deposits found for {0}")]
    NoDeposits(OwnerKey),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl Error {
    /// Short label used for metrics and API error kinds
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Ledger(e) => e.kind(),
            Error::Oracle(_) => "oracle",
            Error::NoDeposits(_) => "no_deposits",
            Error::Config(_) => "config",
            Error::Io(_) => "io",
            Error::Metrics(_) => "metrics",
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Oracle(err.to_string())
    }
}
