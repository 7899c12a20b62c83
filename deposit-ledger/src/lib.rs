//! Deposit Ledger Core
//!
//! Per-owner deposit rows with a reconciliation engine that forces an
//! owner's ledger total onto an externally sourced balance.
//!
//! # Architecture
//!
//! - **Engine**: pure proportional redistribution with remainder correction
//! - **Single Writer**: one actor task performs every store mutation
//! - **Storage**: RocksDB with an owner/sequence index
//! - **Reports**: read-only verification and deposit analysis
//!
//! # Invariants
//!
//! - Σ(active balances) == target ± tolerance after a reconciliation
//! - Rows are never created or deleted by reconciliation
//! - A rewritten balance always resets accumulated yield
//! - Settled (zero-balance) rows are never touched

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod types;
pub mod storage;
pub mod store;
pub mod engine;
pub mod report;
pub mod ledger;
pub mod error;
pub mod actor;
pub mod config;

// Re-exports
pub use error::{Error, Result};
pub use types::{LedgerRow, NewDeposit, OwnerKey, ReconciliationRecord, RowUpdate};
pub use engine::{PlanOutcome, PlannedUpdate, ReconciliationEngine, ReconciliationPlan, DEFAULT_TOLERANCE};
pub use report::{summarize, verify, verify_rows, LedgerSummary, VerificationReport};
pub use store::LedgerStore;
pub use storage::Storage;
pub use ledger::Ledger;
pub use config::Config;
