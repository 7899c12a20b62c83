//! # Deposit Reconciler
//!
//! Keeps an owner's deposit rows in agreement with the owner's on-chain
//! token balance.
//!
//! ## Architecture
//!
//! - **Oracle**: [`BalanceOracle`] supplies the target (ERC-20 `balanceOf`
//!   over JSON-RPC in production)
//! - **Service**: [`ReconciliationService`] runs lock → read → plan → apply
//!   → verify → record for one owner at a time
//! - **API**: axum router exposing reconciliation, deposit listings and
//!   Prometheus metrics
//!
//! The arithmetic lives in `deposit_ledger::ReconciliationEngine`.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, missing_debug_implementations, clippy::all)]

pub mod api;
pub mod config;
pub mod error;
pub mod locks;
pub mod metrics;
pub mod oracle;
pub mod service;

pub use config::{Config, FailurePolicy, OracleConfig};
pub use error::{Error, Result};
pub use locks::{OwnerGuard, OwnerLocks};
pub use metrics::Metrics;
pub use oracle::{BalanceOracle, Erc20BalanceOracle, FixedBalanceOracle};
pub use service::{Change, ReconcileOutcome, ReconcileRequest, ReconciliationService};

/// Initialise `tracing` for the binaries.
///
/// `RUST_LOG` takes precedence over the `info` default.
pub fn init_tracing(json: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}
