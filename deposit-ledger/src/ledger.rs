//! Main ledger orchestration layer
//!
//! Ties together storage, the writer actor and the reconciliation engine
//! into one handle with an explicit open/close lifecycle.
//!
//! # Example
//!
//! ```no_run
//! use deposit_ledger::{Config, Ledger, OwnerKey};
//! use rust_decimal::Decimal;
//!
//! #[tokio::main]
//! async fn main() -> deposit_ledger::Result<()> {
//!     let ledger = Ledger::open(Config::default()).await?;
//!
//!     let owner = OwnerKey::new("0xdd7fc80cafb2f055fb6a519d4043c29ea76a7ce1");
//!     let plan = ledger.plan(&owner, Decimal::new(1, 2))?;
//!     ledger.apply_plan(&plan).await?;
//!
//!     ledger.shutdown().await
//! }
//! ```

use crate::{
    actor::{spawn_ledger_actor, LedgerHandle},
    engine::{ReconciliationEngine, ReconciliationPlan},
    report::{summarize, LedgerSummary, VerificationReport},
    storage::StorageStats,
    store::LedgerStore,
    types::{LedgerRow, NewDeposit, OwnerKey, ReconciliationRecord, RowUpdate},
    Config, Error, Result, Storage,
};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use uuid::Uuid;

/// Main ledger interface
#[derive(Debug)]
pub struct Ledger {
    /// Actor handle for writes
    handle: LedgerHandle,

    /// Direct storage access (for reads)
    storage: Arc<Storage>,

    /// Reconciliation engine configured with the ledger tolerance
    engine: ReconciliationEngine,

    /// Configuration
    config: Config,
}

impl Ledger {
    /// Open ledger with configuration
    pub async fn open(config: Config) -> Result<Self> {
        config.validate()?;

        let storage = Arc::new(Storage::open(&config)?);
        let handle = spawn_ledger_actor(storage.clone(), config.actor.mailbox_capacity);
        let engine = ReconciliationEngine::new(config.reconciliation.tolerance)?;

        Ok(Self {
            handle,
            storage,
            engine,
            config,
        })
    }

    /// Reconciliation engine in use
    pub fn engine(&self) -> ReconciliationEngine {
        self.engine
    }

    /// Configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Record a new deposit row
    ///
    /// Entry point for deposit ingestion; reconciliation never creates rows.
    pub async fn record_deposit(&self, deposit: NewDeposit) -> Result<LedgerRow> {
        if deposit.owner.is_empty() {
            return Err(Error::InvalidInput("owner must not be empty".to_string()));
        }
        if deposit.amount < Decimal::ZERO {
            return Err(Error::InvalidInput(format!(
                "deposit amount must be non-negative, got {}",
                deposit.amount
            )));
        }
        if deposit.tx_hash.trim().is_empty() {
            return Err(Error::InvalidInput("tx hash must not be empty".to_string()));
        }

        let created_at = deposit.created_at.unwrap_or_else(Utc::now);
        let sequence_key = created_at
            .timestamp_nanos_opt()
            .ok_or_else(|| Error::InvalidInput(format!("timestamp out of range: {}", created_at)))?;

        let row = LedgerRow {
            id: Uuid::now_v7(),
            owner: deposit.owner,
            principal: deposit.amount,
            current_balance: deposit.amount,
            sequence_key,
            accumulated_yield: Decimal::ZERO,
            tx_hash: deposit.tx_hash,
            chain_id: deposit.chain_id,
            last_reconciled_at: None,
        };

        self.handle.insert_row(row.clone()).await?;
        Ok(row)
    }

    /// Rows of an owner, ascending by sequence key
    pub fn list_rows(&self, owner: &OwnerKey) -> Result<Vec<LedgerRow>> {
        self.storage.list_by_owner(owner)
    }

    /// Get row by ID
    pub fn get_row(&self, row_id: Uuid) -> Result<LedgerRow> {
        self.storage.get_row(row_id)
    }

    /// Compute (without applying) the plan that brings `owner` to `target`
    pub fn plan(&self, owner: &OwnerKey, target: Decimal) -> Result<ReconciliationPlan> {
        let rows = self.list_rows(owner)?;
        self.engine.reconcile(&rows, target)
    }

    /// Write every update of a plan in one atomic batch
    pub async fn apply_plan(&self, plan: &ReconciliationPlan) -> Result<usize> {
        if plan.is_empty() {
            return Ok(0);
        }

        let updates = plan
            .updates
            .iter()
            .map(|update| (update.row_id, update.row_update()))
            .collect();

        let written = self.handle.apply_updates(updates, Utc::now()).await?;

        tracing::info!(
            owner = ?plan.owner,
            rows = written,
            old_total = %plan.old_total,
            target = %plan.target,
            "Reconciliation plan applied"
        );

        Ok(written)
    }

    /// Store the audit record of an applied plan
    pub async fn record_reconciliation(
        &self,
        plan: &ReconciliationPlan,
        report: &VerificationReport,
    ) -> Result<ReconciliationRecord> {
        let owner = plan
            .owner
            .clone()
            .ok_or_else(|| Error::InvalidInput("plan has no owner".to_string()))?;

        let record = ReconciliationRecord {
            record_id: Uuid::now_v7(),
            owner,
            target: plan.target,
            old_total: plan.old_total,
            new_total: report.new_total,
            rows_updated: plan.updates.len() as u32,
            applied_at: Utc::now(),
        };

        self.handle.record_reconciliation(record.clone()).await?;
        Ok(record)
    }

    /// Applied reconciliations of an owner, oldest first
    pub fn reconciliation_history(&self, owner: &OwnerKey) -> Result<Vec<ReconciliationRecord>> {
        self.storage.list_reconciliations(owner)
    }

    /// Deposit breakdown of an owner
    pub fn summary(&self, owner: &OwnerKey) -> Result<LedgerSummary> {
        summarize(&self.list_rows(owner)?)
    }

    /// Storage statistics
    pub fn stats(&self) -> Result<StorageStats> {
        self.storage.get_stats()
    }

    /// Shutdown ledger
    pub async fn shutdown(self) -> Result<()> {
        self.handle.shutdown().await
    }
}

#[async_trait]
impl LedgerStore for Ledger {
    async fn list_by_owner(&self, owner: &OwnerKey) -> Result<Vec<LedgerRow>> {
        self.list_rows(owner)
    }

    async fn update(&self, row_id: Uuid, update: RowUpdate) -> Result<()> {
        self.handle
            .apply_updates(vec![(row_id, update)], Utc::now())
            .await
            .map(|_| ())
    }
}
