//! Core types for the deposit ledger
//!
//! All types are designed for:
//! - Deterministic serialization (bincode)
//! - Exact arithmetic (Decimal for money)

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Normalized owner identity (wallet address, account handle, ...)
///
/// Always trimmed and lower-cased so that `0xAB..` and `0xab..` resolve to
/// the same set of rows.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OwnerKey(String);

impl OwnerKey {
    /// Create a normalized owner key
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(raw.as_ref().trim().to_lowercase())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when the key is empty after normalization
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for OwnerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for OwnerKey {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

/// One deposit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerRow {
    /// Unique row ID (UUIDv7)
    pub id: Uuid,

    /// Owner this deposit belongs to
    pub owner: OwnerKey,

    /// Originally deposited amount, immutable
    pub principal: Decimal,

    /// Remaining balance attributable to this deposit
    pub current_balance: Decimal,

    /// Creation order (nanoseconds since Unix epoch)
    pub sequence_key: i64,

    /// Yield bookkeeping, reset whenever the balance is rewritten
    pub accumulated_yield: Decimal,

    /// Deposit transaction hash
    pub tx_hash: String,

    /// Chain the deposit was made on
    pub chain_id: u64,

    /// Last time reconciliation rewrote this row
    pub last_reconciled_at: Option<DateTime<Utc>>,
}

impl LedgerRow {
    /// A row with positive balance takes part in redistribution
    pub fn is_active(&self) -> bool {
        self.current_balance > Decimal::ZERO
    }

    /// Apply a reconciliation update
    pub fn apply(&mut self, update: &RowUpdate, at: DateTime<Utc>) {
        self.current_balance = update.current_balance;
        self.accumulated_yield = update.accumulated_yield;
        self.last_reconciled_at = Some(at);
    }
}

/// New deposit as handed over by ingestion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDeposit {
    /// Owner of the deposit
    pub owner: OwnerKey,

    /// Deposited amount
    pub amount: Decimal,

    /// Deposit transaction hash
    pub tx_hash: String,

    /// Chain ID
    pub chain_id: u64,

    /// Creation time; `None` means now
    pub created_at: Option<DateTime<Utc>>,
}

/// Fields rewritten on a row by reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowUpdate {
    /// New current balance
    pub current_balance: Decimal,

    /// New accumulated yield (always zero from reconciliation)
    pub accumulated_yield: Decimal,
}

impl RowUpdate {
    /// Balance rewrite with the mandatory yield reset
    pub fn rebalance(current_balance: Decimal) -> Self {
        Self {
            current_balance,
            accumulated_yield: Decimal::ZERO,
        }
    }
}

/// Audit record of an applied reconciliation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationRecord {
    /// Record ID (UUIDv7, time-ordered)
    pub record_id: Uuid,

    /// Owner that was reconciled
    pub owner: OwnerKey,

    /// Target the ledger was reconciled to
    pub target: Decimal,

    /// Active total before
    pub old_total: Decimal,

    /// Active total after, as re-read
    pub new_total: Decimal,

    /// Number of rows rewritten
    pub rows_updated: u32,

    /// When the plan was applied
    pub applied_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_owner_key_normalized() {
        let a = OwnerKey::new("  0xDD7FC80cafb2f055fb6a519d4043c29EA76a7ce1 ");
        let b = OwnerKey::new("0xdd7fc80cafb2f055fb6a519d4043c29ea76a7ce1");
        assert_eq!(a, b);
        assert!(!a.is_empty());
        assert!(OwnerKey::new("   ").is_empty());
    }

    #[test]
    fn test_row_apply_resets_yield() {
        let mut row = LedgerRow {
            id: Uuid::now_v7(),
            owner: OwnerKey::new("0xabc"),
            principal: dec!(10),
            current_balance: dec!(10),
            sequence_key: 1,
            accumulated_yield: dec!(0.25),
            tx_hash: "0x01".to_string(),
            chain_id: 1,
            last_reconciled_at: None,
        };

        let now = Utc::now();
        row.apply(&RowUpdate::rebalance(dec!(4)), now);

        assert_eq!(row.current_balance, dec!(4));
        assert_eq!(row.accumulated_yield, Decimal::ZERO);
        assert_eq!(row.principal, dec!(10));
        assert_eq!(row.last_reconciled_at, Some(now));
    }

    #[test]
    fn test_row_active() {
        let mut row = LedgerRow {
            id: Uuid::now_v7(),
            owner: OwnerKey::new("0xabc"),
            principal: dec!(1),
            current_balance: Decimal::ZERO,
            sequence_key: 1,
            accumulated_yield: Decimal::ZERO,
            tx_hash: "0x02".to_string(),
            chain_id: 1,
            last_reconciled_at: None,
        };
        assert!(!row.is_active());

        row.current_balance = dec!(0.000001);
        assert!(row.is_active());
    }
}
