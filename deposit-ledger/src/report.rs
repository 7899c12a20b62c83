//! Verification and analysis reports over an owner's rows

use crate::{
    engine::active_total,
    error::{Error, Result},
    store::LedgerStore,
    types::{LedgerRow, OwnerKey},
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Post-apply comparison of the ledger against the target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    /// Active total as re-read from the store
    pub new_total: Decimal,
    /// Target the ledger should match
    pub target: Decimal,
    /// |new_total - target|
    pub difference: Decimal,
    /// difference < tolerance
    pub in_sync: bool,
}

/// Compare a snapshot of rows against the target
pub fn verify_rows(rows: &[LedgerRow], target: Decimal, tolerance: Decimal) -> Result<VerificationReport> {
    let new_total = active_total(rows)?;
    let difference = (new_total - target).abs();

    Ok(VerificationReport {
        new_total,
        target,
        difference,
        in_sync: difference < tolerance,
    })
}

/// Re-read the owner's rows and compare them against the target.
///
/// Read-only. Store failures are returned unchanged.
pub async fn verify<S>(
    store: &S,
    owner: &OwnerKey,
    target: Decimal,
    tolerance: Decimal,
) -> Result<VerificationReport>
where
    S: LedgerStore + ?Sized,
{
    let rows = store.list_by_owner(owner).await?;
    let report = verify_rows(&rows, target, tolerance)?;

    if !report.in_sync {
        tracing::warn!(
            owner = %owner,
            new_total = %report.new_total,
            target = %report.target,
            difference = %report.difference,
            "Ledger not in sync after reconciliation"
        );
    }

    Ok(report)
}

/// Breakdown of an owner's deposits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSummary {
    /// All rows, settled included
    pub total_deposits: usize,
    /// Rows with a positive balance
    pub active_deposits: usize,
    /// Σ principal over active rows
    pub total_principal: Decimal,
    /// Σ current balance over active rows
    pub total_current_balance: Decimal,
    /// Principal no longer backed by a balance (active rows only)
    pub total_redeemed: Decimal,
}

/// Summarize an owner's rows
pub fn summarize(rows: &[LedgerRow]) -> Result<LedgerSummary> {
    let active: Vec<&LedgerRow> = rows.iter().filter(|r| r.is_active()).collect();
    let total_principal = checked_sum(active.iter().map(|r| r.principal), "principal")?;
    let total_current_balance = active_total(rows)?;

    Ok(LedgerSummary {
        total_deposits: rows.len(),
        active_deposits: active.len(),
        total_principal,
        total_current_balance,
        total_redeemed: total_principal
            .checked_sub(total_current_balance)
            .ok_or_else(|| Error::InvalidInput("redeemed amount overflows".to_string()))?,
    })
}

fn checked_sum(mut values: impl Iterator<Item = Decimal>, what: &str) -> Result<Decimal> {
    values.try_fold(Decimal::ZERO, |acc, value| {
        acc.checked_add(value)
            .ok_or_else(|| Error::InvalidInput(format!("{} total overflows", what)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn row(principal: Decimal, balance: Decimal) -> LedgerRow {
        LedgerRow {
            id: Uuid::now_v7(),
            owner: OwnerKey::new("0xabc"),
            principal,
            current_balance: balance,
            sequence_key: 0,
            accumulated_yield: Decimal::ZERO,
            tx_hash: String::new(),
            chain_id: 1,
            last_reconciled_at: None,
        }
    }

    #[test]
    fn test_verify_in_sync() {
        let rows = vec![row(dec!(1), dec!(0.006)), row(dec!(1), dec!(0.004))];
        let report = verify_rows(&rows, dec!(0.01), dec!(0.001)).unwrap();
        assert_eq!(report.new_total, dec!(0.01));
        assert_eq!(report.difference, Decimal::ZERO);
        assert!(report.in_sync);
    }

    #[test]
    fn test_verify_out_of_sync() {
        let rows = vec![row(dec!(1), dec!(0.5)), row(dec!(1), Decimal::ZERO)];
        let report = verify_rows(&rows, dec!(0.01), dec!(0.001)).unwrap();
        assert_eq!(report.difference, dec!(0.49));
        assert!(!report.in_sync);
    }

    #[test]
    fn test_summarize() {
        let rows = vec![
            row(dec!(10), dec!(4)),
            row(dec!(5), dec!(5)),
            row(dec!(7), Decimal::ZERO),
        ];
        let summary = summarize(&rows).unwrap();
        assert_eq!(summary.total_deposits, 3);
        assert_eq!(summary.active_deposits, 2);
        assert_eq!(summary.total_principal, dec!(15));
        assert_eq!(summary.total_current_balance, dec!(9));
        assert_eq!(summary.total_redeemed, dec!(6));
    }

    #[test]
    fn test_summarize_overflow_is_an_error() {
        let rows = vec![row(Decimal::MAX, dec!(1)), row(Decimal::MAX, dec!(1))];
        let err = summarize(&rows).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        let rows = vec![row(dec!(1), Decimal::MAX), row(dec!(1), Decimal::MAX)];
        assert!(summarize(&rows).is_err());
    }
}
