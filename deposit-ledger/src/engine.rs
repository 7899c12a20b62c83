//! Reconciliation engine
//!
//! Redistributes an externally supplied target total across the active
//! deposit rows of one owner.
//!
//! # Algorithm
//!
//! 1. Rows with a zero balance are settled and never touched.
//! 2. No active rows → nothing to do (`AllSettled`).
//! 3. Active total already within tolerance of the target → nothing to do
//!    (`AlreadyInSync`).
//! 4. Otherwise every active row except the last (by `sequence_key`) gets
//!    its proportional share `target * balance / total`, and the last active
//!    row absorbs the remainder `target - allocated`. With a single active
//!    row this degenerates to "set it to the target".
//! 5. Only rows whose delta exceeds the tolerance are emitted as updates.
//!    A skipped row keeps its balance, so its balance (not the recomputed
//!    share) is what counts as allocated for the remainder. If the drift of
//!    skipped rows would push the remainder below zero, the pass is redone
//!    writing every active row.
//!
//! # Invariants
//!
//! - Σ(balances after applying the plan) == target ± tolerance
//! - Settled rows are never part of a plan
//! - Re-running on the reconciled rows yields `AlreadyInSync`
//!
//! The engine is pure: no I/O, no shared state. Callers reconciling the same
//! owner concurrently must serialise themselves.

use crate::{
    error::{Error, Result},
    types::{LedgerRow, OwnerKey, RowUpdate},
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default reconciliation tolerance (0.001)
pub const DEFAULT_TOLERANCE: Decimal = Decimal::from_parts(1, 0, 0, false, 3);

/// How a reconciliation call ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanOutcome {
    /// Owner has no rows at all
    NoRows,
    /// Every row already has a zero balance
    AllSettled,
    /// Active total already matches the target
    AlreadyInSync,
    /// Balances were redistributed
    Rebalanced,
}

impl PlanOutcome {
    /// Label for logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanOutcome::NoRows => "no_rows",
            PlanOutcome::AllSettled => "all_settled",
            PlanOutcome::AlreadyInSync => "already_in_sync",
            PlanOutcome::Rebalanced => "rebalanced",
        }
    }
}

/// One row rewrite
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedUpdate {
    /// Row to rewrite
    pub row_id: Uuid,
    /// Balance before
    pub old_balance: Decimal,
    /// Balance after
    pub new_balance: Decimal,
}

impl PlannedUpdate {
    /// Store update for this change; always resets accumulated yield
    pub fn row_update(&self) -> RowUpdate {
        RowUpdate::rebalance(self.new_balance)
    }

    /// Signed change in balance
    pub fn delta(&self) -> Decimal {
        self.new_balance - self.old_balance
    }
}

/// Result of a reconciliation computation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationPlan {
    /// Owner of the rows (`None` when there were no rows)
    pub owner: Option<OwnerKey>,
    /// Target the rows are reconciled to
    pub target: Decimal,
    /// Row rewrites in ascending sequence order
    pub updates: Vec<PlannedUpdate>,
    /// Active total before
    pub old_total: Decimal,
    /// Active total once the updates are applied
    pub new_total_projected: Decimal,
    /// No active rows were found
    pub all_settled: bool,
    /// Active total was already within tolerance
    pub already_in_sync: bool,
    /// Outcome tag
    pub outcome: PlanOutcome,
}

impl ReconciliationPlan {
    fn unchanged(
        owner: Option<OwnerKey>,
        target: Decimal,
        total: Decimal,
        outcome: PlanOutcome,
    ) -> Self {
        Self {
            owner,
            target,
            updates: Vec::new(),
            old_total: total,
            new_total_projected: total,
            all_settled: matches!(outcome, PlanOutcome::NoRows | PlanOutcome::AllSettled),
            already_in_sync: outcome == PlanOutcome::AlreadyInSync,
            outcome,
        }
    }

    /// True when nothing needs to be written
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    /// Project the plan onto a snapshot of rows without persisting anything
    pub fn project(&self, rows: &[LedgerRow]) -> Vec<LedgerRow> {
        rows.iter()
            .map(|row| {
                let mut row = row.clone();
                if let Some(update) = self.updates.iter().find(|u| u.row_id == row.id) {
                    row.current_balance = update.new_balance;
                    row.accumulated_yield = Decimal::ZERO;
                }
                row
            })
            .collect()
    }
}

/// Sum of the balances of active rows
pub fn active_total(rows: &[LedgerRow]) -> Result<Decimal> {
    rows.iter()
        .filter(|row| row.is_active())
        .try_fold(Decimal::ZERO, |acc, row| {
            acc.checked_add(row.current_balance)
                .ok_or_else(|| Error::InvalidInput("balance total overflows".to_string()))
        })
}

/// Pure reconciliation engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconciliationEngine {
    tolerance: Decimal,
}

impl Default for ReconciliationEngine {
    fn default() -> Self {
        Self {
            tolerance: DEFAULT_TOLERANCE,
        }
    }
}

impl ReconciliationEngine {
    /// Create engine with a custom tolerance
    pub fn new(tolerance: Decimal) -> Result<Self> {
        if tolerance < Decimal::ZERO {
            return Err(Error::InvalidInput(format!(
                "tolerance must be non-negative, got {}",
                tolerance
            )));
        }
        Ok(Self { tolerance })
    }

    /// Configured tolerance
    pub fn tolerance(&self) -> Decimal {
        self.tolerance
    }

    /// Compute the plan that brings `rows` to `target`.
    ///
    /// `rows` must belong to one owner and be sorted by `sequence_key`.
    pub fn reconcile(&self, rows: &[LedgerRow], target: Decimal) -> Result<ReconciliationPlan> {
        if target < Decimal::ZERO {
            return Err(Error::InvalidInput(format!(
                "target must be non-negative, got {}",
                target
            )));
        }

        let Some(first) = rows.first() else {
            return Ok(ReconciliationPlan::unchanged(
                None,
                target,
                Decimal::ZERO,
                PlanOutcome::NoRows,
            ));
        };
        let owner = first.owner.clone();
        Self::validate_rows(&owner, rows)?;

        let active: Vec<&LedgerRow> = rows.iter().filter(|row| row.is_active()).collect();
        if active.is_empty() {
            return Ok(ReconciliationPlan::unchanged(
                Some(owner),
                target,
                Decimal::ZERO,
                PlanOutcome::AllSettled,
            ));
        }

        let current_total = active_total(rows)?;
        if (current_total - target).abs() < self.tolerance {
            return Ok(ReconciliationPlan::unchanged(
                Some(owner),
                target,
                current_total,
                PlanOutcome::AlreadyInSync,
            ));
        }

        let (updates, projected) = match self.allocate(&active, current_total, target, true) {
            Err(Error::RemainderOutOfTolerance { row_id, remainder }) => {
                tracing::debug!(
                    %row_id,
                    %remainder,
                    "Skipped rows drift past the remainder, rewriting every active row"
                );
                self.allocate(&active, current_total, target, false)?
            }
            result => result?,
        };

        Ok(ReconciliationPlan {
            owner: Some(owner),
            target,
            updates,
            old_total: current_total,
            new_total_projected: projected,
            all_settled: false,
            already_in_sync: false,
            outcome: PlanOutcome::Rebalanced,
        })
    }

    /// One redistribution pass over the active rows.
    ///
    /// With `skip_within_tolerance` a non-last row whose share moves less than
    /// the tolerance keeps its balance, and that balance counts towards what
    /// the last row has to complement. Without it every non-last row that
    /// moves at all is written, so the remainder is exactly the last row's
    /// proportional complement.
    ///
    /// Trade-off: a skipped row contributes its old balance rather than its
    /// share, so the last row absorbs the skipped drift and its remainder
    /// differs from `target - Σ shares`. The second pass writes moves below
    /// the tolerance too. Both keep the written total within tolerance of
    /// the target, which the literal share formula does not guarantee.
    fn allocate(
        &self,
        active: &[&LedgerRow],
        current_total: Decimal,
        target: Decimal,
        skip_within_tolerance: bool,
    ) -> Result<(Vec<PlannedUpdate>, Decimal)> {
        let last = active.len() - 1;
        let mut allocated = Decimal::ZERO;
        let mut updates = Vec::new();

        for (index, row) in active.iter().enumerate() {
            let new_balance = if index == last {
                self.settle_remainder(row, target - allocated)?
            } else {
                Self::proportional_share(row.current_balance, current_total, target)?
            };

            let delta = (new_balance - row.current_balance).abs();
            let write = if skip_within_tolerance || index == last {
                delta > self.tolerance
            } else {
                !delta.is_zero()
            };

            if write {
                updates.push(PlannedUpdate {
                    row_id: row.id,
                    old_balance: row.current_balance,
                    new_balance,
                });
                allocated += new_balance;
            } else {
                allocated += row.current_balance;
            }
        }

        Ok((updates, allocated))
    }

    fn validate_rows(owner: &OwnerKey, rows: &[LedgerRow]) -> Result<()> {
        for row in rows {
            if &row.owner != owner {
                return Err(Error::InvalidInput(format!(
                    "row {} belongs to {}, expected {}",
                    row.id, row.owner, owner
                )));
            }
            if row.current_balance < Decimal::ZERO {
                return Err(Error::InvalidInput(format!(
                    "row {} has negative balance {}",
                    row.id, row.current_balance
                )));
            }
        }

        if let Some(pair) = rows
            .windows(2)
            .find(|pair| pair[1].sequence_key < pair[0].sequence_key)
        {
            return Err(Error::InvalidInput(format!(
                "rows not sorted by sequence key: {} precedes {}",
                pair[0].id, pair[1].id
            )));
        }

        Ok(())
    }

    // `total` is positive here: step 2 returned early otherwise.
    fn proportional_share(balance: Decimal, total: Decimal, target: Decimal) -> Result<Decimal> {
        balance
            .checked_div(total)
            .and_then(|weight| target.checked_mul(weight))
            .map(|share| share.normalize())
            .ok_or_else(|| Error::InvalidInput("proportional share overflows".to_string()))
    }

    fn settle_remainder(&self, row: &LedgerRow, remainder: Decimal) -> Result<Decimal> {
        if remainder >= Decimal::ZERO {
            Ok(remainder.normalize())
        } else if -remainder <= self.tolerance {
            tracing::debug!(row_id = %row.id, %remainder, "Clamping negative remainder to zero");
            Ok(Decimal::ZERO)
        } else {
            Err(Error::RemainderOutOfTolerance {
                row_id: row.id,
                remainder,
            })
        }
    }
}
