//! Reconciliation service
//!
//! One reconciliation cycle for an owner:
//!
//! ```text
//! lock owner → list rows → target (override or oracle) → plan
//!            → apply (atomic batch) → verify → audit record
//! ```
//!
//! The owner lock is held for the whole cycle. Dry runs stop after the plan
//! and report the projected result. A failure after the apply step leaves
//! the rows rewritten; it is logged and counted as unrecorded writes.

use crate::{
    config::FailurePolicy, locks::OwnerLocks, metrics::Metrics, oracle::BalanceOracle, Error,
    Result,
};
use deposit_ledger::{
    verify, verify_rows, Ledger, LedgerRow, OwnerKey, PlanOutcome, ReconciliationRecord,
    ReconciliationPlan, VerificationReport,
};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Reconciliation request for one owner
#[derive(Debug, Clone)]
pub struct ReconcileRequest {
    /// Owner whose rows are reconciled
    pub owner: OwnerKey,
    /// Use this target instead of asking the oracle
    pub target_override: Option<Decimal>,
    /// Compute and report without writing
    pub dry_run: bool,
}

impl ReconcileRequest {
    /// Request reconciling `owner` against the oracle
    pub fn new(owner: OwnerKey) -> Self {
        Self {
            owner,
            target_override: None,
            dry_run: false,
        }
    }
}

/// One row change, as reported to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Change {
    /// Row ID
    pub deposit_id: Uuid,
    /// Balance before
    pub old_balance: Decimal,
    /// Balance after
    pub new_balance: Decimal,
    /// Transaction hash of the original deposit
    pub tx_hash: String,
}

/// Result of a reconciliation cycle
#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    /// Owner
    pub owner: OwnerKey,
    /// How the engine classified the call
    pub outcome: PlanOutcome,
    /// Target used
    pub target: Decimal,
    /// Active total before
    pub old_total: Decimal,
    /// Active total after (re-read when applied, projected otherwise)
    pub new_total: Decimal,
    /// |new_total - target|
    pub difference: Decimal,
    /// Ledger matches the target within tolerance
    pub in_sync: bool,
    /// Rows actually written
    pub updates_applied: usize,
    /// Nothing was written on purpose
    pub dry_run: bool,
    /// Planned changes in sequence order
    pub changes: Vec<Change>,
    /// Audit record, present when a plan was applied
    pub record: Option<ReconciliationRecord>,
}

impl ReconcileOutcome {
    /// Human-readable summary line
    pub fn message(&self) -> String {
        match self.outcome {
            PlanOutcome::NoRows => format!("No deposits found for {}", self.owner),
            PlanOutcome::AllSettled => "All deposits are already settled".to_string(),
            PlanOutcome::AlreadyInSync => {
                "Deposits already match the on-chain balance".to_string()
            }
            PlanOutcome::Rebalanced if self.dry_run => format!(
                "Dry run: {} deposit(s) would be updated",
                self.changes.len()
            ),
            PlanOutcome::Rebalanced => format!("Updated {} deposit(s)", self.updates_applied),
        }
    }
}

/// Serialised reconciliation of owners against a balance oracle
pub struct ReconciliationService {
    ledger: Arc<Ledger>,
    oracle: Arc<dyn BalanceOracle>,
    locks: OwnerLocks,
    metrics: Metrics,
    failure_policy: FailurePolicy,
}

impl std::fmt::Debug for ReconciliationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconciliationService")
            .field("failure_policy", &self.failure_policy)
            .finish_non_exhaustive()
    }
}

impl ReconciliationService {
    /// Create service
    pub fn new(
        ledger: Arc<Ledger>,
        oracle: Arc<dyn BalanceOracle>,
        failure_policy: FailurePolicy,
    ) -> Result<Self> {
        Ok(Self {
            ledger,
            oracle,
            locks: OwnerLocks::new(),
            metrics: Metrics::new()?,
            failure_policy,
        })
    }

    /// Underlying ledger
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Metrics collector
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Run one reconciliation cycle
    pub async fn reconcile(&self, request: ReconcileRequest) -> Result<ReconcileOutcome> {
        let started = Instant::now();
        let result = self.reconcile_locked(&request).await;

        match &result {
            Ok(outcome) => {
                self.metrics.record_outcome(
                    outcome.outcome.as_str(),
                    outcome.updates_applied,
                    started.elapsed().as_secs_f64(),
                );
            }
            Err(e) => {
                self.metrics.record_failure(e.kind());
                tracing::error!(owner = %request.owner, kind = e.kind(), "Reconciliation failed: {}", e);
            }
        }

        result
    }

    async fn reconcile_locked(&self, request: &ReconcileRequest) -> Result<ReconcileOutcome> {
        let owner = &request.owner;

        // Rows are never deleted, so an owner without rows can be rejected
        // before it takes a lock entry
        if self.ledger.list_rows(owner)?.is_empty() {
            return Err(Error::NoDeposits(owner.clone()));
        }

        let _guard = self.locks.acquire(owner).await;
        let rows = self.ledger.list_rows(owner)?;

        let target = match request.target_override {
            Some(target) => target,
            None => self.oracle_target(owner).await?,
        };

        let plan = self.ledger.engine().reconcile(&rows, target)?;
        let changes = changes_of(&plan, &rows);
        let tolerance = self.ledger.engine().tolerance();

        if request.dry_run || plan.is_empty() {
            let report = verify_rows(&plan.project(&rows), target, tolerance)?;
            tracing::info!(
                owner = %owner,
                outcome = plan.outcome.as_str(),
                dry_run = request.dry_run,
                old_total = %plan.old_total,
                target = %target,
                planned = changes.len(),
                "Reconciliation computed without writes"
            );
            return Ok(build_outcome(request, &plan, &report, changes, 0, None));
        }

        let applied = self.ledger.apply_plan(&plan).await?;
        let (report, record) = self
            .verify_and_record(owner, &plan, target, tolerance)
            .await
            .inspect_err(|e| self.report_unrecorded(owner, applied, e))?;

        tracing::info!(
            owner = %owner,
            old_total = %plan.old_total,
            new_total = %report.new_total,
            target = %target,
            rows = applied,
            in_sync = report.in_sync,
            "Reconciliation applied"
        );

        Ok(build_outcome(request, &plan, &report, changes, applied, Some(record)))
    }

    async fn verify_and_record(
        &self,
        owner: &OwnerKey,
        plan: &ReconciliationPlan,
        target: Decimal,
        tolerance: Decimal,
    ) -> Result<(VerificationReport, ReconciliationRecord)> {
        let report = verify(self.ledger.as_ref(), owner, target, tolerance).await?;
        self.metrics.record_drift(report.difference);
        let record = self.ledger.record_reconciliation(plan, &report).await?;
        Ok((report, record))
    }

    /// The plan is committed; only the audit trail is missing
    fn report_unrecorded(&self, owner: &OwnerKey, applied: usize, error: &Error) {
        self.metrics.record_unrecorded_writes(applied);
        tracing::error!(
            owner = %owner,
            rows = applied,
            error = %error,
            "Rows were rewritten but the reconciliation was not recorded"
        );
    }

    async fn oracle_target(&self, owner: &OwnerKey) -> Result<Decimal> {
        let result = match self.oracle.target_balance(owner).await {
            Ok(balance) if balance < Decimal::ZERO => Err(Error::Oracle(format!(
                "oracle reported negative balance {}",
                balance
            ))),
            other => other,
        };

        match (result, self.failure_policy) {
            (Ok(balance), _) => Ok(balance),
            (Err(e), FailurePolicy::Abort) => Err(e),
            (Err(e), FailurePolicy::ZeroTarget) => {
                tracing::warn!(
                    owner = %owner,
                    error = %e,
                    "Oracle failed, reconciling against a zero target"
                );
                Ok(Decimal::ZERO)
            }
        }
    }

    /// Rows of an owner, ascending by sequence key
    pub fn deposits(&self, owner: &OwnerKey) -> Result<Vec<LedgerRow>> {
        Ok(self.ledger.list_rows(owner)?)
    }

    /// Applied reconciliations of an owner, oldest first
    pub fn history(&self, owner: &OwnerKey) -> Result<Vec<ReconciliationRecord>> {
        Ok(self.ledger.reconciliation_history(owner)?)
    }
}

fn changes_of(plan: &ReconciliationPlan, rows: &[LedgerRow]) -> Vec<Change> {
    plan.updates
        .iter()
        .map(|update| Change {
            deposit_id: update.row_id,
            old_balance: update.old_balance,
            new_balance: update.new_balance,
            tx_hash: rows
                .iter()
                .find(|row| row.id == update.row_id)
                .map(|row| row.tx_hash.clone())
                .unwrap_or_default(),
        })
        .collect()
}

fn build_outcome(
    request: &ReconcileRequest,
    plan: &ReconciliationPlan,
    report: &VerificationReport,
    changes: Vec<Change>,
    updates_applied: usize,
    record: Option<ReconciliationRecord>,
) -> ReconcileOutcome {
    ReconcileOutcome {
        owner: request.owner.clone(),
        outcome: plan.outcome,
        target: plan.target,
        old_total: plan.old_total,
        new_total: report.new_total,
        difference: report.difference,
        in_sync: report.in_sync,
        updates_applied,
        dry_run: request.dry_run,
        changes,
        record,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::FixedBalanceOracle;
    use async_trait::async_trait;
    use deposit_ledger::{Config, NewDeposit};
    use rust_decimal_macros::dec;

    const OWNER: &str = "0xdd7fc80cafb2f055fb6a519d4043c29ea76a7ce1";

    struct FailingOracle;

    #[async_trait]
    impl BalanceOracle for FailingOracle {
        async fn target_balance(&self, _owner: &OwnerKey) -> Result<Decimal> {
            Err(Error::Oracle("rpc unreachable".to_string()))
        }
    }

    async fn create_service(
        oracle: Arc<dyn BalanceOracle>,
        policy: FailurePolicy,
        balances: &[Decimal],
    ) -> (ReconciliationService, tempfile::TempDir) {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        let ledger = Ledger::open(config).await.unwrap();

        for (i, amount) in balances.iter().enumerate() {
            ledger
                .record_deposit(NewDeposit {
                    owner: OwnerKey::new(OWNER),
                    amount: *amount,
                    tx_hash: format!("0x{:064x}", i),
                    chain_id: 1,
                    created_at: chrono::DateTime::from_timestamp(1_700_000_000 + i as i64, 0),
                })
                .await
                .unwrap();
        }

        let service = ReconciliationService::new(Arc::new(ledger), oracle, policy).unwrap();
        (service, temp_dir)
    }

    #[tokio::test]
    async fn test_reconcile_against_oracle() {
        let oracle = Arc::new(FixedBalanceOracle::new(dec!(0.01)));
        let (service, _temp) =
            create_service(oracle, FailurePolicy::Abort, &[dec!(0.03), dec!(0.02)]).await;

        let outcome = service
            .reconcile(ReconcileRequest::new(OwnerKey::new(OWNER)))
            .await
            .unwrap();

        assert_eq!(outcome.outcome, PlanOutcome::Rebalanced);
        assert_eq!(outcome.old_total, dec!(0.05));
        assert_eq!(outcome.new_total, dec!(0.01));
        assert_eq!(outcome.updates_applied, 2);
        assert!(outcome.in_sync);
        assert_eq!(outcome.changes[0].new_balance, dec!(0.006));
        assert_eq!(outcome.changes[1].new_balance, dec!(0.004));
        assert_eq!(outcome.changes[0].tx_hash, format!("0x{:064x}", 0));
        assert!(outcome.record.is_some());
        assert_eq!(outcome.message(), "Updated 2 deposit(s)");

        assert_eq!(service.history(&OwnerKey::new(OWNER)).unwrap().len(), 1);
        assert_eq!(
            service
                .metrics()
                .reconciliations_total
                .with_label_values(&["rebalanced"])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn test_second_pass_in_sync() {
        let oracle = Arc::new(FixedBalanceOracle::new(dec!(0.01)));
        let (service, _temp) =
            create_service(oracle, FailurePolicy::Abort, &[dec!(0.006), dec!(0.004)]).await;

        let outcome = service
            .reconcile(ReconcileRequest::new(OwnerKey::new(OWNER)))
            .await
            .unwrap();
        assert_eq!(outcome.outcome, PlanOutcome::AlreadyInSync);
        assert_eq!(outcome.updates_applied, 0);
        assert!(outcome.record.is_none());
        assert!(service.history(&OwnerKey::new(OWNER)).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let oracle = Arc::new(FixedBalanceOracle::new(dec!(0.01)));
        let (service, _temp) =
            create_service(oracle, FailurePolicy::Abort, &[dec!(0.03), dec!(0.02)]).await;

        let mut request = ReconcileRequest::new(OwnerKey::new(OWNER));
        request.dry_run = true;
        let outcome = service.reconcile(request).await.unwrap();

        assert_eq!(outcome.changes.len(), 2);
        assert_eq!(outcome.updates_applied, 0);
        assert_eq!(outcome.new_total, dec!(0.01));
        assert!(outcome.message().starts_with("Dry run"));

        let rows = service.deposits(&OwnerKey::new(OWNER)).unwrap();
        assert_eq!(rows[0].current_balance, dec!(0.03));
        assert_eq!(rows[1].current_balance, dec!(0.02));
    }

    #[tokio::test]
    async fn test_target_override_skips_oracle() {
        let (service, _temp) =
            create_service(Arc::new(FailingOracle), FailurePolicy::Abort, &[dec!(1)]).await;

        let mut request = ReconcileRequest::new(OwnerKey::new(OWNER));
        request.target_override = Some(dec!(0.5));
        let outcome = service.reconcile(request).await.unwrap();
        assert_eq!(outcome.changes[0].new_balance, dec!(0.5));
    }

    #[tokio::test]
    async fn test_no_deposits() {
        let oracle = Arc::new(FixedBalanceOracle::new(dec!(1)));
        let (service, _temp) = create_service(oracle, FailurePolicy::Abort, &[]).await;

        let result = service
            .reconcile(ReconcileRequest::new(OwnerKey::new(OWNER)))
            .await;
        assert!(matches!(result, Err(Error::NoDeposits(_))));
        assert_eq!(
            service.metrics().failures_total.with_label_values(&["no_deposits"]).get(),
            1
        );
    }

    #[tokio::test]
    async fn test_oracle_failure_aborts_by_default() {
        let (service, _temp) =
            create_service(Arc::new(FailingOracle), FailurePolicy::Abort, &[dec!(1)]).await;

        let result = service
            .reconcile(ReconcileRequest::new(OwnerKey::new(OWNER)))
            .await;
        assert!(matches!(result, Err(Error::Oracle(_))));

        let rows = service.deposits(&OwnerKey::new(OWNER)).unwrap();
        assert_eq!(rows[0].current_balance, dec!(1));
    }

    #[tokio::test]
    async fn test_oracle_failure_zero_target_policy() {
        let (service, _temp) =
            create_service(Arc::new(FailingOracle), FailurePolicy::ZeroTarget, &[dec!(1)]).await;

        let outcome = service
            .reconcile(ReconcileRequest::new(OwnerKey::new(OWNER)))
            .await
            .unwrap();
        assert_eq!(outcome.target, Decimal::ZERO);
        assert_eq!(outcome.new_total, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_unknown_owners_leave_no_lock_entries() {
        let oracle = Arc::new(FixedBalanceOracle::new(dec!(0.01)));
        let (service, _temp) =
            create_service(oracle, FailurePolicy::Abort, &[dec!(0.03), dec!(0.02)]).await;

        for i in 0..100 {
            let result = service
                .reconcile(ReconcileRequest::new(OwnerKey::new(format!("0x{:040x}", i))))
                .await;
            assert!(matches!(result, Err(Error::NoDeposits(_))));
        }
        service
            .reconcile(ReconcileRequest::new(OwnerKey::new(OWNER)))
            .await
            .unwrap();

        assert!(service.locks.is_empty());
    }

    #[tokio::test]
    async fn test_failure_after_apply_is_counted() {
        let oracle = Arc::new(FixedBalanceOracle::new(dec!(0.01)));
        let (service, _temp) = create_service(oracle, FailurePolicy::Abort, &[dec!(1)]).await;

        let err = Error::Ledger(deposit_ledger::Error::InvalidInput("plan has no owner".to_string()));
        service.report_unrecorded(&OwnerKey::new(OWNER), 3, &err);

        assert_eq!(service.metrics().unrecorded_writes_total.get(), 3);
        assert!(service
            .metrics()
            .export()
            .unwrap()
            .contains("reconciliation_unrecorded_writes_total 3"));
    }

    #[tokio::test]
    async fn test_concurrent_same_owner() {
        let oracle = Arc::new(FixedBalanceOracle::new(dec!(0.01)));
        let (service, _temp) =
            create_service(oracle, FailurePolicy::Abort, &[dec!(0.03), dec!(0.02)]).await;
        let service = Arc::new(service);

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let service = service.clone();
                tokio::spawn(async move {
                    service
                        .reconcile(ReconcileRequest::new(OwnerKey::new(OWNER)))
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut applied = 0;
        for task in tasks {
            applied += task.await.unwrap().updates_applied;
        }

        // Exactly one cycle rewrites; the rest find the ledger in sync
        assert_eq!(applied, 2);
        assert_eq!(service.history(&OwnerKey::new(OWNER)).unwrap().len(), 1);
        assert!(service.locks.is_empty());
    }
}
