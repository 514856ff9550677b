//! Detection and repair of drift between cached and calculated balances.

use std::time::Duration;

use anyhow::anyhow;
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::calculator::{balances_match, BalanceCalculator, BalanceSummary, CalculationError};
use super::domain::{cashbooks::Cashbook, transactions::Transaction};
use crate::{
    config::EngineConfig,
    repos::{DynLedgerRepo, StoreError},
};

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("cashbook {0} does not exist")]
    CashbookNotFound(Uuid),

    #[error("no cashbooks found for store {0}")]
    NoCashbooksInStore(Uuid),

    #[error("timed out after {waited:?} waiting for the lock on cashbook {cashbook_id}")]
    LockTimeout { cashbook_id: Uuid, waited: Duration },

    #[error("the balance of cashbook {cashbook_id} cannot be calculated: {source}")]
    Overflow {
        cashbook_id: Uuid,
        source: CalculationError,
    },

    #[error("{drifted} of {processed} cashbooks have drifted balances")]
    DriftDetected { drifted: usize, processed: usize },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<StoreError> for AuditError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::CashbookNotFound(cashbook_id) => Self::CashbookNotFound(cashbook_id),
            StoreError::LockTimeout {
                cashbook_id,
                waited,
            } => Self::LockTimeout {
                cashbook_id,
                waited,
            },
            StoreError::Duplicate(what) => Self::Other(anyhow!("{} already exists", what)),
            StoreError::Other(error) => Self::Other(error),
        }
    }
}

/// The result of comparing a cashbook's cached balance to its ledger.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ConsistencyReport {
    pub cashbook_id: Uuid,
    pub is_accurate: bool,
    pub cached: Decimal,
    pub calculated: Decimal,
    /// The absolute difference between the cached and calculated balances.
    pub difference: Decimal,
}

/// The cashbooks a bulk reconciliation covers.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ReconcileTarget {
    All,
    Store(Uuid),
    Cashbook(Uuid),
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileMode {
    /// Write the calculated balance of every drifted cashbook.
    Apply,
    /// Report what would be written.
    DryRun,
    /// Only report drift.
    CheckOnly,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileAction {
    Unchanged,
    Updated,
    WouldUpdate,
    NeedsUpdate,
}

#[derive(Clone, Debug, Serialize)]
pub struct ReconcileEntry {
    pub cashbook_id: Uuid,
    pub name: String,
    pub before: Decimal,
    pub calculated: Decimal,
    pub difference: Decimal,
    pub summary: BalanceSummary,
    pub action: ReconcileAction,
}

/// A cashbook that could not be reconciled.
#[derive(Clone, Debug, Serialize)]
pub struct ReconcileFailure {
    pub cashbook_id: Uuid,
    pub name: String,
    pub message: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct BulkReport {
    pub mode: ReconcileMode,
    pub processed: usize,
    pub drifted: usize,
    pub updated: usize,
    pub entries: Vec<ReconcileEntry>,
    pub errors: Vec<ReconcileFailure>,
}

impl BulkReport {
    fn new(mode: ReconcileMode) -> Self {
        Self {
            mode,
            processed: 0,
            drifted: 0,
            updated: 0,
            entries: vec![],
            errors: vec![],
        }
    }

    /// Fail if any cashbook was found with a drifted balance, even if the
    /// drift has since been repaired.
    pub fn ensure_consistent(&self) -> Result<(), AuditError> {
        if self.drifted > 0 {
            return Err(AuditError::DriftDetected {
                drifted: self.drifted,
                processed: self.processed,
            });
        }

        Ok(())
    }
}

/// Compares cached balances to the ledger and repairs them.
#[derive(Clone)]
pub struct ConsistencyAuditor {
    repo: DynLedgerRepo,
    calculator: BalanceCalculator,
    lock_timeout: Duration,
}

impl ConsistencyAuditor {
    pub fn new(repo: DynLedgerRepo, config: EngineConfig) -> Self {
        Self {
            repo,
            calculator: BalanceCalculator::new(config.precision),
            lock_timeout: config.lock_timeout,
        }
    }

    /// Compare a cashbook's cached balance to its calculated balance without
    /// taking any locks.
    pub async fn check(&self, cashbook_id: Uuid) -> Result<ConsistencyReport, AuditError> {
        let cashbook = self
            .repo
            .get_cashbook(cashbook_id)
            .await?
            .ok_or(AuditError::CashbookNotFound(cashbook_id))?;
        let transactions = self.repo.list_cashbook_transactions(cashbook_id).await?;

        let calculated = self
            .calculator
            .calculate(cashbook.initial_balance, &transactions)
            .map_err(|source| AuditError::Overflow {
                cashbook_id,
                source,
            })?;

        let report = ConsistencyReport {
            cashbook_id,
            is_accurate: balances_match(cashbook.current_balance, calculated),
            cached: cashbook.current_balance,
            calculated,
            difference: (cashbook.current_balance - calculated).abs(),
        };

        if report.is_accurate {
            debug!(%cashbook_id, balance = %calculated, "Cashbook balance is accurate.");
        } else {
            warn!(
                %cashbook_id,
                cached = %report.cached,
                calculated = %report.calculated,
                "Cashbook balance has drifted."
            );
        }

        Ok(report)
    }

    /// Compute an itemized breakdown of a cashbook's balance.
    pub async fn summarize(&self, cashbook_id: Uuid) -> Result<BalanceSummary, AuditError> {
        let cashbook = self
            .repo
            .get_cashbook(cashbook_id)
            .await?
            .ok_or(AuditError::CashbookNotFound(cashbook_id))?;
        let transactions = self.repo.list_cashbook_transactions(cashbook_id).await?;

        self.calculator
            .summarize(cashbook.initial_balance, &transactions)
            .map_err(|source| AuditError::Overflow {
                cashbook_id,
                source,
            })
    }

    /// Recompute a cashbook's balance while holding its lock and store it if
    /// it has drifted.
    ///
    /// # Returns
    ///
    /// The cashbook's balance after reconciliation.
    pub async fn reconcile(&self, cashbook_id: Uuid) -> Result<Decimal, AuditError> {
        let entry = self.reconcile_one(cashbook_id, ReconcileMode::Apply).await?;

        Ok(match entry.action {
            ReconcileAction::Updated => entry.calculated,
            _ => entry.before,
        })
    }

    /// Reconcile many cashbooks. A failure in one cashbook is recorded in the
    /// report and does not stop the others from being processed.
    pub async fn reconcile_all(
        &self,
        target: ReconcileTarget,
        mode: ReconcileMode,
    ) -> Result<BulkReport, AuditError> {
        let cashbooks = self.cashbooks_for(target).await?;

        info!(?target, ?mode, count = cashbooks.len(), "Reconciling cashbooks.");

        let mut report = BulkReport::new(mode);
        for cashbook in cashbooks {
            report.processed += 1;

            match self.reconcile_one(cashbook.id, mode).await {
                Ok(entry) => {
                    if entry.action != ReconcileAction::Unchanged {
                        report.drifted += 1;
                    }
                    if entry.action == ReconcileAction::Updated {
                        report.updated += 1;
                    }

                    report.entries.push(entry);
                }
                Err(reconcile_error) => {
                    error!(
                        cashbook_id = %cashbook.id,
                        error = %reconcile_error,
                        "Failed to reconcile cashbook."
                    );

                    report.errors.push(ReconcileFailure {
                        cashbook_id: cashbook.id,
                        name: cashbook.name,
                        message: reconcile_error.to_string(),
                    });
                }
            }
        }

        info!(
            processed = report.processed,
            drifted = report.drifted,
            updated = report.updated,
            errors = report.errors.len(),
            "Finished reconciling cashbooks."
        );

        Ok(report)
    }

    async fn cashbooks_for(&self, target: ReconcileTarget) -> Result<Vec<Cashbook>, AuditError> {
        match target {
            ReconcileTarget::All => Ok(self.repo.list_cashbooks(None).await?),
            ReconcileTarget::Store(store_id) => {
                let cashbooks = self.repo.list_cashbooks(Some(store_id)).await?;
                if cashbooks.is_empty() {
                    return Err(AuditError::NoCashbooksInStore(store_id));
                }

                Ok(cashbooks)
            }
            ReconcileTarget::Cashbook(cashbook_id) => {
                let cashbook = self
                    .repo
                    .get_cashbook(cashbook_id)
                    .await?
                    .ok_or(AuditError::CashbookNotFound(cashbook_id))?;

                Ok(vec![cashbook])
            }
        }
    }

    /// Compare and, in apply mode, repair a single cashbook.
    ///
    /// Only [`ReconcileMode::Apply`] takes the cashbook's lock, and it writes
    /// only if the balance has drifted. The other modes read without locking
    /// like [`Self::check`].
    async fn reconcile_one(
        &self,
        cashbook_id: Uuid,
        mode: ReconcileMode,
    ) -> Result<ReconcileEntry, AuditError> {
        if mode != ReconcileMode::Apply {
            let cashbook = self
                .repo
                .get_cashbook(cashbook_id)
                .await?
                .ok_or(AuditError::CashbookNotFound(cashbook_id))?;
            let transactions = self.repo.list_cashbook_transactions(cashbook_id).await?;

            return self.compare(cashbook, &transactions, mode);
        }

        let mut uow = self.repo.begin().await?;
        let cashbook = uow.lock_cashbook(cashbook_id, self.lock_timeout).await?;
        let transactions = uow.cashbook_transactions(cashbook_id).await?;

        let entry = self.compare(cashbook, &transactions, mode)?;
        if entry.action == ReconcileAction::Updated {
            uow.set_current_balance(cashbook_id, entry.calculated).await?;
            uow.commit().await?;

            warn!(
                %cashbook_id,
                before = %entry.before,
                calculated = %entry.calculated,
                "Repaired drifted cashbook balance."
            );
        }

        Ok(entry)
    }

    fn compare(
        &self,
        cashbook: Cashbook,
        transactions: &[Transaction],
        mode: ReconcileMode,
    ) -> Result<ReconcileEntry, AuditError> {
        let cashbook_id = cashbook.id;
        let summary = self
            .calculator
            .summarize(cashbook.initial_balance, transactions)
            .map_err(|source| AuditError::Overflow {
                cashbook_id,
                source,
            })?;
        let calculated = summary.calculated_balance;
        let before = cashbook.current_balance;

        let action = if balances_match(before, calculated) {
            ReconcileAction::Unchanged
        } else {
            match mode {
                ReconcileMode::Apply => ReconcileAction::Updated,
                ReconcileMode::DryRun => ReconcileAction::WouldUpdate,
                ReconcileMode::CheckOnly => ReconcileAction::NeedsUpdate,
            }
        };

        if action != ReconcileAction::Unchanged && mode != ReconcileMode::Apply {
            warn!(%cashbook_id, %before, %calculated, ?mode, "Cashbook balance has drifted.");
        }

        Ok(ReconcileEntry {
            cashbook_id,
            name: cashbook.name,
            before,
            calculated,
            difference: (before - calculated).abs(),
            summary,
            action,
        })
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use chrono::{NaiveDate, Utc};
    use rust_decimal_macros::dec;

    use super::*;
    use crate::{
        ledger::{
            domain::{
                cashbooks::NewCashbook,
                transactions::{Nature, TransactionStatus},
            },
            test_support::transaction,
        },
        repos::{LedgerRepo, MemoryLedger, UnitOfWork},
    };

    async fn open_cashbook(
        ledger: &MemoryLedger,
        store_id: Uuid,
        name: &str,
        initial: Decimal,
    ) -> Cashbook {
        let cashbook = Cashbook::open(
            NewCashbook {
                store_id,
                name: name.to_owned(),
                description: None,
                initial_balance: initial,
            },
            Utc::now(),
        );
        ledger.insert_cashbook(&cashbook).await.unwrap();

        cashbook
    }

    async fn record(ledger: &MemoryLedger, cashbook: &Cashbook, nature: Nature, amount: Decimal) {
        let mut transaction = transaction(
            nature,
            amount,
            TransactionStatus::Completed,
            NaiveDate::from_ymd_opt(2024, 7, 1).unwrap(),
        );
        transaction.cashbook_id = cashbook.id;

        ledger.insert_raw_transaction(transaction).await;
    }

    fn auditor(ledger: &MemoryLedger) -> ConsistencyAuditor {
        ConsistencyAuditor::new(Arc::new(ledger.clone()), EngineConfig::default())
    }

    async fn cached_balance(ledger: &MemoryLedger, cashbook_id: Uuid) -> Decimal {
        ledger
            .get_cashbook(cashbook_id)
            .await
            .unwrap()
            .unwrap()
            .current_balance
    }

    #[tokio::test]
    async fn check_detects_drift() {
        let ledger = MemoryLedger::new();
        let cashbook = open_cashbook(&ledger, Uuid::new_v4(), "Till", dec!(100.00)).await;
        record(&ledger, &cashbook, Nature::Income, dec!(25.00)).await;

        let report = auditor(&ledger).check(cashbook.id).await.unwrap();

        assert_eq!(
            ConsistencyReport {
                cashbook_id: cashbook.id,
                is_accurate: false,
                cached: dec!(100.00),
                calculated: dec!(125.00),
                difference: dec!(25.00),
            },
            report
        );
    }

    #[tokio::test]
    async fn reconcile_is_idempotent() {
        let ledger = MemoryLedger::new();
        let cashbook = open_cashbook(&ledger, Uuid::new_v4(), "Till", dec!(100.00)).await;
        record(&ledger, &cashbook, Nature::Expense, dec!(40.00)).await;
        let auditor = auditor(&ledger);

        assert_eq!(dec!(60.00), auditor.reconcile(cashbook.id).await.unwrap());
        let after_first = ledger.get_cashbook(cashbook.id).await.unwrap().unwrap();

        assert_eq!(dec!(60.00), auditor.reconcile(cashbook.id).await.unwrap());
        let after_second = ledger.get_cashbook(cashbook.id).await.unwrap().unwrap();

        assert_eq!(after_first, after_second);
        assert!(auditor.check(cashbook.id).await.unwrap().is_accurate);
    }

    #[tokio::test]
    async fn reconcile_leaves_sub_cent_difference() {
        let ledger = MemoryLedger::new();
        let cashbook = open_cashbook(&ledger, Uuid::new_v4(), "Till", dec!(100.00)).await;
        ledger.overwrite_balance(cashbook.id, dec!(100.009)).await;

        let balance = auditor(&ledger).reconcile(cashbook.id).await.unwrap();

        assert_eq!(dec!(100.009), balance);
        assert_eq!(dec!(100.009), cached_balance(&ledger, cashbook.id).await);
    }

    #[tokio::test]
    async fn reconcile_all_modes() {
        let store_id = Uuid::new_v4();

        for (mode, action, want_balance, want_updated) in [
            (ReconcileMode::Apply, ReconcileAction::Updated, dec!(80.00), 1),
            (ReconcileMode::DryRun, ReconcileAction::WouldUpdate, dec!(100.00), 0),
            (ReconcileMode::CheckOnly, ReconcileAction::NeedsUpdate, dec!(100.00), 0),
        ] {
            let ledger = MemoryLedger::new();
            let drifted = open_cashbook(&ledger, store_id, "Drifted", dec!(100.00)).await;
            record(&ledger, &drifted, Nature::Transfer, dec!(20.00)).await;
            let accurate = open_cashbook(&ledger, store_id, "Accurate", dec!(5.00)).await;

            let report = auditor(&ledger)
                .reconcile_all(ReconcileTarget::Store(store_id), mode)
                .await
                .unwrap();

            assert_eq!(2, report.processed);
            assert_eq!(1, report.drifted);
            assert_eq!(want_updated, report.updated);
            assert!(report.errors.is_empty());

            let entry = report
                .entries
                .iter()
                .find(|entry| entry.cashbook_id == drifted.id)
                .unwrap();
            assert_eq!(action, entry.action);
            assert_eq!(dec!(20.00), entry.difference);
            assert_eq!(dec!(20.00), entry.summary.total_transfer);

            assert_eq!(want_balance, cached_balance(&ledger, drifted.id).await);
            assert_eq!(dec!(5.00), cached_balance(&ledger, accurate.id).await);
            assert!(report.ensure_consistent().is_err());
        }
    }

    #[tokio::test]
    async fn report_only_modes_do_not_wait_for_locks() {
        let ledger = MemoryLedger::new();
        let cashbook = open_cashbook(&ledger, Uuid::new_v4(), "Till", dec!(100.00)).await;
        record(&ledger, &cashbook, Nature::Income, dec!(25.00)).await;
        let config = EngineConfig {
            lock_timeout: Duration::from_millis(50),
            ..EngineConfig::default()
        };
        let auditor = ConsistencyAuditor::new(Arc::new(ledger.clone()), config);

        let mut holder = ledger.begin().await.unwrap();
        holder
            .lock_cashbook(cashbook.id, Duration::from_secs(1))
            .await
            .unwrap();

        for mode in [ReconcileMode::CheckOnly, ReconcileMode::DryRun] {
            let report = auditor
                .reconcile_all(ReconcileTarget::All, mode)
                .await
                .unwrap();

            assert!(report.errors.is_empty());
            assert_eq!(1, report.drifted);
            assert_eq!(dec!(125.00), report.entries[0].calculated);
        }

        let report = auditor
            .reconcile_all(ReconcileTarget::All, ReconcileMode::Apply)
            .await
            .unwrap();
        assert_eq!(1, report.errors.len());
        assert_eq!(dec!(100.00), cached_balance(&ledger, cashbook.id).await);

        drop(holder);
        assert_eq!(dec!(125.00), auditor.reconcile(cashbook.id).await.unwrap());
    }

    #[tokio::test]
    async fn reconcile_all_isolates_failures() {
        let ledger = MemoryLedger::new();
        let store_id = Uuid::new_v4();
        let broken = open_cashbook(&ledger, store_id, "Broken", dec!(9999999999.99)).await;
        record(&ledger, &broken, Nature::Income, dec!(1.00)).await;
        let drifted = open_cashbook(&ledger, store_id, "Drifted", dec!(10.00)).await;
        record(&ledger, &drifted, Nature::Income, dec!(1.00)).await;
        let accurate = open_cashbook(&ledger, Uuid::new_v4(), "Accurate", dec!(10.00)).await;

        let report = auditor(&ledger)
            .reconcile_all(ReconcileTarget::All, ReconcileMode::Apply)
            .await
            .unwrap();

        assert_eq!(3, report.processed);
        assert_eq!(1, report.drifted);
        assert_eq!(1, report.updated);
        assert_eq!(1, report.errors.len());
        assert_eq!(broken.id, report.errors[0].cashbook_id);
        assert_eq!("Broken", report.errors[0].name);

        assert_eq!(dec!(11.00), cached_balance(&ledger, drifted.id).await);
        assert_eq!(dec!(10.00), cached_balance(&ledger, accurate.id).await);
    }

    #[tokio::test]
    async fn reconcile_all_unknown_targets() {
        let ledger = MemoryLedger::new();
        let auditor = auditor(&ledger);

        let missing_store = Uuid::new_v4();
        let error = auditor
            .reconcile_all(ReconcileTarget::Store(missing_store), ReconcileMode::Apply)
            .await
            .expect_err("store has no cashbooks");
        assert!(matches!(error, AuditError::NoCashbooksInStore(id) if id == missing_store));

        let missing_cashbook = Uuid::new_v4();
        let error = auditor
            .reconcile_all(
                ReconcileTarget::Cashbook(missing_cashbook),
                ReconcileMode::CheckOnly,
            )
            .await
            .expect_err("cashbook does not exist");
        assert!(matches!(error, AuditError::CashbookNotFound(id) if id == missing_cashbook));
    }

    #[tokio::test]
    async fn consistent_report_passes() {
        let ledger = MemoryLedger::new();
        open_cashbook(&ledger, Uuid::new_v4(), "Till", dec!(10.00)).await;

        let report = auditor(&ledger)
            .reconcile_all(ReconcileTarget::All, ReconcileMode::CheckOnly)
            .await
            .unwrap();

        assert_eq!(1, report.processed);
        report.ensure_consistent().expect("no drift expected");
    }
}
