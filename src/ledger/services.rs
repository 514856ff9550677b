use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info};
use uuid::Uuid;
use validator::Validate;

use super::{
    access::{Actor, DynStoreAccess},
    auditor::{
        AuditError, BulkReport, ConsistencyAuditor, ConsistencyReport, ReconcileMode,
        ReconcileTarget,
    },
    calculator::{BalanceCalculator, BalanceSummary},
    coordinator::{BalanceCoordinator, MutationError},
    domain::{
        cashbooks::{Cashbook, NewCashbook},
        precision::Precision,
        reports::{self, DailyBalance},
        transactions::{
            NewTransactionType, Transaction, TransactionChanges, TransactionData,
            TransactionStatus, TransactionType,
        },
    },
};
use crate::{
    config::EngineConfig,
    repos::{DynLedgerRepo, TransactionCollection, TransactionQuery},
};

/// The entry point for everything that reads or writes cashbooks and their
/// transactions.
#[derive(Clone)]
pub struct LedgerService {
    repo: DynLedgerRepo,
    access: DynStoreAccess,
    calculator: BalanceCalculator,
    coordinator: BalanceCoordinator,
    auditor: ConsistencyAuditor,
}

impl LedgerService {
    pub fn new(repo: DynLedgerRepo, access: DynStoreAccess, config: EngineConfig) -> Self {
        Self {
            coordinator: BalanceCoordinator::new(repo.clone(), config),
            auditor: ConsistencyAuditor::new(repo.clone(), config),
            calculator: BalanceCalculator::new(config.precision),
            repo,
            access,
        }
    }

    /// The precision balances are stored and displayed with.
    pub fn precision(&self) -> Precision {
        self.calculator.precision()
    }

    pub async fn create_cashbook(
        &self,
        new_cashbook: NewCashbook,
    ) -> Result<Cashbook, MutationError> {
        new_cashbook.validate()?;

        let cashbook = Cashbook::open(new_cashbook, Utc::now());
        self.repo.insert_cashbook(&cashbook).await?;

        info!(cashbook_id = %cashbook.id, store_id = %cashbook.store_id, "Opened cashbook.");

        Ok(cashbook)
    }

    pub async fn create_transaction_type(
        &self,
        new_type: NewTransactionType,
    ) -> Result<TransactionType, MutationError> {
        new_type.validate()?;

        let transaction_type = TransactionType::create(new_type, Utc::now());
        self.repo.insert_transaction_type(&transaction_type).await?;

        info!(
            type_id = %transaction_type.id,
            nature = %transaction_type.nature,
            "Created transaction type."
        );

        Ok(transaction_type)
    }

    pub async fn create_transaction(
        &self,
        actor: Actor,
        data: TransactionData,
    ) -> Result<Transaction, MutationError> {
        self.authorize(actor, data.cashbook_id).await?;

        self.coordinator.create(actor, data).await
    }

    /// Apply changes to a transaction. Moving a transaction to another
    /// cashbook requires access to both cashbooks' stores.
    pub async fn update_transaction(
        &self,
        actor: Actor,
        transaction_id: Uuid,
        changes: TransactionChanges,
    ) -> Result<Transaction, MutationError> {
        let transaction = self.get_transaction(transaction_id).await?;

        self.authorize(actor, transaction.cashbook_id).await?;
        if let Some(cashbook_id) = changes.cashbook_id {
            if cashbook_id != transaction.cashbook_id {
                self.authorize(actor, cashbook_id).await?;
            }
        }

        self.coordinator
            .update(actor, transaction_id, &changes)
            .await
    }

    pub async fn delete_transaction(
        &self,
        actor: Actor,
        transaction_id: Uuid,
    ) -> Result<(), MutationError> {
        let transaction = self.get_transaction(transaction_id).await?;

        self.authorize(actor, transaction.cashbook_id).await?;

        self.coordinator.delete(transaction_id).await
    }

    /// Move several transactions to the same status. Each transaction is
    /// changed in its own unit of work, so a failure leaves the transactions
    /// before it changed.
    ///
    /// # Returns
    ///
    /// The number of transactions whose status changed.
    pub async fn set_status(
        &self,
        actor: Actor,
        transaction_ids: &[Uuid],
        status: TransactionStatus,
    ) -> Result<usize, MutationError> {
        let mut changed = 0;

        for transaction_id in transaction_ids {
            let transaction = self.get_transaction(*transaction_id).await?;
            if transaction.status == status {
                continue;
            }

            self.update_transaction(actor, *transaction_id, TransactionChanges::status(status))
                .await?;
            changed += 1;
        }

        info!(
            %status,
            changed,
            requested = transaction_ids.len(),
            "Changed transaction statuses."
        );

        Ok(changed)
    }

    pub async fn list_transactions(
        &self,
        query: TransactionQuery,
    ) -> anyhow::Result<TransactionCollection> {
        Ok(self.repo.list_transactions(query).await?)
    }

    /// The cached balance of a cashbook.
    pub async fn get_balance(&self, cashbook_id: Uuid) -> Result<Decimal, AuditError> {
        Ok(self.cashbook(cashbook_id).await?.current_balance)
    }

    pub async fn get_balance_summary(
        &self,
        cashbook_id: Uuid,
    ) -> Result<BalanceSummary, AuditError> {
        self.auditor.summarize(cashbook_id).await
    }

    pub async fn check_consistency(
        &self,
        cashbook_id: Uuid,
    ) -> Result<ConsistencyReport, AuditError> {
        self.auditor.check(cashbook_id).await
    }

    pub async fn reconcile(
        &self,
        target: ReconcileTarget,
        mode: ReconcileMode,
    ) -> Result<BulkReport, AuditError> {
        self.auditor.reconcile_all(target, mode).await
    }

    pub async fn reconcile_cashbook(&self, cashbook_id: Uuid) -> Result<Decimal, AuditError> {
        self.auditor.reconcile(cashbook_id).await
    }

    /// Compute the daily balances of a cashbook from its ledger.
    pub async fn daily_balances(
        &self,
        cashbook_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailyBalance>, AuditError> {
        let cashbook = self.cashbook(cashbook_id).await?;
        let transactions = self.repo.list_cashbook_transactions(cashbook_id).await?;

        reports::daily_balances(
            &self.calculator,
            cashbook_id,
            cashbook.initial_balance,
            &transactions,
            from,
            to,
        )
        .map_err(|source| AuditError::Overflow {
            cashbook_id,
            source,
        })
    }

    /// Compute and store the daily balances of a cashbook. Days that already
    /// have a recorded balance keep it.
    ///
    /// # Returns
    ///
    /// The number of days newly recorded.
    pub async fn record_daily_balances(
        &self,
        cashbook_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<u64, AuditError> {
        let balances = self.daily_balances(cashbook_id, from, to).await?;
        let recorded = self.repo.record_daily_balances(&balances).await?;

        info!(%cashbook_id, %from, %to, recorded, "Recorded daily balances.");

        Ok(recorded)
    }

    /// The daily balances previously recorded for a cashbook.
    pub async fn recorded_daily_balances(
        &self,
        cashbook_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailyBalance>, AuditError> {
        Ok(self.repo.list_daily_balances(cashbook_id, from, to).await?)
    }

    async fn cashbook(&self, cashbook_id: Uuid) -> Result<Cashbook, AuditError> {
        self.repo
            .get_cashbook(cashbook_id)
            .await?
            .ok_or(AuditError::CashbookNotFound(cashbook_id))
    }

    async fn get_transaction(&self, transaction_id: Uuid) -> Result<Transaction, MutationError> {
        self.repo
            .get_transaction(transaction_id)
            .await?
            .ok_or(MutationError::TransactionNotFound(transaction_id))
    }

    /// Make sure the actor is a member of the store owning a cashbook. This
    /// happens before any cashbook is locked.
    async fn authorize(&self, actor: Actor, cashbook_id: Uuid) -> Result<(), MutationError> {
        let cashbook = self
            .repo
            .get_cashbook(cashbook_id)
            .await?
            .ok_or(MutationError::CashbookNotFound(cashbook_id))?;

        let role = self.access.role_for(actor.user_id, cashbook.store_id).await?;
        match role {
            Some(role) if role.can_write_transactions() => {
                debug!(user_id = %actor.user_id, ?role, %cashbook_id, "Authorized ledger write.");

                Ok(())
            }
            _ => Err(MutationError::PermissionDenied {
                user_id: actor.user_id,
                store_id: cashbook.store_id,
            }),
        }
    }
}
