//! Balance-changing operations on transactions.
//!
//! Every operation runs in a single unit of work that holds the exclusive
//! lock of each cashbook it touches. Creating a transaction applies its effect
//! to the locked balance directly. Updates and deletions that involve a
//! completed transaction recompute the affected balances from scratch, so a
//! previously drifted balance is repaired as a side effect.

use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;
use validator::{Validate, ValidationErrors};

use super::{
    access::Actor,
    calculator::{BalanceCalculator, CalculationError},
    domain::{
        cashbooks::Cashbook,
        transactions::{Nature, Transaction, TransactionChanges, TransactionData},
    },
};
use crate::{
    config::EngineConfig,
    repos::{DynLedgerRepo, StoreError, UnitOfWork},
};

/// How often an update or deletion is attempted when the transaction keeps
/// moving to another cashbook while the locks are being acquired.
const MAX_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum MutationError {
    #[error("cashbook {0} does not exist")]
    CashbookNotFound(Uuid),

    #[error("transaction {0} does not exist")]
    TransactionNotFound(Uuid),

    #[error("transaction type {0} does not exist")]
    TransactionTypeNotFound(Uuid),

    #[error("{0} already exists")]
    Duplicate(String),

    #[error("invalid data: {0}")]
    Validation(#[from] ValidationErrors),

    #[error("timed out after {waited:?} waiting for the lock on cashbook {cashbook_id}")]
    LockTimeout { cashbook_id: Uuid, waited: Duration },

    #[error("the balance of cashbook {cashbook_id} cannot be stored: {source}")]
    Overflow {
        cashbook_id: Uuid,
        source: CalculationError,
    },

    #[error("user {user_id} may not write to store {store_id}")]
    PermissionDenied { user_id: Uuid, store_id: Uuid },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl MutationError {
    /// Determine if the operation may succeed when tried again unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockTimeout { .. })
    }
}

impl From<StoreError> for MutationError {
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
            StoreError::Duplicate(what) => Self::Duplicate(what),
            StoreError::Other(error) => Self::Other(error),
        }
    }
}

/// Applies transaction changes and keeps the cached cashbook balances in step
/// with them.
#[derive(Clone)]
pub struct BalanceCoordinator {
    repo: DynLedgerRepo,
    calculator: BalanceCalculator,
    lock_timeout: Duration,
}

impl BalanceCoordinator {
    pub fn new(repo: DynLedgerRepo, config: EngineConfig) -> Self {
        Self {
            repo,
            calculator: BalanceCalculator::new(config.precision),
            lock_timeout: config.lock_timeout,
        }
    }

    /// Record a new transaction.
    ///
    /// If the transaction is completed, its effect is added to the cashbook's
    /// balance while the cashbook is locked.
    pub async fn create(
        &self,
        actor: Actor,
        data: TransactionData,
    ) -> Result<Transaction, MutationError> {
        data.validate()?;
        let nature = self.nature_of(data.type_id).await?;

        let mut uow = self.repo.begin().await?;
        let cashbook = uow.lock_cashbook(data.cashbook_id, self.lock_timeout).await?;

        let transaction = Transaction::record(data, nature, actor.user_id, Utc::now());
        uow.insert_transaction(&transaction).await?;

        let balance = if transaction.is_completed() {
            let balance = self
                .calculator
                .apply(cashbook.current_balance, &transaction)
                .map_err(|source| MutationError::Overflow {
                    cashbook_id: cashbook.id,
                    source,
                })?;
            uow.set_current_balance(cashbook.id, balance).await?;

            balance
        } else {
            cashbook.current_balance
        };

        uow.commit().await?;

        info!(
            transaction_id = %transaction.id,
            cashbook_id = %cashbook.id,
            status = %transaction.status,
            %balance,
            "Recorded transaction."
        );

        Ok(transaction)
    }

    /// Change an existing transaction.
    ///
    /// The changes are merged into the transaction and validated before any
    /// lock is taken. If the transaction is completed before or after the
    /// change, the balances of its old and new cashbook are recomputed.
    pub async fn update(
        &self,
        actor: Actor,
        transaction_id: Uuid,
        changes: &TransactionChanges,
    ) -> Result<Transaction, MutationError> {
        let mut last_cashbook_id = None;

        for attempt in 1..=MAX_ATTEMPTS {
            let current = self
                .repo
                .get_transaction(transaction_id)
                .await?
                .ok_or(MutationError::TransactionNotFound(transaction_id))?;

            let data = changes.apply_to(TransactionData::from(&current));
            data.validate()?;
            self.nature_for_update(&current, data.type_id).await?;

            if let Some(updated) = self
                .update_locked(actor, &current, changes, data.cashbook_id)
                .await?
            {
                return Ok(updated);
            }

            debug!(%transaction_id, attempt, "Transaction moved while waiting for locks.");
            last_cashbook_id = Some(current.cashbook_id);
        }

        Err(MutationError::LockTimeout {
            cashbook_id: last_cashbook_id.unwrap_or_default(),
            waited: self.lock_timeout,
        })
    }

    /// Remove a transaction. Removing a completed transaction reverses its
    /// effect on the cashbook's balance.
    pub async fn delete(&self, transaction_id: Uuid) -> Result<(), MutationError> {
        let mut last_cashbook_id = None;

        for attempt in 1..=MAX_ATTEMPTS {
            let current = self
                .repo
                .get_transaction(transaction_id)
                .await?
                .ok_or(MutationError::TransactionNotFound(transaction_id))?;

            let mut uow = self.repo.begin().await?;
            let cashbook = uow
                .lock_cashbook(current.cashbook_id, self.lock_timeout)
                .await?;

            let locked = uow
                .get_transaction(transaction_id)
                .await?
                .ok_or(MutationError::TransactionNotFound(transaction_id))?;
            if locked.cashbook_id != cashbook.id {
                debug!(%transaction_id, attempt, "Transaction moved while waiting for locks.");
                last_cashbook_id = Some(cashbook.id);
                continue;
            }

            uow.delete_transaction(transaction_id).await?;

            let balance = if locked.is_completed() {
                self.recompute(uow.as_mut(), &cashbook).await?
            } else {
                cashbook.current_balance
            };

            uow.commit().await?;

            info!(
                %transaction_id,
                cashbook_id = %cashbook.id,
                %balance,
                "Deleted transaction."
            );

            return Ok(());
        }

        Err(MutationError::LockTimeout {
            cashbook_id: last_cashbook_id.unwrap_or_default(),
            waited: self.lock_timeout,
        })
    }

    /// Apply an update while holding the locks of the transaction's current
    /// and target cashbooks.
    ///
    /// # Returns
    ///
    /// `None` if the transaction was moved to a different cashbook after
    /// `seen` was read, in which case nothing was written.
    async fn update_locked(
        &self,
        actor: Actor,
        seen: &Transaction,
        changes: &TransactionChanges,
        target_cashbook_id: Uuid,
    ) -> Result<Option<Transaction>, MutationError> {
        let mut cashbook_ids = vec![seen.cashbook_id, target_cashbook_id];
        cashbook_ids.sort();
        cashbook_ids.dedup();

        let mut uow = self.repo.begin().await?;

        // Locks are always taken in ascending ID order so two updates moving
        // transactions in opposite directions cannot deadlock.
        let mut cashbooks = Vec::with_capacity(cashbook_ids.len());
        for cashbook_id in cashbook_ids {
            cashbooks.push(uow.lock_cashbook(cashbook_id, self.lock_timeout).await?);
        }

        let locked = uow
            .get_transaction(seen.id)
            .await?
            .ok_or(MutationError::TransactionNotFound(seen.id))?;
        if locked.cashbook_id != seen.cashbook_id {
            return Ok(None);
        }

        // Merge again in case the transaction changed while we waited.
        let data = changes.apply_to(TransactionData::from(&locked));
        data.validate()?;
        let nature = self.nature_for_update(&locked, data.type_id).await?;

        let updated = locked.revise(data, nature, actor.user_id, Utc::now());
        uow.update_transaction(&updated).await?;

        if locked.is_completed() || updated.is_completed() {
            for cashbook in &cashbooks {
                let balance = self.recompute(uow.as_mut(), cashbook).await?;

                debug!(cashbook_id = %cashbook.id, %balance, "Recomputed balance.");
            }
        }

        uow.commit().await?;

        info!(
            transaction_id = %updated.id,
            cashbook_id = %updated.cashbook_id,
            status = %updated.status,
            "Updated transaction."
        );

        Ok(Some(updated))
    }

    /// Recalculate the balance of a locked cashbook from its staged ledger and
    /// store it.
    async fn recompute(
        &self,
        uow: &mut (dyn UnitOfWork + Send),
        cashbook: &Cashbook,
    ) -> Result<Decimal, MutationError> {
        let transactions = uow.cashbook_transactions(cashbook.id).await?;
        let balance = self
            .calculator
            .calculate(cashbook.initial_balance, &transactions)
            .map_err(|source| MutationError::Overflow {
                cashbook_id: cashbook.id,
                source,
            })?;

        uow.set_current_balance(cashbook.id, balance).await?;

        Ok(balance)
    }

    async fn nature_of(&self, type_id: Uuid) -> Result<Nature, MutationError> {
        self.repo
            .get_transaction_type(type_id)
            .await?
            .map(|transaction_type| transaction_type.nature)
            .ok_or(MutationError::TransactionTypeNotFound(type_id))
    }

    /// The nature a transaction has after switching to `type_id`. A
    /// transaction keeps its recorded nature unless its type changes.
    async fn nature_for_update(
        &self,
        transaction: &Transaction,
        type_id: Uuid,
    ) -> Result<Nature, MutationError> {
        if type_id == transaction.type_id {
            Ok(transaction.nature)
        } else {
            self.nature_of(type_id).await
        }
    }
}
