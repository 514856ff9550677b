//! Persistence for cashbooks and their transactions.
//!
//! Reads go straight through [`LedgerRepo`]. Anything that changes a cashbook's
//! balance goes through a [`UnitOfWork`], which holds exclusive cashbook locks
//! until it is committed or dropped. Dropping a unit of work without
//! committing discards every write staged in it.

use std::{sync::Arc, time::Duration};

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

use crate::ledger::domain::{
    cashbooks::Cashbook,
    reports::DailyBalance,
    transactions::{Nature, Transaction, TransactionCursor, TransactionStatus, TransactionType},
};

pub mod memory;
mod postgres;

pub use memory::MemoryLedger;

/// The number of transactions in each page of a transaction listing.
pub const TRANSACTION_PAGE_SIZE: u8 = 50;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cashbook {0} does not exist")]
    CashbookNotFound(Uuid),

    #[error("timed out after {waited:?} waiting for the lock on cashbook {cashbook_id}")]
    LockTimeout { cashbook_id: Uuid, waited: Duration },

    #[error("{0} already exists")]
    Duplicate(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(error: sqlx::Error) -> Self {
        Self::Other(error.into())
    }
}

/// Query parameters for listing transactions.
#[derive(Clone, Debug, Default)]
pub struct TransactionQuery {
    pub cashbook_id: Option<Uuid>,
    /// Only list transactions in cashbooks owned by this store.
    pub store_id: Option<Uuid>,
    pub status: Option<TransactionStatus>,
    pub nature: Option<Nature>,
    /// The earliest transaction date to include.
    pub start_date: Option<NaiveDate>,
    /// The latest transaction date to include.
    pub end_date: Option<NaiveDate>,
    pub min_amount: Option<Decimal>,
    pub max_amount: Option<Decimal>,
    pub is_recurring: Option<bool>,
    /// Case insensitive text to look for in the description or reference
    /// number.
    pub search: Option<String>,
    /// An optional cursor into the transaction list indicating that only
    /// results occurring after the specified position in the list should be
    /// returned.
    pub after: Option<TransactionCursor>,
}

pub struct TransactionCollection {
    pub next: Option<TransactionCursor>,
    pub items: Vec<Transaction>,
}

impl TransactionCollection {
    /// Build a page from a list fetched with one more item than the page size.
    /// If the extra item exists, it is removed and a cursor to the next page
    /// is produced.
    fn from_overfetched(mut items: Vec<Transaction>) -> Self {
        let has_next_page = items.len() > usize::from(TRANSACTION_PAGE_SIZE);
        if has_next_page {
            items.pop();
        }

        let next = if has_next_page {
            items.last().map(|last| TransactionCursor {
                after_date: last.transaction_date,
                after_created_at: last.created_at,
            })
        } else {
            None
        };

        Self { next, items }
    }
}

/// Check that a unit of work holds the lock of every cashbook a write
/// touches. Moving a transaction touches both its old and new cashbook.
fn require_locks<F>(is_locked: F, cashbook_ids: &[Uuid]) -> Result<(), StoreError>
where
    F: Fn(&Uuid) -> bool,
{
    match cashbook_ids.iter().find(|&&cashbook_id| !is_locked(&cashbook_id)) {
        Some(cashbook_id) => {
            Err(anyhow!("cashbook {} is not locked by this unit of work", cashbook_id).into())
        }
        None => Ok(()),
    }
}

pub type DynLedgerRepo = Arc<dyn LedgerRepo + Send + Sync>;

#[async_trait]
pub trait LedgerRepo {
    /// Start a new unit of work.
    async fn begin(&self) -> Result<Box<dyn UnitOfWork + Send>, StoreError>;

    async fn get_cashbook(&self, cashbook_id: Uuid) -> Result<Option<Cashbook>, StoreError>;

    /// List cashbooks, optionally only those owned by a specific store.
    async fn list_cashbooks(&self, store_id: Option<Uuid>) -> Result<Vec<Cashbook>, StoreError>;

    /// Persist a new cashbook.
    ///
    /// # Returns
    ///
    /// [`StoreError::Duplicate`] if the store already has a cashbook with the
    /// same name.
    async fn insert_cashbook(&self, cashbook: &Cashbook) -> Result<(), StoreError>;

    async fn get_transaction_type(
        &self,
        type_id: Uuid,
    ) -> Result<Option<TransactionType>, StoreError>;

    /// Persist a new transaction type. There is deliberately no way to update
    /// a type's nature.
    async fn insert_transaction_type(
        &self,
        transaction_type: &TransactionType,
    ) -> Result<(), StoreError>;

    async fn get_transaction(&self, transaction_id: Uuid)
        -> Result<Option<Transaction>, StoreError>;

    /// Every transaction of a cashbook regardless of status, in ledger order.
    async fn list_cashbook_transactions(
        &self,
        cashbook_id: Uuid,
    ) -> Result<Vec<Transaction>, StoreError>;

    /// List the transactions matching the provided query, newest first.
    async fn list_transactions(
        &self,
        query: TransactionQuery,
    ) -> Result<TransactionCollection, StoreError>;

    /// The recorded daily balances of a cashbook within a date range.
    async fn list_daily_balances(
        &self,
        cashbook_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailyBalance>, StoreError>;

    /// Record daily balances. Days that already have a balance recorded are
    /// left untouched.
    ///
    /// # Returns
    ///
    /// The number of balances that were newly recorded.
    async fn record_daily_balances(&self, balances: &[DailyBalance]) -> Result<u64, StoreError>;
}

/// A set of writes that are applied atomically.
#[async_trait]
pub trait UnitOfWork {
    /// Take the exclusive lock on a cashbook, waiting at most `timeout` for
    /// it. The lock is held until the unit of work ends.
    ///
    /// # Returns
    ///
    /// The cashbook as seen while holding the lock.
    async fn lock_cashbook(
        &mut self,
        cashbook_id: Uuid,
        timeout: Duration,
    ) -> Result<Cashbook, StoreError>;

    async fn get_transaction(
        &mut self,
        transaction_id: Uuid,
    ) -> Result<Option<Transaction>, StoreError>;

    /// Every transaction of a locked cashbook as seen by this unit of work,
    /// in ledger order.
    async fn cashbook_transactions(
        &mut self,
        cashbook_id: Uuid,
    ) -> Result<Vec<Transaction>, StoreError>;

    async fn insert_transaction(&mut self, transaction: &Transaction) -> Result<(), StoreError>;

    async fn update_transaction(&mut self, transaction: &Transaction) -> Result<(), StoreError>;

    /// # Returns
    ///
    /// `false` if the transaction did not exist.
    async fn delete_transaction(&mut self, transaction_id: Uuid) -> Result<bool, StoreError>;

    /// Overwrite the cached balance of a locked cashbook.
    async fn set_current_balance(
        &mut self,
        cashbook_id: Uuid,
        balance: Decimal,
    ) -> Result<(), StoreError>;

    /// Apply all staged writes and release the locks.
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn require_locks_on_every_cashbook() {
        let source = Uuid::new_v4();
        let target = Uuid::new_v4();
        let locked = HashSet::from([target]);

        let result = require_locks(|id| locked.contains(id), &[source, target]);

        assert!(matches!(result, Err(StoreError::Other(_))));
    }

    #[test]
    fn require_locks_when_all_held() {
        let source = Uuid::new_v4();
        let target = Uuid::new_v4();
        let locked = HashSet::from([source, target]);

        require_locks(|id| locked.contains(id), &[source, target]).expect("both are locked");
    }
}
