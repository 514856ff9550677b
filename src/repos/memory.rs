//! A ledger store that lives entirely in process memory.
//!
//! Each cashbook has its own async mutex which stands in for the database's
//! row lock. Writes made through a unit of work are staged and only become
//! visible to other readers when the unit of work commits.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Duration,
};

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;
use uuid::Uuid;

use super::{
    require_locks, LedgerRepo, StoreError, TransactionCollection, TransactionQuery, UnitOfWork,
    TRANSACTION_PAGE_SIZE,
};
use crate::ledger::{
    calculator::ledger_order,
    domain::{
        cashbooks::Cashbook,
        reports::DailyBalance,
        transactions::{Transaction, TransactionType},
    },
};

#[derive(Default)]
struct State {
    cashbooks: HashMap<Uuid, Cashbook>,
    transaction_types: HashMap<Uuid, TransactionType>,
    transactions: HashMap<Uuid, Transaction>,
    daily_balances: BTreeMap<(Uuid, NaiveDate), DailyBalance>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

/// An in-memory [`LedgerRepo`]. Clones share the same data.
#[derive(Clone, Default)]
pub struct MemoryLedger {
    inner: Arc<Inner>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    async fn cashbook_lock(&self, cashbook_id: Uuid) -> Arc<Mutex<()>> {
        self.inner
            .locks
            .lock()
            .await
            .entry(cashbook_id)
            .or_default()
            .clone()
    }

    /// Overwrite a cached balance without taking the cashbook lock, the way
    /// an out-of-band write to the database would.
    #[cfg(test)]
    pub(crate) async fn overwrite_balance(&self, cashbook_id: Uuid, balance: Decimal) {
        if let Some(cashbook) = self.inner.state.lock().await.cashbooks.get_mut(&cashbook_id) {
            cashbook.current_balance = balance;
        }
    }

    /// Store a transaction without touching the cashbook's balance.
    #[cfg(test)]
    pub(crate) async fn insert_raw_transaction(&self, transaction: Transaction) {
        self.inner
            .state
            .lock()
            .await
            .transactions
            .insert(transaction.id, transaction);
    }
}

fn query_matches(
    query: &TransactionQuery,
    transaction: &Transaction,
    cashbook: Option<&Cashbook>,
) -> bool {
    if query.cashbook_id.map_or(false, |id| id != transaction.cashbook_id) {
        return false;
    }
    if let Some(store_id) = query.store_id {
        if cashbook.map(|c| c.store_id) != Some(store_id) {
            return false;
        }
    }
    if query.status.map_or(false, |status| status != transaction.status) {
        return false;
    }
    if query.nature.map_or(false, |nature| nature != transaction.nature) {
        return false;
    }
    if query.start_date.map_or(false, |start| transaction.transaction_date < start) {
        return false;
    }
    if query.end_date.map_or(false, |end| transaction.transaction_date > end) {
        return false;
    }
    if query.min_amount.map_or(false, |min| transaction.amount < min) {
        return false;
    }
    if query.max_amount.map_or(false, |max| transaction.amount > max) {
        return false;
    }
    if query.is_recurring.map_or(false, |recurring| recurring != transaction.is_recurring) {
        return false;
    }
    if let Some(search) = &query.search {
        let search = search.to_lowercase();
        let found = [&transaction.description, &transaction.reference_number]
            .into_iter()
            .flatten()
            .any(|text| text.to_lowercase().contains(&search));
        if !found {
            return false;
        }
    }
    if let Some(cursor) = &query.after {
        let older = transaction.transaction_date < cursor.after_date
            || (transaction.transaction_date == cursor.after_date
                && transaction.created_at < cursor.after_created_at);
        if !older {
            return false;
        }
    }

    true
}

#[async_trait]
impl LedgerRepo for MemoryLedger {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork + Send>, StoreError> {
        Ok(Box::new(MemoryUnitOfWork {
            ledger: self.clone(),
            locked: HashMap::new(),
            staged_transactions: HashMap::new(),
            staged_balances: HashMap::new(),
        }))
    }

    async fn get_cashbook(&self, cashbook_id: Uuid) -> Result<Option<Cashbook>, StoreError> {
        Ok(self.inner.state.lock().await.cashbooks.get(&cashbook_id).cloned())
    }

    async fn list_cashbooks(&self, store_id: Option<Uuid>) -> Result<Vec<Cashbook>, StoreError> {
        let state = self.inner.state.lock().await;

        let mut cashbooks = state
            .cashbooks
            .values()
            .filter(|cashbook| store_id.map_or(true, |id| id == cashbook.store_id))
            .cloned()
            .collect::<Vec<_>>();
        cashbooks.sort_by(|a, b| a.store_id.cmp(&b.store_id).then_with(|| a.name.cmp(&b.name)));

        Ok(cashbooks)
    }

    async fn insert_cashbook(&self, cashbook: &Cashbook) -> Result<(), StoreError> {
        let mut state = self.inner.state.lock().await;

        let duplicate = state.cashbooks.values().any(|existing| {
            existing.store_id == cashbook.store_id && existing.name == cashbook.name
        });
        if duplicate {
            return Err(StoreError::Duplicate(format!("cashbook {:?}", cashbook.name)));
        }

        state.cashbooks.insert(cashbook.id, cashbook.clone());

        Ok(())
    }

    async fn get_transaction_type(
        &self,
        type_id: Uuid,
    ) -> Result<Option<TransactionType>, StoreError> {
        Ok(self
            .inner
            .state
            .lock()
            .await
            .transaction_types
            .get(&type_id)
            .cloned())
    }

    async fn insert_transaction_type(
        &self,
        transaction_type: &TransactionType,
    ) -> Result<(), StoreError> {
        let mut state = self.inner.state.lock().await;

        if state
            .transaction_types
            .values()
            .any(|existing| existing.name == transaction_type.name)
        {
            return Err(StoreError::Duplicate(format!(
                "transaction type {:?}",
                transaction_type.name
            )));
        }

        state
            .transaction_types
            .insert(transaction_type.id, transaction_type.clone());

        Ok(())
    }

    async fn get_transaction(
        &self,
        transaction_id: Uuid,
    ) -> Result<Option<Transaction>, StoreError> {
        Ok(self
            .inner
            .state
            .lock()
            .await
            .transactions
            .get(&transaction_id)
            .cloned())
    }

    async fn list_cashbook_transactions(
        &self,
        cashbook_id: Uuid,
    ) -> Result<Vec<Transaction>, StoreError> {
        let state = self.inner.state.lock().await;

        let mut transactions = state
            .transactions
            .values()
            .filter(|transaction| transaction.cashbook_id == cashbook_id)
            .cloned()
            .collect::<Vec<_>>();
        transactions.sort_by(ledger_order);

        Ok(transactions)
    }

    async fn list_transactions(
        &self,
        query: TransactionQuery,
    ) -> Result<TransactionCollection, StoreError> {
        let state = self.inner.state.lock().await;

        let mut transactions = state
            .transactions
            .values()
            .filter(|transaction| {
                query_matches(&query, transaction, state.cashbooks.get(&transaction.cashbook_id))
            })
            .cloned()
            .collect::<Vec<_>>();
        transactions.sort_by(|a, b| ledger_order(b, a));
        transactions.truncate(usize::from(TRANSACTION_PAGE_SIZE) + 1);

        Ok(TransactionCollection::from_overfetched(transactions))
    }

    async fn list_daily_balances(
        &self,
        cashbook_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailyBalance>, StoreError> {
        if from > to {
            return Ok(vec![]);
        }

        Ok(self
            .inner
            .state
            .lock()
            .await
            .daily_balances
            .range((cashbook_id, from)..=(cashbook_id, to))
            .map(|(_, balance)| balance.clone())
            .collect())
    }

    async fn record_daily_balances(&self, balances: &[DailyBalance]) -> Result<u64, StoreError> {
        let mut state = self.inner.state.lock().await;

        let mut recorded = 0;
        for balance in balances {
            let key = (balance.cashbook_id, balance.date);
            if !state.daily_balances.contains_key(&key) {
                state.daily_balances.insert(key, balance.clone());
                recorded += 1;
            }
        }

        Ok(recorded)
    }
}

/// Staged writes against a [`MemoryLedger`].
///
/// A staged transaction of `None` is a deletion.
struct MemoryUnitOfWork {
    ledger: MemoryLedger,
    locked: HashMap<Uuid, OwnedMutexGuard<()>>,
    staged_transactions: HashMap<Uuid, Option<Transaction>>,
    staged_balances: HashMap<Uuid, Decimal>,
}

impl MemoryUnitOfWork {
    fn ensure_locked(&self, cashbook_ids: &[Uuid]) -> Result<(), StoreError> {
        require_locks(|cashbook_id| self.locked.contains_key(cashbook_id), cashbook_ids)
    }

    async fn current_transaction(&self, transaction_id: Uuid) -> Option<Transaction> {
        match self.staged_transactions.get(&transaction_id) {
            Some(staged) => staged.clone(),
            None => self
                .ledger
                .inner
                .state
                .lock()
                .await
                .transactions
                .get(&transaction_id)
                .cloned(),
        }
    }
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    async fn lock_cashbook(
        &mut self,
        cashbook_id: Uuid,
        timeout: Duration,
    ) -> Result<Cashbook, StoreError> {
        if !self.locked.contains_key(&cashbook_id) {
            if self.ledger.get_cashbook(cashbook_id).await?.is_none() {
                return Err(StoreError::CashbookNotFound(cashbook_id));
            }

            let lock = self.ledger.cashbook_lock(cashbook_id).await;
            let guard = tokio::time::timeout(timeout, lock.lock_owned())
                .await
                .map_err(|_| StoreError::LockTimeout {
                    cashbook_id,
                    waited: timeout,
                })?;

            trace!(%cashbook_id, "Locked cashbook.");
            self.locked.insert(cashbook_id, guard);
        }

        let mut cashbook = self
            .ledger
            .get_cashbook(cashbook_id)
            .await?
            .ok_or(StoreError::CashbookNotFound(cashbook_id))?;
        if let Some(balance) = self.staged_balances.get(&cashbook_id) {
            cashbook.current_balance = *balance;
        }

        Ok(cashbook)
    }

    async fn get_transaction(
        &mut self,
        transaction_id: Uuid,
    ) -> Result<Option<Transaction>, StoreError> {
        Ok(self.current_transaction(transaction_id).await)
    }

    async fn cashbook_transactions(
        &mut self,
        cashbook_id: Uuid,
    ) -> Result<Vec<Transaction>, StoreError> {
        self.ensure_locked(&[cashbook_id])?;

        let state = self.ledger.inner.state.lock().await;

        let committed = state
            .transactions
            .values()
            .filter(|transaction| !self.staged_transactions.contains_key(&transaction.id));
        let staged = self.staged_transactions.values().flatten();

        let mut transactions = committed
            .chain(staged)
            .filter(|transaction| transaction.cashbook_id == cashbook_id)
            .cloned()
            .collect::<Vec<_>>();
        transactions.sort_by(ledger_order);

        Ok(transactions)
    }

    async fn insert_transaction(&mut self, transaction: &Transaction) -> Result<(), StoreError> {
        self.ensure_locked(&[transaction.cashbook_id])?;

        if self.current_transaction(transaction.id).await.is_some() {
            return Err(StoreError::Duplicate(format!("transaction {}", transaction.id)));
        }

        self.staged_transactions
            .insert(transaction.id, Some(transaction.clone()));

        Ok(())
    }

    async fn update_transaction(&mut self, transaction: &Transaction) -> Result<(), StoreError> {
        let existing = self
            .current_transaction(transaction.id)
            .await
            .ok_or_else(|| anyhow!("transaction {} does not exist", transaction.id))?;
        self.ensure_locked(&[existing.cashbook_id, transaction.cashbook_id])?;

        self.staged_transactions
            .insert(transaction.id, Some(transaction.clone()));

        Ok(())
    }

    async fn delete_transaction(&mut self, transaction_id: Uuid) -> Result<bool, StoreError> {
        let existing = match self.current_transaction(transaction_id).await {
            Some(existing) => existing,
            None => return Ok(false),
        };
        self.ensure_locked(&[existing.cashbook_id])?;

        self.staged_transactions.insert(transaction_id, None);

        Ok(true)
    }

    async fn set_current_balance(
        &mut self,
        cashbook_id: Uuid,
        balance: Decimal,
    ) -> Result<(), StoreError> {
        self.ensure_locked(&[cashbook_id])?;

        self.staged_balances.insert(cashbook_id, balance);

        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        let mut state = this.ledger.inner.state.lock().await;

        for (transaction_id, staged) in this.staged_transactions {
            match staged {
                Some(transaction) => {
                    state.transactions.insert(transaction_id, transaction);
                }
                None => {
                    state.transactions.remove(&transaction_id);
                }
            }
        }

        let now = Utc::now();
        for (cashbook_id, balance) in this.staged_balances {
            if let Some(cashbook) = state.cashbooks.get_mut(&cashbook_id) {
                cashbook.current_balance = balance;
                cashbook.updated_at = now;
            }
        }

        // The cashbook locks are only released once the writes are visible.
        drop(state);
        drop(this.locked);

        Ok(())
    }
}
