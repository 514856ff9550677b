use std::{collections::HashSet, convert::TryFrom, time::Duration};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};
use tracing::{debug, trace};
use uuid::Uuid;

use super::{
    require_locks, LedgerRepo, StoreError, TransactionCollection, TransactionQuery, UnitOfWork,
    TRANSACTION_PAGE_SIZE,
};
use crate::{
    database::PostgresConnection,
    ledger::domain::{
        cashbooks::Cashbook,
        reports::DailyBalance,
        transactions::{Transaction, TransactionType},
    },
    models,
};

/// Postgres reports this when `lock_timeout` expires.
const LOCK_NOT_AVAILABLE: &str = "55P03";
const UNIQUE_VIOLATION: &str = "23505";

const TRANSACTION_COLUMNS: &str = r#"
    t.id, t.cashbook_id, t.amount, t.type_id, t.nature, t.category_id,
    t.description, t.reference_number, t.transaction_date, t.value_date,
    t.status, t.is_recurring, t.recurring_pattern, t.tags, t.created_by,
    t.updated_by, t.created_at, t.updated_at
"#;

fn error_code(error: &sqlx::Error) -> Option<String> {
    match error {
        sqlx::Error::Database(db_error) => db_error.code().map(|code| code.into_owned()),
        _ => None,
    }
}

fn transaction_from_row(row: models::ledger::Transaction) -> Result<Transaction, StoreError> {
    Ok(Transaction::try_from(row)
        .context("Failed to convert transaction model into domain object.")?)
}

#[async_trait]
impl LedgerRepo for PostgresConnection {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork + Send>, StoreError> {
        let tx = PgPool::begin(self).await?;

        Ok(Box::new(PostgresUnitOfWork {
            tx,
            locked: HashSet::new(),
        }))
    }

    async fn get_cashbook(&self, cashbook_id: Uuid) -> Result<Option<Cashbook>, StoreError> {
        let cashbook = sqlx::query_as::<_, models::ledger::Cashbook>(
            r#"
            SELECT *
            FROM cashbook
            WHERE id = $1
            "#,
        )
        .bind(cashbook_id)
        .fetch_optional(&**self)
        .await?;

        Ok(cashbook.map(Cashbook::from))
    }

    async fn list_cashbooks(&self, store_id: Option<Uuid>) -> Result<Vec<Cashbook>, StoreError> {
        let cashbooks = sqlx::query_as::<_, models::ledger::Cashbook>(
            r#"
            SELECT *
            FROM cashbook
            WHERE $1::UUID IS NULL OR store_id = $1
            ORDER BY store_id, name
            "#,
        )
        .bind(store_id)
        .fetch_all(&**self)
        .await?;

        Ok(cashbooks.into_iter().map(Cashbook::from).collect())
    }

    async fn insert_cashbook(&self, cashbook: &Cashbook) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO cashbook (
                id, store_id, name, description, initial_balance,
                current_balance, is_active, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(cashbook.id)
        .bind(cashbook.store_id)
        .bind(&cashbook.name)
        .bind(&cashbook.description)
        .bind(cashbook.initial_balance)
        .bind(cashbook.current_balance)
        .bind(cashbook.is_active)
        .bind(cashbook.created_at)
        .bind(cashbook.updated_at)
        .execute(&**self)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(error) if error_code(&error).as_deref() == Some(UNIQUE_VIOLATION) => Err(
                StoreError::Duplicate(format!("cashbook {:?}", cashbook.name)),
            ),
            Err(error) => Err(error.into()),
        }
    }

    async fn get_transaction_type(
        &self,
        type_id: Uuid,
    ) -> Result<Option<TransactionType>, StoreError> {
        let row = sqlx::query_as::<_, models::ledger::TransactionType>(
            r#"
            SELECT *
            FROM transaction_type
            WHERE id = $1
            "#,
        )
        .bind(type_id)
        .fetch_optional(&**self)
        .await?;

        Ok(row.map(TransactionType::try_from).transpose()?)
    }

    async fn insert_transaction_type(
        &self,
        transaction_type: &TransactionType,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO transaction_type (id, name, nature, is_active, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(transaction_type.id)
        .bind(&transaction_type.name)
        .bind(transaction_type.nature.as_str())
        .bind(transaction_type.is_active)
        .bind(transaction_type.created_at)
        .bind(transaction_type.updated_at)
        .execute(&**self)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(error) if error_code(&error).as_deref() == Some(UNIQUE_VIOLATION) => Err(
                StoreError::Duplicate(format!("transaction type {:?}", transaction_type.name)),
            ),
            Err(error) => Err(error.into()),
        }
    }

    async fn get_transaction(
        &self,
        transaction_id: Uuid,
    ) -> Result<Option<Transaction>, StoreError> {
        let row = sqlx::query_as::<_, models::ledger::Transaction>(&format!(
            r#"SELECT {} FROM "transaction" t WHERE t.id = $1"#,
            TRANSACTION_COLUMNS
        ))
        .bind(transaction_id)
        .fetch_optional(&**self)
        .await?;

        row.map(transaction_from_row).transpose()
    }

    async fn list_cashbook_transactions(
        &self,
        cashbook_id: Uuid,
    ) -> Result<Vec<Transaction>, StoreError> {
        let rows = sqlx::query_as::<_, models::ledger::Transaction>(&format!(
            r#"
            SELECT {}
            FROM "transaction" t
            WHERE t.cashbook_id = $1
            ORDER BY t.transaction_date, t.created_at, t.id
            "#,
            TRANSACTION_COLUMNS
        ))
        .bind(cashbook_id)
        .fetch_all(&**self)
        .await?;

        trace!(%cashbook_id, count = rows.len(), "Loaded cashbook transactions.");

        Ok(models::ledger::try_into_domain(rows)?)
    }

    async fn list_transactions(
        &self,
        query: TransactionQuery,
    ) -> Result<TransactionCollection, StoreError> {
        let mut query_builder: QueryBuilder<'_, Postgres> = QueryBuilder::new(format!(
            r#"
            SELECT {}
            FROM "transaction" t
                JOIN cashbook c ON t.cashbook_id = c.id
            WHERE TRUE"#,
            TRANSACTION_COLUMNS
        ));

        if let Some(cashbook_id) = query.cashbook_id {
            query_builder.push(" AND t.cashbook_id = ").push_bind(cashbook_id);
        }
        if let Some(store_id) = query.store_id {
            query_builder.push(" AND c.store_id = ").push_bind(store_id);
        }
        if let Some(status) = query.status {
            query_builder.push(" AND t.status = ").push_bind(status.as_str());
        }
        if let Some(nature) = query.nature {
            query_builder.push(" AND t.nature = ").push_bind(nature.as_str());
        }
        if let Some(start_date) = query.start_date {
            query_builder
                .push(" AND t.transaction_date >= ")
                .push_bind(start_date);
        }
        if let Some(end_date) = query.end_date {
            query_builder
                .push(" AND t.transaction_date <= ")
                .push_bind(end_date);
        }
        if let Some(min_amount) = query.min_amount {
            query_builder.push(" AND t.amount >= ").push_bind(min_amount);
        }
        if let Some(max_amount) = query.max_amount {
            query_builder.push(" AND t.amount <= ").push_bind(max_amount);
        }
        if let Some(is_recurring) = query.is_recurring {
            query_builder
                .push(" AND t.is_recurring = ")
                .push_bind(is_recurring);
        }
        if let Some(search) = query.search {
            let pattern = format!("%{}%", search);

            query_builder
                .push(" AND (t.description ILIKE ")
                .push_bind(pattern.clone())
                .push(" OR t.reference_number ILIKE ")
                .push_bind(pattern)
                .push(")");
        }

        if let Some(cursor) = query.after {
            query_builder
                .push(" AND (t.transaction_date < ")
                .push_bind(cursor.after_date)
                .push(" OR (t.transaction_date = ")
                .push_bind(cursor.after_date)
                .push(" AND t.created_at < ")
                .push_bind(cursor.after_created_at)
                .push("))");
        }

        query_builder
            .push(" ORDER BY t.transaction_date DESC, t.created_at DESC, t.id DESC LIMIT ")
            // Select one more than the page size so we can determine if there
            // is a next page.
            .push_bind(i16::from(TRANSACTION_PAGE_SIZE) + 1);

        let rows = query_builder
            .build()
            .fetch_all(&**self)
            .await?
            .iter()
            .map(models::ledger::Transaction::from_row)
            .collect::<Result<Vec<_>, sqlx::Error>>()?;

        Ok(TransactionCollection::from_overfetched(
            models::ledger::try_into_domain(rows)?,
        ))
    }

    async fn list_daily_balances(
        &self,
        cashbook_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailyBalance>, StoreError> {
        let rows = sqlx::query_as::<_, models::ledger::CashbookBalance>(
            r#"
            SELECT
                cashbook_id, "date", opening_balance, closing_balance,
                total_income, total_expense
            FROM cashbook_balance
            WHERE cashbook_id = $1 AND "date" BETWEEN $2 AND $3
            ORDER BY "date"
            "#,
        )
        .bind(cashbook_id)
        .bind(from)
        .bind(to)
        .fetch_all(&**self)
        .await?;

        Ok(rows.into_iter().map(DailyBalance::from).collect())
    }

    async fn record_daily_balances(&self, balances: &[DailyBalance]) -> Result<u64, StoreError> {
        if balances.is_empty() {
            return Ok(0);
        }

        let mut query_builder: QueryBuilder<'_, Postgres> = QueryBuilder::new(
            r#"
            INSERT INTO cashbook_balance (
                cashbook_id, "date", opening_balance, closing_balance,
                total_income, total_expense
            )
            "#,
        );

        query_builder.push_values(balances, |mut b, balance| {
            b.push_bind(balance.cashbook_id)
                .push_bind(balance.date)
                .push_bind(balance.opening_balance)
                .push_bind(balance.closing_balance)
                .push_bind(balance.total_income)
                .push_bind(balance.total_expense);
        });
        query_builder.push(r#" ON CONFLICT (cashbook_id, "date") DO NOTHING"#);

        let result = query_builder.build().execute(&**self).await?;

        debug!(rows = result.rows_affected(), "Recorded daily balances.");

        Ok(result.rows_affected())
    }
}

/// A database transaction holding `FOR UPDATE` locks on cashbook rows.
struct PostgresUnitOfWork {
    tx: sqlx::Transaction<'static, Postgres>,
    locked: HashSet<Uuid>,
}

impl PostgresUnitOfWork {
    fn ensure_locked(&self, cashbook_ids: &[Uuid]) -> Result<(), StoreError> {
        require_locks(|cashbook_id| self.locked.contains(cashbook_id), cashbook_ids)
    }

    /// The cashbook a transaction currently belongs to, as seen by this unit
    /// of work.
    async fn stored_cashbook_id(
        &mut self,
        transaction_id: Uuid,
    ) -> Result<Option<Uuid>, StoreError> {
        let cashbook_id = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT cashbook_id
            FROM "transaction"
            WHERE id = $1
            "#,
        )
        .bind(transaction_id)
        .fetch_optional(&mut self.tx)
        .await?;

        Ok(cashbook_id)
    }
}

#[async_trait]
impl UnitOfWork for PostgresUnitOfWork {
    async fn lock_cashbook(
        &mut self,
        cashbook_id: Uuid,
        timeout: Duration,
    ) -> Result<Cashbook, StoreError> {
        // The setting only lasts until the end of the database transaction.
        sqlx::query("SELECT set_config('lock_timeout', $1, true)")
            .bind(format!("{}ms", timeout.as_millis().max(1)))
            .execute(&mut self.tx)
            .await?;

        let result = sqlx::query_as::<_, models::ledger::Cashbook>(
            r#"
            SELECT *
            FROM cashbook
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(cashbook_id)
        .fetch_optional(&mut self.tx)
        .await;

        let cashbook = match result {
            Ok(Some(cashbook)) => cashbook,
            Ok(None) => return Err(StoreError::CashbookNotFound(cashbook_id)),
            Err(error) if error_code(&error).as_deref() == Some(LOCK_NOT_AVAILABLE) => {
                return Err(StoreError::LockTimeout {
                    cashbook_id,
                    waited: timeout,
                })
            }
            Err(error) => return Err(error.into()),
        };

        trace!(%cashbook_id, "Locked cashbook.");
        self.locked.insert(cashbook_id);

        Ok(cashbook.into())
    }

    async fn get_transaction(
        &mut self,
        transaction_id: Uuid,
    ) -> Result<Option<Transaction>, StoreError> {
        let row = sqlx::query_as::<_, models::ledger::Transaction>(&format!(
            r#"SELECT {} FROM "transaction" t WHERE t.id = $1"#,
            TRANSACTION_COLUMNS
        ))
        .bind(transaction_id)
        .fetch_optional(&mut self.tx)
        .await?;

        row.map(transaction_from_row).transpose()
    }

    async fn cashbook_transactions(
        &mut self,
        cashbook_id: Uuid,
    ) -> Result<Vec<Transaction>, StoreError> {
        self.ensure_locked(&[cashbook_id])?;

        let rows = sqlx::query_as::<_, models::ledger::Transaction>(&format!(
            r#"
            SELECT {}
            FROM "transaction" t
            WHERE t.cashbook_id = $1
            ORDER BY t.transaction_date, t.created_at, t.id
            "#,
            TRANSACTION_COLUMNS
        ))
        .bind(cashbook_id)
        .fetch_all(&mut self.tx)
        .await?;

        Ok(models::ledger::try_into_domain(rows)?)
    }

    async fn insert_transaction(&mut self, transaction: &Transaction) -> Result<(), StoreError> {
        self.ensure_locked(&[transaction.cashbook_id])?;

        sqlx::query(
            r#"
            INSERT INTO "transaction" (
                id, cashbook_id, amount, type_id, nature, category_id,
                description, reference_number, transaction_date, value_date,
                status, is_recurring, recurring_pattern, tags, created_by,
                updated_by, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            "#,
        )
        .bind(transaction.id)
        .bind(transaction.cashbook_id)
        .bind(transaction.amount)
        .bind(transaction.type_id)
        .bind(transaction.nature.as_str())
        .bind(transaction.category_id)
        .bind(&transaction.description)
        .bind(&transaction.reference_number)
        .bind(transaction.transaction_date)
        .bind(transaction.value_date)
        .bind(transaction.status.as_str())
        .bind(transaction.is_recurring)
        .bind(&transaction.recurring_pattern)
        .bind(&transaction.tags)
        .bind(transaction.created_by)
        .bind(transaction.updated_by)
        .bind(transaction.created_at)
        .bind(transaction.updated_at)
        .execute(&mut self.tx)
        .await?;

        Ok(())
    }

    async fn update_transaction(&mut self, transaction: &Transaction) -> Result<(), StoreError> {
        let existing = self
            .stored_cashbook_id(transaction.id)
            .await?
            .ok_or_else(|| anyhow!("transaction {} does not exist", transaction.id))?;
        self.ensure_locked(&[existing, transaction.cashbook_id])?;

        let result = sqlx::query(
            r#"
            UPDATE "transaction"
            SET
                cashbook_id = $2,
                amount = $3,
                type_id = $4,
                nature = $5,
                category_id = $6,
                description = $7,
                reference_number = $8,
                transaction_date = $9,
                value_date = $10,
                status = $11,
                is_recurring = $12,
                recurring_pattern = $13,
                tags = $14,
                updated_by = $15,
                updated_at = $16
            WHERE id = $1
            "#,
        )
        .bind(transaction.id)
        .bind(transaction.cashbook_id)
        .bind(transaction.amount)
        .bind(transaction.type_id)
        .bind(transaction.nature.as_str())
        .bind(transaction.category_id)
        .bind(&transaction.description)
        .bind(&transaction.reference_number)
        .bind(transaction.transaction_date)
        .bind(transaction.value_date)
        .bind(transaction.status.as_str())
        .bind(transaction.is_recurring)
        .bind(&transaction.recurring_pattern)
        .bind(&transaction.tags)
        .bind(transaction.updated_by)
        .bind(transaction.updated_at)
        .execute(&mut self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(anyhow!("transaction {} does not exist", transaction.id).into());
        }

        Ok(())
    }

    async fn delete_transaction(&mut self, transaction_id: Uuid) -> Result<bool, StoreError> {
        let existing = match self.stored_cashbook_id(transaction_id).await? {
            Some(existing) => existing,
            None => return Ok(false),
        };
        self.ensure_locked(&[existing])?;

        let result = sqlx::query(
            r#"
            DELETE FROM "transaction"
            WHERE id = $1
            "#,
        )
        .bind(transaction_id)
        .execute(&mut self.tx)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_current_balance(
        &mut self,
        cashbook_id: Uuid,
        balance: Decimal,
    ) -> Result<(), StoreError> {
        self.ensure_locked(&[cashbook_id])?;

        sqlx::query(
            r#"
            UPDATE cashbook
            SET current_balance = $2, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(cashbook_id)
        .bind(balance)
        .execute(&mut self.tx)
        .await?;

        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;

        Ok(())
    }
}
