//! Row shapes of the ledger tables.
//!
//! Enumerations are stored as text, so converting a row into its domain type
//! can fail if the database holds a value this version does not know about.

use std::convert::TryFrom;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::ledger::domain;

#[derive(Debug, sqlx::FromRow)]
pub struct Cashbook {
    pub id: Uuid,
    pub store_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub initial_balance: Decimal,
    pub current_balance: Decimal,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
pub struct TransactionType {
    pub id: Uuid,
    pub name: String,
    pub nature: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A transaction that has been persisted in a repository.
#[derive(Debug, sqlx::FromRow)]
pub struct Transaction {
    pub id: Uuid,
    pub cashbook_id: Uuid,
    pub amount: Decimal,
    pub type_id: Uuid,
    pub nature: String,
    pub category_id: Option<Uuid>,
    pub description: Option<String>,
    pub reference_number: Option<String>,
    pub transaction_date: NaiveDate,
    pub value_date: Option<NaiveDate>,
    pub status: String,
    pub is_recurring: bool,
    pub recurring_pattern: Option<String>,
    pub tags: Vec<String>,
    pub created_by: Uuid,
    pub updated_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
pub struct CashbookBalance {
    pub cashbook_id: Uuid,
    pub date: NaiveDate,
    pub opening_balance: Decimal,
    pub closing_balance: Decimal,
    pub total_income: Decimal,
    pub total_expense: Decimal,
}

impl From<Cashbook> for domain::cashbooks::Cashbook {
    fn from(model: Cashbook) -> Self {
        Self {
            id: model.id,
            store_id: model.store_id,
            name: model.name,
            description: model.description,
            initial_balance: model.initial_balance,
            current_balance: model.current_balance,
            is_active: model.is_active,
            created_at: model.created_at,
            updated_at: model.updated_at,
        }
    }
}

impl TryFrom<TransactionType> for domain::transactions::TransactionType {
    type Error = anyhow::Error;

    fn try_from(model: TransactionType) -> Result<Self, Self::Error> {
        Ok(Self {
            id: model.id,
            name: model.name,
            nature: model.nature.parse()?,
            is_active: model.is_active,
            created_at: model.created_at,
            updated_at: model.updated_at,
        })
    }
}

impl TryFrom<Transaction> for domain::transactions::Transaction {
    type Error = anyhow::Error;

    fn try_from(model: Transaction) -> Result<Self, Self::Error> {
        Ok(Self {
            id: model.id,
            cashbook_id: model.cashbook_id,
            amount: model.amount,
            type_id: model.type_id,
            nature: model.nature.parse()?,
            category_id: model.category_id,
            description: model.description,
            reference_number: model.reference_number,
            transaction_date: model.transaction_date,
            value_date: model.value_date,
            status: model.status.parse()?,
            is_recurring: model.is_recurring,
            recurring_pattern: model.recurring_pattern,
            tags: model.tags,
            created_by: model.created_by,
            updated_by: model.updated_by,
            created_at: model.created_at,
            updated_at: model.updated_at,
        })
    }
}

impl From<CashbookBalance> for domain::reports::DailyBalance {
    fn from(model: CashbookBalance) -> Self {
        Self {
            cashbook_id: model.cashbook_id,
            date: model.date,
            opening_balance: model.opening_balance,
            closing_balance: model.closing_balance,
            total_income: model.total_income,
            total_expense: model.total_expense,
        }
    }
}

/// Convert a list of rows into domain objects, failing on the first row that
/// cannot be converted.
pub fn try_into_domain<M, D>(models: Vec<M>) -> anyhow::Result<Vec<D>>
where
    D: TryFrom<M, Error = anyhow::Error>,
{
    models.into_iter().map(D::try_from).collect()
}
