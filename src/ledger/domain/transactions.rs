use std::{fmt, str::FromStr};

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;
use validator::Validate;

mod transaction_changes;
mod transaction_data;

pub use transaction_changes::TransactionChanges;
pub use transaction_data::{validate_money, TransactionData};

/// The lifecycle state of a transaction. Only completed transactions affect a
/// cashbook's balance.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Cancelled,
}

/// What a transaction type means for the money in a cashbook.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Nature {
    Income,
    Expense,
    Transfer,
}

#[derive(Debug, Error, PartialEq)]
#[error("unrecognized {kind}: {value:?}")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl FromStr for TransactionStatus {
    type Err = ParseEnumError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(ParseEnumError {
                kind: "transaction status",
                value: other.to_owned(),
            }),
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Nature {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Income => "income",
            Self::Expense => "expense",
            Self::Transfer => "transfer",
        }
    }
}

impl FromStr for Nature {
    type Err = ParseEnumError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "income" => Ok(Self::Income),
            "expense" => Ok(Self::Expense),
            "transfer" => Ok(Self::Transfer),
            other => Err(ParseEnumError {
                kind: "transaction nature",
                value: other.to_owned(),
            }),
        }
    }
}

impl fmt::Display for Nature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A kind of transaction, eg "Sales" or "Rent". The nature of a type never
/// changes once it is created.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TransactionType {
    pub id: Uuid,
    pub name: String,
    pub nature: Nature,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Deserialize, Validate)]
pub struct NewTransactionType {
    #[validate(length(min = 1, max = 100))]
    pub name: String,
    pub nature: Nature,
}

impl TransactionType {
    pub fn create(new_type: NewTransactionType, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: new_type.name,
            nature: new_type.nature,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A transaction recorded in a cashbook.
///
/// The nature of the transaction's type is copied onto the transaction when it
/// is recorded, so the balance effect of historic transactions can never be
/// changed by editing a type.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Transaction {
    pub id: Uuid,
    pub cashbook_id: Uuid,
    pub amount: Decimal,
    pub type_id: Uuid,
    pub nature: Nature,
    pub category_id: Option<Uuid>,
    pub description: Option<String>,
    pub reference_number: Option<String>,
    pub transaction_date: NaiveDate,
    pub value_date: Option<NaiveDate>,
    pub status: TransactionStatus,
    pub is_recurring: bool,
    pub recurring_pattern: Option<String>,
    pub tags: Vec<String>,
    pub created_by: Uuid,
    pub updated_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    /// Build a new transaction from validated data.
    ///
    /// # Arguments
    /// * `data` - The validated transaction information.
    /// * `nature` - The nature of the transaction's type.
    /// * `created_by` - The user recording the transaction.
    /// * `now` - The creation timestamp.
    ///
    /// If no value date is provided, the transaction date is used.
    pub fn record(
        data: TransactionData,
        nature: Nature,
        created_by: Uuid,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            cashbook_id: data.cashbook_id,
            amount: data.amount,
            type_id: data.type_id,
            nature,
            category_id: data.category_id,
            description: data.description,
            reference_number: data.reference_number,
            transaction_date: data.transaction_date,
            value_date: data.value_date.or(Some(data.transaction_date)),
            status: data.status,
            is_recurring: data.is_recurring,
            recurring_pattern: data.recurring_pattern,
            tags: data.tags,
            created_by,
            updated_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Produce the revised version of this transaction. The identity and
    /// creation audit fields are preserved.
    pub fn revise(
        &self,
        data: TransactionData,
        nature: Nature,
        updated_by: Uuid,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: self.id,
            cashbook_id: data.cashbook_id,
            amount: data.amount,
            type_id: data.type_id,
            nature,
            category_id: data.category_id,
            description: data.description,
            reference_number: data.reference_number,
            transaction_date: data.transaction_date,
            value_date: data.value_date,
            status: data.status,
            is_recurring: data.is_recurring,
            recurring_pattern: data.recurring_pattern,
            tags: data.tags,
            created_by: self.created_by,
            updated_by: Some(updated_by),
            created_at: self.created_at,
            updated_at: now,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == TransactionStatus::Completed
    }
}

/// A position in the list of transactions, which is ordered by transaction
/// date and then creation time, newest first.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct TransactionCursor {
    pub after_date: NaiveDate,
    pub after_created_at: DateTime<Utc>,
}
