//! Builders shared by the ledger tests.

use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use super::domain::transactions::{Nature, Transaction, TransactionStatus};

/// A transaction in a throwaway cashbook.
pub fn transaction(
    nature: Nature,
    amount: Decimal,
    status: TransactionStatus,
    transaction_date: NaiveDate,
) -> Transaction {
    let now = Utc::now();

    Transaction {
        id: Uuid::new_v4(),
        cashbook_id: Uuid::new_v4(),
        amount,
        type_id: Uuid::new_v4(),
        nature,
        category_id: None,
        description: None,
        reference_number: None,
        transaction_date,
        value_date: Some(transaction_date),
        status,
        is_recurring: false,
        recurring_pattern: None,
        tags: vec![],
        created_by: Uuid::new_v4(),
        updated_by: None,
        created_at: now,
        updated_at: now,
    }
}
