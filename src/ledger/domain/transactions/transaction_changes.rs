use chrono::NaiveDate;
use rust_decimal::Decimal;
use uuid::Uuid;

use super::{TransactionData, TransactionStatus};

/// A partial update to a transaction. Fields that are `None` are left as they
/// are. Optional fields of the transaction use a nested `Option` so they can be
/// cleared with `Some(None)`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TransactionChanges {
    pub cashbook_id: Option<Uuid>,
    pub amount: Option<Decimal>,
    pub type_id: Option<Uuid>,
    pub category_id: Option<Option<Uuid>>,
    pub description: Option<Option<String>>,
    pub reference_number: Option<Option<String>>,
    pub transaction_date: Option<NaiveDate>,
    pub value_date: Option<Option<NaiveDate>>,
    pub status: Option<TransactionStatus>,
    pub is_recurring: Option<bool>,
    pub recurring_pattern: Option<Option<String>>,
    pub tags: Option<Vec<String>>,
}

impl TransactionChanges {
    /// Only change the status of a transaction.
    pub fn status(status: TransactionStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// Merge the changes into the current state of a transaction.
    pub fn apply_to(&self, mut data: TransactionData) -> TransactionData {
        if let Some(cashbook_id) = self.cashbook_id {
            data.cashbook_id = cashbook_id;
        }
        if let Some(amount) = self.amount {
            data.amount = amount;
        }
        if let Some(type_id) = self.type_id {
            data.type_id = type_id;
        }
        if let Some(category_id) = self.category_id {
            data.category_id = category_id;
        }
        if let Some(description) = &self.description {
            data.description = description.clone();
        }
        if let Some(reference_number) = &self.reference_number {
            data.reference_number = reference_number.clone();
        }
        if let Some(transaction_date) = self.transaction_date {
            data.transaction_date = transaction_date;
        }
        if let Some(value_date) = self.value_date {
            data.value_date = value_date;
        }
        if let Some(status) = self.status {
            data.status = status;
        }
        if let Some(is_recurring) = self.is_recurring {
            data.is_recurring = is_recurring;
        }
        if let Some(recurring_pattern) = &self.recurring_pattern {
            data.recurring_pattern = recurring_pattern.clone();
        }
        if let Some(tags) = &self.tags {
            data.tags = tags.clone();
        }

        data
    }
}

#[cfg(test)]
mod test {
    use rust_decimal_macros::dec;

    use super::*;

    fn data() -> TransactionData {
        TransactionData {
            cashbook_id: Uuid::new_v4(),
            amount: dec!(150.00),
            type_id: Uuid::new_v4(),
            category_id: Some(Uuid::new_v4()),
            description: Some("Supplier invoice".to_owned()),
            reference_number: None,
            transaction_date: NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
            value_date: None,
            status: TransactionStatus::Completed,
            is_recurring: false,
            recurring_pattern: None,
            tags: vec![],
        }
    }

    #[test]
    fn apply_empty_changes() {
        let original = data();

        let merged = TransactionChanges::default().apply_to(original.clone());

        assert_eq!(original.amount, merged.amount);
        assert_eq!(original.category_id, merged.category_id);
        assert_eq!(original.description, merged.description);
    }

    #[test]
    fn apply_changes_and_clear_optional_field() {
        let changes = TransactionChanges {
            amount: Some(dec!(300.00)),
            category_id: Some(None),
            ..Default::default()
        };

        let merged = changes.apply_to(data());

        assert_eq!(dec!(300.00), merged.amount);
        assert_eq!(None, merged.category_id);
        assert_eq!(Some("Supplier invoice".to_owned()), merged.description);
    }

    #[test]
    fn status_only_changes_status() {
        let merged = TransactionChanges::status(TransactionStatus::Cancelled).apply_to(data());

        assert_eq!(TransactionStatus::Cancelled, merged.status);
        assert_eq!(dec!(150.00), merged.amount);
    }
}
