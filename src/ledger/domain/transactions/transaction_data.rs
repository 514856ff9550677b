use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Deserialize;
use uuid::Uuid;
use validator::{Validate, ValidationError};

use super::{Transaction, TransactionStatus};
use crate::ledger::domain::precision::{fractional_digits, Precision};

/// The number of fractional digits allowed in amounts and balances.
const MONEY_DECIMAL_PLACES: u32 = 2;

/// The information describing a transaction, as provided by a user.
///
/// This is used both for new transactions and for the merged state of an
/// updated transaction, so the same rules apply to either.
#[derive(Clone, Debug, Deserialize, Validate)]
#[validate(schema(function = "validate_schedule"))]
pub struct TransactionData {
    /// The cashbook that the transaction belongs to.
    pub cashbook_id: Uuid,

    /// The amount of money moved. The direction is decided by the nature of
    /// the transaction type, so this is always positive.
    #[validate(custom = "validate_amount")]
    pub amount: Decimal,

    pub type_id: Uuid,

    pub category_id: Option<Uuid>,

    #[validate(length(max = 2000))]
    pub description: Option<String>,

    /// An external reference such as an invoice or receipt number.
    #[validate(length(max = 100))]
    pub reference_number: Option<String>,

    /// The date the transaction was made.
    pub transaction_date: NaiveDate,

    /// The date the money actually moved. This may not be earlier than the
    /// transaction date.
    pub value_date: Option<NaiveDate>,

    pub status: TransactionStatus,

    #[serde(default)]
    pub is_recurring: bool,

    /// How often a recurring transaction repeats, eg "monthly". Required if
    /// the transaction is recurring.
    #[validate(length(min = 1, max = 50))]
    pub recurring_pattern: Option<String>,

    #[serde(default)]
    #[validate(custom = "validate_tags")]
    pub tags: Vec<String>,
}

impl From<&Transaction> for TransactionData {
    fn from(transaction: &Transaction) -> Self {
        Self {
            cashbook_id: transaction.cashbook_id,
            amount: transaction.amount,
            type_id: transaction.type_id,
            category_id: transaction.category_id,
            description: transaction.description.clone(),
            reference_number: transaction.reference_number.clone(),
            transaction_date: transaction.transaction_date,
            value_date: transaction.value_date,
            status: transaction.status,
            is_recurring: transaction.is_recurring,
            recurring_pattern: transaction.recurring_pattern.clone(),
            tags: transaction.tags.clone(),
        }
    }
}

/// Validate that a monetary value fits the fixed-point scale used for
/// storage.
pub fn validate_money(value: &Decimal) -> Result<(), ValidationError> {
    if fractional_digits(*value) > MONEY_DECIMAL_PLACES {
        let mut error = ValidationError::new("too_many_decimals");
        error.add_param("max_decimal_places".into(), &MONEY_DECIMAL_PLACES);

        return Err(error);
    }

    if !Precision::default().fits(*value) {
        return Err(ValidationError::new("out_of_range"));
    }

    Ok(())
}

fn validate_amount(amount: &Decimal) -> Result<(), ValidationError> {
    if *amount <= Decimal::ZERO {
        return Err(ValidationError::new("not_positive"));
    }

    validate_money(amount)
}

fn validate_tags(tags: &Vec<String>) -> Result<(), ValidationError> {
    if tags.iter().any(|tag| tag.trim().is_empty()) {
        return Err(ValidationError::new("blank_tag"));
    }

    Ok(())
}

fn validate_schedule(data: &TransactionData) -> Result<(), ValidationError> {
    if let Some(value_date) = data.value_date {
        if value_date < data.transaction_date {
            return Err(ValidationError::new("value_date_before_transaction_date"));
        }
    }

    if data.is_recurring && data.recurring_pattern.is_none() {
        return Err(ValidationError::new("recurring_without_pattern"));
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use rust_decimal_macros::dec;

    use super::*;

    fn valid_data() -> TransactionData {
        TransactionData {
            cashbook_id: Uuid::new_v4(),
            amount: dec!(200.00),
            type_id: Uuid::new_v4(),
            category_id: None,
            description: Some("Weekly sales".to_owned()),
            reference_number: Some("INV-1001".to_owned()),
            transaction_date: NaiveDate::from_ymd_opt(2024, 4, 15).unwrap(),
            value_date: None,
            status: TransactionStatus::Completed,
            is_recurring: false,
            recurring_pattern: None,
            tags: vec!["sales".to_owned()],
        }
    }

    #[test]
    fn transaction_validate_valid_data() {
        valid_data().validate().expect("should be valid data");
    }

    #[test]
    fn transaction_validate_zero_amount() {
        let data = TransactionData {
            amount: Decimal::ZERO,
            ..valid_data()
        };

        let errors = data.validate().expect_err("zero amount should be invalid");
        let field_errors = errors.field_errors();

        assert_eq!(1, field_errors.len());
        assert_eq!("not_positive", field_errors["amount"][0].code);
    }

    #[test]
    fn transaction_validate_negative_amount() {
        let data = TransactionData {
            amount: dec!(-5.00),
            ..valid_data()
        };

        let errors = data.validate().expect_err("negative amount should be invalid");

        assert_eq!("not_positive", errors.field_errors()["amount"][0].code);
    }

    #[test]
    fn transaction_validate_too_many_decimals() {
        let data = TransactionData {
            amount: dec!(1.005),
            ..valid_data()
        };

        let errors = data.validate().expect_err("sub-cent amount should be invalid");

        assert_eq!("too_many_decimals", errors.field_errors()["amount"][0].code);
    }

    #[test]
    fn transaction_validate_amount_out_of_range() {
        let data = TransactionData {
            amount: dec!(10000000000.00),
            ..valid_data()
        };

        let errors = data.validate().expect_err("amount should not fit");

        assert_eq!("out_of_range", errors.field_errors()["amount"][0].code);
    }

    #[test]
    fn transaction_validate_trailing_zeroes_allowed() {
        let data = TransactionData {
            amount: dec!(1.5000),
            ..valid_data()
        };

        data.validate().expect("trailing zeroes are not extra precision");
    }

    #[test]
    fn transaction_validate_value_date_before_transaction_date() {
        let data = TransactionData {
            value_date: NaiveDate::from_ymd_opt(2024, 4, 14),
            ..valid_data()
        };

        let errors = data.validate().expect_err("value date should be rejected");

        assert_eq!(
            "value_date_before_transaction_date",
            errors.field_errors()["__all__"][0].code
        );
    }

    #[test]
    fn transaction_validate_recurring_without_pattern() {
        let data = TransactionData {
            is_recurring: true,
            ..valid_data()
        };

        let errors = data.validate().expect_err("recurring needs a pattern");

        assert_eq!(
            "recurring_without_pattern",
            errors.field_errors()["__all__"][0].code
        );
    }

    #[test]
    fn transaction_validate_recurring_with_pattern() {
        let data = TransactionData {
            is_recurring: true,
            recurring_pattern: Some("monthly".to_owned()),
            ..valid_data()
        };

        data.validate().expect("recurring with pattern is valid");
    }

    #[test]
    fn transaction_validate_blank_tag() {
        let data = TransactionData {
            tags: vec!["rent".to_owned(), "  ".to_owned()],
            ..valid_data()
        };

        let errors = data.validate().expect_err("blank tag should be invalid");

        assert_eq!("blank_tag", errors.field_errors()["tags"][0].code);
    }

    #[test]
    fn transaction_validate_long_reference_number() {
        let data = TransactionData {
            reference_number: Some("X".repeat(101)),
            ..valid_data()
        };

        let errors = data.validate().expect_err("reference number too long");

        assert_eq!("length", errors.field_errors()["reference_number"][0].code);
    }
}
