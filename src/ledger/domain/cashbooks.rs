use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use super::transactions::validate_money;

/// A cashbook tracks the money held in one till, account or wallet of a store.
///
/// `current_balance` is a cache of `initial_balance` plus the effect of every
/// completed transaction in the cashbook. It is only written while the
/// cashbook is locked, either by a transaction mutation or by reconciliation.
#[derive(Clone, Debug, PartialEq, Serialize)]
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

/// Information required to open a new cashbook.
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct NewCashbook {
    /// The store that owns the cashbook.
    pub store_id: Uuid,

    /// The cashbook's name. This must be unique within the store.
    #[validate(length(min = 1, max = 255))]
    pub name: String,

    pub description: Option<String>,

    /// The balance the cashbook started with before any transactions were
    /// recorded.
    #[serde(default)]
    #[validate(custom = "validate_money")]
    pub initial_balance: Decimal,
}

impl Cashbook {
    /// Open a new cashbook. The cached balance starts out equal to the initial
    /// balance since there are no transactions yet.
    pub fn open(new_cashbook: NewCashbook, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            store_id: new_cashbook.store_id,
            name: new_cashbook.name,
            description: new_cashbook.description,
            initial_balance: new_cashbook.initial_balance,
            current_balance: new_cashbook.initial_balance,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod test {
    use rust_decimal_macros::dec;

    use super::*;

    #[test]
    fn open_starts_at_initial_balance() {
        let cashbook = Cashbook::open(
            NewCashbook {
                store_id: Uuid::new_v4(),
                name: "Front Till".to_owned(),
                description: None,
                initial_balance: dec!(1000.00),
            },
            Utc::now(),
        );

        assert_eq!(dec!(1000.00), cashbook.current_balance);
        assert!(cashbook.is_active);
    }

    #[test]
    fn validate_empty_name() {
        let data = NewCashbook {
            store_id: Uuid::new_v4(),
            name: "".to_owned(),
            description: None,
            initial_balance: Decimal::ZERO,
        };

        let errors = data.validate().expect_err("empty name should be invalid");
        let field_errors = errors.field_errors();

        assert_eq!(1, field_errors.len());
        assert_eq!("length", field_errors["name"][0].code);
    }

    #[test]
    fn validate_sub_cent_initial_balance() {
        let data = NewCashbook {
            store_id: Uuid::new_v4(),
            name: "Safe".to_owned(),
            description: None,
            initial_balance: dec!(10.001),
        };

        let errors = data.validate().expect_err("sub-cent balance should be invalid");

        assert_eq!(
            "too_many_decimals",
            errors.field_errors()["initial_balance"][0].code
        );
    }
}
