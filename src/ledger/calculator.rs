//! Balance calculation.
//!
//! This is the only place that decides how the nature of a transaction maps to
//! the sign of its effect on a cashbook. Everything else asks the calculator.

use std::cmp::Ordering;

use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;

use super::domain::{
    precision::Precision,
    transactions::{Nature, Transaction, TransactionStatus},
};

/// Two balances closer together than one cent are considered equal.
pub const BALANCE_TOLERANCE: Decimal = Decimal::from_parts(1, 0, 0, false, 2);

/// Determine if two balances are equal within [`BALANCE_TOLERANCE`].
pub fn balances_match(left: Decimal, right: Decimal) -> bool {
    (left - right).abs() < BALANCE_TOLERANCE
}

/// The order transactions are applied to a balance: oldest transaction date
/// first, then creation time. The ID breaks any remaining ties so the order is
/// stable.
pub fn ledger_order(a: &Transaction, b: &Transaction) -> Ordering {
    a.transaction_date
        .cmp(&b.transaction_date)
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

#[derive(Debug, Error, PartialEq)]
pub enum CalculationError {
    /// The result cannot be stored with the configured precision.
    #[error("balance exceeds {max_digits} digits with {decimal_places} decimal places")]
    Overflow { max_digits: u32, decimal_places: u32 },
}

/// An itemized breakdown of a cashbook's balance.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BalanceSummary {
    pub initial_balance: Decimal,
    pub total_income: Decimal,
    pub total_expense: Decimal,
    pub total_transfer: Decimal,
    /// Income minus expenses and transfers.
    pub net_change: Decimal,
    pub calculated_balance: Decimal,
    pub completed_count: usize,
    pub pending_count: usize,
    pub cancelled_count: usize,
}

/// Computes balances from an initial balance and a set of transactions.
#[derive(Clone, Copy, Debug, Default)]
pub struct BalanceCalculator {
    precision: Precision,
}

impl BalanceCalculator {
    pub fn new(precision: Precision) -> Self {
        Self { precision }
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    /// The signed effect of an amount on a cashbook's balance.
    pub fn effect(nature: Nature, amount: Decimal) -> Decimal {
        match nature {
            Nature::Income => amount,
            Nature::Expense => -amount,
            // Known limitation: a transfer only debits the cashbook it is
            // recorded in. Nothing credits a destination cashbook, so
            // transfers do not net to zero across cashbooks.
            Nature::Transfer => -amount,
        }
    }

    /// Apply a single transaction to a balance, regardless of its status.
    pub fn apply(
        &self,
        balance: Decimal,
        transaction: &Transaction,
    ) -> Result<Decimal, CalculationError> {
        let effect = Self::effect(transaction.nature, transaction.amount);

        self.checked(balance.checked_add(effect))
    }

    /// Calculate a balance from scratch.
    ///
    /// # Arguments
    /// * `initial_balance` - The balance before any transactions.
    /// * `transactions` - The transactions of the cashbook. Only completed
    ///   transactions are applied, in ledger order.
    pub fn calculate<'a, I>(
        &self,
        initial_balance: Decimal,
        transactions: I,
    ) -> Result<Decimal, CalculationError>
    where
        I: IntoIterator<Item = &'a Transaction>,
    {
        let mut completed = transactions
            .into_iter()
            .filter(|transaction| transaction.is_completed())
            .collect::<Vec<_>>();
        completed.sort_by(|a, b| ledger_order(a, b));

        let mut balance = self.checked(Some(initial_balance))?;
        for transaction in completed {
            balance = self.apply(balance, transaction)?;
        }

        Ok(balance)
    }

    /// Calculate the balance along with its breakdown by nature and status.
    pub fn summarize(
        &self,
        initial_balance: Decimal,
        transactions: &[Transaction],
    ) -> Result<BalanceSummary, CalculationError> {
        let mut summary = BalanceSummary {
            initial_balance,
            total_income: Decimal::ZERO,
            total_expense: Decimal::ZERO,
            total_transfer: Decimal::ZERO,
            net_change: Decimal::ZERO,
            calculated_balance: self.calculate(initial_balance, transactions)?,
            completed_count: 0,
            pending_count: 0,
            cancelled_count: 0,
        };

        for transaction in transactions {
            match transaction.status {
                TransactionStatus::Pending => summary.pending_count += 1,
                TransactionStatus::Cancelled => summary.cancelled_count += 1,
                TransactionStatus::Completed => {
                    summary.completed_count += 1;

                    let total = match transaction.nature {
                        Nature::Income => &mut summary.total_income,
                        Nature::Expense => &mut summary.total_expense,
                        Nature::Transfer => &mut summary.total_transfer,
                    };
                    *total = self.checked(total.checked_add(transaction.amount))?;
                }
            }
        }

        summary.net_change = summary.calculated_balance - initial_balance;

        Ok(summary)
    }

    fn checked(&self, value: Option<Decimal>) -> Result<Decimal, CalculationError> {
        match value {
            Some(value) if value.abs() <= self.precision.max_magnitude() => Ok(value),
            _ => Err(CalculationError::Overflow {
                max_digits: self.precision.max_digits(),
                decimal_places: self.precision.decimal_places(),
            }),
        }
    }
}

#[cfg(test)]
mod test {
    use chrono::{Duration, NaiveDate};
    use rand::seq::SliceRandom;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::ledger::test_support::transaction;

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
    }

    #[test]
    fn effect_by_nature() {
        assert_eq!(dec!(10.00), BalanceCalculator::effect(Nature::Income, dec!(10.00)));
        assert_eq!(dec!(-10.00), BalanceCalculator::effect(Nature::Expense, dec!(10.00)));
        assert_eq!(dec!(-10.00), BalanceCalculator::effect(Nature::Transfer, dec!(10.00)));
    }

    #[test]
    fn calculate_without_transactions() {
        let calculator = BalanceCalculator::default();

        let balance = calculator
            .calculate(dec!(1000.00), &Vec::<Transaction>::new())
            .expect("calculation failed");

        assert_eq!(dec!(1000.00), balance);
    }

    #[test]
    fn calculate_only_applies_completed() {
        let calculator = BalanceCalculator::default();
        let transactions = vec![
            transaction(Nature::Income, dec!(200.00), TransactionStatus::Completed, date(1)),
            transaction(Nature::Expense, dec!(150.00), TransactionStatus::Completed, date(2)),
            transaction(Nature::Income, dec!(999.00), TransactionStatus::Pending, date(3)),
            transaction(Nature::Expense, dec!(999.00), TransactionStatus::Cancelled, date(4)),
        ];

        let balance = calculator
            .calculate(dec!(1000.00), &transactions)
            .expect("calculation failed");

        assert_eq!(dec!(1050.00), balance);
    }

    #[test]
    fn calculate_transfer_debits_cashbook() {
        let calculator = BalanceCalculator::default();
        let transactions = vec![transaction(
            Nature::Transfer,
            dec!(75.50),
            TransactionStatus::Completed,
            date(1),
        )];

        let balance = calculator
            .calculate(dec!(100.00), &transactions)
            .expect("calculation failed");

        assert_eq!(dec!(24.50), balance);
    }

    #[test]
    fn calculate_is_permutation_invariant() {
        let calculator = BalanceCalculator::default();
        let natures = [Nature::Income, Nature::Expense, Nature::Transfer];
        let mut transactions = (0..60u32)
            .map(|i| {
                transaction(
                    natures[(i % 3) as usize],
                    Decimal::new(i64::from(i) * 137 + 1, 2),
                    TransactionStatus::Completed,
                    date(1) + Duration::days(i64::from(i % 28)),
                )
            })
            .collect::<Vec<_>>();

        let want_balance = calculator
            .calculate(dec!(500.00), &transactions)
            .expect("calculation failed");

        let mut rng = rand::thread_rng();
        for _ in 0..20 {
            transactions.shuffle(&mut rng);

            let balance = calculator
                .calculate(dec!(500.00), &transactions)
                .expect("calculation failed");

            assert_eq!(want_balance, balance);
        }
    }

    #[test]
    fn calculate_overflow() {
        let calculator = BalanceCalculator::new(Precision::new(12, 2));
        let transactions = vec![transaction(
            Nature::Income,
            dec!(0.01),
            TransactionStatus::Completed,
            date(1),
        )];

        let error = calculator
            .calculate(dec!(9999999999.99), &transactions)
            .expect_err("balance should overflow");

        assert_eq!(
            CalculationError::Overflow {
                max_digits: 12,
                decimal_places: 2
            },
            error
        );
    }

    #[test]
    fn calculate_negative_balance_within_precision() {
        let calculator = BalanceCalculator::default();
        let transactions = vec![transaction(
            Nature::Expense,
            dec!(250.00),
            TransactionStatus::Completed,
            date(1),
        )];

        let balance = calculator
            .calculate(dec!(100.00), &transactions)
            .expect("negative balances are allowed");

        assert_eq!(dec!(-150.00), balance);
    }

    #[test]
    fn summarize_breakdown() {
        let calculator = BalanceCalculator::default();
        let transactions = vec![
            transaction(Nature::Income, dec!(200.00), TransactionStatus::Completed, date(1)),
            transaction(Nature::Income, dec!(50.00), TransactionStatus::Completed, date(2)),
            transaction(Nature::Expense, dec!(120.00), TransactionStatus::Completed, date(3)),
            transaction(Nature::Transfer, dec!(30.00), TransactionStatus::Completed, date(4)),
            transaction(Nature::Income, dec!(10.00), TransactionStatus::Pending, date(5)),
            transaction(Nature::Expense, dec!(10.00), TransactionStatus::Cancelled, date(6)),
        ];

        let summary = calculator
            .summarize(dec!(1000.00), &transactions)
            .expect("summary failed");

        assert_eq!(
            BalanceSummary {
                initial_balance: dec!(1000.00),
                total_income: dec!(250.00),
                total_expense: dec!(120.00),
                total_transfer: dec!(30.00),
                net_change: dec!(100.00),
                calculated_balance: dec!(1100.00),
                completed_count: 4,
                pending_count: 1,
                cancelled_count: 1,
            },
            summary
        );
    }

    #[test]
    fn balances_match_within_tolerance() {
        assert!(balances_match(dec!(700.00), dec!(700.00)));
        assert!(balances_match(dec!(700.00), dec!(700.009)));
        assert!(!balances_match(dec!(700.00), dec!(700.01)));
        assert!(!balances_match(dec!(650.00), dec!(700.00)));
    }

    #[test]
    fn ledger_order_by_date_then_creation() {
        let status = TransactionStatus::Completed;
        let mut later = transaction(Nature::Income, dec!(1.00), status, date(2));
        let earlier = transaction(Nature::Income, dec!(1.00), status, date(1));
        later.created_at = earlier.created_at - Duration::hours(1);

        assert_eq!(Ordering::Less, ledger_order(&earlier, &later));
    }
}
