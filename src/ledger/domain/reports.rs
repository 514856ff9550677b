use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use super::transactions::{Nature, Transaction};
use crate::ledger::calculator::{ledger_order, BalanceCalculator, CalculationError};

/// The movement of a cashbook's balance over a single day.
///
/// Transfers count as expenses here, so that the opening balance plus income
/// minus expenses always equals the closing balance.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DailyBalance {
    pub cashbook_id: Uuid,
    pub date: NaiveDate,
    pub opening_balance: Decimal,
    pub closing_balance: Decimal,
    pub total_income: Decimal,
    pub total_expense: Decimal,
}

/// Compute the balance of a cashbook for every day in a date range.
///
/// # Arguments
/// * `calculator` - The calculator used to apply transactions.
/// * `cashbook_id` - The cashbook that the transactions belong to.
/// * `initial_balance` - The cashbook's balance before any transactions.
/// * `transactions` - All transactions of the cashbook. Only completed
///   transactions are counted.
/// * `from` - The first day of the report.
/// * `to` - The last day of the report, inclusive.
///
/// # Returns
///
/// One entry per day, oldest first. An empty range yields no entries.
pub fn daily_balances(
    calculator: &BalanceCalculator,
    cashbook_id: Uuid,
    initial_balance: Decimal,
    transactions: &[Transaction],
    from: NaiveDate,
    to: NaiveDate,
) -> Result<Vec<DailyBalance>, CalculationError> {
    let mut completed = transactions
        .iter()
        .filter(|transaction| transaction.is_completed() && transaction.transaction_date <= to)
        .collect::<Vec<_>>();
    completed.sort_by(|a, b| ledger_order(a, b));

    let mut completed = completed.into_iter().peekable();

    let mut balance = initial_balance;
    while let Some(transaction) = completed.next_if(|t| t.transaction_date < from) {
        balance = calculator.apply(balance, transaction)?;
    }

    let mut balances = vec![];
    let mut date = from;
    while date <= to {
        let mut day = DailyBalance {
            cashbook_id,
            date,
            opening_balance: balance,
            closing_balance: balance,
            total_income: Decimal::ZERO,
            total_expense: Decimal::ZERO,
        };

        while let Some(transaction) = completed.next_if(|t| t.transaction_date == date) {
            match transaction.nature {
                Nature::Income => day.total_income += transaction.amount,
                Nature::Expense | Nature::Transfer => day.total_expense += transaction.amount,
            }

            balance = calculator.apply(balance, transaction)?;
        }

        day.closing_balance = balance;
        balances.push(day);

        match date.succ_opt() {
            Some(next) => date = next,
            None => break,
        }
    }

    Ok(balances)
}
