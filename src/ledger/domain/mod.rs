pub mod cashbooks;
pub mod precision;
pub mod reports;
pub mod transactions;
