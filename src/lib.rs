pub mod cli;
pub mod config;
pub mod database;
pub mod ledger;
pub mod models;
pub mod repos;
