use std::time::Duration;

use crate::ledger::domain::precision::Precision;

/// Settings shared by every operation that changes a cashbook's balance.
#[derive(Clone, Copy, Debug)]
pub struct EngineConfig {
    /// The longest a unit of work waits for a cashbook lock before giving up.
    pub lock_timeout: Duration,
    /// The precision balances are persisted with.
    pub precision: Precision,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(5),
            precision: Precision::default(),
        }
    }
}

pub struct DatabaseOptions {
    pub pool_size: u32,
    pub timeout_seconds: u8,
    pub url: String,
}
