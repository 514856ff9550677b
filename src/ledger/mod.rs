pub mod access;
pub mod auditor;
pub mod calculator;
pub mod coordinator;
pub mod domain;
pub mod services;

#[cfg(test)]
pub(crate) mod test_support;
