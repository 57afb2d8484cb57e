//! Ledger Store Errors
//!
//! Infrastructure failures raised by store backends. Domain rule violations
//! are reported as `LedgerError` variants instead.

use crate::domain::{AccountId, TransactionId};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An account was touched inside a scope that does not hold its lock
    #[error("Account {0} is not locked by this scope")]
    NotLocked(AccountId),

    /// A unique transaction id or idempotency key was written twice
    #[error("Duplicate transaction: {0}")]
    DuplicateTransaction(TransactionId),

    /// The scope was already committed
    #[error("Scope already committed")]
    ScopeClosed,

    /// Row data that does not map onto the domain model
    #[error("Invalid stored data: {0}")]
    InvalidData(String),
}

impl StoreError {
    /// Check if this error came from the database driver
    pub fn is_database(&self) -> bool {
        matches!(self, StoreError::Database(_))
    }
}
