//! Ledger Error Types
//!
//! The closed set of outcomes the ledger core can return besides success.
//! Each variant carries only the data a caller needs to act on it.

use thiserror::Error;
use uuid::Uuid;

use super::{AccountId, AccountStatus, Money, TransactionId, TransactionStatus};
use crate::ledger::StoreError;

/// How a caller should treat an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Malformed or out-of-range input; never retried
    Validation,
    /// Referenced account or transaction does not exist
    Resource,
    /// Illegal state or transition
    StateConflict,
    /// Policy said no; not a system failure
    BusinessRejection,
    /// Storage unavailable or a check could not complete; mutation rolled back
    Infrastructure,
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    #[error("Account {account_id} is not active (status: {status})")]
    AccountNotActive {
        account_id: AccountId,
        status: AccountStatus,
    },

    #[error("Insufficient funds in account {account_id}: requested {requested}, available {available}")]
    InsufficientFunds {
        account_id: AccountId,
        requested: Money,
        available: Money,
    },

    #[error("Daily transfer limit exceeded for account {account_id}: limit {limit}, used {used}, requested {requested}")]
    DailyLimitExceeded {
        account_id: AccountId,
        limit: Money,
        used: Money,
        requested: Money,
    },

    #[error("Monthly transfer limit exceeded for account {account_id}: limit {limit}, used {used}, requested {requested}")]
    MonthlyLimitExceeded {
        account_id: AccountId,
        limit: Money,
        used: Money,
        requested: Money,
    },

    #[error("Transaction blocked for review (risk score {score})")]
    TransactionBlocked { score: u8, factors: Vec<String> },

    #[error("Cannot transfer to the same account")]
    SameAccountTransfer,

    #[error("Amount {amount} is out of range (must be > 0 and <= {max})")]
    AmountOutOfRange { amount: Money, max: Money },

    #[error("Currency mismatch: expected {expected}, found {found}")]
    CurrencyMismatch { expected: String, found: String },

    #[error("Account {account_id} still holds {balance} and cannot be closed")]
    AccountNotEmpty { account_id: AccountId, balance: Money },

    #[error("Transaction not found: {0}")]
    TransactionNotFound(TransactionId),

    #[error("Transaction {transaction_id} cannot move from {from} to {to}")]
    StateConflict {
        transaction_id: TransactionId,
        from: TransactionStatus,
        to: TransactionStatus,
    },

    #[error("Idempotency key {0} was already used for a different request")]
    IdempotencyConflict(Uuid),

    #[error("{0} check did not complete in time")]
    CheckTimedOut(&'static str),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LedgerError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::SameAccountTransfer
            | Self::AmountOutOfRange { .. }
            | Self::CurrencyMismatch { .. } => ErrorCategory::Validation,
            Self::AccountNotFound(_) | Self::TransactionNotFound(_) => ErrorCategory::Resource,
            Self::AccountNotActive { .. }
            | Self::AccountNotEmpty { .. }
            | Self::StateConflict { .. }
            | Self::IdempotencyConflict(_) => ErrorCategory::StateConflict,
            Self::InsufficientFunds { .. }
            | Self::DailyLimitExceeded { .. }
            | Self::MonthlyLimitExceeded { .. }
            | Self::TransactionBlocked { .. } => ErrorCategory::BusinessRejection,
            Self::CheckTimedOut(_) | Self::Store(_) => ErrorCategory::Infrastructure,
        }
    }

    /// Errors raised by a limit ceiling
    pub fn is_limit_violation(&self) -> bool {
        matches!(
            self,
            Self::DailyLimitExceeded { .. } | Self::MonthlyLimitExceeded { .. }
        )
    }

    /// Short machine-readable code, shared by API responses and failure reasons
    pub fn code(&self) -> &'static str {
        match self {
            Self::AccountNotFound(_) => "account_not_found",
            Self::AccountNotActive { .. } => "account_not_active",
            Self::InsufficientFunds { .. } => "insufficient_funds",
            Self::DailyLimitExceeded { .. } => "daily_limit_exceeded",
            Self::MonthlyLimitExceeded { .. } => "monthly_limit_exceeded",
            Self::TransactionBlocked { .. } => "transaction_blocked",
            Self::SameAccountTransfer => "same_account_transfer",
            Self::AmountOutOfRange { .. } => "amount_out_of_range",
            Self::CurrencyMismatch { .. } => "currency_mismatch",
            Self::AccountNotEmpty { .. } => "account_not_empty",
            Self::TransactionNotFound(_) => "transaction_not_found",
            Self::StateConflict { .. } => "state_conflict",
            Self::IdempotencyConflict(_) => "idempotency_conflict",
            Self::CheckTimedOut(_) => "check_timed_out",
            Self::Store(_) => "store_error",
        }
    }
}
