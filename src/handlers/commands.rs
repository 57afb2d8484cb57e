//! Command definitions
//!
//! Commands represent intentions to move money. Amounts are already parsed
//! into [`Money`]; range checks happen in the handlers.

use serde::{Deserialize, Serialize};

use crate::domain::{AccountId, Money, Transaction, TransactionId, TransactionStatus};
use crate::risk::RiskLevel;

/// Command to move funds between two accounts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferCommand {
    pub from_account: AccountId,
    pub to_account: AccountId,
    pub amount: Money,
    pub description: Option<String>,
}

impl TransferCommand {
    pub fn new(from_account: AccountId, to_account: AccountId, amount: Money) -> Self {
        Self {
            from_account,
            to_account,
            amount,
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Command to credit or debit a single account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementCommand {
    pub account_id: AccountId,
    pub amount: Money,
    pub description: Option<String>,
}

impl MovementCommand {
    pub fn new(account_id: AccountId, amount: Money) -> Self {
        Self {
            account_id,
            amount,
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Result of a transfer request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferResult {
    pub transaction_id: TransactionId,
    pub status: TransactionStatus,
    pub from_account: AccountId,
    pub to_account: AccountId,
    pub amount: Money,
    pub fraud_score: u8,
    pub risk_level: RiskLevel,
    /// `true` when an earlier result was returned for a repeated idempotency key
    pub replayed: bool,
}

impl TransferResult {
    pub(crate) fn from_record(
        record: &Transaction,
        from_account: AccountId,
        to_account: AccountId,
        replayed: bool,
    ) -> Self {
        Self {
            transaction_id: record.id.clone(),
            status: record.status,
            from_account,
            to_account,
            amount: record.amount,
            fraud_score: record.fraud_score,
            risk_level: RiskLevel::from_score(record.fraud_score),
            replayed,
        }
    }
}

/// Result of a deposit or withdrawal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementResult {
    pub transaction_id: TransactionId,
    pub status: TransactionStatus,
    pub account_id: AccountId,
    pub amount: Money,
    /// Balance of the account once the movement committed
    pub balance_after: Option<Money>,
    pub replayed: bool,
}

impl MovementResult {
    pub(crate) fn from_record(record: &Transaction, account_id: AccountId, replayed: bool) -> Self {
        let leg = if record.from_account == Some(account_id) {
            record.from_balances
        } else {
            record.to_balances
        };
        Self {
            transaction_id: record.id.clone(),
            status: record.status,
            account_id,
            amount: record.amount,
            balance_after: leg.map(|b| b.after),
            replayed,
        }
    }
}
