//! Ledger Events
//!
//! Structured facts emitted to the audit/event sink after the exclusive
//! scope has been released. Consumers decide persistence and alerting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{AccountId, Money, TransactionId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LedgerEvent {
    /// Both legs of a transfer committed
    TransferCompleted {
        transaction_id: TransactionId,
        from_account: AccountId,
        to_account: AccountId,
        amount: Money,
        fraud_score: u8,
        initiated_by: Option<Uuid>,
        completed_at: DateTime<Utc>,
    },

    /// Transfer rejected by the risk gate before any mutation
    TransferBlocked {
        from_account: AccountId,
        to_account: AccountId,
        amount: Money,
        score: u8,
        factors: Vec<String>,
        initiated_by: Option<Uuid>,
        client_ip: Option<String>,
        blocked_at: DateTime<Utc>,
    },

    /// A daily or monthly ceiling would have been breached
    LimitExceeded {
        account_id: AccountId,
        period: LimitPeriod,
        limit: Money,
        used: Money,
        requested: Money,
        occurred_at: DateTime<Utc>,
    },

    /// The mutating unit rolled back after the record was created
    TransferFailed {
        transaction_id: TransactionId,
        reason: String,
        failed_at: DateTime<Utc>,
    },

    TransactionCancelled {
        transaction_id: TransactionId,
        cancelled_by: Option<Uuid>,
        cancelled_at: DateTime<Utc>,
    },

    DepositCompleted {
        transaction_id: TransactionId,
        account_id: AccountId,
        amount: Money,
        completed_at: DateTime<Utc>,
    },

    WithdrawalCompleted {
        transaction_id: TransactionId,
        account_id: AccountId,
        amount: Money,
        completed_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitPeriod {
    Daily,
    Monthly,
}

impl LedgerEvent {
    /// Get the event type as a string
    pub fn event_type(&self) -> &'static str {
        match self {
            LedgerEvent::TransferCompleted { .. } => "TransferCompleted",
            LedgerEvent::TransferBlocked { .. } => "TransferBlocked",
            LedgerEvent::LimitExceeded { .. } => "LimitExceeded",
            LedgerEvent::TransferFailed { .. } => "TransferFailed",
            LedgerEvent::TransactionCancelled { .. } => "TransactionCancelled",
            LedgerEvent::DepositCompleted { .. } => "DepositCompleted",
            LedgerEvent::WithdrawalCompleted { .. } => "WithdrawalCompleted",
        }
    }

    /// Whether the event should be surfaced to security monitoring
    pub fn is_security_relevant(&self) -> bool {
        matches!(
            self,
            LedgerEvent::TransferBlocked { .. } | LedgerEvent::LimitExceeded { .. }
        )
    }

    /// Transaction this event refers to, if one was persisted
    pub fn transaction_id(&self) -> Option<&TransactionId> {
        match self {
            LedgerEvent::TransferCompleted { transaction_id, .. }
            | LedgerEvent::TransferFailed { transaction_id, .. }
            | LedgerEvent::TransactionCancelled { transaction_id, .. }
            | LedgerEvent::DepositCompleted { transaction_id, .. }
            | LedgerEvent::WithdrawalCompleted { transaction_id, .. } => Some(transaction_id),
            LedgerEvent::TransferBlocked { .. } | LedgerEvent::LimitExceeded { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocked_event_serialization() {
        let event = LedgerEvent::TransferBlocked {
            from_account: AccountId(1),
            to_account: AccountId(2),
            amount: Money::from_major(10_000),
            score: 70,
            factors: vec!["new beneficiary".to_string()],
            initiated_by: None,
            client_ip: Some("198.51.100.4".to_string()),
            blocked_at: Utc::now(),
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"TransferBlocked""#));
        assert!(json.contains(r#""amount":1000000"#));

        let back: LedgerEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
        assert!(back.is_security_relevant());
        assert!(back.transaction_id().is_none());
    }

    #[test]
    fn test_limit_period_serialization() {
        assert_eq!(
            serde_json::to_string(&LimitPeriod::Daily).unwrap(),
            r#""daily""#
        );
    }
}
