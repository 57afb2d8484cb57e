//! Transaction records
//!
//! A transaction is the persisted record of one money movement. Its status
//! only ever moves forward; [`Transaction::transition`] is the single place
//! the state machine is enforced.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::{AccountId, LedgerError, Money};

/// Globally unique opaque transaction identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(String);

impl TransactionId {
    pub fn generate() -> Self {
        Self(format!("txn_{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for TransactionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for TransactionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Transfer,
    Deposit,
    Withdrawal,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Transfer => "transfer",
            TransactionType::Deposit => "deposit",
            TransactionType::Withdrawal => "withdrawal",
        }
    }
}

impl FromStr for TransactionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transfer" => Ok(TransactionType::Transfer),
            "deposit" => Ok(TransactionType::Deposit),
            "withdrawal" => Ok(TransactionType::Withdrawal),
            other => Err(format!("unknown transaction type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
    Reversed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Processing => "processing",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Failed => "failed",
            TransactionStatus::Cancelled => "cancelled",
            TransactionStatus::Reversed => "reversed",
        }
    }

    /// Forward-only transition table.
    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        use TransactionStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Cancelled)
                | (Pending, Failed)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Completed, Reversed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Failed | TransactionStatus::Cancelled | TransactionStatus::Reversed
        )
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TransactionStatus::Pending),
            "processing" => Ok(TransactionStatus::Processing),
            "completed" => Ok(TransactionStatus::Completed),
            "failed" => Ok(TransactionStatus::Failed),
            "cancelled" => Ok(TransactionStatus::Cancelled),
            "reversed" => Ok(TransactionStatus::Reversed),
            other => Err(format!("unknown transaction status: {}", other)),
        }
    }
}

/// Balance snapshot for one leg of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegBalances {
    pub before: Money,
    pub after: Money,
}

/// Persisted transaction record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<Uuid>,
    pub transaction_type: TransactionType,
    pub from_account: Option<AccountId>,
    pub to_account: Option<AccountId>,
    pub amount: Money,
    pub currency: String,
    pub status: TransactionStatus,
    pub fraud_score: u8,
    pub from_balances: Option<LegBalances>,
    pub to_balances: Option<LegBalances>,
    pub description: Option<String>,
    pub initiated_by: Option<Uuid>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Transaction {
    /// A new `pending` record
    pub fn new(
        transaction_type: TransactionType,
        from_account: Option<AccountId>,
        to_account: Option<AccountId>,
        amount: Money,
        currency: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: TransactionId::generate(),
            idempotency_key: None,
            transaction_type,
            from_account,
            to_account,
            amount,
            currency: currency.into(),
            status: TransactionStatus::Pending,
            fraud_score: 0,
            from_balances: None,
            to_balances: None,
            description: None,
            initiated_by: None,
            failure_reason: None,
            created_at,
            processed_at: None,
            completed_at: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: Option<Uuid>) -> Self {
        self.idempotency_key = key;
        self
    }

    pub fn with_description(mut self, description: Option<String>) -> Self {
        self.description = description;
        self
    }

    pub fn with_initiator(mut self, user_id: Option<Uuid>) -> Self {
        self.initiated_by = user_id;
        self
    }

    pub fn with_fraud_score(mut self, score: u8) -> Self {
        self.fraud_score = score.min(100);
        self
    }

    /// Move to `next`, stamping the matching timestamp.
    pub fn transition(
        &mut self,
        next: TransactionStatus,
        at: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        if !self.status.can_transition_to(next) {
            return Err(LedgerError::StateConflict {
                transaction_id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }

        match next {
            TransactionStatus::Processing => self.processed_at = Some(at),
            TransactionStatus::Completed => self.completed_at = Some(at),
            _ => {}
        }
        self.status = next;
        Ok(())
    }

    /// Mark the record failed. Failed records give up their idempotency key
    /// so the caller may retry under the same key.
    pub fn fail(&mut self, reason: impl Into<String>, at: DateTime<Utc>) -> Result<(), LedgerError> {
        self.transition(TransactionStatus::Failed, at)?;
        self.failure_reason = Some(reason.into());
        self.idempotency_key = None;
        Ok(())
    }

    /// When the money moved: completion, else the start of processing, else
    /// creation. Usage windows are keyed on this, so a transfer submitted on
    /// one day and executed on the next counts against the next.
    pub fn effective_at(&self) -> DateTime<Utc> {
        self.completed_at
            .or(self.processed_at)
            .unwrap_or(self.created_at)
    }

    /// Whether a replayed request describes the same movement as this record.
    pub fn matches_request(
        &self,
        transaction_type: TransactionType,
        from_account: Option<AccountId>,
        to_account: Option<AccountId>,
        amount: Money,
    ) -> bool {
        self.transaction_type == transaction_type
            && self.from_account == from_account
            && self.to_account == to_account
            && self.amount == amount
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending() -> Transaction {
        Transaction::new(
            TransactionType::Transfer,
            Some(AccountId(1)),
            Some(AccountId(2)),
            Money::from_minor(100),
            "USD",
            Utc::now(),
        )
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let a = TransactionId::generate();
        let b = TransactionId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("txn_"));
        assert_eq!(a.as_str().len(), 36);
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut tx = pending();
        let now = Utc::now();
        tx.transition(TransactionStatus::Processing, now).unwrap();
        assert_eq!(tx.processed_at, Some(now));
        tx.transition(TransactionStatus::Completed, now).unwrap();
        assert_eq!(tx.completed_at, Some(now));
        assert_eq!(tx.status, TransactionStatus::Completed);
    }

    #[test]
    fn test_effective_at_follows_execution() {
        let mut tx = pending();
        assert_eq!(tx.effective_at(), tx.created_at);

        let executed = tx.created_at + chrono::Duration::hours(12);
        tx.transition(TransactionStatus::Processing, executed).unwrap();
        assert_eq!(tx.effective_at(), executed);
        tx.transition(TransactionStatus::Completed, executed).unwrap();
        assert_eq!(tx.effective_at(), executed);
    }

    #[test]
    fn test_completed_never_reverts() {
        let mut tx = pending();
        let now = Utc::now();
        tx.transition(TransactionStatus::Processing, now).unwrap();
        tx.transition(TransactionStatus::Completed, now).unwrap();

        for next in [
            TransactionStatus::Pending,
            TransactionStatus::Processing,
            TransactionStatus::Cancelled,
            TransactionStatus::Failed,
        ] {
            let err = tx.transition(next, now).unwrap_err();
            assert!(matches!(err, LedgerError::StateConflict { .. }));
        }
        assert_eq!(tx.status, TransactionStatus::Completed);
    }

    #[test]
    fn test_cancel_only_from_pending() {
        assert!(TransactionStatus::Pending.can_transition_to(TransactionStatus::Cancelled));
        assert!(!TransactionStatus::Processing.can_transition_to(TransactionStatus::Cancelled));
        assert!(!TransactionStatus::Completed.can_transition_to(TransactionStatus::Cancelled));
    }

    #[test]
    fn test_fail_releases_idempotency_key() {
        let mut tx = pending().with_idempotency_key(Some(Uuid::new_v4()));
        tx.fail("boom", Utc::now()).unwrap();
        assert_eq!(tx.status, TransactionStatus::Failed);
        assert!(tx.idempotency_key.is_none());
        assert_eq!(tx.failure_reason.as_deref(), Some("boom"));
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(TransactionStatus::Cancelled.to_string(), "cancelled");
        assert_eq!(
            "reversed".parse::<TransactionStatus>().unwrap(),
            TransactionStatus::Reversed
        );
        assert_eq!("deposit".parse::<TransactionType>().unwrap(), TransactionType::Deposit);
    }
}
