//! Account model
//!
//! Accounts hold balances in minor units. Balance state is only ever changed
//! through [`Account::apply_delta`], which enforces the status and
//! non-negative balance rules shared by every store backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::{LedgerError, Money};

/// Ledger account identifier. Ordering of ids defines the global lock order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct AccountId(pub i64);

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for AccountId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(AccountId)
    }
}

/// Account status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    #[default]
    Active,
    Frozen,
    Closed,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::Frozen => "frozen",
            AccountStatus::Closed => "closed",
        }
    }
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccountStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(AccountStatus::Active),
            "frozen" => Ok(AccountStatus::Frozen),
            "closed" => Ok(AccountStatus::Closed),
            other => Err(format!("unknown account status: {}", other)),
        }
    }
}

/// A ledger account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub owner_id: Uuid,
    /// ISO 4217 code
    pub currency: String,
    pub balance: Money,
    /// Always `<= balance`
    pub available_balance: Money,
    pub status: AccountStatus,
    /// `None` falls back to the system default
    pub daily_transfer_limit: Option<Money>,
    pub monthly_transfer_limit: Option<Money>,
    pub last_transaction_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Account {
    pub fn is_active(&self) -> bool {
        self.status == AccountStatus::Active
    }

    /// Fail with `AccountNotActive` unless the account is in `required` status.
    pub fn ensure_status(&self, required: AccountStatus) -> Result<(), LedgerError> {
        if self.status != required {
            return Err(LedgerError::AccountNotActive {
                account_id: self.id,
                status: self.status,
            });
        }
        Ok(())
    }

    /// Apply a signed balance change and return the new balance.
    ///
    /// Debits are checked against the available balance so that
    /// `available_balance <= balance` and `balance >= 0` both hold afterwards.
    pub fn apply_delta(
        &mut self,
        delta: Money,
        required: AccountStatus,
        at: DateTime<Utc>,
    ) -> Result<Money, LedgerError> {
        self.ensure_status(required)?;

        let (Some(available), Some(balance)) = (
            self.available_balance.checked_add(delta),
            self.balance.checked_add(delta),
        ) else {
            return Err(LedgerError::AmountOutOfRange {
                amount: delta,
                max: Money::from_minor(i64::MAX),
            });
        };
        if available.is_negative() {
            return Err(LedgerError::InsufficientFunds {
                account_id: self.id,
                requested: -delta,
                available: self.available_balance,
            });
        }

        self.available_balance = available;
        self.balance = balance;

        self.last_transaction_at = Some(at);
        Ok(self.balance)
    }
}

/// Parameters for opening an account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAccount {
    pub owner_id: Uuid,
    pub currency: String,
    #[serde(default)]
    pub opening_balance: Money,
    #[serde(default)]
    pub daily_transfer_limit: Option<Money>,
    #[serde(default)]
    pub monthly_transfer_limit: Option<Money>,
}

impl NewAccount {
    pub fn new(owner_id: Uuid, currency: impl Into<String>) -> Self {
        Self {
            owner_id,
            currency: currency.into(),
            opening_balance: Money::ZERO,
            daily_transfer_limit: None,
            monthly_transfer_limit: None,
        }
    }

    pub fn with_balance(mut self, balance: Money) -> Self {
        self.opening_balance = balance;
        self
    }

    pub fn with_daily_limit(mut self, limit: Money) -> Self {
        self.daily_transfer_limit = Some(limit);
        self
    }

    pub fn with_monthly_limit(mut self, limit: Money) -> Self {
        self.monthly_transfer_limit = Some(limit);
        self
    }

    /// Materialise the account once the store has allocated an id.
    pub fn into_account(self, id: AccountId, created_at: DateTime<Utc>) -> Account {
        Account {
            id,
            owner_id: self.owner_id,
            currency: self.currency,
            balance: self.opening_balance,
            available_balance: self.opening_balance,
            status: AccountStatus::Active,
            daily_transfer_limit: self.daily_transfer_limit,
            monthly_transfer_limit: self.monthly_transfer_limit,
            last_transaction_at: None,
            created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(balance: i64) -> Account {
        NewAccount::new(Uuid::new_v4(), "USD")
            .with_balance(Money::from_minor(balance))
            .into_account(AccountId(1), Utc::now())
    }

    #[test]
    fn test_debit_and_credit() {
        let mut acct = account(50_000);
        let now = Utc::now();

        let after = acct
            .apply_delta(Money::from_minor(-10_000), AccountStatus::Active, now)
            .unwrap();
        assert_eq!(after, Money::from_minor(40_000));
        assert_eq!(acct.available_balance, Money::from_minor(40_000));

        acct.apply_delta(Money::from_minor(500), AccountStatus::Active, now)
            .unwrap();
        assert_eq!(acct.balance, Money::from_minor(40_500));
        assert_eq!(acct.last_transaction_at, Some(now));
    }

    #[test]
    fn test_overdraft_rejected_and_state_untouched() {
        let mut acct = account(100);
        let err = acct
            .apply_delta(Money::from_minor(-101), AccountStatus::Active, Utc::now())
            .unwrap_err();

        assert!(matches!(
            err,
            LedgerError::InsufficientFunds { requested, available, .. }
                if requested == Money::from_minor(101) && available == Money::from_minor(100)
        ));
        assert_eq!(acct.balance, Money::from_minor(100));
        assert!(acct.last_transaction_at.is_none());
    }

    #[test]
    fn test_exact_balance_debit() {
        let mut acct = account(100);
        let after = acct
            .apply_delta(Money::from_minor(-100), AccountStatus::Active, Utc::now())
            .unwrap();
        assert_eq!(after, Money::ZERO);
    }

    #[test]
    fn test_credit_overflow_is_out_of_range() {
        let mut acct = account(i64::MAX - 5);
        let err = acct
            .apply_delta(Money::from_minor(10), AccountStatus::Active, Utc::now())
            .unwrap_err();

        assert!(matches!(
            err,
            LedgerError::AmountOutOfRange { amount, .. } if amount == Money::from_minor(10)
        ));
        assert_eq!(acct.balance, Money::from_minor(i64::MAX - 5));
        assert_eq!(AccountStatus::default(), AccountStatus::Active);
    }

    #[test]
    fn test_status_required() {
        let mut acct = account(100);
        acct.status = AccountStatus::Frozen;

        let err = acct
            .apply_delta(Money::from_minor(10), AccountStatus::Active, Utc::now())
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::AccountNotActive { status: AccountStatus::Frozen, .. }
        ));
    }

    #[test]
    fn test_status_round_trip() {
        for status in [AccountStatus::Active, AccountStatus::Frozen, AccountStatus::Closed] {
            assert_eq!(status.as_str().parse::<AccountStatus>().unwrap(), status);
        }
        assert!("deleted".parse::<AccountStatus>().is_err());
    }
}
