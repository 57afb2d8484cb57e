//! Ledger Store
//!
//! Sole owner of account balance state. Every balance mutation happens inside
//! a [`LedgerScope`]: an explicit guard that holds exclusive access to a fixed
//! set of accounts, acquired in ascending id order. Dropping a scope without
//! committing rolls back every staged change and releases the locks.

mod error;
pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::net::IpAddr;
use uuid::Uuid;

use crate::domain::{
    Account, AccountId, AccountStatus, LedgerError, Money, NewAccount, Transaction,
    TransactionId, TransactionStatus,
};
use crate::risk::{HistoryQuery, RiskHistory};

pub use error::StoreError;
pub use memory::MemoryLedgerStore;
pub use postgres::PgLedgerStore;

/// Sorted, de-duplicated set of accounts to lock.
///
/// Construction is the only way to obtain one, so every scope acquires its
/// locks lowest id first regardless of which side is "from" or "to".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockSet(Vec<AccountId>);

impl LockSet {
    pub fn single(id: AccountId) -> Self {
        Self(vec![id])
    }

    pub fn pair(a: AccountId, b: AccountId) -> Self {
        Self::from_ids([a, b])
    }

    pub fn from_ids(ids: impl IntoIterator<Item = AccountId>) -> Self {
        let mut ids: Vec<AccountId> = ids.into_iter().collect();
        ids.sort_unstable();
        ids.dedup();
        Self(ids)
    }

    /// Lock acquisition order
    pub fn ids(&self) -> &[AccountId] {
        &self.0
    }

    pub fn contains(&self, id: AccountId) -> bool {
        self.0.binary_search(&id).is_ok()
    }
}

/// Exclusive access over a [`LockSet`].
#[async_trait]
pub trait LedgerScope: Send {
    fn locks(&self) -> &LockSet;

    /// Current (staged) state of a locked account
    async fn account(&mut self, id: AccountId) -> Result<Account, LedgerError>;

    /// Apply a signed delta; fails with `AccountNotActive` or `InsufficientFunds`.
    async fn adjust_balance(
        &mut self,
        id: AccountId,
        delta: Money,
        required: AccountStatus,
        at: DateTime<Utc>,
    ) -> Result<Money, LedgerError>;

    async fn set_status(
        &mut self,
        id: AccountId,
        status: AccountStatus,
    ) -> Result<Account, LedgerError>;

    /// Sum of completed transactions with `id` as source that executed at or
    /// after `since` (see [`Transaction::effective_at`])
    async fn outgoing_total_since(
        &mut self,
        id: AccountId,
        since: DateTime<Utc>,
    ) -> Result<Money, LedgerError>;

    async fn find_by_idempotency_key(
        &mut self,
        key: Uuid,
    ) -> Result<Option<Transaction>, LedgerError>;

    /// Insert or update a transaction record as part of this unit
    async fn save_transaction(&mut self, transaction: &Transaction) -> Result<(), LedgerError>;

    /// Compare-and-set on status as part of this unit. The comparison holds
    /// until commit: a concurrent store-level transition of the same record
    /// either fails with `StateConflict` or makes this scope's commit fail
    /// with it.
    async fn transition_transaction(
        &mut self,
        id: &TransactionId,
        from: TransactionStatus,
        to: TransactionStatus,
        at: DateTime<Utc>,
    ) -> Result<Transaction, LedgerError>;

    /// Make every staged change visible atomically
    async fn commit(&mut self) -> Result<(), LedgerError>;
}

/// Handle to the authoritative ledger.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn open_account(&self, new_account: NewAccount) -> Result<Account, LedgerError>;

    async fn get_account(&self, id: AccountId) -> Result<Account, LedgerError>;

    /// Acquire exclusive access over `locks`; fails with `AccountNotFound` if
    /// any of them does not exist.
    async fn begin(&self, locks: LockSet) -> Result<Box<dyn LedgerScope>, LedgerError>;

    async fn get_transaction(&self, id: &TransactionId) -> Result<Transaction, LedgerError>;

    async fn find_by_idempotency_key(&self, key: Uuid) -> Result<Option<Transaction>, LedgerError>;

    /// Insert or update a record outside any account scope (pending and
    /// failed records).
    async fn save_transaction(&self, transaction: &Transaction) -> Result<(), LedgerError>;

    /// Compare-and-set on status. Fails with `StateConflict` if the record is
    /// not currently in `from`.
    async fn transition_transaction(
        &self,
        id: &TransactionId,
        from: TransactionStatus,
        to: TransactionStatus,
        at: DateTime<Utc>,
    ) -> Result<Transaction, LedgerError>;

    async fn load_risk_history(&self, query: &HistoryQuery) -> Result<RiskHistory, LedgerError>;

    /// Pending records created before `created_before`
    async fn list_stale_pending(
        &self,
        created_before: DateTime<Utc>,
    ) -> Result<Vec<TransactionId>, LedgerError>;

    /// Record the address a user's session was established from.
    async fn record_session(
        &self,
        user_id: Uuid,
        ip: IpAddr,
        at: DateTime<Utc>,
    ) -> Result<(), LedgerError>;

    /// Change account status under an exclusive scope. Closing requires a
    /// zero balance.
    async fn set_account_status(
        &self,
        id: AccountId,
        status: AccountStatus,
    ) -> Result<Account, LedgerError> {
        let mut scope = self.begin(LockSet::single(id)).await?;
        let account = scope.set_status(id, status).await?;
        scope.commit().await?;
        Ok(account)
    }
}

/// Shared by both backends: opening balances may be zero but never negative.
pub(crate) fn check_opening_balance(new_account: &NewAccount) -> Result<(), LedgerError> {
    if new_account.opening_balance.is_negative() {
        return Err(LedgerError::AmountOutOfRange {
            amount: new_account.opening_balance,
            max: Money::from_minor(i64::MAX),
        });
    }
    Ok(())
}

/// Shared by both backends: validate a status change on the locked copy.
pub(crate) fn apply_status(account: &mut Account, status: AccountStatus) -> Result<(), LedgerError> {
    if status == AccountStatus::Closed && account.balance != Money::ZERO {
        return Err(LedgerError::AccountNotEmpty {
            account_id: account.id,
            balance: account.balance,
        });
    }
    account.status = status;
    Ok(())
}

/// Shared by both backends: reject a compare-and-set that the state machine
/// would never allow, before touching storage.
pub(crate) fn check_transition(
    id: &TransactionId,
    from: TransactionStatus,
    to: TransactionStatus,
) -> Result<(), LedgerError> {
    if !from.can_transition_to(to) {
        return Err(LedgerError::StateConflict {
            transaction_id: id.clone(),
            from,
            to,
        });
    }
    Ok(())
}
