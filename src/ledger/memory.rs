//! In-process Ledger Store
//!
//! Each account lives behind its own `tokio::sync::Mutex`. A scope takes the
//! owned guards in [`LockSet`] order and works on staged copies; `commit`
//! writes the copies back and publishes staged transaction records in one
//! step. Dropping the scope discards the copies and releases the guards.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use uuid::Uuid;

use crate::domain::{
    Account, AccountId, AccountStatus, Clock, LedgerError, Money, NewAccount, SystemClock,
    Transaction, TransactionId, TransactionStatus,
};
use crate::risk::{HistoryQuery, RiskHistory};

use super::{
    apply_status, check_opening_balance, check_transition, LedgerScope, LedgerStore, LockSet,
    StoreError,
};

/// Transaction records plus the idempotency-key index
#[derive(Debug, Default)]
struct TransactionTable {
    records: HashMap<TransactionId, Transaction>,
    by_key: HashMap<Uuid, TransactionId>,
}

impl TransactionTable {
    /// Fails if `tx` carries a key already owned by another record.
    fn check_key(&self, tx: &Transaction) -> Result<(), LedgerError> {
        if let Some(key) = tx.idempotency_key {
            if let Some(owner) = self.by_key.get(&key) {
                if owner != &tx.id {
                    return Err(LedgerError::IdempotencyConflict(key));
                }
            }
        }
        Ok(())
    }

    fn upsert(&mut self, tx: Transaction) {
        if let Some(previous) = self.records.get(&tx.id) {
            if let Some(old_key) = previous.idempotency_key {
                if tx.idempotency_key != Some(old_key) {
                    self.by_key.remove(&old_key);
                }
            }
        }
        if let Some(key) = tx.idempotency_key {
            self.by_key.insert(key, tx.id.clone());
        }
        self.records.insert(tx.id.clone(), tx);
    }

    fn by_idempotency_key(&self, key: Uuid) -> Option<&Transaction> {
        self.by_key.get(&key).and_then(|id| self.records.get(id))
    }
}

type AccountCell = Arc<Mutex<Account>>;

pub struct MemoryLedgerStore {
    clock: Arc<dyn Clock>,
    next_account_id: AtomicI64,
    accounts: RwLock<HashMap<AccountId, AccountCell>>,
    transactions: Arc<RwLock<TransactionTable>>,
    sessions: RwLock<HashMap<Uuid, (IpAddr, DateTime<Utc>)>>,
}

impl Default for MemoryLedgerStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Use `clock` for account creation timestamps
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            next_account_id: AtomicI64::new(1),
            accounts: RwLock::new(HashMap::new()),
            transactions: Arc::new(RwLock::new(TransactionTable::default())),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Sum of every account balance. Takes each account lock in id order.
    pub async fn total_balance(&self) -> Money {
        let cells: Vec<(AccountId, AccountCell)> = {
            let accounts = self.accounts.read().await;
            let mut cells: Vec<_> = accounts
                .iter()
                .map(|(id, cell)| (*id, Arc::clone(cell)))
                .collect();
            cells.sort_unstable_by_key(|(id, _)| *id);
            cells
        };

        let mut total = Money::ZERO;
        for (_, cell) in cells {
            total = total.saturating_add(cell.lock().await.balance);
        }
        total
    }

    /// Every stored transaction, oldest first
    pub async fn transactions(&self) -> Vec<Transaction> {
        let table = self.transactions.read().await;
        let mut records: Vec<Transaction> = table.records.values().cloned().collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        records
    }

    async fn cell(&self, id: AccountId) -> Result<AccountCell, LedgerError> {
        self.accounts
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(LedgerError::AccountNotFound(id))
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn open_account(&self, new_account: NewAccount) -> Result<Account, LedgerError> {
        check_opening_balance(&new_account)?;

        let id = AccountId(self.next_account_id.fetch_add(1, Ordering::SeqCst));
        let account = new_account.into_account(id, self.clock.now());

        self.accounts
            .write()
            .await
            .insert(id, Arc::new(Mutex::new(account.clone())));

        tracing::debug!(account_id = %id, owner_id = %account.owner_id, "Account opened");
        Ok(account)
    }

    async fn get_account(&self, id: AccountId) -> Result<Account, LedgerError> {
        let cell = self.cell(id).await?;
        let account = cell.lock().await.clone();
        Ok(account)
    }

    async fn begin(&self, locks: LockSet) -> Result<Box<dyn LedgerScope>, LedgerError> {
        let mut cells = Vec::with_capacity(locks.ids().len());
        for id in locks.ids() {
            cells.push(self.cell(*id).await?);
        }

        let mut guards = Vec::with_capacity(cells.len());
        for cell in cells {
            guards.push(cell.lock_owned().await);
        }

        Ok(Box::new(MemoryScope {
            locks,
            guards,
            staged_accounts: HashMap::new(),
            staged_transactions: Vec::new(),
            claims: Vec::new(),
            transactions: Arc::clone(&self.transactions),
            closed: false,
        }))
    }

    async fn get_transaction(&self, id: &TransactionId) -> Result<Transaction, LedgerError> {
        self.transactions
            .read()
            .await
            .records
            .get(id)
            .cloned()
            .ok_or_else(|| LedgerError::TransactionNotFound(id.clone()))
    }

    async fn find_by_idempotency_key(&self, key: Uuid) -> Result<Option<Transaction>, LedgerError> {
        Ok(self
            .transactions
            .read()
            .await
            .by_idempotency_key(key)
            .cloned())
    }

    async fn save_transaction(&self, transaction: &Transaction) -> Result<(), LedgerError> {
        let mut table = self.transactions.write().await;
        table.check_key(transaction)?;
        table.upsert(transaction.clone());
        Ok(())
    }

    async fn transition_transaction(
        &self,
        id: &TransactionId,
        from: TransactionStatus,
        to: TransactionStatus,
        at: DateTime<Utc>,
    ) -> Result<Transaction, LedgerError> {
        check_transition(id, from, to)?;

        let mut table = self.transactions.write().await;
        let record = table
            .records
            .get_mut(id)
            .ok_or_else(|| LedgerError::TransactionNotFound(id.clone()))?;

        if record.status != from {
            return Err(LedgerError::StateConflict {
                transaction_id: id.clone(),
                from: record.status,
                to,
            });
        }
        record.transition(to, at)?;
        Ok(record.clone())
    }

    async fn load_risk_history(&self, query: &HistoryQuery) -> Result<RiskHistory, LedgerError> {
        let last_session_ip = match query.owner_id {
            Some(owner) => self.sessions.read().await.get(&owner).map(|(ip, _)| *ip),
            None => None,
        };

        let table = self.transactions.read().await;
        Ok(RiskHistory::from_transactions(
            query,
            table.records.values(),
            last_session_ip,
        ))
    }

    async fn list_stale_pending(
        &self,
        created_before: DateTime<Utc>,
    ) -> Result<Vec<TransactionId>, LedgerError> {
        let table = self.transactions.read().await;
        Ok(table
            .records
            .values()
            .filter(|tx| tx.status == TransactionStatus::Pending && tx.created_at < created_before)
            .map(|tx| tx.id.clone())
            .collect())
    }

    async fn record_session(
        &self,
        user_id: Uuid,
        ip: IpAddr,
        at: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let mut sessions = self.sessions.write().await;
        match sessions.get(&user_id) {
            Some((_, seen)) if *seen > at => {}
            _ => {
                sessions.insert(user_id, (ip, at));
            }
        }
        Ok(())
    }
}

/// Exclusive scope over the in-process store
struct MemoryScope {
    locks: LockSet,
    /// Same order as `locks.ids()`
    guards: Vec<OwnedMutexGuard<Account>>,
    staged_accounts: HashMap<AccountId, Account>,
    staged_transactions: Vec<Transaction>,
    /// Committed status each claimed record must still have at commit
    claims: Vec<(TransactionId, TransactionStatus, TransactionStatus)>,
    transactions: Arc<RwLock<TransactionTable>>,
    closed: bool,
}

impl MemoryScope {
    fn ensure_open(&self) -> Result<(), LedgerError> {
        if self.closed {
            return Err(StoreError::ScopeClosed.into());
        }
        Ok(())
    }

    fn guard_index(&self, id: AccountId) -> Result<usize, LedgerError> {
        self.locks
            .ids()
            .binary_search(&id)
            .map_err(|_| StoreError::NotLocked(id).into())
    }

    /// Mutable staged copy of a locked account
    fn staged(&mut self, id: AccountId) -> Result<&mut Account, LedgerError> {
        self.ensure_open()?;
        let index = self.guard_index(id)?;
        let guards = &self.guards;
        Ok(self
            .staged_accounts
            .entry(id)
            .or_insert_with(|| (*guards[index]).clone()))
    }

    /// Staged transaction records layered over the committed table
    fn staged_transaction(&self, id: &TransactionId) -> Option<&Transaction> {
        self.staged_transactions.iter().rev().find(|tx| &tx.id == id)
    }
}

#[async_trait]
impl LedgerScope for MemoryScope {
    fn locks(&self) -> &LockSet {
        &self.locks
    }

    async fn account(&mut self, id: AccountId) -> Result<Account, LedgerError> {
        self.ensure_open()?;
        if let Some(account) = self.staged_accounts.get(&id) {
            return Ok(account.clone());
        }
        let index = self.guard_index(id)?;
        Ok((*self.guards[index]).clone())
    }

    async fn adjust_balance(
        &mut self,
        id: AccountId,
        delta: Money,
        required: AccountStatus,
        at: DateTime<Utc>,
    ) -> Result<Money, LedgerError> {
        self.staged(id)?.apply_delta(delta, required, at)
    }

    async fn set_status(
        &mut self,
        id: AccountId,
        status: AccountStatus,
    ) -> Result<Account, LedgerError> {
        let account = self.staged(id)?;
        apply_status(account, status)?;
        Ok(account.clone())
    }

    async fn outgoing_total_since(
        &mut self,
        id: AccountId,
        since: DateTime<Utc>,
    ) -> Result<Money, LedgerError> {
        self.ensure_open()?;
        self.guard_index(id)?;

        let counts = |tx: &Transaction| {
            tx.from_account == Some(id)
                && tx.status == TransactionStatus::Completed
                && tx.effective_at() >= since
        };

        let table = self.transactions.read().await;
        let committed: Money = table
            .records
            .values()
            .filter(|tx| self.staged_transaction(&tx.id).is_none())
            .filter(|tx| counts(*tx))
            .map(|tx| tx.amount)
            .sum();

        let mut seen = Vec::new();
        let mut staged = Money::ZERO;
        for tx in self.staged_transactions.iter().rev() {
            if seen.contains(&&tx.id) {
                continue;
            }
            seen.push(&tx.id);
            if counts(tx) {
                staged = staged.saturating_add(tx.amount);
            }
        }

        Ok(committed.saturating_add(staged))
    }

    async fn find_by_idempotency_key(
        &mut self,
        key: Uuid,
    ) -> Result<Option<Transaction>, LedgerError> {
        self.ensure_open()?;
        if let Some(tx) = self
            .staged_transactions
            .iter()
            .rev()
            .find(|tx| tx.idempotency_key == Some(key))
        {
            return Ok(Some(tx.clone()));
        }

        let table = self.transactions.read().await;
        Ok(table
            .by_idempotency_key(key)
            .filter(|tx| self.staged_transaction(&tx.id).is_none())
            .cloned())
    }

    async fn save_transaction(&mut self, transaction: &Transaction) -> Result<(), LedgerError> {
        self.ensure_open()?;
        self.staged_transactions.push(transaction.clone());
        Ok(())
    }

    async fn transition_transaction(
        &mut self,
        id: &TransactionId,
        from: TransactionStatus,
        to: TransactionStatus,
        at: DateTime<Utc>,
    ) -> Result<Transaction, LedgerError> {
        self.ensure_open()?;
        check_transition(id, from, to)?;

        let (mut record, committed) = match self.staged_transaction(id) {
            Some(staged) => (staged.clone(), false),
            None => {
                let table = self.transactions.read().await;
                let record = table
                    .records
                    .get(id)
                    .cloned()
                    .ok_or_else(|| LedgerError::TransactionNotFound(id.clone()))?;
                (record, true)
            }
        };

        if record.status != from {
            return Err(LedgerError::StateConflict {
                transaction_id: id.clone(),
                from: record.status,
                to,
            });
        }
        record.transition(to, at)?;

        if committed {
            self.claims.push((id.clone(), from, to));
        }
        self.staged_transactions.push(record.clone());
        Ok(record)
    }

    async fn commit(&mut self) -> Result<(), LedgerError> {
        self.ensure_open()?;

        {
            let mut table = self.transactions.write().await;
            for (id, from, to) in &self.claims {
                let current = table.records.get(id).map(|tx| tx.status);
                if current != Some(*from) {
                    return Err(LedgerError::StateConflict {
                        transaction_id: id.clone(),
                        from: current.unwrap_or(*from),
                        to: *to,
                    });
                }
            }
            for tx in &self.staged_transactions {
                table.check_key(tx)?;
            }
            for tx in self.staged_transactions.drain(..) {
                table.upsert(tx);
            }

            for (id, account) in self.staged_accounts.drain() {
                if let Ok(index) = self.locks.ids().binary_search(&id) {
                    *self.guards[index] = account;
                }
            }
        }

        self.closed = true;
        self.guards.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TransactionType;

    async fn store_with(balances: &[i64]) -> (MemoryLedgerStore, Vec<AccountId>) {
        let store = MemoryLedgerStore::new();
        let mut ids = Vec::new();
        for balance in balances {
            let account = store
                .open_account(
                    NewAccount::new(Uuid::new_v4(), "USD").with_balance(Money::from_minor(*balance)),
                )
                .await
                .unwrap();
            ids.push(account.id);
        }
        (store, ids)
    }

    #[tokio::test]
    async fn test_commit_applies_staged_changes() {
        let (store, ids) = store_with(&[1_000, 0]).await;
        let now = Utc::now();

        let mut scope = store.begin(LockSet::pair(ids[0], ids[1])).await.unwrap();
        scope
            .adjust_balance(ids[0], Money::from_minor(-400), AccountStatus::Active, now)
            .await
            .unwrap();
        scope
            .adjust_balance(ids[1], Money::from_minor(400), AccountStatus::Active, now)
            .await
            .unwrap();
        scope.commit().await.unwrap();
        drop(scope);

        assert_eq!(store.get_account(ids[0]).await.unwrap().balance, Money::from_minor(600));
        assert_eq!(store.get_account(ids[1]).await.unwrap().balance, Money::from_minor(400));
        assert_eq!(store.total_balance().await, Money::from_minor(1_000));
    }

    #[tokio::test]
    async fn test_drop_rolls_back() {
        let (store, ids) = store_with(&[1_000]).await;

        let mut scope = store.begin(LockSet::single(ids[0])).await.unwrap();
        scope
            .adjust_balance(ids[0], Money::from_minor(-999), AccountStatus::Active, Utc::now())
            .await
            .unwrap();
        let tx = Transaction::new(
            TransactionType::Withdrawal,
            Some(ids[0]),
            None,
            Money::from_minor(999),
            "USD",
            Utc::now(),
        );
        scope.save_transaction(&tx).await.unwrap();
        drop(scope);

        assert_eq!(store.get_account(ids[0]).await.unwrap().balance, Money::from_minor(1_000));
        assert!(store.get_transaction(&tx.id).await.is_err());
    }

    #[tokio::test]
    async fn test_unlocked_account_rejected() {
        let (store, ids) = store_with(&[10, 10]).await;
        let mut scope = store.begin(LockSet::single(ids[0])).await.unwrap();

        let err = scope.account(ids[1]).await.unwrap_err();
        assert!(matches!(err, LedgerError::Store(StoreError::NotLocked(_))));
    }

    #[tokio::test]
    async fn test_begin_unknown_account() {
        let (store, ids) = store_with(&[10]).await;
        let err = store
            .begin(LockSet::pair(ids[0], AccountId(999)))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, LedgerError::AccountNotFound(AccountId(999))));

        // the existing account was never locked
        let _scope = store.begin(LockSet::single(ids[0])).await.unwrap();
    }

    #[tokio::test]
    async fn test_commit_twice_fails() {
        let (store, ids) = store_with(&[10]).await;
        let mut scope = store.begin(LockSet::single(ids[0])).await.unwrap();
        scope.commit().await.unwrap();
        assert!(matches!(
            scope.commit().await,
            Err(LedgerError::Store(StoreError::ScopeClosed))
        ));
    }

    #[tokio::test]
    async fn test_compare_and_set_transition() {
        let (store, ids) = store_with(&[10, 10]).await;
        let tx = Transaction::new(
            TransactionType::Transfer,
            Some(ids[0]),
            Some(ids[1]),
            Money::from_minor(5),
            "USD",
            Utc::now(),
        );
        store.save_transaction(&tx).await.unwrap();

        let cancelled = store
            .transition_transaction(
                &tx.id,
                TransactionStatus::Pending,
                TransactionStatus::Cancelled,
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(cancelled.status, TransactionStatus::Cancelled);

        let err = store
            .transition_transaction(
                &tx.id,
                TransactionStatus::Pending,
                TransactionStatus::Processing,
                Utc::now(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::StateConflict { from: TransactionStatus::Cancelled, .. }
        ));
    }

    #[tokio::test]
    async fn test_scoped_claim_loses_to_committed_cancel() {
        let (store, ids) = store_with(&[10, 10]).await;
        let tx = Transaction::new(
            TransactionType::Transfer,
            Some(ids[0]),
            Some(ids[1]),
            Money::from_minor(5),
            "USD",
            Utc::now(),
        );
        store.save_transaction(&tx).await.unwrap();

        let mut scope = store.begin(LockSet::pair(ids[0], ids[1])).await.unwrap();
        let claimed = scope
            .transition_transaction(
                &tx.id,
                TransactionStatus::Pending,
                TransactionStatus::Processing,
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(claimed.status, TransactionStatus::Processing);
        scope
            .adjust_balance(ids[0], Money::from_minor(-5), AccountStatus::Active, Utc::now())
            .await
            .unwrap();

        // not visible outside the scope yet
        assert_eq!(
            store.get_transaction(&tx.id).await.unwrap().status,
            TransactionStatus::Pending
        );
        store
            .transition_transaction(
                &tx.id,
                TransactionStatus::Pending,
                TransactionStatus::Cancelled,
                Utc::now(),
            )
            .await
            .unwrap();

        let err = scope.commit().await.unwrap_err();
        assert!(matches!(
            err,
            LedgerError::StateConflict { from: TransactionStatus::Cancelled, .. }
        ));
        drop(scope);

        assert_eq!(
            store.get_transaction(&tx.id).await.unwrap().status,
            TransactionStatus::Cancelled
        );
        assert_eq!(store.get_account(ids[0]).await.unwrap().balance, Money::from_minor(10));
    }

    #[tokio::test]
    async fn test_idempotency_key_unique() {
        let (store, ids) = store_with(&[10]).await;
        let key = Uuid::new_v4();
        let make = || {
            Transaction::new(
                TransactionType::Deposit,
                None,
                Some(ids[0]),
                Money::from_minor(1),
                "USD",
                Utc::now(),
            )
            .with_idempotency_key(Some(key))
        };

        let first = make();
        store.save_transaction(&first).await.unwrap();
        assert_eq!(
            store.find_by_idempotency_key(key).await.unwrap().unwrap().id,
            first.id
        );

        let err = store.save_transaction(&make()).await.unwrap_err();
        assert!(matches!(err, LedgerError::IdempotencyConflict(k) if k == key));

        // releasing the key frees it
        let mut failed = first.clone();
        failed.fail("rolled back", Utc::now()).unwrap();
        store.save_transaction(&failed).await.unwrap();
        assert!(store.find_by_idempotency_key(key).await.unwrap().is_none());
        store.save_transaction(&make()).await.unwrap();
    }

    #[tokio::test]
    async fn test_outgoing_total_sees_staged_records() {
        let (store, ids) = store_with(&[10_000, 0]).await;
        let now = Utc::now();

        let mut done = Transaction::new(
            TransactionType::Transfer,
            Some(ids[0]),
            Some(ids[1]),
            Money::from_minor(300),
            "USD",
            now,
        );
        done.status = TransactionStatus::Completed;
        store.save_transaction(&done).await.unwrap();

        let mut scope = store.begin(LockSet::pair(ids[0], ids[1])).await.unwrap();
        let mut staged = done.clone();
        staged.id = TransactionId::generate();
        scope.save_transaction(&staged).await.unwrap();

        let total = scope
            .outgoing_total_since(ids[0], now - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(total, Money::from_minor(600));
    }
}
