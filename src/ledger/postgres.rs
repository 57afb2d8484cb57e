//! PostgreSQL Ledger Store
//!
//! A scope is one database transaction. Account rows are locked with
//! `SELECT ... FOR UPDATE`, one id at a time in [`LockSet`] order, and held
//! until commit or rollback. Dropping the scope rolls the transaction back.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool, Postgres};
use std::net::IpAddr;
use uuid::Uuid;

use crate::domain::{
    Account, AccountId, AccountStatus, LedgerError, LegBalances, Money, NewAccount, Transaction,
    TransactionId, TransactionStatus,
};
use crate::risk::{HistoryQuery, RiskHistory};

use super::{
    apply_status, check_opening_balance, check_transition, LedgerScope, LedgerStore, LockSet,
    StoreError,
};

const ACCOUNT_COLUMNS: &str = "id, owner_id, currency, balance, available_balance, status, \
     daily_transfer_limit, monthly_transfer_limit, last_transaction_at, created_at";

const TRANSACTION_COLUMNS: &str = "transaction_id, idempotency_key, transaction_type, \
     from_account, to_account, amount, currency, status, fraud_score, \
     from_balance_before, from_balance_after, to_balance_before, to_balance_after, \
     description, initiated_by, failure_reason, created_at, processed_at, completed_at";

const IDEMPOTENCY_CONSTRAINT: &str = "transactions_idempotency_key_key";

fn db_error(err: sqlx::Error) -> LedgerError {
    StoreError::Database(err).into()
}

// =========================================================================
// Row mapping
// =========================================================================

#[derive(Debug, sqlx::FromRow)]
struct AccountRow {
    id: i64,
    owner_id: Uuid,
    currency: String,
    balance: i64,
    available_balance: i64,
    status: String,
    daily_transfer_limit: Option<i64>,
    monthly_transfer_limit: Option<i64>,
    last_transaction_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<AccountRow> for Account {
    type Error = StoreError;

    fn try_from(row: AccountRow) -> Result<Self, Self::Error> {
        Ok(Account {
            id: AccountId(row.id),
            owner_id: row.owner_id,
            currency: row.currency,
            balance: Money::from_minor(row.balance),
            available_balance: Money::from_minor(row.available_balance),
            status: row.status.parse().map_err(StoreError::InvalidData)?,
            daily_transfer_limit: row.daily_transfer_limit.map(Money::from_minor),
            monthly_transfer_limit: row.monthly_transfer_limit.map(Money::from_minor),
            last_transaction_at: row.last_transaction_at,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct TransactionRow {
    transaction_id: String,
    idempotency_key: Option<Uuid>,
    transaction_type: String,
    from_account: Option<i64>,
    to_account: Option<i64>,
    amount: i64,
    currency: String,
    status: String,
    fraud_score: i16,
    from_balance_before: Option<i64>,
    from_balance_after: Option<i64>,
    to_balance_before: Option<i64>,
    to_balance_after: Option<i64>,
    description: Option<String>,
    initiated_by: Option<Uuid>,
    failure_reason: Option<String>,
    created_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

fn leg(before: Option<i64>, after: Option<i64>) -> Option<LegBalances> {
    match (before, after) {
        (Some(before), Some(after)) => Some(LegBalances {
            before: Money::from_minor(before),
            after: Money::from_minor(after),
        }),
        _ => None,
    }
}

impl TryFrom<TransactionRow> for Transaction {
    type Error = StoreError;

    fn try_from(row: TransactionRow) -> Result<Self, Self::Error> {
        let fraud_score = u8::try_from(row.fraud_score)
            .map_err(|_| StoreError::InvalidData(format!("fraud_score {}", row.fraud_score)))?;

        Ok(Transaction {
            id: TransactionId::from(row.transaction_id),
            idempotency_key: row.idempotency_key,
            transaction_type: row
                .transaction_type
                .parse()
                .map_err(StoreError::InvalidData)?,
            from_account: row.from_account.map(AccountId),
            to_account: row.to_account.map(AccountId),
            amount: Money::from_minor(row.amount),
            currency: row.currency,
            status: row.status.parse().map_err(StoreError::InvalidData)?,
            fraud_score,
            from_balances: leg(row.from_balance_before, row.from_balance_after),
            to_balances: leg(row.to_balance_before, row.to_balance_after),
            description: row.description,
            initiated_by: row.initiated_by,
            failure_reason: row.failure_reason,
            created_at: row.created_at,
            processed_at: row.processed_at,
            completed_at: row.completed_at,
        })
    }
}

// =========================================================================
// Shared queries
// =========================================================================

async fn fetch_account(
    conn: &mut PgConnection,
    id: AccountId,
) -> Result<Account, LedgerError> {
    let sql = format!("SELECT {} FROM accounts WHERE id = $1", ACCOUNT_COLUMNS);
    let row: Option<AccountRow> = sqlx::query_as(&sql)
        .bind(id.0)
        .fetch_optional(conn)
        .await
        .map_err(db_error)?;

    match row {
        Some(row) => Ok(Account::try_from(row)?),
        None => Err(LedgerError::AccountNotFound(id)),
    }
}

async fn transaction_by_id(
    conn: &mut PgConnection,
    id: &TransactionId,
    for_update: bool,
) -> Result<Option<Transaction>, LedgerError> {
    let sql = format!(
        "SELECT {} FROM transactions WHERE transaction_id = $1{}",
        TRANSACTION_COLUMNS,
        if for_update { " FOR UPDATE" } else { "" }
    );
    let row: Option<TransactionRow> = sqlx::query_as(&sql)
        .bind(id.as_str())
        .fetch_optional(conn)
        .await
        .map_err(db_error)?;
    Ok(row.map(Transaction::try_from).transpose()?)
}

async fn transaction_by_key(
    conn: &mut PgConnection,
    key: Uuid,
) -> Result<Option<Transaction>, LedgerError> {
    let sql = format!(
        "SELECT {} FROM transactions WHERE idempotency_key = $1",
        TRANSACTION_COLUMNS
    );
    let row: Option<TransactionRow> = sqlx::query_as(&sql)
        .bind(key)
        .fetch_optional(conn)
        .await
        .map_err(db_error)?;
    Ok(row.map(Transaction::try_from).transpose()?)
}

/// Insert or update a transaction record. The immutable columns (type,
/// parties, amount, currency, created_at) are only written on insert.
async fn upsert_transaction(
    conn: &mut PgConnection,
    tx: &Transaction,
) -> Result<(), LedgerError> {
    let result = sqlx::query(
        r#"
        INSERT INTO transactions (
            transaction_id, idempotency_key, transaction_type,
            from_account, to_account, amount, currency, status, fraud_score,
            from_balance_before, from_balance_after, to_balance_before, to_balance_after,
            description, initiated_by, failure_reason, created_at, processed_at, completed_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
        ON CONFLICT (transaction_id) DO UPDATE SET
            idempotency_key = EXCLUDED.idempotency_key,
            status = EXCLUDED.status,
            fraud_score = EXCLUDED.fraud_score,
            from_balance_before = EXCLUDED.from_balance_before,
            from_balance_after = EXCLUDED.from_balance_after,
            to_balance_before = EXCLUDED.to_balance_before,
            to_balance_after = EXCLUDED.to_balance_after,
            description = EXCLUDED.description,
            failure_reason = EXCLUDED.failure_reason,
            processed_at = EXCLUDED.processed_at,
            completed_at = EXCLUDED.completed_at
        "#,
    )
    .bind(tx.id.as_str())
    .bind(tx.idempotency_key)
    .bind(tx.transaction_type.as_str())
    .bind(tx.from_account.map(|a| a.0))
    .bind(tx.to_account.map(|a| a.0))
    .bind(tx.amount.minor())
    .bind(&tx.currency)
    .bind(tx.status.as_str())
    .bind(i16::from(tx.fraud_score))
    .bind(tx.from_balances.map(|b| b.before.minor()))
    .bind(tx.from_balances.map(|b| b.after.minor()))
    .bind(tx.to_balances.map(|b| b.before.minor()))
    .bind(tx.to_balances.map(|b| b.after.minor()))
    .bind(&tx.description)
    .bind(tx.initiated_by)
    .bind(&tx.failure_reason)
    .bind(tx.created_at)
    .bind(tx.processed_at)
    .bind(tx.completed_at)
    .execute(conn)
    .await;

    match result {
        Ok(_) => Ok(()),
        Err(sqlx::Error::Database(db))
            if db.constraint() == Some(IDEMPOTENCY_CONSTRAINT) =>
        {
            match tx.idempotency_key {
                Some(key) => Err(LedgerError::IdempotencyConflict(key)),
                None => Err(db_error(sqlx::Error::Database(db))),
            }
        }
        Err(e) => Err(db_error(e)),
    }
}

// =========================================================================
// PgLedgerStore
// =========================================================================

#[derive(Debug, Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn connection(&self) -> Result<sqlx::pool::PoolConnection<Postgres>, LedgerError> {
        self.pool.acquire().await.map_err(db_error)
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn open_account(&self, new_account: NewAccount) -> Result<Account, LedgerError> {
        check_opening_balance(&new_account)?;

        let sql = format!(
            r#"
            INSERT INTO accounts (
                owner_id, currency, balance, available_balance, status,
                daily_transfer_limit, monthly_transfer_limit
            )
            VALUES ($1, $2, $3, $3, 'active', $4, $5)
            RETURNING {}
            "#,
            ACCOUNT_COLUMNS
        );
        let row: AccountRow = sqlx::query_as(&sql)
            .bind(new_account.owner_id)
            .bind(&new_account.currency)
            .bind(new_account.opening_balance.minor())
            .bind(new_account.daily_transfer_limit.map(|m| m.minor()))
            .bind(new_account.monthly_transfer_limit.map(|m| m.minor()))
            .fetch_one(&self.pool)
            .await
            .map_err(db_error)?;

        let account = Account::try_from(row)?;
        tracing::debug!(account_id = %account.id, owner_id = %account.owner_id, "Account opened");
        Ok(account)
    }

    async fn get_account(&self, id: AccountId) -> Result<Account, LedgerError> {
        let mut conn = self.connection().await?;
        fetch_account(&mut conn, id).await
    }

    async fn begin(&self, locks: LockSet) -> Result<Box<dyn LedgerScope>, LedgerError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        for id in locks.ids() {
            let locked: Option<(i64,)> =
                sqlx::query_as("SELECT id FROM accounts WHERE id = $1 FOR UPDATE")
                    .bind(id.0)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(db_error)?;

            if locked.is_none() {
                return Err(LedgerError::AccountNotFound(*id));
            }
        }

        Ok(Box::new(PgScope { locks, tx: Some(tx) }))
    }

    async fn get_transaction(&self, id: &TransactionId) -> Result<Transaction, LedgerError> {
        let mut conn = self.connection().await?;
        transaction_by_id(&mut conn, id, false)
            .await?
            .ok_or_else(|| LedgerError::TransactionNotFound(id.clone()))
    }

    async fn find_by_idempotency_key(&self, key: Uuid) -> Result<Option<Transaction>, LedgerError> {
        let mut conn = self.connection().await?;
        transaction_by_key(&mut conn, key).await
    }

    async fn save_transaction(&self, transaction: &Transaction) -> Result<(), LedgerError> {
        let mut conn = self.connection().await?;
        upsert_transaction(&mut conn, transaction).await
    }

    async fn transition_transaction(
        &self,
        id: &TransactionId,
        from: TransactionStatus,
        to: TransactionStatus,
        at: DateTime<Utc>,
    ) -> Result<Transaction, LedgerError> {
        check_transition(id, from, to)?;

        let mut tx = self.pool.begin().await.map_err(db_error)?;
        let mut record = transaction_by_id(&mut tx, id, true)
            .await?
            .ok_or_else(|| LedgerError::TransactionNotFound(id.clone()))?;

        if record.status != from {
            return Err(LedgerError::StateConflict {
                transaction_id: id.clone(),
                from: record.status,
                to,
            });
        }
        record.transition(to, at)?;

        upsert_transaction(&mut tx, &record).await?;
        tx.commit().await.map_err(db_error)?;
        Ok(record)
    }

    async fn load_risk_history(&self, query: &HistoryQuery) -> Result<RiskHistory, LedgerError> {
        let (average, recent_count, daily_count, daily_outgoing, has_prior, recipients): (
            Option<i64>,
            i64,
            i64,
            i64,
            bool,
            i64,
        ) = sqlx::query_as(
            r#"
            SELECT
                FLOOR(AVG(amount) FILTER (
                    WHERE status = 'completed'
                        AND COALESCE(completed_at, processed_at, created_at) >= $3
                ))::BIGINT,
                COUNT(*) FILTER (
                    WHERE status NOT IN ('failed', 'cancelled')
                        AND COALESCE(completed_at, processed_at, created_at) >= $4
                ),
                COUNT(*) FILTER (
                    WHERE status NOT IN ('failed', 'cancelled')
                        AND COALESCE(completed_at, processed_at, created_at) >= $5
                ),
                COALESCE(SUM(amount) FILTER (
                    WHERE status = 'completed'
                        AND COALESCE(completed_at, processed_at, created_at) >= $5
                ), 0)::BIGINT,
                COALESCE(BOOL_OR(status = 'completed' AND to_account = $2), FALSE),
                COUNT(DISTINCT to_account) FILTER (
                    WHERE status = 'completed'
                        AND COALESCE(completed_at, processed_at, created_at) >= $5
                )
            FROM transactions
            WHERE from_account = $1
            "#,
        )
        .bind(query.source.0)
        .bind(query.destination.map(|a| a.0))
        .bind(query.average_since())
        .bind(query.velocity_since())
        .bind(query.pattern_since())
        .fetch_one(&self.pool)
        .await
        .map_err(db_error)?;

        let last_session_ip = match query.owner_id {
            Some(owner) => {
                let ip: Option<(String,)> = sqlx::query_as(
                    r#"
                    SELECT host(ip_address)
                    FROM user_sessions
                    WHERE user_id = $1
                    ORDER BY created_at DESC
                    LIMIT 1
                    "#,
                )
                .bind(owner)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_error)?;
                ip.and_then(|(ip,)| ip.parse::<IpAddr>().ok())
            }
            None => None,
        };

        Ok(RiskHistory {
            average_amount_30d: average.map(Money::from_minor),
            recent_count: recent_count as u32,
            daily_count: daily_count as u32,
            daily_outgoing: Money::from_minor(daily_outgoing),
            has_prior_transfer: has_prior,
            unique_recipients_24h: recipients as u32,
            last_session_ip,
        })
    }

    async fn list_stale_pending(
        &self,
        created_before: DateTime<Utc>,
    ) -> Result<Vec<TransactionId>, LedgerError> {
        let ids: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT transaction_id
            FROM transactions
            WHERE status = 'pending' AND created_at < $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(created_before)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(ids.into_iter().map(|(id,)| TransactionId::from(id)).collect())
    }

    async fn record_session(
        &self,
        user_id: Uuid,
        ip: IpAddr,
        at: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            INSERT INTO user_sessions (user_id, ip_address, created_at)
            VALUES ($1, $2::inet, $3)
            "#,
        )
        .bind(user_id)
        .bind(ip.to_string())
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }
}

// =========================================================================
// PgScope
// =========================================================================

struct PgScope {
    locks: LockSet,
    /// `None` once committed
    tx: Option<sqlx::Transaction<'static, Postgres>>,
}

impl PgScope {
    fn conn(&mut self) -> Result<&mut PgConnection, LedgerError> {
        self.tx
            .as_deref_mut()
            .ok_or_else(|| StoreError::ScopeClosed.into())
    }

    fn ensure_locked(&self, id: AccountId) -> Result<(), LedgerError> {
        if !self.locks.contains(id) {
            return Err(StoreError::NotLocked(id).into());
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerScope for PgScope {
    fn locks(&self) -> &LockSet {
        &self.locks
    }

    async fn account(&mut self, id: AccountId) -> Result<Account, LedgerError> {
        self.ensure_locked(id)?;
        fetch_account(self.conn()?, id).await
    }

    async fn adjust_balance(
        &mut self,
        id: AccountId,
        delta: Money,
        required: AccountStatus,
        at: DateTime<Utc>,
    ) -> Result<Money, LedgerError> {
        let mut account = self.account(id).await?;
        let balance = account.apply_delta(delta, required, at)?;

        sqlx::query(
            r#"
            UPDATE accounts
            SET balance = $2, available_balance = $3, last_transaction_at = $4
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .bind(account.balance.minor())
        .bind(account.available_balance.minor())
        .bind(account.last_transaction_at)
        .execute(self.conn()?)
        .await
        .map_err(db_error)?;

        Ok(balance)
    }

    async fn set_status(
        &mut self,
        id: AccountId,
        status: AccountStatus,
    ) -> Result<Account, LedgerError> {
        let mut account = self.account(id).await?;
        apply_status(&mut account, status)?;

        sqlx::query("UPDATE accounts SET status = $2 WHERE id = $1")
            .bind(id.0)
            .bind(status.as_str())
            .execute(self.conn()?)
            .await
            .map_err(db_error)?;

        Ok(account)
    }

    async fn outgoing_total_since(
        &mut self,
        id: AccountId,
        since: DateTime<Utc>,
    ) -> Result<Money, LedgerError> {
        self.ensure_locked(id)?;
        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(amount), 0)::BIGINT
            FROM transactions
            WHERE from_account = $1 AND status = 'completed'
              AND COALESCE(completed_at, processed_at, created_at) >= $2
            "#,
        )
        .bind(id.0)
        .bind(since)
        .fetch_one(self.conn()?)
        .await
        .map_err(db_error)?;

        Ok(Money::from_minor(total))
    }

    async fn find_by_idempotency_key(
        &mut self,
        key: Uuid,
    ) -> Result<Option<Transaction>, LedgerError> {
        transaction_by_key(self.conn()?, key).await
    }

    async fn save_transaction(&mut self, transaction: &Transaction) -> Result<(), LedgerError> {
        upsert_transaction(self.conn()?, transaction).await
    }

    /// The row stays locked `FOR UPDATE` until the scope ends, so a concurrent
    /// cancel waits and then sees the outcome.
    async fn transition_transaction(
        &mut self,
        id: &TransactionId,
        from: TransactionStatus,
        to: TransactionStatus,
        at: DateTime<Utc>,
    ) -> Result<Transaction, LedgerError> {
        check_transition(id, from, to)?;

        let conn = self.conn()?;
        let mut record = transaction_by_id(&mut *conn, id, true)
            .await?
            .ok_or_else(|| LedgerError::TransactionNotFound(id.clone()))?;

        if record.status != from {
            return Err(LedgerError::StateConflict {
                transaction_id: id.clone(),
                from: record.status,
                to,
            });
        }
        record.transition(to, at)?;

        upsert_transaction(conn, &record).await?;
        Ok(record)
    }

    async fn commit(&mut self) -> Result<(), LedgerError> {
        let tx = self.tx.take().ok_or(StoreError::ScopeClosed)?;
        tx.commit().await.map_err(db_error)
    }
}
