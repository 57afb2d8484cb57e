//! Limit Policy
//!
//! Daily and monthly outgoing ceilings per account. Usage is the sum of
//! completed transactions with the account as source that executed since the
//! start of the current calendar day (or month) at the configured UTC offset. Checks run
//! inside the caller's [`LedgerScope`] so the usage they read cannot change
//! before the debit commits.

use chrono::{DateTime, Datelike, FixedOffset, NaiveTime, TimeZone, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::config::LedgerConfig;
use crate::domain::{Account, AccountId, Clock, LedgerError, LedgerEvent, LimitPeriod, Money};
use crate::ledger::{LedgerScope, LedgerStore, LockSet};

/// Current allowance for one account
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LimitUsage {
    pub account_id: AccountId,
    pub daily_limit: Money,
    pub daily_used: Money,
    pub daily_remaining: Money,
    pub monthly_limit: Money,
    pub monthly_used: Money,
    pub monthly_remaining: Money,
}

pub struct LimitPolicy {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    default_daily_limit: Money,
    default_monthly_limit: Money,
    offset: FixedOffset,
    timeout: Duration,
}

impl LimitPolicy {
    pub fn new(store: Arc<dyn LedgerStore>, clock: Arc<dyn Clock>, config: &LedgerConfig) -> Self {
        Self {
            store,
            clock,
            default_daily_limit: config.default_daily_limit,
            default_monthly_limit: config.default_monthly_limit,
            offset: config.utc_offset,
            timeout: config.check_timeout,
        }
    }

    pub fn daily_limit_for(&self, account: &Account) -> Money {
        account
            .daily_transfer_limit
            .unwrap_or(self.default_daily_limit)
    }

    pub fn monthly_limit_for(&self, account: &Account) -> Money {
        account
            .monthly_transfer_limit
            .unwrap_or(self.default_monthly_limit)
    }

    /// Start of the local calendar day containing `now`, as UTC
    pub fn day_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let date = now.with_timezone(&self.offset).date_naive();
        self.local_midnight(date)
    }

    /// Start of the local calendar month containing `now`, as UTC
    pub fn month_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let date = now.with_timezone(&self.offset).date_naive();
        let first = date - chrono::Duration::days(i64::from(date.day0()));
        self.local_midnight(first)
    }

    fn local_midnight(&self, date: chrono::NaiveDate) -> DateTime<Utc> {
        let local = date.and_time(NaiveTime::default());
        let utc = local - chrono::Duration::seconds(i64::from(self.offset.local_minus_utc()));
        Utc.from_utc_datetime(&utc)
    }

    /// Fails with `DailyLimitExceeded` if `amount` would take today's usage
    /// past the account's daily limit.
    pub async fn check_daily_limit(
        &self,
        scope: &mut dyn LedgerScope,
        account: &Account,
        amount: Money,
    ) -> Result<(), LedgerError> {
        let limit = self.daily_limit_for(account);
        let used = scope
            .outgoing_total_since(account.id, self.day_start(self.clock.now()))
            .await?;

        if exceeds(used, amount, limit) {
            return Err(LedgerError::DailyLimitExceeded {
                account_id: account.id,
                limit,
                used,
                requested: amount,
            });
        }
        Ok(())
    }

    /// Same shape as [`check_daily_limit`](Self::check_daily_limit) over the
    /// current calendar month.
    pub async fn check_monthly_limit(
        &self,
        scope: &mut dyn LedgerScope,
        account: &Account,
        amount: Money,
    ) -> Result<(), LedgerError> {
        let limit = self.monthly_limit_for(account);
        let used = scope
            .outgoing_total_since(account.id, self.month_start(self.clock.now()))
            .await?;

        if exceeds(used, amount, limit) {
            return Err(LedgerError::MonthlyLimitExceeded {
                account_id: account.id,
                limit,
                used,
                requested: amount,
            });
        }
        Ok(())
    }

    /// Daily then monthly, bounded by the check timeout.
    pub async fn check(
        &self,
        scope: &mut dyn LedgerScope,
        account: &Account,
        amount: Money,
    ) -> Result<(), LedgerError> {
        let checks = async {
            self.check_daily_limit(&mut *scope, account, amount).await?;
            self.check_monthly_limit(&mut *scope, account, amount).await
        };

        match tokio::time::timeout(self.timeout, checks).await {
            Ok(result) => result,
            Err(_) => {
                tracing::error!(
                    account_id = %account.id,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Limit check timed out; failing closed"
                );
                Err(LedgerError::CheckTimedOut("limit"))
            }
        }
    }

    /// Read-only allowance report. Briefly takes the account's lock so the
    /// figures reflect no half-applied transfer.
    pub async fn usage(&self, account_id: AccountId) -> Result<LimitUsage, LedgerError> {
        let now = self.clock.now();
        let mut scope = self.store.begin(LockSet::single(account_id)).await?;

        let account = scope.account(account_id).await?;
        let daily_used = scope
            .outgoing_total_since(account_id, self.day_start(now))
            .await?;
        let monthly_used = scope
            .outgoing_total_since(account_id, self.month_start(now))
            .await?;
        drop(scope);

        let daily_limit = self.daily_limit_for(&account);
        let monthly_limit = self.monthly_limit_for(&account);

        Ok(LimitUsage {
            account_id,
            daily_limit,
            daily_used,
            daily_remaining: remaining(daily_limit, daily_used),
            monthly_limit,
            monthly_used,
            monthly_remaining: remaining(monthly_limit, monthly_used),
        })
    }
}

fn exceeds(used: Money, amount: Money, limit: Money) -> bool {
    used.checked_add(amount).map_or(true, |total| total > limit)
}

fn remaining(limit: Money, used: Money) -> Money {
    limit.checked_sub(used).unwrap_or(Money::ZERO).max(Money::ZERO)
}

/// The event to emit for a limit rejection, if `err` is one.
pub fn limit_exceeded_event(err: &LedgerError, occurred_at: DateTime<Utc>) -> Option<LedgerEvent> {
    let (period, account_id, limit, used, requested) = match err {
        LedgerError::DailyLimitExceeded {
            account_id,
            limit,
            used,
            requested,
        } => (LimitPeriod::Daily, account_id, limit, used, requested),
        LedgerError::MonthlyLimitExceeded {
            account_id,
            limit,
            used,
            requested,
        } => (LimitPeriod::Monthly, account_id, limit, used, requested),
        _ => return None,
    };

    Some(LedgerEvent::LimitExceeded {
        account_id: *account_id,
        period,
        limit: *limit,
        used: *used,
        requested: *requested,
        occurred_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FixedClock, NewAccount, Transaction, TransactionStatus, TransactionType};
    use crate::ledger::MemoryLedgerStore;
    use uuid::Uuid;

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap()
    }

    struct Fixture {
        store: Arc<MemoryLedgerStore>,
        policy: LimitPolicy,
        source: Account,
        sink: Account,
    }

    async fn fixture(config: LedgerConfig) -> Fixture {
        let clock = Arc::new(FixedClock::new(noon()));
        let store = Arc::new(MemoryLedgerStore::with_clock(clock.clone()));
        let source = store
            .open_account(NewAccount::new(Uuid::new_v4(), "USD").with_balance(Money::from_major(5_000)))
            .await
            .unwrap();
        let sink = store
            .open_account(NewAccount::new(Uuid::new_v4(), "USD"))
            .await
            .unwrap();
        let policy = LimitPolicy::new(store.clone(), clock, &config);
        Fixture {
            store,
            policy,
            source,
            sink,
        }
    }

    async fn completed(f: &Fixture, major: i64, at: DateTime<Utc>) {
        let mut tx = Transaction::new(
            TransactionType::Transfer,
            Some(f.source.id),
            Some(f.sink.id),
            Money::from_major(major),
            "USD",
            at,
        );
        tx.status = TransactionStatus::Completed;
        f.store.save_transaction(&tx).await.unwrap();
    }

    #[test]
    fn test_day_start_respects_offset() {
        let config = LedgerConfig::default();
        let policy = LimitPolicy::new(
            Arc::new(MemoryLedgerStore::new()),
            Arc::new(FixedClock::new(noon())),
            &config,
        );
        assert_eq!(
            policy.day_start(noon()),
            Utc.with_ymd_and_hms(2026, 3, 10, 0, 0, 0).unwrap()
        );
        assert_eq!(
            policy.month_start(noon()),
            Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap()
        );

        // UTC+09:00: 2026-03-10T12:00Z is 21:00 local, the local day began at 15:00Z the day before
        let tokyo = config.with_utc_offset(FixedOffset::east_opt(9 * 3600).unwrap());
        let policy = LimitPolicy::new(
            Arc::new(MemoryLedgerStore::new()),
            Arc::new(FixedClock::new(noon())),
            &tokyo,
        );
        assert_eq!(
            policy.day_start(noon()),
            Utc.with_ymd_and_hms(2026, 3, 9, 15, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn test_daily_limit_exceeded() {
        let f = fixture(LedgerConfig::default().with_default_daily_limit(Money::from_major(1_000))).await;
        completed(&f, 900, noon() - chrono::Duration::hours(1)).await;

        let mut scope = f.store.begin(LockSet::single(f.source.id)).await.unwrap();
        let err = f
            .policy
            .check_daily_limit(scope.as_mut(), &f.source, Money::from_major(150))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            LedgerError::DailyLimitExceeded { used, requested, .. }
                if used == Money::from_major(900) && requested == Money::from_major(150)
        ));

        let event = limit_exceeded_event(&err, noon()).unwrap();
        assert!(matches!(
            event,
            LedgerEvent::LimitExceeded { period: LimitPeriod::Daily, .. }
        ));
    }

    #[tokio::test]
    async fn test_exactly_at_limit_is_allowed() {
        let f = fixture(LedgerConfig::default().with_default_daily_limit(Money::from_major(1_000))).await;
        completed(&f, 900, noon() - chrono::Duration::hours(1)).await;

        let mut scope = f.store.begin(LockSet::single(f.source.id)).await.unwrap();
        f.policy
            .check(scope.as_mut(), &f.source, Money::from_major(100))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_yesterday_does_not_count_today() {
        let f = fixture(LedgerConfig::default().with_default_daily_limit(Money::from_major(1_000))).await;
        completed(&f, 900, noon() - chrono::Duration::hours(13)).await;

        let mut scope = f.store.begin(LockSet::single(f.source.id)).await.unwrap();
        f.policy
            .check_daily_limit(scope.as_mut(), &f.source, Money::from_major(1_000))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_monthly_limit() {
        let mut config = LedgerConfig::default();
        config.default_monthly_limit = Money::from_major(2_000);
        let f = fixture(config).await;
        completed(&f, 1_500, noon() - chrono::Duration::days(5)).await;

        let mut scope = f.store.begin(LockSet::single(f.source.id)).await.unwrap();
        let err = f
            .policy
            .check(scope.as_mut(), &f.source, Money::from_major(600))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::MonthlyLimitExceeded { .. }));
    }

    #[tokio::test]
    async fn test_usage_report() {
        let f = fixture(LedgerConfig::default()).await;
        completed(&f, 400, noon() - chrono::Duration::hours(2)).await;
        completed(&f, 100, noon() - chrono::Duration::days(3)).await;

        let usage = f.policy.usage(f.source.id).await.unwrap();
        assert_eq!(usage.daily_used, Money::from_major(400));
        assert_eq!(usage.daily_remaining, Money::from_major(9_600));
        assert_eq!(usage.monthly_used, Money::from_major(500));
        assert_eq!(usage.monthly_remaining, Money::from_major(99_500));
    }

    #[test]
    fn test_remaining_never_negative() {
        assert_eq!(
            remaining(Money::from_major(10), Money::from_major(25)),
            Money::ZERO
        );
    }
}
