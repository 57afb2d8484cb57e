//! Risk history
//!
//! The read-only slice of transaction history the scoring rules look at.
//! Store backends fill a [`RiskHistory`] for a [`HistoryQuery`]; tests build
//! one by hand as a fixture.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::IpAddr;
use uuid::Uuid;

use crate::domain::{AccountId, Money, Transaction, TransactionStatus};

/// Window for the average-amount baseline
pub fn average_window() -> Duration {
    Duration::days(30)
}

/// Window for the velocity rule
pub fn velocity_window() -> Duration {
    Duration::minutes(5)
}

/// Window for the hard-stop pattern checks and advisory signals
pub fn pattern_window() -> Duration {
    Duration::hours(24)
}

/// What to load for one candidate transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryQuery {
    pub source: AccountId,
    pub destination: Option<AccountId>,
    /// Owner of the source account, for the session lookup
    pub owner_id: Option<Uuid>,
    pub now: DateTime<Utc>,
}

impl HistoryQuery {
    pub fn average_since(&self) -> DateTime<Utc> {
        self.now - average_window()
    }

    pub fn velocity_since(&self) -> DateTime<Utc> {
        self.now - velocity_window()
    }

    pub fn pattern_since(&self) -> DateTime<Utc> {
        self.now - pattern_window()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskHistory {
    /// Mean completed outgoing amount over 30 days, `None` without history
    pub average_amount_30d: Option<Money>,
    /// Outgoing transactions (not failed or cancelled) in the last 5 minutes
    pub recent_count: u32,
    /// Outgoing transactions (not failed or cancelled) in the last 24 hours
    pub daily_count: u32,
    /// Completed outgoing total in the last 24 hours
    pub daily_outgoing: Money,
    /// Any completed transaction from source to destination, ever
    pub has_prior_transfer: bool,
    /// Distinct completed destinations in the last 24 hours
    pub unique_recipients_24h: u32,
    /// Most recent session address of the source account's owner
    pub last_session_ip: Option<IpAddr>,
}

fn counts_as_activity(status: TransactionStatus) -> bool {
    !matches!(
        status,
        TransactionStatus::Failed | TransactionStatus::Cancelled
    )
}

impl RiskHistory {
    /// Aggregate a history from raw records. Windows are matched against
    /// [`Transaction::effective_at`].
    pub fn from_transactions<'a>(
        query: &HistoryQuery,
        transactions: impl IntoIterator<Item = &'a Transaction>,
        last_session_ip: Option<IpAddr>,
    ) -> Self {
        let mut history = RiskHistory {
            last_session_ip,
            ..RiskHistory::default()
        };
        let mut average_sum: i128 = 0;
        let mut average_count: i128 = 0;
        let mut recipients = HashSet::new();

        for tx in transactions {
            if tx.from_account != Some(query.source) {
                continue;
            }
            let completed = tx.status == TransactionStatus::Completed;
            let at = tx.effective_at();

            if completed && tx.to_account.is_some() && tx.to_account == query.destination {
                history.has_prior_transfer = true;
            }
            if completed && at >= query.average_since() {
                average_sum += i128::from(tx.amount.minor());
                average_count += 1;
            }
            if at >= query.pattern_since() {
                if counts_as_activity(tx.status) {
                    history.daily_count += 1;
                    if at >= query.velocity_since() {
                        history.recent_count += 1;
                    }
                }
                if completed {
                    history.daily_outgoing = history.daily_outgoing.saturating_add(tx.amount);
                    if let Some(to) = tx.to_account {
                        recipients.insert(to);
                    }
                }
            }
        }

        if average_count > 0 {
            let average = (average_sum / average_count) as i64;
            history.average_amount_30d = Some(Money::from_minor(average));
        }
        history.unique_recipients_24h = recipients.len() as u32;
        history
    }
}
