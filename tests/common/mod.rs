//! Common test utilities

#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

use finance_ledger::audit::ChannelSink;
use finance_ledger::domain::{AccountId, FixedClock, LedgerEvent, Money, NewAccount};
use finance_ledger::ledger::{LedgerStore, MemoryLedgerStore};
use finance_ledger::{LedgerConfig, LedgerService};

/// Tuesday noon, inside normal hours
pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap()
}

/// A ledger over the in-process store with a controllable clock
pub struct Fixture {
    pub clock: Arc<FixedClock>,
    pub store: Arc<MemoryLedgerStore>,
    pub ledger: Arc<LedgerService>,
    pub events: UnboundedReceiver<LedgerEvent>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(LedgerConfig::default())
    }

    pub fn with_config(config: LedgerConfig) -> Self {
        let clock = Arc::new(FixedClock::new(start_time()));
        let store = Arc::new(MemoryLedgerStore::with_clock(clock.clone()));
        let (sink, events) = ChannelSink::new();
        let ledger = Arc::new(LedgerService::new(
            store.clone(),
            Arc::new(sink),
            clock.clone(),
            &config,
        ));
        Self {
            clock,
            store,
            ledger,
            events,
        }
    }

    /// Open a USD account holding `major` whole units
    pub async fn open(&self, major: i64) -> AccountId {
        self.open_with(NewAccount::new(Uuid::new_v4(), "USD").with_balance(Money::from_major(major)))
            .await
    }

    pub async fn open_with(&self, new_account: NewAccount) -> AccountId {
        self.ledger
            .open_account(new_account)
            .await
            .expect("open account")
            .id
    }

    pub async fn balance(&self, id: AccountId) -> Money {
        self.store.get_account(id).await.expect("account").balance
    }

    /// Everything emitted so far
    pub fn drain_events(&mut self) -> Vec<LedgerEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}

/// Connect to DATABASE_URL and apply migrations. Each test opens its own
/// accounts, so tables are shared between tests.
pub async fn setup_test_db() -> PgPool {
    dotenvy::dotenv().ok();
    let database_url = std::env::var("DATABASE_URL")
        .expect("DATABASE_URL must be set for tests");

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .expect("Failed to connect to DB");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    pool
}
