//! Load Testing Tool
//!
//! Fires concurrent transfers between a ring of accounts and checks that the
//! total balance is unchanged afterwards.
//!
//! Run with: cargo run --bin load_test --release -- --transfers 5000 --accounts 20
//! Add `--postgres` to run against DATABASE_URL instead of the in-process store.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use finance_ledger::audit::TracingSink;
use finance_ledger::domain::{AccountId, Money, NewAccount, OperationContext, SystemClock};
use finance_ledger::handlers::TransferCommand;
use finance_ledger::ledger::{LedgerStore, MemoryLedgerStore, PgLedgerStore};
use finance_ledger::{LedgerConfig, LedgerService};

fn arg<T: std::str::FromStr>(args: &[String], name: &str, default: T) -> T {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let args: Vec<String> = std::env::args().collect();
    let transfer_count: usize = arg(&args, "--transfers", 5_000);
    let account_count: usize = arg(&args, "--accounts", 20).max(2);
    let use_postgres = args.iter().any(|a| a == "--postgres");

    let store: Arc<dyn LedgerStore> = if use_postgres {
        let database_url = std::env::var("DATABASE_URL")?;
        println!("Connecting to database...");
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(&database_url)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Arc::new(PgLedgerStore::new(pool))
    } else {
        Arc::new(MemoryLedgerStore::new())
    };

    let config = LedgerConfig {
        default_daily_limit: Money::from_major(1_000_000_000),
        default_monthly_limit: Money::from_major(1_000_000_000),
        daily_hard_ceiling: Money::from_major(1_000_000_000),
        daily_transaction_cap: u32::MAX,
        ..LedgerConfig::default()
    };
    let ledger = Arc::new(LedgerService::new(
        store.clone(),
        Arc::new(TracingSink),
        Arc::new(SystemClock),
        &config,
    ));

    let mut accounts = Vec::with_capacity(account_count);
    for _ in 0..account_count {
        let account = ledger
            .open_account(
                NewAccount::new(Uuid::new_v4(), "USD").with_balance(Money::from_major(1_000)),
            )
            .await?;
        accounts.push(account.id);
    }
    let before = total_balance(store.as_ref(), &accounts).await?;

    println!(
        "Load Test - {} transfers across {} accounts",
        transfer_count, account_count
    );

    let start = Instant::now();
    let mut tasks = Vec::with_capacity(transfer_count);
    for i in 0..transfer_count {
        let ledger = ledger.clone();
        let from = accounts[i % account_count];
        let to = accounts[(i * 7 + 1) % account_count];
        tasks.push(tokio::spawn(async move {
            if from == to {
                return "skipped";
            }
            let command = TransferCommand::new(from, to, Money::from_minor(2_500));
            match ledger
                .transfers
                .execute(command, None, &OperationContext::new())
                .await
            {
                Ok(_) => "completed",
                Err(e) => e.code(),
            }
        }));
    }

    let mut outcomes: BTreeMap<&'static str, u64> = BTreeMap::new();
    for task in tasks {
        *outcomes.entry(task.await?).or_default() += 1;
    }

    let elapsed = start.elapsed();
    let after = total_balance(store.as_ref(), &accounts).await?;
    let completed = outcomes.get("completed").copied().unwrap_or(0);

    println!("\n=== Load Test Results ===");
    for (outcome, count) in &outcomes {
        println!("{:>24}: {}", outcome, count);
    }
    println!("Time: {:.2}s", elapsed.as_secs_f64());
    println!(
        "Rate: {:.0} transfers/sec",
        completed as f64 / elapsed.as_secs_f64()
    );
    println!("Total before: {}  after: {}", before, after);

    if before != after {
        anyhow::bail!("conservation violated: {} != {}", before, after);
    }
    println!("Conservation holds");

    Ok(())
}

async fn total_balance(store: &dyn LedgerStore, accounts: &[AccountId]) -> anyhow::Result<Money> {
    let mut total = Money::ZERO;
    for id in accounts {
        total = total + store.get_account(*id).await?.balance;
    }
    Ok(total)
}
