//! finance-ledger - Money-movement ledger backend API
//!
//! Transfers, deposits and withdrawals over PostgreSQL-backed accounts,
//! gated by per-account limits and a fraud risk score.

use std::net::SocketAddr;
use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use finance_ledger::api::{self, AppState};
use finance_ledger::audit::{AuditLogService, AuditSink, EventSink, FanoutSink, TracingSink};
use finance_ledger::db;
use finance_ledger::domain::{Clock, SystemClock};
use finance_ledger::jobs::{JobScheduler, JobSchedulerConfig};
use finance_ledger::ledger::{LedgerStore, PgLedgerStore};
use finance_ledger::{Config, LedgerService};

/// Initialize tracing/logging
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "finance_ledger=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    init_tracing();

    let config = Config::from_env()?;
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;

    tracing::info!(environment = %config.environment, "Starting finance-ledger server");
    tracing::info!("Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await?;
    db::verify_connection(&pool).await?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    if !db::check_schema(&pool).await? {
        tracing::error!("Database schema is not complete. Please run migrations.");
        return Err(anyhow::anyhow!("Database schema incomplete"));
    }

    tracing::info!("Database connected successfully");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store: Arc<dyn LedgerStore> = Arc::new(PgLedgerStore::new(pool.clone()));
    let audit = AuditLogService::new(pool.clone());
    let events: Arc<dyn EventSink> = Arc::new(
        FanoutSink::new()
            .with_sink(Arc::new(TracingSink))
            .with_sink(Arc::new(AuditSink::new(audit.clone()))),
    );

    let ledger = LedgerService::new(store.clone(), events.clone(), clock.clone(), &config.ledger);

    let jobs = JobScheduler::new(
        store,
        events,
        clock,
        JobSchedulerConfig {
            pending_expiry_interval: config.ledger.job_interval,
            pending_ttl: chrono::Duration::from_std(config.ledger.pending_ttl)?,
            ..JobSchedulerConfig::default()
        },
    )
    .with_audit(audit)
    .start();

    let app = api::build_router(AppState::new(ledger));

    tracing::info!("Listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("Server shutting down...");
    jobs.abort();
    pool.close().await;
    tracing::info!("Database connections closed. Goodbye!");

    Ok(())
}

/// Shutdown signal handler for graceful shutdown
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown...");
        },
    }
}
