//! Configuration module
//!
//! Loads configuration from environment variables.

use chrono::{FixedOffset, Offset, Utc};
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::domain::Money;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Database connection URL
    pub database_url: String,

    /// Maximum database connections in pool
    pub database_max_connections: u32,

    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// Environment (development, production)
    pub environment: String,

    /// Ledger policy
    pub ledger: LedgerConfig,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = env::var("DATABASE_URL")
            .map_err(|_| ConfigError::MissingEnv("DATABASE_URL"))?;

        let database_max_connections = parse_env("DATABASE_MAX_CONNECTIONS", 10)?;

        let host = env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());

        let port = parse_env("PORT", 3000)?;

        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        Ok(Self {
            database_url,
            database_max_connections,
            host,
            port,
            environment,
            ledger: LedgerConfig::from_env()?,
        })
    }

    /// Check if running in production
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

/// Limits, risk ceilings and timing knobs shared by the ledger components.
/// Monetary values are read from the environment as minor units.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Single-transaction ceiling
    pub max_transaction_amount: Money,

    /// Daily limit for accounts without their own
    pub default_daily_limit: Money,

    /// Monthly limit for accounts without their own
    pub default_monthly_limit: Money,

    /// 24-hour outgoing ceiling enforced by the risk hard stop
    pub daily_hard_ceiling: Money,

    /// More transactions than this in 24 hours is a hard stop
    pub daily_transaction_cap: u32,

    /// Bound on risk-history and limit lookups
    pub check_timeout: Duration,

    /// Offset used for calendar day/month boundaries and off-hours scoring
    pub utc_offset: FixedOffset,

    /// Age after which a pending transaction is expired
    pub pending_ttl: Duration,

    /// Background job tick
    pub job_interval: Duration,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_transaction_amount: Money::from_major(1_000_000),
            default_daily_limit: Money::from_major(10_000),
            default_monthly_limit: Money::from_major(100_000),
            daily_hard_ceiling: Money::from_major(50_000),
            daily_transaction_cap: 20,
            check_timeout: Duration::from_millis(2_000),
            utc_offset: utc(),
            pending_ttl: Duration::from_secs(24 * 60 * 60),
            job_interval: Duration::from_secs(60),
        }
    }
}

impl LedgerConfig {
    /// Load ledger policy from environment variables, falling back to defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let max_transaction_amount = Money::from_minor(parse_env(
            "MAX_TRANSACTION_AMOUNT",
            defaults.max_transaction_amount.minor(),
        )?);
        let default_daily_limit = Money::from_minor(parse_env(
            "DEFAULT_DAILY_LIMIT",
            defaults.default_daily_limit.minor(),
        )?);
        let default_monthly_limit = Money::from_minor(parse_env(
            "DEFAULT_MONTHLY_LIMIT",
            defaults.default_monthly_limit.minor(),
        )?);
        let daily_hard_ceiling = Money::from_minor(parse_env(
            "RISK_DAILY_HARD_CEILING",
            defaults.daily_hard_ceiling.minor(),
        )?);

        for (name, value) in [
            ("MAX_TRANSACTION_AMOUNT", max_transaction_amount),
            ("DEFAULT_DAILY_LIMIT", default_daily_limit),
            ("DEFAULT_MONTHLY_LIMIT", default_monthly_limit),
            ("RISK_DAILY_HARD_CEILING", daily_hard_ceiling),
        ] {
            if !value.is_positive() {
                return Err(ConfigError::InvalidValue(name));
            }
        }

        let check_timeout = Duration::from_millis(parse_env("CHECK_TIMEOUT_MS", 2_000u64)?);

        let offset_minutes: i32 = parse_env("LEDGER_UTC_OFFSET_MINUTES", 0)?;
        let utc_offset = offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .ok_or(ConfigError::InvalidValue("LEDGER_UTC_OFFSET_MINUTES"))?;

        let pending_ttl = Duration::from_secs(60 * parse_env("PENDING_TTL_MINUTES", 24 * 60u64)?);
        let job_interval = Duration::from_secs(parse_env("JOB_INTERVAL_SECONDS", 60u64)?);
        if job_interval.is_zero() {
            return Err(ConfigError::InvalidValue("JOB_INTERVAL_SECONDS"));
        }

        Ok(Self {
            max_transaction_amount,
            default_daily_limit,
            default_monthly_limit,
            daily_hard_ceiling,
            daily_transaction_cap: defaults.daily_transaction_cap,
            check_timeout,
            utc_offset,
            pending_ttl,
            job_interval,
        })
    }

    pub fn with_default_daily_limit(mut self, limit: Money) -> Self {
        self.default_daily_limit = limit;
        self
    }

    pub fn with_check_timeout(mut self, timeout: Duration) -> Self {
        self.check_timeout = timeout;
        self
    }

    pub fn with_utc_offset(mut self, offset: FixedOffset) -> Self {
        self.utc_offset = offset;
        self
    }
}

fn utc() -> FixedOffset {
    Utc.fix()
}

/// Read and parse an optional variable
fn parse_env<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue(name)),
        Err(_) => Ok(default),
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnv(&'static str),

    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(&'static str),
}
