//! finance-ledger Library
//!
//! Re-exports modules for integration testing and external use.

pub mod api;
pub mod audit;
pub mod domain;
pub mod handlers;
pub mod jobs;
pub mod ledger;
pub mod limits;
pub mod risk;

// Used mostly by the main.rs binary
pub mod config;
pub mod db;
mod error;

pub use config::{Config, LedgerConfig};
pub use domain::{LedgerError, LedgerEvent, Money, OperationContext};
pub use error::{AppError, AppResult};
pub use handlers::LedgerService;
