//! Command Handlers module
//!
//! Handlers that orchestrate money movements. Each one coordinates the
//! ledger store, the limit policy, the risk engine and the event sink.

mod commands;
mod deposit_handler;
mod service;
mod shared;
mod transfer_handler;
mod withdrawal_handler;

#[cfg(test)]
mod tests;

pub use commands::*;
pub use deposit_handler::DepositHandler;
pub use service::LedgerService;
pub use shared::HandlerDeps;
pub use transfer_handler::TransferHandler;
pub use withdrawal_handler::WithdrawalHandler;
