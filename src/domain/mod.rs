//! Domain module
//!
//! Core ledger types: money, accounts, transaction records, errors, events.

pub mod account;
pub mod clock;
pub mod context;
pub mod error;
pub mod events;
pub mod money;
pub mod transaction;

pub use account::{Account, AccountId, AccountStatus, NewAccount};
pub use clock::{Clock, FixedClock, SystemClock};
pub use context::OperationContext;
pub use error::{ErrorCategory, LedgerError};
pub use events::{LedgerEvent, LimitPeriod};
pub use money::{Money, MoneyError};
pub use transaction::{
    LegBalances, Transaction, TransactionId, TransactionStatus, TransactionType,
};
