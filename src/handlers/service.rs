//! Ledger service
//!
//! One handle over every operation the API exposes, built from a store, an
//! event sink, a clock and the ledger policy.

use std::net::IpAddr;
use std::sync::Arc;
use uuid::Uuid;

use crate::audit::EventSink;
use crate::config::LedgerConfig;
use crate::domain::{
    Account, AccountId, AccountStatus, Clock, LedgerError, NewAccount, Transaction,
    TransactionId,
};
use crate::ledger::LedgerStore;
use crate::limits::{LimitPolicy, LimitUsage};
use crate::risk::RiskEngine;

use super::shared::HandlerDeps;
use super::{DepositHandler, TransferHandler, WithdrawalHandler};

pub struct LedgerService {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    limits: Arc<LimitPolicy>,
    risk: Arc<RiskEngine>,
    pub transfers: TransferHandler,
    pub deposits: DepositHandler,
    pub withdrawals: WithdrawalHandler,
}

impl LedgerService {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        events: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
        config: &LedgerConfig,
    ) -> Self {
        let deps = HandlerDeps::new(store, events, clock, config);
        Self {
            store: deps.store.clone(),
            clock: deps.clock.clone(),
            limits: deps.limits.clone(),
            risk: deps.risk.clone(),
            transfers: TransferHandler::new(deps.clone()),
            deposits: DepositHandler::new(deps.clone()),
            withdrawals: WithdrawalHandler::new(deps),
        }
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    pub fn risk(&self) -> &RiskEngine {
        &self.risk
    }

    pub async fn open_account(&self, new_account: NewAccount) -> Result<Account, LedgerError> {
        let account = self.store.open_account(new_account).await?;
        tracing::info!(
            account_id = %account.id,
            owner_id = %account.owner_id,
            currency = %account.currency,
            "Account opened"
        );
        Ok(account)
    }

    pub async fn get_account(&self, id: AccountId) -> Result<Account, LedgerError> {
        self.store.get_account(id).await
    }

    pub async fn set_account_status(
        &self,
        id: AccountId,
        status: AccountStatus,
    ) -> Result<Account, LedgerError> {
        let account = self.store.set_account_status(id, status).await?;
        tracing::info!(account_id = %id, status = %status, "Account status changed");
        Ok(account)
    }

    pub async fn limit_usage(&self, id: AccountId) -> Result<LimitUsage, LedgerError> {
        self.limits.usage(id).await
    }

    pub async fn get_transaction(&self, id: &TransactionId) -> Result<Transaction, LedgerError> {
        self.store.get_transaction(id).await
    }

    /// Remember where a user's session came from; feeds the IP-change rule.
    pub async fn record_session(&self, user_id: Uuid, ip: IpAddr) -> Result<(), LedgerError> {
        self.store.record_session(user_id, ip, self.clock.now()).await
    }
}
