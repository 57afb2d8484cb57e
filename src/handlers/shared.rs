//! Pieces every money-moving handler shares: the injected collaborators,
//! amount validation, and how a rolled-back record is persisted as failed.

use std::sync::Arc;

use crate::audit::EventSink;
use crate::config::LedgerConfig;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::{
    AccountId, Clock, LedgerError, LedgerEvent, Money, OperationContext, Transaction,
    TransactionStatus, TransactionType,
};
use crate::ledger::{LedgerScope, LedgerStore};
use crate::limits::{limit_exceeded_event, LimitPolicy};
use crate::risk::RiskEngine;

use super::{MovementCommand, MovementResult};

/// Collaborators injected into every handler
#[derive(Clone)]
pub struct HandlerDeps {
    pub store: Arc<dyn LedgerStore>,
    pub limits: Arc<LimitPolicy>,
    pub risk: Arc<RiskEngine>,
    pub events: Arc<dyn EventSink>,
    pub clock: Arc<dyn Clock>,
    pub max_transaction_amount: Money,
}

impl HandlerDeps {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        events: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
        config: &LedgerConfig,
    ) -> Self {
        Self {
            limits: Arc::new(LimitPolicy::new(store.clone(), clock.clone(), config)),
            risk: Arc::new(RiskEngine::new(store.clone(), clock.clone(), config)),
            store,
            events,
            clock,
            max_transaction_amount: config.max_transaction_amount,
        }
    }

    /// `0 < amount <= max_transaction_amount`
    pub fn validate_amount(&self, amount: Money) -> Result<(), LedgerError> {
        if !amount.is_positive() || amount > self.max_transaction_amount {
            return Err(LedgerError::AmountOutOfRange {
                amount,
                max: self.max_transaction_amount,
            });
        }
        Ok(())
    }

    /// Emit a `LimitExceeded` event if `err` is a limit rejection.
    pub fn report_rejection(&self, err: &LedgerError, context: &OperationContext) {
        if let Some(event) = limit_exceeded_event(err, self.clock.now()) {
            self.events.emit(event, context);
        }
    }

    /// Persist `record` as failed outside any scope and emit `TransferFailed`.
    /// Returns `err` so callers can `return Err(deps.fail(..).await)`.
    pub async fn fail(
        &self,
        mut record: Transaction,
        err: LedgerError,
        context: &OperationContext,
    ) -> LedgerError {
        let now = self.clock.now();
        let reason = err.to_string();

        if let Err(transition) = record.fail(reason.clone(), now) {
            tracing::error!(
                transaction_id = %record.id,
                error = %transition,
                "Cannot mark transaction failed"
            );
            return err;
        }

        if let Err(save) = self.store.save_transaction(&record).await {
            tracing::error!(
                transaction_id = %record.id,
                error = %save,
                "Failed to persist failed transaction"
            );
        }

        tracing::warn!(
            transaction_id = %record.id,
            error_code = err.code(),
            reason = %reason,
            "Transaction failed"
        );
        self.events.emit(
            LedgerEvent::TransferFailed {
                transaction_id: record.id.clone(),
                reason,
                failed_at: now,
            },
            context,
        );
        err
    }
}

/// Why a scope ended without committing
pub(crate) enum ScopeError {
    /// A check said no before anything was written
    Rejected(LedgerError),
    /// Something broke after the record reached `processing`
    Failed(LedgerError),
}

impl From<LedgerError> for ScopeError {
    fn from(err: LedgerError) -> Self {
        ScopeError::Failed(err)
    }
}

/// Stamp `completed`, save, and commit the scope. `record` is only updated
/// once the commit went through.
pub(crate) async fn complete(
    scope: &mut dyn LedgerScope,
    record: &mut Transaction,
    now: DateTime<Utc>,
) -> Result<(), LedgerError> {
    let mut completed = record.clone();
    completed.transition(TransactionStatus::Completed, now)?;
    scope.save_transaction(&completed).await?;
    scope.commit().await?;

    *record = completed;
    Ok(())
}

/// Return the earlier result for a repeated deposit or withdrawal key, or
/// `IdempotencyConflict` if the key was used for something else.
pub(crate) fn replay_movement(
    existing: &Transaction,
    transaction_type: TransactionType,
    command: &MovementCommand,
    key: Uuid,
) -> Result<MovementResult, LedgerError> {
    let (from, to) = movement_legs(transaction_type, command.account_id);
    if !existing.matches_request(transaction_type, from, to, command.amount) {
        return Err(LedgerError::IdempotencyConflict(key));
    }

    tracing::info!(
        transaction_id = %existing.id,
        idempotency_key = %key,
        "Idempotent replay"
    );
    Ok(MovementResult::from_record(existing, command.account_id, true))
}

/// Deposits credit the `to` side, withdrawals debit the `from` side.
pub(crate) fn movement_legs(
    transaction_type: TransactionType,
    account_id: AccountId,
) -> (Option<AccountId>, Option<AccountId>) {
    match transaction_type {
        TransactionType::Withdrawal => (Some(account_id), None),
        _ => (None, Some(account_id)),
    }
}
