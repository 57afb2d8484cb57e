//! Withdrawal Handler
//!
//! Debits funds out of one active account. Withdrawals are checked against
//! the available balance and count toward the daily and monthly limits like
//! any other outgoing movement.

use uuid::Uuid;

use crate::domain::{
    Account, AccountStatus, LedgerError, LedgerEvent, LegBalances, Money, OperationContext,
    Transaction, TransactionStatus, TransactionType,
};
use crate::ledger::{LedgerScope, LockSet};

use super::shared::{complete, replay_movement, HandlerDeps, ScopeError};
use super::{MovementCommand, MovementResult};

// =========================================================================
// WithdrawalHandler
// =========================================================================

pub struct WithdrawalHandler {
    deps: HandlerDeps,
}

impl WithdrawalHandler {
    pub fn new(deps: HandlerDeps) -> Self {
        Self { deps }
    }

    pub async fn execute(
        &self,
        command: MovementCommand,
        idempotency_key: Option<Uuid>,
        context: &OperationContext,
    ) -> Result<MovementResult, LedgerError> {
        self.deps.validate_amount(command.amount)?;

        if let Some(key) = idempotency_key {
            if let Some(existing) = self.deps.store.find_by_idempotency_key(key).await? {
                return replay_movement(&existing, TransactionType::Withdrawal, &command, key);
            }
        }

        let mut record = Transaction::new(
            TransactionType::Withdrawal,
            Some(command.account_id),
            None,
            command.amount,
            String::new(),
            self.deps.clock.now(),
        )
        .with_idempotency_key(idempotency_key)
        .with_description(command.description.clone())
        .with_initiator(context.request_user_id);

        match self.commit(&mut record, &command).await {
            Ok(None) => {}
            Ok(Some(existing)) => {
                let key = existing.idempotency_key.unwrap_or_default();
                return replay_movement(&existing, TransactionType::Withdrawal, &command, key);
            }
            Err(ScopeError::Rejected(err)) => {
                tracing::info!(
                    account_id = %command.account_id,
                    amount = %command.amount,
                    error_code = err.code(),
                    "Withdrawal rejected"
                );
                self.deps.report_rejection(&err, context);
                return Err(err);
            }
            Err(ScopeError::Failed(err)) => return Err(self.deps.fail(record, err, context).await),
        }

        tracing::info!(
            transaction_id = %record.id,
            account_id = %command.account_id,
            amount = %command.amount,
            "Withdrawal completed"
        );
        self.deps.events.emit(
            LedgerEvent::WithdrawalCompleted {
                transaction_id: record.id.clone(),
                account_id: command.account_id,
                amount: record.amount,
                completed_at: record.completed_at.unwrap_or_else(|| self.deps.clock.now()),
            },
            context,
        );

        Ok(MovementResult::from_record(&record, command.account_id, false))
    }

    async fn commit(
        &self,
        record: &mut Transaction,
        command: &MovementCommand,
    ) -> Result<Option<Transaction>, ScopeError> {
        let mut scope = self
            .deps
            .store
            .begin(LockSet::single(command.account_id))
            .await
            .map_err(ScopeError::Rejected)?;

        if let Some(key) = record.idempotency_key {
            let existing = scope
                .find_by_idempotency_key(key)
                .await
                .map_err(ScopeError::Rejected)?;
            if existing.is_some() {
                return Ok(existing);
            }
        }

        let account = scope
            .account(command.account_id)
            .await
            .map_err(ScopeError::Rejected)?;
        self.check(scope.as_mut(), &account, command.amount)
            .await
            .map_err(ScopeError::Rejected)?;

        let now = self.deps.clock.now();
        record.currency = account.currency.clone();
        record.transition(TransactionStatus::Processing, now)?;
        let after = scope
            .adjust_balance(command.account_id, -command.amount, AccountStatus::Active, now)
            .await?;
        record.from_balances = Some(LegBalances {
            before: account.balance,
            after,
        });
        scope.save_transaction(record).await?;
        complete(scope.as_mut(), record, now).await?;

        Ok(None)
    }

    async fn check(
        &self,
        scope: &mut dyn LedgerScope,
        account: &Account,
        amount: Money,
    ) -> Result<(), LedgerError> {
        account.ensure_status(AccountStatus::Active)?;
        if account.available_balance < amount {
            return Err(LedgerError::InsufficientFunds {
                account_id: account.id,
                requested: amount,
                available: account.available_balance,
            });
        }
        self.deps.limits.check(scope, account, amount).await
    }
}
