//! Deposit Handler
//!
//! Credits funds from outside the ledger into one active account. Deposits
//! are not risk scored and do not count against transfer limits.

use uuid::Uuid;

use crate::domain::{
    AccountStatus, LedgerError, LedgerEvent, LegBalances, OperationContext, Transaction,
    TransactionStatus, TransactionType,
};
use crate::ledger::LockSet;

use super::shared::{complete, replay_movement, HandlerDeps, ScopeError};
use super::{MovementCommand, MovementResult};

// =========================================================================
// DepositHandler
// =========================================================================

pub struct DepositHandler {
    deps: HandlerDeps,
}

impl DepositHandler {
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
                return replay_movement(&existing, TransactionType::Deposit, &command, key);
            }
        }

        let mut record = Transaction::new(
            TransactionType::Deposit,
            None,
            Some(command.account_id),
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
                return replay_movement(&existing, TransactionType::Deposit, &command, key);
            }
            Err(ScopeError::Rejected(err)) => return Err(err),
            Err(ScopeError::Failed(err)) => return Err(self.deps.fail(record, err, context).await),
        }

        tracing::info!(
            transaction_id = %record.id,
            account_id = %command.account_id,
            amount = %command.amount,
            "Deposit completed"
        );
        self.deps.events.emit(
            LedgerEvent::DepositCompleted {
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
        account
            .ensure_status(AccountStatus::Active)
            .map_err(ScopeError::Rejected)?;
        let after = account
            .balance
            .checked_add(command.amount)
            .ok_or(LedgerError::AmountOutOfRange {
                amount: command.amount,
                max: self.deps.max_transaction_amount,
            })
            .map_err(ScopeError::Rejected)?;

        let now = self.deps.clock.now();
        record.currency = account.currency.clone();
        record.transition(TransactionStatus::Processing, now)?;
        record.to_balances = Some(LegBalances {
            before: account.balance,
            after,
        });
        scope.save_transaction(record).await?;
        scope
            .adjust_balance(command.account_id, command.amount, AccountStatus::Active, now)
            .await?;
        complete(scope.as_mut(), record, now).await?;

        Ok(None)
    }
}
