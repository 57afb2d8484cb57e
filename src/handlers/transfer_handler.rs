//! Transfer Handler
//!
//! Moves funds between two accounts as one indivisible unit:
//! 1. validate the request and resolve idempotent replays
//! 2. score it with the risk engine; a block or hard stop ends here
//! 3. lock both accounts (lowest id first) and re-check the key
//! 4. status, currency, balance and limit checks under the lock
//! 5. record `processing`, debit, credit, record `completed`, commit
//!
//! A rejection in steps 2 to 4 persists nothing, and a stored `pending`
//! record stays `pending`. An error in step 5 rolls the scope back and the
//! record is persisted as `failed`. Events go out only after the scope has
//! been released.

use uuid::Uuid;

use crate::domain::{
    Account, AccountStatus, LedgerError, LedgerEvent, LegBalances, Money, OperationContext,
    Transaction, TransactionId, TransactionStatus, TransactionType,
};
use crate::ledger::{LedgerScope, LockSet};
use crate::risk::{CandidateTransfer, RiskAssessment};

use super::shared::{complete, HandlerDeps, ScopeError};
use super::{TransferCommand, TransferResult};

// =========================================================================
// TransferHandler
// =========================================================================

pub struct TransferHandler {
    deps: HandlerDeps,
}

impl TransferHandler {
    pub fn new(deps: HandlerDeps) -> Self {
        Self { deps }
    }

    /// Execute a transfer immediately
    pub async fn execute(
        &self,
        command: TransferCommand,
        idempotency_key: Option<Uuid>,
        context: &OperationContext,
    ) -> Result<TransferResult, LedgerError> {
        self.validate(&command)?;

        if let Some(result) = self.replay(&command, idempotency_key).await? {
            return Ok(result);
        }

        let assessment = self.gate(&command, context).await?;

        let mut record = Transaction::new(
            TransactionType::Transfer,
            Some(command.from_account),
            Some(command.to_account),
            command.amount,
            String::new(),
            self.deps.clock.now(),
        )
        .with_idempotency_key(idempotency_key)
        .with_description(command.description.clone())
        .with_initiator(context.request_user_id)
        .with_fraud_score(assessment.score);

        match self.commit(&mut record, &command, false).await {
            Ok(None) => Ok(self.completed(&record, &command, context)),
            Ok(Some(existing)) => {
                let key = existing.idempotency_key.unwrap_or_default();
                replay_result(&existing, &command, key)
            }
            Err(ScopeError::Rejected(err)) => {
                self.reject(&err, &command, context);
                Err(err)
            }
            Err(ScopeError::Failed(err)) => Err(self.deps.fail(record, err, context).await),
        }
    }

    /// Create a `pending` transfer to be executed later
    pub async fn submit(
        &self,
        command: TransferCommand,
        idempotency_key: Option<Uuid>,
        context: &OperationContext,
    ) -> Result<TransferResult, LedgerError> {
        self.validate(&command)?;

        if let Some(result) = self.replay(&command, idempotency_key).await? {
            return Ok(result);
        }

        let source = self.deps.store.get_account(command.from_account).await?;
        let destination = self.deps.store.get_account(command.to_account).await?;
        check_currency(&source, &destination)?;

        let record = Transaction::new(
            TransactionType::Transfer,
            Some(command.from_account),
            Some(command.to_account),
            command.amount,
            source.currency,
            self.deps.clock.now(),
        )
        .with_idempotency_key(idempotency_key)
        .with_description(command.description.clone())
        .with_initiator(context.request_user_id);

        self.deps.store.save_transaction(&record).await?;

        tracing::info!(
            transaction_id = %record.id,
            from_account = %command.from_account,
            to_account = %command.to_account,
            amount = %command.amount,
            "Transfer submitted"
        );

        Ok(TransferResult::from_record(
            &record,
            command.from_account,
            command.to_account,
            false,
        ))
    }

    /// Run a `pending` transfer through the full protocol. Risk and limits
    /// are checked as of now; the record is then claimed `pending ->
    /// processing` with a compare-and-set inside the locked scope, so a
    /// concurrent cancel either wins or fails with `StateConflict`. A
    /// rejection leaves the record `pending`.
    pub async fn execute_pending(
        &self,
        id: &TransactionId,
        context: &OperationContext,
    ) -> Result<TransferResult, LedgerError> {
        let mut record = self.deps.store.get_transaction(id).await?;
        let command = match (record.transaction_type, record.from_account, record.to_account) {
            (TransactionType::Transfer, Some(from), Some(to)) => TransferCommand {
                from_account: from,
                to_account: to,
                amount: record.amount,
                description: record.description.clone(),
            },
            _ => return Err(LedgerError::TransactionNotFound(id.clone())),
        };
        if record.status != TransactionStatus::Pending {
            return Err(LedgerError::StateConflict {
                transaction_id: id.clone(),
                from: record.status,
                to: TransactionStatus::Processing,
            });
        }

        let assessment = self.gate(&command, context).await?;
        record.fraud_score = assessment.score;

        match self.commit(&mut record, &command, true).await {
            Ok(None) => Ok(self.completed(&record, &command, context)),
            Ok(Some(existing)) => Err(LedgerError::IdempotencyConflict(
                existing.idempotency_key.unwrap_or_default(),
            )),
            Err(ScopeError::Rejected(err)) => {
                self.reject(&err, &command, context);
                Err(err)
            }
            // lost the claim to a cancel or expiry; nothing was applied
            Err(ScopeError::Failed(err @ LedgerError::StateConflict { .. })) => Err(err),
            Err(ScopeError::Failed(err)) => Err(self.deps.fail(record, err, context).await),
        }
    }

    /// Cancel a transfer that has not started processing
    pub async fn cancel_transaction(
        &self,
        id: &TransactionId,
        context: &OperationContext,
    ) -> Result<Transaction, LedgerError> {
        let now = self.deps.clock.now();
        let record = self
            .deps
            .store
            .transition_transaction(id, TransactionStatus::Pending, TransactionStatus::Cancelled, now)
            .await?;

        tracing::info!(
            transaction_id = %id,
            cancelled_by = ?context.request_user_id,
            "Transaction cancelled"
        );
        self.deps.events.emit(
            LedgerEvent::TransactionCancelled {
                transaction_id: id.clone(),
                cancelled_by: context.request_user_id,
                cancelled_at: now,
            },
            context,
        );

        Ok(record)
    }

    /// Advisory pre-check: score the transfer without touching any balance
    pub async fn assess_risk(
        &self,
        command: &TransferCommand,
        context: &OperationContext,
    ) -> Result<RiskAssessment, LedgerError> {
        self.validate(command)?;
        self.deps.risk.assess(&candidate(command, context)).await
    }

    // =========================================================================
    // Protocol steps
    // =========================================================================

    fn validate(&self, command: &TransferCommand) -> Result<(), LedgerError> {
        if command.from_account == command.to_account {
            return Err(LedgerError::SameAccountTransfer);
        }
        self.deps.validate_amount(command.amount)
    }

    async fn replay(
        &self,
        command: &TransferCommand,
        idempotency_key: Option<Uuid>,
    ) -> Result<Option<TransferResult>, LedgerError> {
        let Some(key) = idempotency_key else {
            return Ok(None);
        };
        match self.deps.store.find_by_idempotency_key(key).await? {
            Some(existing) => replay_result(&existing, command, key).map(Some),
            None => Ok(None),
        }
    }

    /// Score the transfer; blocked and hard-stopped transfers never reach a scope.
    async fn gate(
        &self,
        command: &TransferCommand,
        context: &OperationContext,
    ) -> Result<RiskAssessment, LedgerError> {
        let assessment = self.deps.risk.assess(&candidate(command, context)).await?;

        if assessment.is_rejected() {
            let factors = assessment.rejection_factors();
            tracing::warn!(
                from_account = %command.from_account,
                to_account = %command.to_account,
                amount = %command.amount,
                score = assessment.score,
                factors = ?factors,
                initiated_by = ?context.request_user_id,
                client_ip = ?context.client_ip,
                "Transfer blocked by risk gate"
            );
            self.deps.events.emit(
                LedgerEvent::TransferBlocked {
                    from_account: command.from_account,
                    to_account: command.to_account,
                    amount: command.amount,
                    score: assessment.score,
                    factors: factors.clone(),
                    initiated_by: context.request_user_id,
                    client_ip: context.client_ip.map(|ip| ip.to_string()),
                    blocked_at: self.deps.clock.now(),
                },
                context,
            );
            return Err(LedgerError::TransactionBlocked {
                score: assessment.score,
                factors,
            });
        }

        if !assessment.advisories.is_empty() {
            tracing::info!(
                from_account = %command.from_account,
                advisories = ?assessment.advisories,
                "Risk advisories raised"
            );
        }

        Ok(assessment)
    }

    /// Everything that happens under the account locks. Returns the record
    /// that already owns the idempotency key if another request got there
    /// first. `claim_pending` is set when `record` is a stored `pending`
    /// record rather than a new one.
    async fn commit(
        &self,
        record: &mut Transaction,
        command: &TransferCommand,
        claim_pending: bool,
    ) -> Result<Option<Transaction>, ScopeError> {
        let locks = LockSet::pair(command.from_account, command.to_account);
        let mut scope = self
            .deps
            .store
            .begin(locks)
            .await
            .map_err(ScopeError::Rejected)?;

        if let Some(key) = record.idempotency_key {
            let existing = scope
                .find_by_idempotency_key(key)
                .await
                .map_err(ScopeError::Rejected)?;
            if let Some(existing) = existing.filter(|e| e.id != record.id) {
                return Ok(Some(existing));
            }
        }

        let source = scope
            .account(command.from_account)
            .await
            .map_err(ScopeError::Rejected)?;
        let destination = scope
            .account(command.to_account)
            .await
            .map_err(ScopeError::Rejected)?;

        self.check(scope.as_mut(), &source, &destination, command.amount)
            .await
            .map_err(ScopeError::Rejected)?;

        record.currency = source.currency.clone();
        apply_transfer(
            scope.as_mut(),
            record,
            &source,
            &destination,
            claim_pending,
            self.deps.clock.now(),
        )
        .await?;

        Ok(None)
    }

    /// Pre-mutation checks; any failure here leaves no trace.
    async fn check(
        &self,
        scope: &mut dyn LedgerScope,
        source: &Account,
        destination: &Account,
        amount: Money,
    ) -> Result<(), LedgerError> {
        source.ensure_status(AccountStatus::Active)?;
        destination.ensure_status(AccountStatus::Active)?;
        check_currency(source, destination)?;

        if source.available_balance < amount {
            return Err(LedgerError::InsufficientFunds {
                account_id: source.id,
                requested: amount,
                available: source.available_balance,
            });
        }

        self.deps.limits.check(scope, source, amount).await
    }

    fn completed(
        &self,
        record: &Transaction,
        command: &TransferCommand,
        context: &OperationContext,
    ) -> TransferResult {
        let completed_at = record.completed_at.unwrap_or_else(|| self.deps.clock.now());

        tracing::info!(
            transaction_id = %record.id,
            from_account = %command.from_account,
            to_account = %command.to_account,
            amount = %command.amount,
            fraud_score = record.fraud_score,
            "Transfer completed"
        );
        self.deps.events.emit(
            LedgerEvent::TransferCompleted {
                transaction_id: record.id.clone(),
                from_account: command.from_account,
                to_account: command.to_account,
                amount: record.amount,
                fraud_score: record.fraud_score,
                initiated_by: record.initiated_by,
                completed_at,
            },
            context,
        );

        TransferResult::from_record(record, command.from_account, command.to_account, false)
    }

    fn reject(&self, err: &LedgerError, command: &TransferCommand, context: &OperationContext) {
        tracing::info!(
            from_account = %command.from_account,
            to_account = %command.to_account,
            amount = %command.amount,
            error_code = err.code(),
            "Transfer rejected"
        );
        self.deps.report_rejection(err, context);
    }
}

fn candidate(command: &TransferCommand, context: &OperationContext) -> CandidateTransfer {
    CandidateTransfer {
        from_account: command.from_account,
        to_account: Some(command.to_account),
        amount: command.amount,
        client_ip: context.client_ip,
    }
}

fn check_currency(source: &Account, destination: &Account) -> Result<(), LedgerError> {
    if source.currency != destination.currency {
        return Err(LedgerError::CurrencyMismatch {
            expected: source.currency.clone(),
            found: destination.currency.clone(),
        });
    }
    Ok(())
}

fn replay_result(
    existing: &Transaction,
    command: &TransferCommand,
    key: Uuid,
) -> Result<TransferResult, LedgerError> {
    if !existing.matches_request(
        TransactionType::Transfer,
        Some(command.from_account),
        Some(command.to_account),
        command.amount,
    ) {
        return Err(LedgerError::IdempotencyConflict(key));
    }

    tracing::info!(
        transaction_id = %existing.id,
        idempotency_key = %key,
        "Idempotent replay"
    );
    Ok(TransferResult::from_record(
        existing,
        command.from_account,
        command.to_account,
        true,
    ))
}

/// Claim or stamp `processing`, debit, credit, record both legs' balances,
/// mark `completed`, commit.
async fn apply_transfer(
    scope: &mut dyn LedgerScope,
    record: &mut Transaction,
    source: &Account,
    destination: &Account,
    claim_pending: bool,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<(), ScopeError> {
    let amount = record.amount;

    if claim_pending {
        scope
            .transition_transaction(
                &record.id,
                TransactionStatus::Pending,
                TransactionStatus::Processing,
                now,
            )
            .await
            .map_err(ScopeError::Rejected)?;
    }
    record.transition(TransactionStatus::Processing, now)?;

    let source_after = scope
        .adjust_balance(source.id, -amount, AccountStatus::Active, now)
        .await?;
    let destination_after = scope
        .adjust_balance(destination.id, amount, AccountStatus::Active, now)
        .await?;
    record.from_balances = Some(LegBalances {
        before: source.balance,
        after: source_after,
    });
    record.to_balances = Some(LegBalances {
        before: destination.balance,
        after: destination_after,
    });
    scope.save_transaction(record).await?;

    complete(scope, record, now).await?;
    Ok(())
}
