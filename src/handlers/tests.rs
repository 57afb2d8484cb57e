//! Handler tests against the in-process store
//!
//! Every test builds a fresh `MemoryLedgerStore` behind a fixed clock and
//! collects emitted events through a channel sink.

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{TimeZone, Utc};
    use tokio::sync::mpsc::UnboundedReceiver;
    use uuid::Uuid;

    use crate::audit::ChannelSink;
    use crate::config::LedgerConfig;
    use crate::domain::{
        AccountId, AccountStatus, FixedClock, LedgerError, LedgerEvent, Money, NewAccount,
        OperationContext, TransactionStatus, TransactionType,
    };
    use crate::handlers::{LedgerService, MovementCommand, TransferCommand};
    use crate::ledger::{LedgerStore, MemoryLedgerStore};

    struct Harness {
        service: LedgerService,
        store: Arc<MemoryLedgerStore>,
        events: UnboundedReceiver<LedgerEvent>,
    }

    fn harness(config: LedgerConfig) -> Harness {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap(),
        ));
        let store = Arc::new(MemoryLedgerStore::with_clock(clock.clone()));
        let (sink, events) = ChannelSink::new();
        let service = LedgerService::new(store.clone(), Arc::new(sink), clock, &config);
        Harness {
            service,
            store,
            events,
        }
    }

    impl Harness {
        async fn open(&self, major: i64) -> AccountId {
            self.service
                .open_account(
                    NewAccount::new(Uuid::new_v4(), "USD").with_balance(Money::from_major(major)),
                )
                .await
                .unwrap()
                .id
        }

        async fn balance(&self, id: AccountId) -> Money {
            self.service.get_account(id).await.unwrap().balance
        }

        fn drain(&mut self) -> Vec<LedgerEvent> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                out.push(event);
            }
            out
        }
    }

    // =========================================================================
    // Deposits
    // =========================================================================

    #[tokio::test]
    async fn test_deposit_credits_account() {
        let mut h = harness(LedgerConfig::default());
        let account = h.open(0).await;

        let result = h
            .service
            .deposits
            .execute(
                MovementCommand::new(account, Money::from_major(250)).with_description("payroll"),
                None,
                &OperationContext::new(),
            )
            .await
            .unwrap();

        assert_eq!(result.status, TransactionStatus::Completed);
        assert_eq!(result.balance_after, Some(Money::from_major(250)));
        assert_eq!(h.balance(account).await, Money::from_major(250));

        let record = h.service.get_transaction(&result.transaction_id).await.unwrap();
        assert_eq!(record.transaction_type, TransactionType::Deposit);
        assert_eq!(record.currency, "USD");
        assert!(record.completed_at.is_some());

        let events = h.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type(), "DepositCompleted");
    }

    #[tokio::test]
    async fn test_deposit_into_frozen_account_rejected() {
        let h = harness(LedgerConfig::default());
        let account = h.open(10).await;
        h.service
            .set_account_status(account, AccountStatus::Frozen)
            .await
            .unwrap();

        let err = h
            .service
            .deposits
            .execute(
                MovementCommand::new(account, Money::from_major(5)),
                None,
                &OperationContext::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            LedgerError::AccountNotActive { status: AccountStatus::Frozen, .. }
        ));
        assert!(h.store.transactions().await.is_empty());
    }

    #[tokio::test]
    async fn test_deposit_replay_and_conflict() {
        let h = harness(LedgerConfig::default());
        let account = h.open(0).await;
        let key = Uuid::new_v4();
        let ctx = OperationContext::new();

        let first = h
            .service
            .deposits
            .execute(MovementCommand::new(account, Money::from_major(40)), Some(key), &ctx)
            .await
            .unwrap();
        let replay = h
            .service
            .deposits
            .execute(MovementCommand::new(account, Money::from_major(40)), Some(key), &ctx)
            .await
            .unwrap();

        assert!(replay.replayed);
        assert_eq!(replay.transaction_id, first.transaction_id);
        assert_eq!(h.balance(account).await, Money::from_major(40));

        let err = h
            .service
            .deposits
            .execute(MovementCommand::new(account, Money::from_major(41)), Some(key), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::IdempotencyConflict(k) if k == key));
    }

    // =========================================================================
    // Withdrawals
    // =========================================================================

    #[tokio::test]
    async fn test_withdrawal_overdraft_persists_nothing() {
        let h = harness(LedgerConfig::default());
        let account = h.open(50).await;

        let err = h
            .service
            .withdrawals
            .execute(
                MovementCommand::new(account, Money::from_major(51)),
                None,
                &OperationContext::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, LedgerError::InsufficientFunds { .. }));
        assert_eq!(h.balance(account).await, Money::from_major(50));
        assert!(h.store.transactions().await.is_empty());
    }

    #[tokio::test]
    async fn test_withdrawals_count_toward_daily_limit() {
        let mut h = harness(
            LedgerConfig::default().with_default_daily_limit(Money::from_major(100)),
        );
        let account = h.open(500).await;
        let ctx = OperationContext::new();

        h.service
            .withdrawals
            .execute(MovementCommand::new(account, Money::from_major(80)), None, &ctx)
            .await
            .unwrap();

        let err = h
            .service
            .withdrawals
            .execute(MovementCommand::new(account, Money::from_major(30)), None, &ctx)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::DailyLimitExceeded { used, .. } if used == Money::from_major(80)
        ));

        let usage = h.service.limit_usage(account).await.unwrap();
        assert_eq!(usage.daily_remaining, Money::from_major(20));

        let types: Vec<_> = h.drain().iter().map(|e| e.event_type()).collect();
        assert_eq!(types, vec!["WithdrawalCompleted", "LimitExceeded"]);
    }

    // =========================================================================
    // Transfers
    // =========================================================================

    #[tokio::test]
    async fn test_transfer_records_both_legs() {
        let mut h = harness(LedgerConfig::default());
        let from = h.open(500).await;
        let to = h.open(0).await;

        let result = h
            .service
            .transfers
            .execute(
                TransferCommand::new(from, to, Money::from_major(120)),
                None,
                &OperationContext::new(),
            )
            .await
            .unwrap();

        let record = h.service.get_transaction(&result.transaction_id).await.unwrap();
        assert_eq!(record.status, TransactionStatus::Completed);
        assert_eq!(record.from_balances.unwrap().after, Money::from_major(380));
        assert_eq!(record.to_balances.unwrap().after, Money::from_major(120));
        assert!(record.processed_at.is_some());

        let events = h.drain();
        assert!(matches!(
            events.as_slice(),
            [LedgerEvent::TransferCompleted { fraud_score: 15, .. }]
        ));
    }

    #[tokio::test]
    async fn test_same_account_rejected_before_anything() {
        let h = harness(LedgerConfig::default());
        let account = h.open(10).await;

        let err = h
            .service
            .transfers
            .execute(
                TransferCommand::new(account, account, Money::from_major(1)),
                None,
                &OperationContext::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::SameAccountTransfer));
    }

    #[tokio::test]
    async fn test_amount_bounds() {
        let h = harness(LedgerConfig::default());
        let from = h.open(10).await;
        let to = h.open(0).await;
        let ctx = OperationContext::new();

        for amount in [Money::ZERO, Money::from_minor(-1), Money::from_major(1_000_001)] {
            let err = h
                .service
                .transfers
                .execute(TransferCommand::new(from, to, amount), None, &ctx)
                .await
                .unwrap_err();
            assert!(matches!(err, LedgerError::AmountOutOfRange { .. }));
        }
    }

    #[tokio::test]
    async fn test_currency_mismatch() {
        let h = harness(LedgerConfig::default());
        let from = h.open(10).await;
        let to = h
            .service
            .open_account(NewAccount::new(Uuid::new_v4(), "EUR"))
            .await
            .unwrap()
            .id;

        let err = h
            .service
            .transfers
            .execute(
                TransferCommand::new(from, to, Money::from_major(1)),
                None,
                &OperationContext::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::CurrencyMismatch { .. }));
        assert_eq!(h.balance(from).await, Money::from_major(10));
    }

    #[tokio::test]
    async fn test_hard_ceiling_blocks_and_reports() {
        let mut h = harness(LedgerConfig::default());
        let from = h.open(60_000).await;
        let to = h.open(0).await;

        let err = h
            .service
            .transfers
            .execute(
                TransferCommand::new(from, to, Money::from_major(50_001)),
                None,
                &OperationContext::new(),
            )
            .await
            .unwrap_err();

        match err {
            LedgerError::TransactionBlocked { score, factors } => {
                assert!(score < 70);
                assert!(factors.iter().any(|f| f.contains("24-hour outgoing total")));
            }
            other => panic!("expected TransactionBlocked, got {:?}", other),
        }
        assert!(h.store.transactions().await.is_empty());

        let events = h.drain();
        assert!(matches!(events.as_slice(), [LedgerEvent::TransferBlocked { .. }]));
    }

    #[tokio::test]
    async fn test_assess_risk_is_read_only() {
        let h = harness(LedgerConfig::default());
        let from = h.open(100).await;
        let to = h.open(0).await;

        let assessment = h
            .service
            .transfers
            .assess_risk(
                &TransferCommand::new(from, to, Money::from_major(2_000)),
                &OperationContext::new(),
            )
            .await
            .unwrap();

        assert_eq!(assessment.score, 15);
        assert_eq!(assessment.advisories, vec!["round amount".to_string()]);
        assert_eq!(h.balance(from).await, Money::from_major(100));
        assert!(h.store.transactions().await.is_empty());
    }

    // =========================================================================
    // Pending transfers
    // =========================================================================

    #[tokio::test]
    async fn test_submit_then_execute_pending() {
        let mut h = harness(LedgerConfig::default());
        let from = h.open(300).await;
        let to = h.open(0).await;
        let ctx = OperationContext::new();

        let submitted = h
            .service
            .transfers
            .submit(TransferCommand::new(from, to, Money::from_major(75)), None, &ctx)
            .await
            .unwrap();
        assert_eq!(submitted.status, TransactionStatus::Pending);
        assert_eq!(h.balance(from).await, Money::from_major(300));

        let executed = h
            .service
            .transfers
            .execute_pending(&submitted.transaction_id, &ctx)
            .await
            .unwrap();
        assert_eq!(executed.transaction_id, submitted.transaction_id);
        assert_eq!(executed.status, TransactionStatus::Completed);
        assert_eq!(h.balance(from).await, Money::from_major(225));
        assert_eq!(h.balance(to).await, Money::from_major(75));

        let again = h
            .service
            .transfers
            .execute_pending(&submitted.transaction_id, &ctx)
            .await
            .unwrap_err();
        assert!(matches!(again, LedgerError::StateConflict { .. }));

        let types: Vec<_> = h.drain().iter().map(|e| e.event_type()).collect();
        assert_eq!(types, vec!["TransferCompleted"]);
    }

    #[tokio::test]
    async fn test_pending_rejection_leaves_record_pending() {
        let mut h = harness(LedgerConfig::default());
        let from = h.open(10).await;
        let to = h.open(0).await;
        let ctx = OperationContext::new();
        let key = Uuid::new_v4();

        let submitted = h
            .service
            .transfers
            .submit(TransferCommand::new(from, to, Money::from_major(20)), Some(key), &ctx)
            .await
            .unwrap();

        let err = h
            .service
            .transfers
            .execute_pending(&submitted.transaction_id, &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientFunds { .. }));

        let record = h
            .service
            .get_transaction(&submitted.transaction_id)
            .await
            .unwrap();
        assert_eq!(record.status, TransactionStatus::Pending);
        assert!(record.processed_at.is_none());
        assert!(record.failure_reason.is_none());
        assert_eq!(record.idempotency_key, Some(key));
        assert!(h.drain().is_empty());

        // funded later, the same record goes through
        h.service
            .deposits
            .execute(MovementCommand::new(from, Money::from_major(15)), None, &ctx)
            .await
            .unwrap();
        let executed = h
            .service
            .transfers
            .execute_pending(&submitted.transaction_id, &ctx)
            .await
            .unwrap();
        assert_eq!(executed.status, TransactionStatus::Completed);
        assert_eq!(h.balance(from).await, Money::from_major(5));
        assert_eq!(h.balance(to).await, Money::from_major(20));
    }

    #[tokio::test]
    async fn test_cancelled_pending_cannot_execute() {
        let mut h = harness(LedgerConfig::default());
        let from = h.open(300).await;
        let to = h.open(0).await;
        let ctx = OperationContext::new().with_request_user(Uuid::new_v4());

        let submitted = h
            .service
            .transfers
            .submit(TransferCommand::new(from, to, Money::from_major(75)), None, &ctx)
            .await
            .unwrap();

        let cancelled = h
            .service
            .transfers
            .cancel_transaction(&submitted.transaction_id, &ctx)
            .await
            .unwrap();
        assert_eq!(cancelled.status, TransactionStatus::Cancelled);

        let err = h
            .service
            .transfers
            .execute_pending(&submitted.transaction_id, &ctx)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::StateConflict { from: TransactionStatus::Cancelled, .. }
        ));
        assert_eq!(h.balance(from).await, Money::from_major(300));

        let events = h.drain();
        assert!(matches!(
            events.as_slice(),
            [LedgerEvent::TransactionCancelled { cancelled_by: Some(_), .. }]
        ));
    }
}
