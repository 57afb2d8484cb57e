//! Scheduled Jobs
//!
//! Background maintenance: pending transfers that were never executed are
//! cancelled once they outlive their TTL, and the audit hash chain is
//! re-verified periodically when one is configured.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;

use crate::audit::{AuditLogError, AuditLogService, EventSink};
use crate::domain::{Clock, LedgerError, LedgerEvent, OperationContext, TransactionStatus};
use crate::ledger::LedgerStore;

// =========================================================================
// Pending Transfer Expiry
// =========================================================================

/// Cancel every `pending` record created more than `ttl` ago. A record that
/// moved on concurrently (executed or cancelled by a caller) is skipped.
pub async fn expire_stale_pending(
    store: &dyn LedgerStore,
    events: &dyn EventSink,
    clock: &dyn Clock,
    ttl: ChronoDuration,
) -> Result<u64, JobError> {
    let now = clock.now();
    let stale = store.list_stale_pending(now - ttl).await?;

    let context = OperationContext::new();
    let mut expired = 0u64;
    for id in stale {
        match store
            .transition_transaction(&id, TransactionStatus::Pending, TransactionStatus::Cancelled, now)
            .await
        {
            Ok(_) => {
                expired += 1;
                events.emit(
                    LedgerEvent::TransactionCancelled {
                        transaction_id: id,
                        cancelled_by: None,
                        cancelled_at: now,
                    },
                    &context,
                );
            }
            Err(LedgerError::StateConflict { .. }) => {
                tracing::debug!(transaction_id = %id, "Pending transaction moved on before expiry");
            }
            Err(e) => return Err(e.into()),
        }
    }

    if expired > 0 {
        tracing::info!(expired = expired, "Expired stale pending transactions");
    }

    Ok(expired)
}

// =========================================================================
// Audit Chain Verification
// =========================================================================

/// Re-walk the audit chain from genesis, up to `limit` entries. Returns
/// whether it held.
pub async fn verify_audit_chain(audit: &AuditLogService, limit: i64) -> Result<bool, JobError> {
    let result = audit.verify_hash_chain(Some(limit)).await?;

    if !result.is_valid {
        tracing::error!(
            entries_checked = result.entries_checked,
            first_invalid_entry = ?result.first_invalid_entry,
            expected_hash = ?result.expected_hash,
            actual_hash = ?result.actual_hash,
            "Audit log hash chain is broken"
        );
    }

    Ok(result.is_valid)
}

// =========================================================================
// Job Scheduler
// =========================================================================

/// Job scheduler configuration
#[derive(Debug, Clone)]
pub struct JobSchedulerConfig {
    pub pending_expiry_interval: Duration,
    pub pending_ttl: ChronoDuration,
    pub audit_check_interval: Duration,
    pub audit_check_limit: i64,
}

impl Default for JobSchedulerConfig {
    fn default() -> Self {
        Self {
            pending_expiry_interval: Duration::from_secs(60),
            pending_ttl: ChronoDuration::hours(24),
            audit_check_interval: Duration::from_secs(3600),
            audit_check_limit: 1000,
        }
    }
}

/// Job Scheduler - runs periodic maintenance tasks
pub struct JobScheduler {
    store: Arc<dyn LedgerStore>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    audit: Option<AuditLogService>,
    config: JobSchedulerConfig,
}

impl JobScheduler {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        events: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
        config: JobSchedulerConfig,
    ) -> Self {
        Self {
            store,
            events,
            clock,
            audit: None,
            config,
        }
    }

    /// Also verify the audit hash chain on its own interval
    pub fn with_audit(mut self, audit: AuditLogService) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Start the job scheduler in the background
    /// Returns a handle that can be used to abort the scheduler
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&self) {
        tracing::info!("Job scheduler started");

        let mut expiry_interval = interval(self.config.pending_expiry_interval);
        let mut audit_interval = interval(self.config.audit_check_interval);

        loop {
            tokio::select! {
                _ = expiry_interval.tick() => {
                    if let Err(e) = self.expire_pending().await {
                        tracing::error!(error = %e, "Pending expiry failed");
                    }
                }
                _ = audit_interval.tick() => {
                    if let Some(audit) = &self.audit {
                        if let Err(e) = verify_audit_chain(audit, self.config.audit_check_limit).await {
                            tracing::error!(error = %e, "Audit chain verification failed");
                        }
                    }
                }
            }
        }
    }

    async fn expire_pending(&self) -> Result<u64, JobError> {
        expire_stale_pending(
            self.store.as_ref(),
            self.events.as_ref(),
            self.clock.as_ref(),
            self.config.pending_ttl,
        )
        .await
    }

    /// Run all maintenance jobs once (for manual trigger or testing)
    pub async fn run_all_once(&self) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();

        match self.expire_pending().await {
            Ok(count) => report.pending_expired = count,
            Err(e) => report.errors.push(format!("Pending expiry: {}", e)),
        }

        if let Some(audit) = &self.audit {
            match verify_audit_chain(audit, self.config.audit_check_limit).await {
                Ok(valid) => report.audit_chain_valid = Some(valid),
                Err(e) => report.errors.push(format!("Audit verification: {}", e)),
            }
        }

        report.completed_at = self.clock.now();
        report
    }
}

/// Report from running maintenance jobs
#[derive(Debug, Clone, Default)]
pub struct MaintenanceReport {
    pub pending_expired: u64,
    pub audit_chain_valid: Option<bool>,
    pub errors: Vec<String>,
    pub completed_at: DateTime<Utc>,
}

/// Job execution errors
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Audit error: {0}")]
    Audit(#[from] AuditLogError),
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::ChannelSink;
    use crate::domain::{
        AccountId, FixedClock, Money, Transaction, TransactionType,
    };
    use crate::ledger::MemoryLedgerStore;
    use chrono::TimeZone;

    fn pending(created_at: DateTime<Utc>) -> Transaction {
        Transaction::new(
            TransactionType::Transfer,
            Some(AccountId(1)),
            Some(AccountId(2)),
            Money::from_major(10),
            "USD",
            created_at,
        )
    }

    #[tokio::test]
    async fn test_expire_only_stale_pending() {
        let start = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap();
        let clock = Arc::new(FixedClock::new(start));
        let store = MemoryLedgerStore::with_clock(clock.clone());
        let (sink, mut events) = ChannelSink::new();

        let old = pending(start - ChronoDuration::hours(25));
        let fresh = pending(start - ChronoDuration::hours(1));
        store.save_transaction(&old).await.unwrap();
        store.save_transaction(&fresh).await.unwrap();

        let expired = expire_stale_pending(&store, &sink, clock.as_ref(), ChronoDuration::hours(24))
            .await
            .unwrap();

        assert_eq!(expired, 1);
        assert_eq!(
            store.get_transaction(&old.id).await.unwrap().status,
            TransactionStatus::Cancelled
        );
        assert_eq!(
            store.get_transaction(&fresh.id).await.unwrap().status,
            TransactionStatus::Pending
        );
        assert!(matches!(
            events.recv().await,
            Some(LedgerEvent::TransactionCancelled { cancelled_by: None, .. })
        ));
    }

    #[tokio::test]
    async fn test_scheduler_report() {
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let store = Arc::new(MemoryLedgerStore::with_clock(clock.clone()));
        let (sink, _events) = ChannelSink::new();
        let scheduler =
            JobScheduler::new(store, Arc::new(sink), clock, JobSchedulerConfig::default());

        let report = scheduler.run_all_once().await;
        assert_eq!(report.pending_expired, 0);
        assert!(report.audit_chain_valid.is_none());
        assert!(report.errors.is_empty());
    }

    #[test]
    fn test_job_scheduler_config_default() {
        let config = JobSchedulerConfig::default();
        assert_eq!(config.pending_expiry_interval, Duration::from_secs(60));
        assert_eq!(config.pending_ttl, ChronoDuration::hours(24));
    }
}
