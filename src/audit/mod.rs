//! Audit Log Service
//!
//! Provides tamper-evident audit logging with hash chain verification.
//! Ledger events reach it through [`AuditSink`], one of the [`EventSink`]
//! implementations the orchestrator emits to.

mod sink;

use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::domain::{LedgerEvent, OperationContext};

pub use sink::{AuditSink, ChannelSink, EventSink, FanoutSink, TracingSink};

/// Hash that precedes the first entry
const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Audit action types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
    TransferCompleted,
    TransferBlocked,
    TransferFailed,
    LimitExceeded,
    TransactionCancelled,
    DepositCompleted,
    WithdrawalCompleted,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::TransferCompleted => "transfer.completed",
            AuditAction::TransferBlocked => "transfer.blocked",
            AuditAction::TransferFailed => "transfer.failed",
            AuditAction::LimitExceeded => "limit.exceeded",
            AuditAction::TransactionCancelled => "transaction.cancelled",
            AuditAction::DepositCompleted => "deposit.completed",
            AuditAction::WithdrawalCompleted => "withdrawal.completed",
        }
    }

    pub fn for_event(event: &LedgerEvent) -> Self {
        match event {
            LedgerEvent::TransferCompleted { .. } => AuditAction::TransferCompleted,
            LedgerEvent::TransferBlocked { .. } => AuditAction::TransferBlocked,
            LedgerEvent::TransferFailed { .. } => AuditAction::TransferFailed,
            LedgerEvent::LimitExceeded { .. } => AuditAction::LimitExceeded,
            LedgerEvent::TransactionCancelled { .. } => AuditAction::TransactionCancelled,
            LedgerEvent::DepositCompleted { .. } => AuditAction::DepositCompleted,
            LedgerEvent::WithdrawalCompleted { .. } => AuditAction::WithdrawalCompleted,
        }
    }
}

/// Builder for creating audit log entries
#[derive(Debug, Clone)]
pub struct AuditLogBuilder {
    action: String,
    resource_type: Option<String>,
    resource_id: Option<String>,
    details: Option<String>,
}

impl AuditLogBuilder {
    /// Create a new audit log builder
    pub fn new(action: AuditAction) -> Self {
        Self {
            action: action.as_str().to_string(),
            resource_type: None,
            resource_id: None,
            details: None,
        }
    }

    /// Entry for a ledger event; the event itself is stored as details
    pub fn from_event(event: &LedgerEvent) -> Result<Self, AuditLogError> {
        let builder = Self::new(AuditAction::for_event(event)).details(event)?;
        Ok(match event.transaction_id() {
            Some(id) => builder.resource_type("Transaction").resource_id(id.as_str()),
            None => builder,
        })
    }

    /// Set the resource type
    pub fn resource_type(mut self, resource_type: &str) -> Self {
        self.resource_type = Some(resource_type.to_string());
        self
    }

    /// Set the resource ID
    pub fn resource_id(mut self, resource_id: &str) -> Self {
        self.resource_id = Some(resource_id.to_string());
        self
    }

    /// Serialized once so the hashed text is exactly what is stored
    pub fn details<T: Serialize>(mut self, details: &T) -> Result<Self, AuditLogError> {
        self.details = Some(serde_json::to_string(details)?);
        Ok(self)
    }
}

/// Audit Log Service
#[derive(Debug, Clone)]
pub struct AuditLogService {
    pool: PgPool,
}

impl AuditLogService {
    /// Create a new AuditLogService
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Write an audit log entry.
    /// sequence_number and the hash chain are assigned by the database trigger.
    pub async fn log(
        &self,
        builder: AuditLogBuilder,
        context: &OperationContext,
    ) -> Result<Uuid, AuditLogError> {
        let id = Uuid::new_v4();

        let result: (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO audit_logs (
                id, request_user_id, correlation_id,
                action, resource_type, resource_id, details, client_ip
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8::inet)
            RETURNING id
            "#,
        )
        .bind(id)
        .bind(context.request_user_id)
        .bind(context.correlation_id)
        .bind(&builder.action)
        .bind(&builder.resource_type)
        .bind(&builder.resource_id)
        .bind(&builder.details)
        .bind(context.client_ip.map(|ip| ip.to_string()))
        .fetch_one(&self.pool)
        .await?;

        tracing::debug!(
            audit_id = %result.0,
            action = %builder.action,
            "Audit log entry created"
        );

        Ok(result.0)
    }

    /// Verify the integrity of the audit log hash chain
    pub async fn verify_hash_chain(
        &self,
        limit: Option<i64>,
    ) -> Result<ChainVerificationResult, AuditLogError> {
        let limit = limit.unwrap_or(1000);

        let entries: Vec<ChainRow> = sqlx::query_as(
            r#"
            SELECT id, sequence_number, action, request_user_id, details,
                   previous_hash, current_hash
            FROM audit_logs
            ORDER BY sequence_number ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(verify_chain(&entries))
    }
}

/// The columns that participate in the hash
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ChainRow {
    pub id: Uuid,
    pub sequence_number: i64,
    pub action: String,
    pub request_user_id: Option<Uuid>,
    pub details: Option<String>,
    pub previous_hash: String,
    pub current_hash: String,
}

impl ChainRow {
    /// Recompute this entry's hash from its contents and predecessor
    pub fn expected_hash(&self) -> String {
        let hash_input = format!(
            "{}{}{}{}{}{}",
            self.id,
            self.sequence_number,
            self.action,
            self.request_user_id.map(|u| u.to_string()).unwrap_or_default(),
            self.details.as_deref().unwrap_or_default(),
            self.previous_hash
        );
        sha256_hex(&hash_input)
    }
}

/// Walk entries in sequence order, checking linkage and content hashes.
pub fn verify_chain(entries: &[ChainRow]) -> ChainVerificationResult {
    let mut previous_hash = GENESIS_HASH.to_string();

    for (checked, entry) in entries.iter().enumerate() {
        if entry.previous_hash != previous_hash {
            return ChainVerificationResult::broken(
                checked as u64,
                entry.id,
                previous_hash,
                entry.previous_hash.clone(),
            );
        }

        let calculated_hash = entry.expected_hash();
        if calculated_hash != entry.current_hash {
            return ChainVerificationResult::broken(
                checked as u64,
                entry.id,
                calculated_hash,
                entry.current_hash.clone(),
            );
        }

        previous_hash = entry.current_hash.clone();
    }

    ChainVerificationResult {
        is_valid: true,
        entries_checked: entries.len() as u64,
        first_invalid_entry: None,
        expected_hash: None,
        actual_hash: None,
    }
}

/// Result of hash chain verification
#[derive(Debug, Clone)]
pub struct ChainVerificationResult {
    pub is_valid: bool,
    pub entries_checked: u64,
    pub first_invalid_entry: Option<Uuid>,
    pub expected_hash: Option<String>,
    pub actual_hash: Option<String>,
}

impl ChainVerificationResult {
    fn broken(entries_checked: u64, id: Uuid, expected: String, actual: String) -> Self {
        Self {
            is_valid: false,
            entries_checked,
            first_invalid_entry: Some(id),
            expected_hash: Some(expected),
            actual_hash: Some(actual),
        }
    }
}

/// Calculate SHA-256 hash and return as hex string
fn sha256_hex(input: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Audit log errors
#[derive(Debug, thiserror::Error)]
pub enum AuditLogError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// =========================================================================
// Tests
// =========================================================================
