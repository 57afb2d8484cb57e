//! API Routes
//!
//! HTTP endpoint definitions. Amounts cross the wire as decimal strings in
//! major units ("100.00") and are converted to [`Money`] here.

use axum::{
    extract::{Extension, Path, State},
    http::{HeaderMap, StatusCode},
    routing::{get, patch, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{
    Account, AccountId, AccountStatus, LegBalances, Money, NewAccount, OperationContext,
    Transaction, TransactionId, TransactionStatus, TransactionType,
};
use crate::error::AppError;
use crate::handlers::{MovementCommand, MovementResult, TransferCommand, TransferResult};
use crate::limits::LimitUsage;
use crate::risk::{RiskAssessment, RiskLevel};

use super::AppState;

pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

// =========================================================================
// Request/Response types
// =========================================================================

#[derive(Debug, Deserialize)]
pub struct OpenAccountRequest {
    pub owner_id: Uuid,
    pub currency: String,
    #[serde(default)]
    pub opening_balance: Option<String>,
    #[serde(default)]
    pub daily_transfer_limit: Option<String>,
    #[serde(default)]
    pub monthly_transfer_limit: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AccountResponse {
    pub id: AccountId,
    pub owner_id: Uuid,
    pub currency: String,
    pub balance: Decimal,
    pub available_balance: Decimal,
    pub status: AccountStatus,
    pub daily_transfer_limit: Option<Decimal>,
    pub monthly_transfer_limit: Option<Decimal>,
    pub last_transaction_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<Account> for AccountResponse {
    fn from(account: Account) -> Self {
        Self {
            id: account.id,
            owner_id: account.owner_id,
            currency: account.currency,
            balance: account.balance.to_decimal(),
            available_balance: account.available_balance.to_decimal(),
            status: account.status,
            daily_transfer_limit: account.daily_transfer_limit.map(|m| m.to_decimal()),
            monthly_transfer_limit: account.monthly_transfer_limit.map(|m| m.to_decimal()),
            last_transaction_at: account.last_transaction_at,
            created_at: account.created_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: AccountStatus,
}

#[derive(Debug, Serialize)]
pub struct LimitUsageResponse {
    pub account_id: AccountId,
    pub daily_limit: Decimal,
    pub daily_used: Decimal,
    pub daily_remaining: Decimal,
    pub monthly_limit: Decimal,
    pub monthly_used: Decimal,
    pub monthly_remaining: Decimal,
}

impl From<LimitUsage> for LimitUsageResponse {
    fn from(usage: LimitUsage) -> Self {
        Self {
            account_id: usage.account_id,
            daily_limit: usage.daily_limit.to_decimal(),
            daily_used: usage.daily_used.to_decimal(),
            daily_remaining: usage.daily_remaining.to_decimal(),
            monthly_limit: usage.monthly_limit.to_decimal(),
            monthly_used: usage.monthly_used.to_decimal(),
            monthly_remaining: usage.monthly_remaining.to_decimal(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct MovementRequest {
    pub amount: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct MovementResponse {
    pub transaction_id: TransactionId,
    pub status: TransactionStatus,
    pub account_id: AccountId,
    pub amount: Decimal,
    pub balance_after: Option<Decimal>,
    pub replayed: bool,
}

impl From<MovementResult> for MovementResponse {
    fn from(result: MovementResult) -> Self {
        Self {
            transaction_id: result.transaction_id,
            status: result.status,
            account_id: result.account_id,
            amount: result.amount.to_decimal(),
            balance_after: result.balance_after.map(|m| m.to_decimal()),
            replayed: result.replayed,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TransferRequest {
    pub from_account: AccountId,
    pub to_account: AccountId,
    pub amount: String,
    #[serde(default)]
    pub description: Option<String>,
}

impl TransferRequest {
    fn into_command(self) -> Result<TransferCommand, AppError> {
        Ok(TransferCommand {
            from_account: self.from_account,
            to_account: self.to_account,
            amount: parse_amount(&self.amount)?,
            description: self.description,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct TransferResponse {
    pub transaction_id: TransactionId,
    pub status: TransactionStatus,
    pub from_account: AccountId,
    pub to_account: AccountId,
    pub amount: Decimal,
    pub fraud_score: u8,
    pub risk_level: RiskLevel,
    pub replayed: bool,
}

impl From<TransferResult> for TransferResponse {
    fn from(result: TransferResult) -> Self {
        Self {
            transaction_id: result.transaction_id,
            status: result.status,
            from_account: result.from_account,
            to_account: result.to_account,
            amount: result.amount.to_decimal(),
            fraud_score: result.fraud_score,
            risk_level: result.risk_level,
            replayed: result.replayed,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct LegResponse {
    pub before: Decimal,
    pub after: Decimal,
}

impl From<LegBalances> for LegResponse {
    fn from(leg: LegBalances) -> Self {
        Self {
            before: leg.before.to_decimal(),
            after: leg.after.to_decimal(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TransactionResponse {
    pub transaction_id: TransactionId,
    pub transaction_type: TransactionType,
    pub from_account: Option<AccountId>,
    pub to_account: Option<AccountId>,
    pub amount: Decimal,
    pub currency: String,
    pub status: TransactionStatus,
    pub fraud_score: u8,
    pub from_balances: Option<LegResponse>,
    pub to_balances: Option<LegResponse>,
    pub description: Option<String>,
    pub initiated_by: Option<Uuid>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<Transaction> for TransactionResponse {
    fn from(tx: Transaction) -> Self {
        Self {
            transaction_id: tx.id,
            transaction_type: tx.transaction_type,
            from_account: tx.from_account,
            to_account: tx.to_account,
            amount: tx.amount.to_decimal(),
            currency: tx.currency,
            status: tx.status,
            fraud_score: tx.fraud_score,
            from_balances: tx.from_balances.map(LegResponse::from),
            to_balances: tx.to_balances.map(LegResponse::from),
            description: tx.description,
            initiated_by: tx.initiated_by,
            failure_reason: tx.failure_reason,
            created_at: tx.created_at,
            processed_at: tx.processed_at,
            completed_at: tx.completed_at,
        }
    }
}

// =========================================================================
// API Router
// =========================================================================

/// Create the API router
pub fn create_router() -> Router<AppState> {
    Router::new()
        // Accounts
        .route("/accounts", post(open_account))
        .route("/accounts/:account_id", get(get_account))
        .route("/accounts/:account_id/status", patch(update_account_status))
        .route("/accounts/:account_id/limits", get(get_limit_usage))
        .route("/accounts/:account_id/deposits", post(deposit))
        .route("/accounts/:account_id/withdrawals", post(withdraw))
        // Transfers
        .route("/transfers", post(transfer))
        .route("/transfers/assess", post(assess_transfer))
        .route("/transfers/pending", post(submit_transfer))
        // Transactions
        .route("/transactions/:transaction_id", get(get_transaction))
        .route("/transactions/:transaction_id/execute", post(execute_transaction))
        .route("/transactions/:transaction_id/cancel", post(cancel_transaction))
        // Sessions
        .route("/sessions", post(record_session))
}

// =========================================================================
// Helpers
// =========================================================================

fn parse_amount(raw: &str) -> Result<Money, AppError> {
    raw.parse::<Money>()
        .map_err(|e| AppError::InvalidRequest(format!("Invalid amount: {}", e)))
}

fn parse_optional_amount(raw: Option<&str>) -> Result<Option<Money>, AppError> {
    raw.map(parse_amount).transpose()
}

/// `Idempotency-Key` must be a UUID when present.
fn idempotency_key(headers: &HeaderMap) -> Result<Option<Uuid>, AppError> {
    headers
        .get(IDEMPOTENCY_HEADER)
        .map(|value| {
            value
                .to_str()
                .ok()
                .and_then(|s| Uuid::parse_str(s.trim()).ok())
                .ok_or_else(|| {
                    AppError::InvalidRequest("Idempotency-Key must be a UUID".to_string())
                })
        })
        .transpose()
}

/// Created for fresh results, OK for replays
fn replay_status(replayed: bool) -> StatusCode {
    if replayed {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    }
}

// =========================================================================
// Accounts
// =========================================================================

/// POST /accounts
async fn open_account(
    State(state): State<AppState>,
    Json(request): Json<OpenAccountRequest>,
) -> Result<(StatusCode, Json<AccountResponse>), AppError> {
    let currency = request.currency.trim().to_uppercase();
    if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(AppError::InvalidRequest(
            "currency must be a three-letter ISO 4217 code".to_string(),
        ));
    }

    let mut new_account = NewAccount::new(request.owner_id, currency);
    if let Some(balance) = parse_optional_amount(request.opening_balance.as_deref())? {
        new_account = new_account.with_balance(balance);
    }
    if let Some(limit) = parse_optional_amount(request.daily_transfer_limit.as_deref())? {
        new_account = new_account.with_daily_limit(limit);
    }
    if let Some(limit) = parse_optional_amount(request.monthly_transfer_limit.as_deref())? {
        new_account = new_account.with_monthly_limit(limit);
    }

    let account = state.ledger.open_account(new_account).await?;

    Ok((StatusCode::CREATED, Json(account.into())))
}

/// GET /accounts/:account_id
async fn get_account(
    State(state): State<AppState>,
    Path(account_id): Path<AccountId>,
) -> Result<Json<AccountResponse>, AppError> {
    let account = state.ledger.get_account(account_id).await?;
    Ok(Json(account.into()))
}

/// PATCH /accounts/:account_id/status
async fn update_account_status(
    State(state): State<AppState>,
    Path(account_id): Path<AccountId>,
    Json(request): Json<UpdateStatusRequest>,
) -> Result<Json<AccountResponse>, AppError> {
    let account = state
        .ledger
        .set_account_status(account_id, request.status)
        .await?;
    Ok(Json(account.into()))
}

/// GET /accounts/:account_id/limits
async fn get_limit_usage(
    State(state): State<AppState>,
    Path(account_id): Path<AccountId>,
) -> Result<Json<LimitUsageResponse>, AppError> {
    let usage = state.ledger.limit_usage(account_id).await?;
    Ok(Json(usage.into()))
}

/// POST /accounts/:account_id/deposits
async fn deposit(
    State(state): State<AppState>,
    Extension(context): Extension<OperationContext>,
    Path(account_id): Path<AccountId>,
    headers: HeaderMap,
    Json(request): Json<MovementRequest>,
) -> Result<(StatusCode, Json<MovementResponse>), AppError> {
    let key = idempotency_key(&headers)?;
    let command = MovementCommand {
        account_id,
        amount: parse_amount(&request.amount)?,
        description: request.description,
    };

    let result = state.ledger.deposits.execute(command, key, &context).await?;

    Ok((replay_status(result.replayed), Json(result.into())))
}

/// POST /accounts/:account_id/withdrawals
async fn withdraw(
    State(state): State<AppState>,
    Extension(context): Extension<OperationContext>,
    Path(account_id): Path<AccountId>,
    headers: HeaderMap,
    Json(request): Json<MovementRequest>,
) -> Result<(StatusCode, Json<MovementResponse>), AppError> {
    let key = idempotency_key(&headers)?;
    let command = MovementCommand {
        account_id,
        amount: parse_amount(&request.amount)?,
        description: request.description,
    };

    let result = state
        .ledger
        .withdrawals
        .execute(command, key, &context)
        .await?;

    Ok((replay_status(result.replayed), Json(result.into())))
}

// =========================================================================
// Transfers
// =========================================================================

/// POST /transfers
async fn transfer(
    State(state): State<AppState>,
    Extension(context): Extension<OperationContext>,
    headers: HeaderMap,
    Json(request): Json<TransferRequest>,
) -> Result<(StatusCode, Json<TransferResponse>), AppError> {
    let key = idempotency_key(&headers)?;
    let command = request.into_command()?;

    let result = state.ledger.transfers.execute(command, key, &context).await?;

    Ok((replay_status(result.replayed), Json(result.into())))
}

/// POST /transfers/assess
async fn assess_transfer(
    State(state): State<AppState>,
    Extension(context): Extension<OperationContext>,
    Json(request): Json<TransferRequest>,
) -> Result<Json<RiskAssessment>, AppError> {
    let command = request.into_command()?;
    let assessment = state.ledger.transfers.assess_risk(&command, &context).await?;
    Ok(Json(assessment))
}

/// POST /transfers/pending
async fn submit_transfer(
    State(state): State<AppState>,
    Extension(context): Extension<OperationContext>,
    headers: HeaderMap,
    Json(request): Json<TransferRequest>,
) -> Result<(StatusCode, Json<TransferResponse>), AppError> {
    let key = idempotency_key(&headers)?;
    let command = request.into_command()?;

    let result = state.ledger.transfers.submit(command, key, &context).await?;
    let status = if result.replayed {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };

    Ok((status, Json(result.into())))
}

// =========================================================================
// Transactions
// =========================================================================

/// GET /transactions/:transaction_id
async fn get_transaction(
    State(state): State<AppState>,
    Path(transaction_id): Path<String>,
) -> Result<Json<TransactionResponse>, AppError> {
    let tx = state
        .ledger
        .get_transaction(&TransactionId::from(transaction_id))
        .await?;
    Ok(Json(tx.into()))
}

/// POST /transactions/:transaction_id/execute
async fn execute_transaction(
    State(state): State<AppState>,
    Extension(context): Extension<OperationContext>,
    Path(transaction_id): Path<String>,
) -> Result<Json<TransferResponse>, AppError> {
    let result = state
        .ledger
        .transfers
        .execute_pending(&TransactionId::from(transaction_id), &context)
        .await?;
    Ok(Json(result.into()))
}

/// POST /transactions/:transaction_id/cancel
async fn cancel_transaction(
    State(state): State<AppState>,
    Extension(context): Extension<OperationContext>,
    Path(transaction_id): Path<String>,
) -> Result<Json<TransactionResponse>, AppError> {
    let tx = state
        .ledger
        .transfers
        .cancel_transaction(&TransactionId::from(transaction_id), &context)
        .await?;
    Ok(Json(tx.into()))
}

// =========================================================================
// Sessions
// =========================================================================

/// POST /sessions
///
/// Records the address the requesting user signed in from; later transfers
/// from another address score for an IP change.
async fn record_session(
    State(state): State<AppState>,
    Extension(context): Extension<OperationContext>,
) -> Result<StatusCode, AppError> {
    let user_id = context
        .request_user_id
        .ok_or_else(|| AppError::MissingHeader(super::middleware::REQUEST_USER_HEADER.to_string()))?;
    let ip = context.client_ip.ok_or_else(|| {
        AppError::InvalidRequest("client address could not be determined".to_string())
    })?;

    state.ledger.record_session(user_id, ip).await?;

    Ok(StatusCode::NO_CONTENT)
}
