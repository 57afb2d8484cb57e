//! Error handling module
//!
//! Centralized error types and HTTP response conversion.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;

use crate::domain::LedgerError;
use crate::ledger::StoreError;

/// Application-wide Result type
pub type AppResult<T> = Result<T, AppError>;

/// Application error types
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    // Client errors (4xx)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Missing required header: {0}")]
    MissingHeader(String),

    // Ledger errors
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    // Server errors (5xx)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code, details) = match &self {
            // 400 Bad Request
            AppError::InvalidRequest(msg) => {
                (StatusCode::BAD_REQUEST, "invalid_request", Some(json!(msg)))
            }
            AppError::MissingHeader(header) => {
                (StatusCode::BAD_REQUEST, "missing_header", Some(json!(header)))
            }

            AppError::Ledger(err) => ledger_status(err),

            // 500 Internal Server Error
            AppError::Database(e) => {
                tracing::error!("Database error: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "database_error", None)
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", None)
            }
            AppError::Config(e) => {
                tracing::error!("Config error: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "config_error", None)
            }
        };

        let error = match &self {
            // Store failures never leak driver messages
            AppError::Ledger(LedgerError::Store(_)) => "Internal storage error".to_string(),
            other => other.to_string(),
        };

        let body = ErrorResponse {
            error,
            error_code: error_code.to_string(),
            details,
        };

        (status, Json(body)).into_response()
    }
}

fn ledger_status(err: &LedgerError) -> (StatusCode, &'static str, Option<serde_json::Value>) {
    let code = err.code();
    match err {
        // 400 Bad Request
        LedgerError::SameAccountTransfer => (StatusCode::BAD_REQUEST, code, None),
        LedgerError::AmountOutOfRange { amount, max } => (
            StatusCode::BAD_REQUEST,
            code,
            Some(json!({ "amount": amount.to_string(), "max": max.to_string() })),
        ),
        LedgerError::CurrencyMismatch { expected, found } => (
            StatusCode::BAD_REQUEST,
            code,
            Some(json!({ "expected": expected, "found": found })),
        ),

        // 404 Not Found
        LedgerError::AccountNotFound(id) => {
            (StatusCode::NOT_FOUND, code, Some(json!({ "account_id": id })))
        }
        LedgerError::TransactionNotFound(id) => {
            (StatusCode::NOT_FOUND, code, Some(json!({ "transaction_id": id })))
        }

        // 409 Conflict
        LedgerError::AccountNotActive { account_id, status } => (
            StatusCode::CONFLICT,
            code,
            Some(json!({ "account_id": account_id, "status": status })),
        ),
        LedgerError::AccountNotEmpty { account_id, balance } => (
            StatusCode::CONFLICT,
            code,
            Some(json!({ "account_id": account_id, "balance": balance.to_string() })),
        ),
        LedgerError::StateConflict { transaction_id, from, to } => (
            StatusCode::CONFLICT,
            code,
            Some(json!({ "transaction_id": transaction_id, "from": from, "to": to })),
        ),
        LedgerError::IdempotencyConflict(key) => {
            (StatusCode::CONFLICT, code, Some(json!({ "idempotency_key": key })))
        }

        // 422 Unprocessable Entity
        LedgerError::InsufficientFunds {
            account_id,
            requested,
            available,
        } => (
            StatusCode::UNPROCESSABLE_ENTITY,
            code,
            Some(json!({
                "account_id": account_id,
                "requested": requested.to_string(),
                "available": available.to_string(),
            })),
        ),
        LedgerError::DailyLimitExceeded {
            account_id,
            limit,
            used,
            requested,
        }
        | LedgerError::MonthlyLimitExceeded {
            account_id,
            limit,
            used,
            requested,
        } => (
            StatusCode::UNPROCESSABLE_ENTITY,
            code,
            Some(json!({
                "account_id": account_id,
                "limit": limit.to_string(),
                "used": used.to_string(),
                "requested": requested.to_string(),
            })),
        ),
        LedgerError::TransactionBlocked { score, factors } => (
            StatusCode::UNPROCESSABLE_ENTITY,
            code,
            Some(json!({ "score": score, "factors": factors })),
        ),

        // 503 Service Unavailable
        LedgerError::CheckTimedOut(check) => (
            StatusCode::SERVICE_UNAVAILABLE,
            code,
            Some(json!({ "check": check })),
        ),

        // 500 Internal Server Error
        LedgerError::Store(store) => {
            match store {
                StoreError::Database(e) => tracing::error!("Database error: {:?}", e),
                other => tracing::error!("Store error: {}", other),
            }
            (StatusCode::INTERNAL_SERVER_ERROR, code, None)
        }
    }
}
