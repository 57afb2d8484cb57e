//! API Middleware
//!
//! Request context extraction and request logging.

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{HeaderMap, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::net::{IpAddr, SocketAddr};
use uuid::Uuid;

use crate::domain::OperationContext;

pub const REQUEST_USER_HEADER: &str = "X-Request-User-Id";
pub const CORRELATION_HEADER: &str = "X-Correlation-Id";
pub const FORWARDED_FOR_HEADER: &str = "X-Forwarded-For";

// =========================================================================
// Operation Context Middleware
// =========================================================================

/// Build the [`OperationContext`] every handler receives: initiator from
/// `X-Request-User-Id`, correlation id from `X-Correlation-Id` (generated if
/// absent), client address from `X-Forwarded-For` or the socket peer.
pub async fn context_middleware(
    headers: HeaderMap,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, Response> {
    let mut context = OperationContext::new();

    if let Some(user_id_str) = headers.get(REQUEST_USER_HEADER).and_then(|v| v.to_str().ok()) {
        match Uuid::parse_str(user_id_str) {
            Ok(user_id) => context = context.with_request_user(user_id),
            Err(_) => {
                return Err((
                    StatusCode::BAD_REQUEST,
                    Json(json!({
                        "error": "Invalid X-Request-User-Id header format",
                        "error_code": "invalid_user_id"
                    })),
                )
                    .into_response());
            }
        }
    }

    let correlation_id = headers
        .get(CORRELATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| Uuid::parse_str(s).ok())
        .unwrap_or_else(Uuid::new_v4);
    context = context.with_correlation_id(correlation_id);

    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    if let Some(ip) = forwarded_ip(&headers).or(peer) {
        context = context.with_client_ip(ip);
    }

    request.extensions_mut().insert(context);

    Ok(next.run(request).await)
}

/// First address in `X-Forwarded-For`, the original client.
pub fn forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get(FORWARDED_FOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|list| list.split(',').next())
        .and_then(|first| first.trim().parse().ok())
}

// =========================================================================
// Request logging
// =========================================================================

/// Never written to logs verbatim
const SENSITIVE_HEADERS: &[&str] = &["authorization", "cookie", "set-cookie", "idempotency-key"];

/// Header pairs safe to log; sensitive values become `[REDACTED]`.
pub fn mask_headers_for_logging(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            let shown = if SENSITIVE_HEADERS.contains(&name.as_str()) {
                "[REDACTED]"
            } else {
                value.to_str().unwrap_or("[invalid utf8]")
            };
            (name.to_string(), shown.to_string())
        })
        .collect()
}

/// Logs each request once it has been answered. Runs inside
/// [`context_middleware`], so the initiator and correlation id are known.
pub async fn logging_middleware(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let headers = mask_headers_for_logging(request.headers());
    let context = request
        .extensions()
        .get::<OperationContext>()
        .cloned()
        .unwrap_or_default();

    tracing::debug!(method = %method, path = %path, headers = ?headers, "Incoming request");

    let started = std::time::Instant::now();
    let response = next.run(request).await;
    let elapsed_ms = started.elapsed().as_millis() as u64;
    let status = response.status();

    if status.is_server_error() {
        tracing::error!(
            method = %method,
            path = %path,
            status = status.as_u16(),
            elapsed_ms,
            correlation_id = ?context.correlation_id,
            request_user_id = ?context.request_user_id,
            "Request failed"
        );
    } else {
        tracing::info!(
            method = %method,
            path = %path,
            status = status.as_u16(),
            elapsed_ms,
            correlation_id = ?context.correlation_id,
            request_user_id = ?context.request_user_id,
            client_ip = ?context.client_ip,
            "Request completed"
        );
    }

    response
}
