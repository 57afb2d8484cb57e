//! Event sinks
//!
//! Where the orchestrator sends [`LedgerEvent`]s once a scope has been
//! released. Emission never fails from the caller's point of view: sinks that
//! do I/O spawn it and log their own errors.

use std::sync::Arc;
use tokio::sync::mpsc;

use crate::domain::{LedgerEvent, OperationContext};

use super::{AuditLogBuilder, AuditLogService};

pub trait EventSink: Send + Sync {
    fn emit(&self, event: LedgerEvent, context: &OperationContext);
}

/// Structured log line per event; security-relevant ones at `warn`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: LedgerEvent, context: &OperationContext) {
        let payload = serde_json::to_string(&event).unwrap_or_default();
        if event.is_security_relevant() {
            tracing::warn!(
                event_type = event.event_type(),
                correlation_id = ?context.correlation_id,
                request_user_id = ?context.request_user_id,
                client_ip = ?context.client_ip,
                payload = %payload,
                "Security event"
            );
        } else {
            tracing::info!(
                event_type = event.event_type(),
                correlation_id = ?context.correlation_id,
                payload = %payload,
                "Ledger event"
            );
        }
    }
}

/// Forwards events into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::UnboundedSender<LedgerEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LedgerEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: LedgerEvent, _context: &OperationContext) {
        if self.sender.send(event).is_err() {
            tracing::debug!("Event channel closed; dropping event");
        }
    }
}

/// Sends every event to each inner sink in order.
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: LedgerEvent, context: &OperationContext) {
        for sink in &self.sinks {
            sink.emit(event.clone(), context);
        }
    }
}

/// Persists events into the hash-chained audit log.
#[derive(Debug, Clone)]
pub struct AuditSink {
    service: AuditLogService,
}

impl AuditSink {
    pub fn new(service: AuditLogService) -> Self {
        Self { service }
    }
}

impl EventSink for AuditSink {
    fn emit(&self, event: LedgerEvent, context: &OperationContext) {
        let builder = match AuditLogBuilder::from_event(&event) {
            Ok(builder) => builder,
            Err(e) => {
                tracing::error!(event_type = event.event_type(), error = %e, "Failed to build audit entry");
                return;
            }
        };

        let service = self.service.clone();
        let context = context.clone();
        tokio::spawn(async move {
            if let Err(e) = service.log(builder, &context).await {
                tracing::error!(
                    event_type = event.event_type(),
                    correlation_id = ?context.correlation_id,
                    error = %e,
                    "Failed to write audit log entry"
                );
            }
        });
    }
}
