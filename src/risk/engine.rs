//! Risk Scoring Engine
//!
//! Loads the history slice for a candidate transfer, runs the rule list and
//! the hard-stop pattern checks, and reports a [`RiskAssessment`]. History is
//! read outside any account lock; a lookup that outlives the configured bound
//! fails closed.

use chrono::{FixedOffset, Timelike};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::config::LedgerConfig;
use crate::domain::{AccountId, Clock, LedgerError, Money};
use crate::ledger::LedgerStore;

use super::rules::{default_rules, RiskContext, RiskRule};
use super::{HistoryQuery, RiskHistory};

/// Scores at or above this are blocked
pub const BLOCK_THRESHOLD: u8 = 70;

const MAX_SCORE: u8 = 100;

/// Advisory: amounts that are an exact multiple of this look structured
const ROUND_AMOUNT_UNIT: Money = Money::from_major(1_000);

/// Advisory: more distinct recipients than this in 24 hours
const UNIQUE_RECIPIENT_THRESHOLD: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn from_score(score: u8) -> Self {
        match score {
            70.. => RiskLevel::Critical,
            50..=69 => RiskLevel::High,
            30..=49 => RiskLevel::Medium,
            _ => RiskLevel::Low,
        }
    }
}

/// `true` iff the score reaches the block threshold
pub fn should_block(score: u8) -> bool {
    score >= BLOCK_THRESHOLD
}

/// A transfer that has not been executed yet
#[derive(Debug, Clone)]
pub struct CandidateTransfer {
    pub from_account: AccountId,
    pub to_account: Option<AccountId>,
    pub amount: Money,
    pub client_ip: Option<IpAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub score: u8,
    pub level: RiskLevel,
    /// Contributing factors in rule order
    pub factors: Vec<String>,
    pub should_block: bool,
    /// Pattern violations that reject regardless of score
    pub hard_stops: Vec<String>,
    /// Reporting-only signals; never gate a transfer
    pub advisories: Vec<String>,
}

impl RiskAssessment {
    /// Whether the transfer must not proceed
    pub fn is_rejected(&self) -> bool {
        self.should_block || !self.hard_stops.is_empty()
    }

    /// Everything that contributed to a rejection
    pub fn rejection_factors(&self) -> Vec<String> {
        self.factors
            .iter()
            .chain(self.hard_stops.iter())
            .cloned()
            .collect()
    }
}

pub struct RiskEngine {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    rules: Vec<RiskRule>,
    local_offset: FixedOffset,
    lookup_timeout: Duration,
    daily_transaction_cap: u32,
    daily_hard_ceiling: Money,
}

impl RiskEngine {
    pub fn new(store: Arc<dyn LedgerStore>, clock: Arc<dyn Clock>, config: &LedgerConfig) -> Self {
        Self {
            store,
            clock,
            rules: default_rules(),
            local_offset: config.utc_offset,
            lookup_timeout: config.check_timeout,
            daily_transaction_cap: config.daily_transaction_cap,
            daily_hard_ceiling: config.daily_hard_ceiling,
        }
    }

    /// Replace the rule list
    pub fn with_rules(mut self, rules: Vec<RiskRule>) -> Self {
        self.rules = rules;
        self
    }

    /// Load history for the candidate and score it.
    pub async fn assess(&self, candidate: &CandidateTransfer) -> Result<RiskAssessment, LedgerError> {
        let now = self.clock.now();

        let load = async {
            let source = self.store.get_account(candidate.from_account).await?;
            let query = HistoryQuery {
                source: candidate.from_account,
                destination: candidate.to_account,
                owner_id: Some(source.owner_id),
                now,
            };
            self.store.load_risk_history(&query).await
        };

        let history = match tokio::time::timeout(self.lookup_timeout, load).await {
            Ok(history) => history?,
            Err(_) => {
                tracing::error!(
                    from_account = %candidate.from_account,
                    timeout_ms = self.lookup_timeout.as_millis() as u64,
                    "Risk history lookup timed out; failing closed"
                );
                return Err(LedgerError::CheckTimedOut("risk history"));
            }
        };

        let ctx = RiskContext {
            amount: candidate.amount,
            local_hour: now.with_timezone(&self.local_offset).hour(),
            client_ip: candidate.client_ip,
            history: &history,
        };
        let assessment = self.evaluate(&ctx);

        tracing::debug!(
            from_account = %candidate.from_account,
            to_account = ?candidate.to_account,
            amount = %candidate.amount,
            score = assessment.score,
            level = ?assessment.level,
            factors = ?assessment.factors,
            "Risk assessed"
        );

        Ok(assessment)
    }

    /// Pure scoring over an already-loaded context.
    pub fn evaluate(&self, ctx: &RiskContext<'_>) -> RiskAssessment {
        let mut score: u16 = 0;
        let mut factors = Vec::new();

        for rule in &self.rules {
            if let Some(hit) = rule.apply(ctx) {
                score += u16::from(hit.points);
                factors.push(hit.factor);
            }
        }
        let score = score.min(u16::from(MAX_SCORE)) as u8;

        RiskAssessment {
            score,
            level: RiskLevel::from_score(score),
            factors,
            should_block: should_block(score),
            hard_stops: self.hard_stops(ctx),
            advisories: advisories(ctx),
        }
    }

    /// Pattern checks that reject independently of the score.
    pub fn hard_stops(&self, ctx: &RiskContext<'_>) -> Vec<String> {
        let mut stops = Vec::new();
        let history: &RiskHistory = ctx.history;

        if history.daily_count > self.daily_transaction_cap {
            stops.push(format!(
                "{} transactions in 24 hours",
                history.daily_count
            ));
        }

        let projected = history.daily_outgoing.checked_add(ctx.amount);
        if projected.map_or(true, |total| total > self.daily_hard_ceiling) {
            stops.push(format!(
                "24-hour outgoing total would exceed {}",
                self.daily_hard_ceiling
            ));
        }

        stops
    }
}

/// Reporting-only signals
pub fn advisories(ctx: &RiskContext<'_>) -> Vec<String> {
    let mut signals = Vec::new();
    let amount = ctx.amount.minor();
    let unit = ROUND_AMOUNT_UNIT.minor();

    if amount >= unit && amount % unit == 0 {
        signals.push("round amount".to_string());
    }
    if ctx.history.unique_recipients_24h > UNIQUE_RECIPIENT_THRESHOLD {
        signals.push(format!(
            "{} unique recipients in 24 hours",
            ctx.history.unique_recipients_24h
        ));
    }

    signals
}
