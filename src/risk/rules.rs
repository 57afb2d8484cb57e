//! Scoring rules
//!
//! Each heuristic is a standalone [`RiskRule`]: a name, the most points it
//! can contribute, and a pure evaluation function over a [`RiskContext`].
//! The engine walks the list in order and sums the hits.

use std::net::IpAddr;

use crate::domain::Money;

use super::RiskHistory;

/// Amount must exceed this multiple of the 30-day average to count as anomalous
const ANOMALY_MULTIPLIER: i64 = 3;
const ANOMALY_MAX_POINTS: u8 = 30;

const VELOCITY_THRESHOLD: u32 = 3;
const VELOCITY_POINTS: u8 = 25;

const NEW_BENEFICIARY_POINTS: u8 = 15;

/// Local hours strictly outside `[OFF_HOURS_START, OFF_HOURS_END]` score
const OFF_HOURS_START: u32 = 6;
const OFF_HOURS_END: u32 = 22;
const OFF_HOURS_POINTS: u8 = 10;

const IP_CHANGE_POINTS: u8 = 20;

/// Inputs shared by every rule
#[derive(Debug, Clone, Copy)]
pub struct RiskContext<'a> {
    pub amount: Money,
    /// Hour of day in the ledger's local time
    pub local_hour: u32,
    pub client_ip: Option<IpAddr>,
    pub history: &'a RiskHistory,
}

/// A rule that fired
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleHit {
    pub points: u8,
    pub factor: String,
}

#[derive(Debug, Clone, Copy)]
pub struct RiskRule {
    pub name: &'static str,
    pub max_points: u8,
    pub evaluate: fn(&RiskContext<'_>) -> Option<RuleHit>,
}

impl RiskRule {
    /// Evaluate and clamp to the rule's cap
    pub fn apply(&self, ctx: &RiskContext<'_>) -> Option<RuleHit> {
        (self.evaluate)(ctx).map(|mut hit| {
            hit.points = hit.points.min(self.max_points);
            hit
        })
    }
}

/// The scoring rules, in evaluation order
pub fn default_rules() -> Vec<RiskRule> {
    vec![
        RiskRule {
            name: "amount_anomaly",
            max_points: ANOMALY_MAX_POINTS,
            evaluate: amount_anomaly,
        },
        RiskRule {
            name: "velocity",
            max_points: VELOCITY_POINTS,
            evaluate: velocity,
        },
        RiskRule {
            name: "new_beneficiary",
            max_points: NEW_BENEFICIARY_POINTS,
            evaluate: new_beneficiary,
        },
        RiskRule {
            name: "off_hours",
            max_points: OFF_HOURS_POINTS,
            evaluate: off_hours,
        },
        RiskRule {
            name: "ip_change",
            max_points: IP_CHANGE_POINTS,
            evaluate: ip_change,
        },
    ]
}

/// amount > 3x the 30-day average; `min(30, floor(ratio * 10))` points.
pub fn amount_anomaly(ctx: &RiskContext<'_>) -> Option<RuleHit> {
    let average = ctx.history.average_amount_30d?.minor();
    let amount = ctx.amount.minor();
    if average <= 0 || amount <= average.saturating_mul(ANOMALY_MULTIPLIER) {
        return None;
    }

    // ratio in tenths, floored
    let ratio_tenths = i128::from(amount) * 10 / i128::from(average);
    let points = ratio_tenths.min(i128::from(ANOMALY_MAX_POINTS)) as u8;

    Some(RuleHit {
        points,
        factor: format!(
            "amount {}.{}x above average",
            ratio_tenths / 10,
            ratio_tenths % 10
        ),
    })
}

/// More than 3 transactions from the source in the trailing 5 minutes.
pub fn velocity(ctx: &RiskContext<'_>) -> Option<RuleHit> {
    let count = ctx.history.recent_count;
    (count > VELOCITY_THRESHOLD).then(|| RuleHit {
        points: VELOCITY_POINTS,
        factor: format!("{} transactions in 5 minutes", count),
    })
}

/// No completed transaction from this source to this destination before.
pub fn new_beneficiary(ctx: &RiskContext<'_>) -> Option<RuleHit> {
    (!ctx.history.has_prior_transfer).then(|| RuleHit {
        points: NEW_BENEFICIARY_POINTS,
        factor: "new beneficiary".to_string(),
    })
}

pub fn off_hours(ctx: &RiskContext<'_>) -> Option<RuleHit> {
    (ctx.local_hour < OFF_HOURS_START || ctx.local_hour > OFF_HOURS_END).then(|| RuleHit {
        points: OFF_HOURS_POINTS,
        factor: "transaction outside normal hours".to_string(),
    })
}

/// Request address differs from the owner's most recent session address.
/// Without both addresses there is nothing to compare.
pub fn ip_change(ctx: &RiskContext<'_>) -> Option<RuleHit> {
    match (ctx.client_ip, ctx.history.last_session_ip) {
        (Some(current), Some(last)) if current != last => Some(RuleHit {
            points: IP_CHANGE_POINTS,
            factor: "new IP address detected".to_string(),
        }),
        _ => None,
    }
}
