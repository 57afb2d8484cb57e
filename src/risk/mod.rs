//! Risk Scoring
//!
//! Heuristic fraud scoring for outgoing transfers:
//! - `history`: the windowed history slice loaded per candidate
//! - `rules`: the ordered list of scoring rules
//! - `engine`: orchestration, hard stops and advisory signals

mod engine;
mod history;
pub mod rules;

pub use engine::{
    advisories, should_block, CandidateTransfer, RiskAssessment, RiskEngine, RiskLevel,
    BLOCK_THRESHOLD,
};
pub use history::{
    average_window, pattern_window, velocity_window, HistoryQuery, RiskHistory,
};
pub use rules::{default_rules, RiskContext, RiskRule, RuleHit};
