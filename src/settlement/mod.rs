//! Settlement: deterministic rankings, tie-block payout allocation, canonical
//! hashing, and the transactional execution wrapper.

pub mod canonical;
pub mod engine;
pub mod service;
pub mod strategy;

pub use canonical::{canonical_json, canonical_sha256};
pub use engine::{
    allocate_payouts, compute_rankings, compute_settlement, PayoutAllocation, RankingEntry,
    SettlementResults, RAKE_PCT,
};
pub use service::{SettleOutcome, SettlementRecord, SettlementService};
pub use strategy::{ScoreStrategy, StoredScoreStrategy, StrategyRegistry};
