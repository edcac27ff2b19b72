//! Structured error taxonomy for the contest core.
//!
//! Precondition failures are errors; expected no-op conditions (transition
//! already applied, settlement already exists, transfer not claimable) are
//! success-shaped outcome variants on the individual services, never errors.

use thiserror::Error;

use crate::models::{Actor, ContestStatus};

/// Errors surfaced by the lifecycle, settlement and payout services.
///
/// Callers see stable codes, never raw provider or database text.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("contest not found: {0}")]
    ContestNotFound(String),

    #[error("payout job not found: {0}")]
    JobNotFound(String),

    #[error("transition not allowed: {from} -> {to} by {actor}")]
    TransitionNotAllowed {
        from: ContestStatus,
        to: ContestStatus,
        actor: Actor,
    },

    #[error("settlement requires snapshot_id and snapshot_hash")]
    MissingSnapshotBinding,

    #[error("settlement record missing for contest: {0}")]
    SettlementMissing(String),

    #[error("unknown scoring strategy: {0}")]
    UnknownStrategy(String),

    #[error("invalid payout structure: {0}")]
    InvalidPayoutStructure(String),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Payment provider failure, already classified at the adapter boundary.
///
/// Retryable: network faults, timeouts, HTTP 5xx and 429. Permanent:
/// validation and other 4xx. Anything unclassifiable defaults to retryable;
/// retrying is safer than silently dropping money movement.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("retryable provider error [{code}]")]
    Retryable { code: String, message: String },

    #[error("permanent provider error [{code}]")]
    Permanent { code: String, message: String },
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Retryable { .. })
    }

    /// Stable classification code, safe to persist as a failure reason.
    pub fn code(&self) -> &str {
        match self {
            ProviderError::Retryable { code, .. } => code,
            ProviderError::Permanent { code, .. } => code,
        }
    }
}
