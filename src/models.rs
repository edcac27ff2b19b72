use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Contest lifecycle status.
///
/// Happy path is SCHEDULED -> LOCKED -> LIVE -> COMPLETE. CANCELLED is an
/// admin escape from SCHEDULED/LOCKED, ERROR quarantines a failed settlement
/// until an admin recovers it. COMPLETE and CANCELLED are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContestStatus {
    Scheduled,
    Locked,
    Live,
    Complete,
    Cancelled,
    Error,
}

impl ContestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContestStatus::Scheduled => "SCHEDULED",
            ContestStatus::Locked => "LOCKED",
            ContestStatus::Live => "LIVE",
            ContestStatus::Complete => "COMPLETE",
            ContestStatus::Cancelled => "CANCELLED",
            ContestStatus::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SCHEDULED" => Some(ContestStatus::Scheduled),
            "LOCKED" => Some(ContestStatus::Locked),
            "LIVE" => Some(ContestStatus::Live),
            "COMPLETE" => Some(ContestStatus::Complete),
            "CANCELLED" => Some(ContestStatus::Cancelled),
            "ERROR" => Some(ContestStatus::Error),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ContestStatus::Complete | ContestStatus::Cancelled)
    }

    pub const ALL: [ContestStatus; 6] = [
        ContestStatus::Scheduled,
        ContestStatus::Locked,
        ContestStatus::Live,
        ContestStatus::Complete,
        ContestStatus::Cancelled,
        ContestStatus::Error,
    ];
}

impl fmt::Display for ContestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authority class allowed to request a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Actor {
    Admin,
    System,
}

impl Actor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Actor::Admin => "ADMIN",
            Actor::System => "SYSTEM",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ADMIN" => Some(Actor::Admin),
            "SYSTEM" => Some(Actor::System),
            _ => None,
        }
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Percentage-by-rank payout table, e.g. `{1: 70.0, 2: 20.0, 3: 10.0}`.
///
/// This is the single canonical representation of the stored JSON; it is
/// validated once here and everything downstream consumes it as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayoutStructure(pub BTreeMap<u32, f64>);

impl PayoutStructure {
    pub fn new(entries: impl IntoIterator<Item = (u32, f64)>) -> Result<Self, CoreError> {
        let map: BTreeMap<u32, f64> = entries.into_iter().collect();
        Self::validate(&map)?;
        Ok(Self(map))
    }

    /// Parse and validate the stored JSON form (object keyed by rank position).
    pub fn from_json(raw: &str) -> Result<Self, CoreError> {
        let map: BTreeMap<u32, f64> = serde_json::from_str(raw)
            .map_err(|e| CoreError::InvalidPayoutStructure(e.to_string()))?;
        Self::validate(&map)?;
        Ok(Self(map))
    }

    pub fn to_json(&self) -> String {
        // BTreeMap keys serialize in ascending rank order.
        serde_json::to_string(&self.0).unwrap_or_else(|_| "{}".to_string())
    }

    /// Percentage configured for a 1-based ordinal position (0 if unpaid).
    pub fn pct_for_position(&self, position: u32) -> f64 {
        self.0.get(&position).copied().unwrap_or(0.0)
    }

    /// Deepest paid position.
    pub fn paid_positions(&self) -> u32 {
        self.0.keys().max().copied().unwrap_or(0)
    }

    fn validate(map: &BTreeMap<u32, f64>) -> Result<(), CoreError> {
        if map.is_empty() {
            return Err(CoreError::InvalidPayoutStructure(
                "payout structure is empty".to_string(),
            ));
        }
        if map.keys().any(|&pos| pos == 0) {
            return Err(CoreError::InvalidPayoutStructure(
                "rank positions are 1-based".to_string(),
            ));
        }
        if map.values().any(|&pct| !pct.is_finite() || pct < 0.0) {
            return Err(CoreError::InvalidPayoutStructure(
                "percentages must be finite and non-negative".to_string(),
            ));
        }
        let total: f64 = map.values().sum();
        if total > 100.0 + 1e-9 {
            return Err(CoreError::InvalidPayoutStructure(format!(
                "percentages sum to {total:.4}, above 100"
            )));
        }
        Ok(())
    }
}

/// One contest row, owned exclusively by the lifecycle store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContestInstance {
    pub id: String,
    pub sport: String,
    pub status: ContestStatus,
    pub lock_time: DateTime<Utc>,
    pub tournament_start_time: DateTime<Utc>,
    pub tournament_end_time: DateTime<Utc>,
    pub settle_time: Option<DateTime<Utc>>,
    pub entry_fee_cents: i64,
    pub payout_structure: PayoutStructure,
    pub organizer_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for contest creation; the store assigns id/status/timestamps.
#[derive(Debug, Clone)]
pub struct NewContest {
    pub sport: String,
    pub lock_time: DateTime<Utc>,
    pub tournament_start_time: DateTime<Utc>,
    pub tournament_end_time: DateTime<Utc>,
    pub entry_fee_cents: i64,
    pub payout_structure: PayoutStructure,
    pub organizer_id: String,
}

/// One participant's aggregated score for a contest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantScore {
    pub participant_id: String,
    pub total_score: f64,
}

/// Scores bound to the immutable data snapshot they were computed from.
///
/// Settlement refuses to run without both binding fields; they are what make
/// a settlement replayable and auditable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreSnapshot {
    pub snapshot_id: String,
    pub snapshot_hash: String,
    pub scores: Vec<ParticipantScore>,
}

impl ScoreSnapshot {
    pub fn require_binding(&self) -> Result<(), CoreError> {
        if self.snapshot_id.trim().is_empty() || self.snapshot_hash.trim().is_empty() {
            return Err(CoreError::MissingSnapshotBinding);
        }
        Ok(())
    }
}
