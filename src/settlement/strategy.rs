//! Sport-specific score aggregation strategies.
//!
//! The scoring formula itself lives outside this crate; settlement consumes
//! it through `ScoreStrategy`. Strategies are resolved through an explicit
//! registry built at startup, so an unknown sport key is rejected eagerly
//! instead of surfacing mid-settlement.

use std::collections::HashMap;
use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::CoreError;
use crate::models::{ParticipantScore, ScoreSnapshot};

/// Aggregates final scores for one contest.
///
/// Runs inside the settlement transaction (hence the borrowed connection)
/// and must be deterministic for a given snapshot.
pub trait ScoreStrategy: Send + Sync + std::fmt::Debug {
    fn aggregate_scores(
        &self,
        conn: &Connection,
        contest_id: &str,
    ) -> Result<ScoreSnapshot, CoreError>;
}

/// Sport key -> strategy table, resolved once at startup.
#[derive(Default)]
pub struct StrategyRegistry {
    strategies: HashMap<String, Arc<dyn ScoreStrategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, sport: &str, strategy: Arc<dyn ScoreStrategy>) {
        self.strategies.insert(sport.to_string(), strategy);
    }

    pub fn resolve(&self, sport: &str) -> Result<Arc<dyn ScoreStrategy>, CoreError> {
        self.strategies
            .get(sport)
            .cloned()
            .ok_or_else(|| CoreError::UnknownStrategy(sport.to_string()))
    }

    pub fn sports(&self) -> Vec<&str> {
        self.strategies.keys().map(String::as_str).collect()
    }
}

/// Strategy reading pre-ingested scores and their snapshot binding from the
/// `participant_scores` / `score_snapshots` tables (ingestion writes them,
/// out of band). One implementation serves every sport whose scoring runs
/// upstream.
#[derive(Debug)]
pub struct StoredScoreStrategy;

impl ScoreStrategy for StoredScoreStrategy {
    fn aggregate_scores(
        &self,
        conn: &Connection,
        contest_id: &str,
    ) -> Result<ScoreSnapshot, CoreError> {
        let binding: Option<(String, String)> = conn
            .query_row(
                "SELECT snapshot_id, snapshot_hash FROM score_snapshots WHERE contest_id = ?1",
                params![contest_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        // Absent binding rows surface as the missing-binding precondition
        // error in the service, via require_binding().
        let (snapshot_id, snapshot_hash) = binding.unwrap_or_default();

        let mut stmt = conn.prepare_cached(
            "SELECT participant_id, total_score FROM participant_scores \
             WHERE contest_id = ?1 ORDER BY participant_id ASC",
        )?;
        let scores = stmt
            .query_map(params![contest_id], |row| {
                Ok(ParticipantScore {
                    participant_id: row.get(0)?,
                    total_score: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ScoreSnapshot {
            snapshot_id,
            snapshot_hash,
            scores,
        })
    }
}
